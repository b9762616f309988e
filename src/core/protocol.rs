//! Multi-phase training protocols.
//!
//! A [`Protocol`] is an ordered list of [`Phase`]s. Each phase swaps the
//! training table, reconfigures layer roles and lesions, optionally loads a
//! checkpoint, trains until the stopping policy fires, restores the baseline
//! configuration and optionally saves a checkpoint. A phase's save always
//! completes before the next phase's load starts.

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::{RunController, SimulationState, StopReason};
use crate::env::TrialTable;
use crate::error::{SimError, SimResult};
use crate::layers::{LayerConfig, LayerOp, ResolvedOp};
use crate::network::Network;
use crate::storage;

/// Immutable phase descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: String,
    pub table: Arc<TrialTable>,
    pub max_epochs: usize,
    /// Applied in order before training.
    pub ops: Vec<LayerOp>,
    pub load_checkpoint: Option<String>,
    pub save_checkpoint: Option<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>, table: Arc<TrialTable>, max_epochs: usize) -> Self {
        Self {
            name: name.into(),
            table,
            max_epochs,
            ops: Vec::new(),
            load_checkpoint: None,
            save_checkpoint: None,
        }
    }

    pub fn op(mut self, op: LayerOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn load(mut self, checkpoint: impl Into<String>) -> Self {
        self.load_checkpoint = Some(checkpoint.into());
        self
    }

    pub fn save(mut self, checkpoint: impl Into<String>) -> Self {
        self.save_checkpoint = Some(checkpoint.into());
        self
    }
}

#[derive(Debug, Clone)]
struct ResolvedPhase {
    phase: Phase,
    ops: Vec<ResolvedOp>,
}

/// What one phase did.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhaseReport {
    pub name: String,
    pub stop_reason: StopReason,
    pub epochs: usize,
    pub first_zero: i64,
}

/// Phases completed by one protocol invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolReport {
    pub run: usize,
    pub phases: Vec<PhaseReport>,
    /// A stop request ended the protocol before every phase ran.
    pub cancelled: bool,
}

impl ProtocolReport {
    fn completed_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Protocol {
    phases: Vec<ResolvedPhase>,
    baseline: LayerConfig,
}

impl Protocol {
    /// Validate `phases` against `state` and capture its current role and
    /// lesion configuration as the baseline. Fails before touching the
    /// network on unknown layers, empty tables or a zero epoch budget.
    pub fn build<N: Network>(state: &SimulationState<N>, phases: Vec<Phase>) -> SimResult<Self> {
        if phases.is_empty() {
            return Err(SimError::Configuration("protocol has no phases".into()));
        }
        let mut resolved = Vec::with_capacity(phases.len());
        for phase in phases {
            if phase.table.is_empty() {
                return Err(SimError::Configuration(format!(
                    "phase `{}`: table `{}` has no trials",
                    phase.name, phase.table.name
                )));
            }
            if phase.max_epochs == 0 {
                return Err(SimError::Configuration(format!(
                    "phase `{}`: max_epochs must be positive",
                    phase.name
                )));
            }
            for name in [&phase.load_checkpoint, &phase.save_checkpoint]
                .into_iter()
                .flatten()
            {
                if name.is_empty() {
                    return Err(SimError::Configuration(format!(
                        "phase `{}`: empty checkpoint name",
                        phase.name
                    )));
                }
                storage::check_name(name).map_err(|e| {
                    SimError::Configuration(format!("phase `{}`: {e}", phase.name))
                })?;
            }
            let ops = phase
                .ops
                .iter()
                .map(|op| op.resolve(&state.net))
                .collect::<SimResult<Vec<_>>>()?;
            // Restoring the baseline only resets driven layers' roles.
            for op in &ops {
                if let ResolvedOp::SetRole(id, _) = op {
                    if !state.layers().driven().iter().any(|l| l.id == *id) {
                        return Err(SimError::Configuration(format!(
                            "phase `{}`: layer `{}` is not driven; roles apply to driven layers only",
                            phase.name,
                            state.net.layer_name(*id)
                        )));
                    }
                }
            }
            resolved.push(ResolvedPhase { phase, ops });
        }
        Ok(Self {
            phases: resolved,
            baseline: state.layer_config().clone(),
        })
    }

    /// Use `baseline` instead of the configuration captured at build time.
    pub fn with_baseline(mut self, baseline: LayerConfig) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn baseline(&self) -> &LayerConfig {
        &self.baseline
    }

    pub fn phases(&self) -> impl Iterator<Item = &Phase> + '_ {
        self.phases.iter().map(|p| &p.phase)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Run every phase once, in order, at the controller's current run.
    pub fn run<N: Network>(&self, ctl: &mut RunController<N>) -> SimResult<ProtocolReport> {
        let control = ctl.control();
        let _guard = control.try_begin()?;
        self.run_unguarded(ctl)
    }

    /// Repeat the protocol once per configured run, each from fresh weights.
    pub fn run_all<N: Network>(&self, ctl: &mut RunController<N>) -> SimResult<Vec<ProtocolReport>> {
        let control = ctl.control();
        let _guard = control.try_begin()?;
        self.run_all_unguarded(ctl)
    }

    pub(crate) fn run_all_unguarded<N: Network>(
        &self,
        ctl: &mut RunController<N>,
    ) -> SimResult<Vec<ProtocolReport>> {
        let control = ctl.control();
        let (start, end) = (ctl.config().start_run, ctl.config().end_run());
        let mut reports = Vec::with_capacity(end - start);
        for run in start..end {
            ctl.set_run(run);
            ctl.new_run()?;
            let report = self.run_unguarded(ctl)?;
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled || control.stop_requested() {
                break;
            }
        }
        Ok(reports)
    }

    pub(crate) fn run_unguarded<N: Network>(
        &self,
        ctl: &mut RunController<N>,
    ) -> SimResult<ProtocolReport> {
        if ctl.needs_new_run() {
            ctl.new_run()?;
        }
        let control = ctl.control();
        let mut report = ProtocolReport {
            run: ctl.train_env().run.cur,
            ..Default::default()
        };

        for resolved in &self.phases {
            let phase = &resolved.phase;
            info!(
                phase = %phase.name,
                table = %phase.table.name,
                max_epochs = phase.max_epochs,
                "phase start"
            );

            ctl.begin_phase(&phase.name, Arc::clone(&phase.table), phase.max_epochs);
            for op in &resolved.ops {
                ctl.state_mut().apply_op(*op);
            }

            let outcome = self.train_phase(ctl, phase);
            ctl.end_phase();
            let stop = match outcome {
                Ok(stop) => stop,
                Err((checkpoint, source)) => {
                    return Err(SimError::PhaseFailed {
                        phase: phase.name.clone(),
                        checkpoint,
                        completed: report.completed_names(),
                        source: Box::new(source),
                    });
                }
            };

            let Some(reason) = stop else {
                warn!(phase = %phase.name, "protocol stopped by request");
                report.cancelled = true;
                return Ok(report);
            };

            if let Some(name) = &phase.save_checkpoint {
                ctl.state_mut()
                    .net
                    .save_checkpoint(name)
                    .map_err(|e| SimError::PhaseFailed {
                        phase: phase.name.clone(),
                        checkpoint: Some(name.clone()),
                        completed: report.completed_names(),
                        source: Box::new(e.into()),
                    })?;
            }

            let epochs = ctl.train_env().epoch.cur;
            info!(phase = %phase.name, epochs, reason = %reason, "phase done");
            report.phases.push(PhaseReport {
                name: phase.name.clone(),
                stop_reason: reason,
                epochs,
                first_zero: ctl.stats().int("FirstZero"),
            });

            if control.stop_requested() && report.phases.len() < self.phases.len() {
                report.cancelled = true;
                return Ok(report);
            }
        }
        Ok(report)
    }

    /// Load, train, restore baseline. Errors carry the checkpoint involved.
    fn train_phase<N: Network>(
        &self,
        ctl: &mut RunController<N>,
        phase: &Phase,
    ) -> Result<Option<StopReason>, (Option<String>, SimError)> {
        if let Some(name) = &phase.load_checkpoint {
            if let Err(e) = ctl.state_mut().net.load_checkpoint(name) {
                ctl.state_mut().restore(&self.baseline);
                return Err((Some(name.clone()), e.into()));
            }
        }
        let result = ctl.train_until_stop();
        ctl.state_mut().restore(&self.baseline);
        result.map_err(|e| (None, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::env::TrialRecord;
    use crate::mock::{Call, RecordingNet};
    use crate::network::{LayerId, LayerRole};

    fn table(name: &str, n: usize) -> Arc<TrialTable> {
        let records = (0..n)
            .map(|i| {
                TrialRecord::new(format!("{name}{i}"))
                    .with_field("Env", vec![1.0, 0.0])
                    .with_field("Approach", vec![0.0, 1.0])
                    .with_field("Behavior", vec![1.0, 1.0])
            })
            .collect();
        Arc::new(TrialTable::new(name, records))
    }

    fn controller() -> RunController<RecordingNet> {
        let net = RecordingNet::new(&[("Env", 2), ("Hidden", 4), ("Approach", 2), ("Behavior", 2)]);
        let driven = [
            ("Env".to_string(), LayerRole::Input),
            ("Approach".to_string(), LayerRole::Target),
            ("Behavior".to_string(), LayerRole::Target),
        ];
        let state = SimulationState::new(net, &driven, 1).unwrap();
        let config = RunConfig {
            cycles_per_quarter: 1,
            diagnostic_interval: -1,
            ..Default::default()
        };
        RunController::new(state, config, table("base", 2), table("test", 2)).unwrap()
    }

    fn instrumental_then_pavlov() -> Vec<Phase> {
        vec![
            Phase::new("INSTRUMENTAL", table("instr", 3), 2)
                .op(LayerOp::role("Approach", LayerRole::Input))
                .op(LayerOp::lesion("Env"))
                .save("trained"),
            Phase::new("PAVLOV", table("pvlv", 2), 3)
                .op(LayerOp::lesion("Behavior"))
                .load("trained")
                .save("trained2"),
        ]
    }

    #[test]
    fn phases_chain_through_checkpoints() {
        let mut ctl = controller();
        let protocol = Protocol::build(ctl.state(), instrumental_then_pavlov()).unwrap();
        let report = protocol.run(&mut ctl).unwrap();

        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[0].epochs, 2);
        assert_eq!(report.phases[1].epochs, 3);
        assert!(!report.cancelled);

        let net = &ctl.state().net;
        let saves: Vec<&Call> = net
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Save(_) | Call::Load(_)))
            .collect();
        assert_eq!(
            saves,
            vec![
                &Call::Save("trained".into()),
                &Call::Load("trained".into()),
                &Call::Save("trained2".into()),
            ]
        );

        // 2 epochs x 3 trials in phase A, then phase B starts from A's weights.
        assert_eq!(net.checkpoints["trained"].len(), 6);
        assert_eq!(net.begin_weights[6], 6);
        assert_eq!(net.checkpoints["trained2"].len(), 6 + 3 * 2);
        // One reset for the only run.
        assert_eq!(net.count(|c| *c == Call::Reset), 1);
    }

    #[test]
    fn lesioned_layer_never_receives_values() {
        let mut ctl = controller();
        let protocol = Protocol::build(ctl.state(), instrumental_then_pavlov()).unwrap();
        protocol.run(&mut ctl).unwrap();

        let net = &ctl.state().net;
        let env = LayerId(0);
        let behavior = LayerId(3);
        // Phase A: Env lesioned for its 6 trials; phase B: Behavior lesioned.
        let applied: Vec<LayerId> = net
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::ApplyExt(id) => Some(*id),
                _ => None,
            })
            .collect();
        let (a, b) = applied.split_at(6 * 2);
        assert!(!a.contains(&env));
        assert!(!b.contains(&behavior));
        assert!(b.contains(&env));
    }

    #[test]
    fn baseline_restored_after_each_phase() {
        let mut ctl = controller();
        let baseline = ctl.state().layer_config().clone();
        let protocol = Protocol::build(ctl.state(), instrumental_then_pavlov()).unwrap();
        protocol.run(&mut ctl).unwrap();
        assert!(ctl.state().is_active(LayerId(0)));
        assert!(ctl.state().is_active(LayerId(3)));
        assert_eq!(ctl.state().role(LayerId(2)), Some(LayerRole::Target));
        assert_eq!(ctl.state().layer_config().roles, baseline.roles);
    }

    #[test]
    fn missing_checkpoint_reports_completed_phases() {
        let mut ctl = controller();
        let phases = vec![
            Phase::new("A", table("a", 2), 1).save("a"),
            Phase::new("B", table("b", 2), 1).load("missing"),
        ];
        let protocol = Protocol::build(ctl.state(), phases).unwrap();
        let err = protocol.run(&mut ctl).unwrap_err();
        assert!(err.is_checkpoint_not_found());
        match err {
            SimError::PhaseFailed {
                phase,
                checkpoint,
                completed,
                ..
            } => {
                assert_eq!(phase, "B");
                assert_eq!(checkpoint.as_deref(), Some("missing"));
                assert_eq!(completed, vec!["A".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ctl.control().is_running());
    }

    #[test]
    fn unknown_layer_fails_before_any_network_call() {
        let ctl = controller();
        let calls = ctl.state().net.calls.len();
        let phases = vec![Phase::new("A", table("a", 2), 1).op(LayerOp::lesion("Nope"))];
        let err = Protocol::build(ctl.state(), phases).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(ctl.state().net.calls.len(), calls);
    }

    #[test]
    fn empty_table_and_zero_epochs_rejected() {
        let ctl = controller();
        let empty = Arc::new(TrialTable::new("empty", Vec::new()));
        assert!(Protocol::build(ctl.state(), vec![Phase::new("A", empty, 1)])
            .unwrap_err()
            .is_configuration());
        assert!(Protocol::build(ctl.state(), vec![Phase::new("A", table("a", 1), 0)])
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn role_on_undriven_layer_rejected() {
        let ctl = controller();
        let calls = ctl.state().net.calls.len();
        let phases = vec![
            Phase::new("A", table("a", 2), 1).op(LayerOp::role("Hidden", LayerRole::Compare)),
            Phase::new("B", table("b", 2), 1),
        ];
        let err = Protocol::build(ctl.state(), phases).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Hidden"));
        assert_eq!(ctl.state().net.calls.len(), calls);
        assert_eq!(ctl.state().role(LayerId(1)), None);
    }

    #[test]
    fn layer_config_matches_baseline_after_run() {
        let mut ctl = controller();
        let baseline = ctl.state().layer_config().clone();
        let phases = vec![
            Phase::new("A", table("a", 2), 1)
                .op(LayerOp::role("Behavior", LayerRole::Compare))
                .op(LayerOp::lesion("Hidden")),
            Phase::new("B", table("b", 2), 1),
        ];
        let protocol = Protocol::build(ctl.state(), phases).unwrap();
        protocol.run(&mut ctl).unwrap();
        assert_eq!(ctl.state().layer_config(), &baseline);
        let roles: Vec<&Call> = ctl
            .state()
            .net
            .calls
            .iter()
            .filter(|c| matches!(c, Call::SetRole(LayerId(3), _)))
            .collect();
        assert_eq!(
            roles.last(),
            Some(&&Call::SetRole(LayerId(3), LayerRole::Target))
        );
        assert!(roles.contains(&&Call::SetRole(LayerId(3), LayerRole::Compare)));
    }

    #[test]
    fn checkpoint_names_must_stay_in_the_store() {
        let ctl = controller();
        for name in ["../../x", "nested/trained", "/tmp/trained"] {
            let phases = vec![Phase::new("A", table("a", 2), 1).save(name)];
            let err = Protocol::build(ctl.state(), phases).unwrap_err();
            assert!(err.is_configuration(), "{name} accepted");
            let phases = vec![Phase::new("A", table("a", 2), 1).load(name)];
            assert!(Protocol::build(ctl.state(), phases)
                .unwrap_err()
                .is_configuration());
        }
        let phases = vec![Phase::new("A", table("a", 2), 1).save("trained")];
        assert!(Protocol::build(ctl.state(), phases).is_ok());
    }

    #[test]
    fn run_all_repeats_per_run() {
        let net = RecordingNet::new(&[("Env", 2), ("Approach", 2), ("Behavior", 2)]);
        let driven = [("Env".to_string(), LayerRole::Input)];
        let state = SimulationState::new(net, &driven, 1).unwrap();
        let config = RunConfig {
            max_runs: 3,
            start_run: 1,
            cycles_per_quarter: 1,
            ..Default::default()
        };
        let mut ctl = RunController::new(state, config, table("a", 2), table("a", 2)).unwrap();
        let protocol =
            Protocol::build(ctl.state(), vec![Phase::new("A", table("a", 2), 1)]).unwrap();
        let reports = protocol.run_all(&mut ctl).unwrap();
        assert_eq!(
            reports.iter().map(|r| r.run).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(ctl.state().net.count(|c| *c == Call::Reset), 3);
    }
}
