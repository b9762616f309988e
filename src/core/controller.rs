//! The Run/Epoch/Trial/Cycle state machine.
//!
//! [`RunController`] owns a [`SimulationState`] (network, layer roles and
//! lesions, stats, time) plus the training and testing environments. Every
//! public loop polls the [`RunControl`] stop flag between trials, never
//! inside one, so cancellation cannot leave a half-applied weight change.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::RunConfig;
use crate::env::{FixedTable, TrialRecord, TrialTable};
use crate::error::{NetworkError, SimError, SimResult};
use crate::layers::{LayerConfig, LayerTable, ResolvedOp};
use crate::network::{resolve, LayerError, LayerId, LayerRole, Network};
use crate::observer::{LogSink, Logs, Mode, Timescale};
use crate::pca;
use crate::stats::{update_zero_streak, EpochAccumulator, Stats, TrialError};
use crate::time::{TimeState, QUARTERS};

/// Why training for a run (or a protocol phase) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StopReason {
    MaxEpochs,
    ZeroErrorStreak,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::MaxEpochs => "MaxEpochs",
            StopReason::ZeroErrorStreak => "ZeroErrorStreak",
        })
    }
}

/// Stopping policy, evaluated once per epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_epochs: usize,
    /// <= 0 disables the streak rule.
    pub nzero_stop: i64,
}

impl StopPolicy {
    /// A zero-error streak wins over max epochs when both hold.
    pub fn evaluate(&self, epoch: usize, nzero: i64) -> Option<StopReason> {
        if self.nzero_stop > 0 && nzero >= self.nzero_stop {
            Some(StopReason::ZeroErrorStreak)
        } else if epoch >= self.max_epochs {
            Some(StopReason::MaxEpochs)
        } else {
            None
        }
    }
}

/// Outcome of one [`RunController::train_trial`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStep {
    /// A training trial ran to completion.
    Trained,
    /// The stopping policy fired at an epoch boundary; no trial ran.
    Stopped(StopReason),
    /// Every configured run is done; no trial ran.
    Complete,
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ControlFlags {
    running: AtomicBool,
    stop: AtomicBool,
}

/// Shared is-running / stop-requested flags.
///
/// Cloning shares the flags, so a control surface can keep a handle while
/// the controller runs on another thread.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    flags: Arc<ControlFlags>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::Acquire)
    }

    /// Ask the running loop to exit after the in-flight trial. No-op when
    /// nothing is running.
    pub fn stop(&self) {
        if self.is_running() {
            self.flags.stop.store(true, Ordering::Release);
        }
    }

    /// Mark a loop as running, refusing if one already is.
    pub fn try_begin(&self) -> SimResult<RunGuard> {
        self.flags
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SimError::AlreadyRunning)?;
        self.flags.stop.store(false, Ordering::Release);
        Ok(RunGuard {
            control: self.clone(),
        })
    }
}

/// Clears the running and stop flags on drop.
#[derive(Debug)]
pub struct RunGuard {
    control: RunControl,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.control.flags.stop.store(false, Ordering::Release);
        self.control.flags.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// The single-writer bundle the controller and protocol operate on.
///
/// Role and lesion changes go through setters that mirror every change onto
/// the network, so the two views never disagree.
pub struct SimulationState<N: Network> {
    pub net: N,
    layers: LayerTable,
    layer_cfg: LayerConfig,
    pub stats: Stats,
    pub time: TimeState,
}

impl<N: Network> SimulationState<N> {
    /// Resolve the driven layers against `net` and push their roles to it.
    pub fn new(net: N, driven: &[(String, LayerRole)], cycles_per_quarter: usize) -> SimResult<Self> {
        let (layers, roles) = LayerTable::resolve(&net, driven)?;
        let mut state = Self {
            net,
            layers,
            layer_cfg: LayerConfig::default(),
            stats: Stats::new(),
            time: TimeState::new(cycles_per_quarter),
        };
        for (id, role) in roles.iter() {
            state.set_role(id, role);
        }
        Ok(state)
    }

    pub fn layers(&self) -> &LayerTable {
        &self.layers
    }

    pub fn layer_config(&self) -> &LayerConfig {
        &self.layer_cfg
    }

    pub fn role(&self, id: LayerId) -> Option<LayerRole> {
        self.layer_cfg.roles.get(id)
    }

    pub fn is_active(&self, id: LayerId) -> bool {
        self.layer_cfg.lesions.is_active(id)
    }

    pub fn set_role(&mut self, id: LayerId, role: LayerRole) {
        self.layer_cfg.roles.set(id, role);
        self.net.set_layer_role(id, role);
    }

    pub fn set_active(&mut self, id: LayerId, active: bool) {
        self.layer_cfg.lesions.set_active(id, active);
        self.net.set_layer_active(id, active);
    }

    pub fn apply_op(&mut self, op: ResolvedOp) {
        match op {
            ResolvedOp::SetRole(id, role) => self.set_role(id, role),
            ResolvedOp::SetActive(id, active) => self.set_active(id, active),
        }
    }

    /// Return to `baseline`. Layers lesioned now but absent from the
    /// baseline mask are re-enabled.
    pub fn restore(&mut self, baseline: &LayerConfig) {
        let lesioned: Vec<LayerId> = self.layer_cfg.lesions.lesioned().collect();
        for id in lesioned {
            self.set_active(id, baseline.lesions.is_active(id));
        }
        for (id, active) in baseline.lesions.iter() {
            self.set_active(id, active);
        }
        for (id, role) in baseline.roles.iter() {
            self.set_role(id, role);
        }
    }

    /// Apply the record's fields to every active driven layer that has one.
    pub fn apply_record(&mut self, record: &TrialRecord) -> Result<(), NetworkError> {
        for layer in self.layers.driven() {
            if !self.layer_cfg.lesions.is_active(layer.id) {
                continue;
            }
            let Some(pattern) = record.field(&layer.name) else {
                continue;
            };
            self.net.apply_external_values(layer.id, pattern)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Epoch,
    Run,
    All,
}

/// On stop: advance to the next run, or hold the run index (protocol phases).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunAdvance {
    Next,
    Hold,
}

pub struct RunController<N: Network> {
    state: SimulationState<N>,
    config: RunConfig,
    train_env: FixedTable,
    test_env: FixedTable,
    logs: Logs,
    control: RunControl,

    stat_layers: Vec<LayerId>,
    diag_layers: Vec<(LayerId, String)>,
    diag_samples: Vec<Vec<Vec<f32>>>,

    train_acc: EpochAccumulator,
    test_acc: EpochAccumulator,
    max_epochs_override: Option<usize>,
    needs_new_run: bool,
    complete: bool,
}

impl<N: Network> RunController<N> {
    pub fn new(
        state: SimulationState<N>,
        config: RunConfig,
        train_table: Arc<TrialTable>,
        test_table: Arc<TrialTable>,
    ) -> SimResult<Self> {
        config.validate()?;

        let stat_layers = config
            .stat_layers
            .iter()
            .map(|name| resolve(&state.net, name))
            .collect::<SimResult<Vec<_>>>()?;
        let diag_layers = config
            .diagnostic_layers
            .iter()
            .map(|name| resolve(&state.net, name).map(|id| (id, name.clone())))
            .collect::<SimResult<Vec<_>>>()?;

        let train_env = FixedTable::new("TrainEnv", train_table).sequential(config.sequential);
        train_env.validate()?;
        let test_env = FixedTable::new("TestEnv", test_table).sequential(true);
        if config.test_interval > 0 {
            test_env.validate()?;
        }

        let mut ctl = Self {
            diag_samples: vec![Vec::new(); diag_layers.len()],
            state,
            train_env,
            test_env,
            logs: Logs::new(),
            control: RunControl::new(),
            stat_layers,
            diag_layers,
            train_acc: EpochAccumulator::default(),
            test_acc: EpochAccumulator::default(),
            max_epochs_override: None,
            needs_new_run: true,
            complete: false,
            config,
        };
        ctl.state.time = TimeState::new(ctl.config.cycles_per_quarter);
        ctl.reset_run_counter();
        ctl.init_stats();
        Ok(ctl)
    }

    pub fn with_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.logs.attach(sink);
        self
    }

    pub fn logs_mut(&mut self) -> &mut Logs {
        &mut self.logs
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> &SimulationState<N> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SimulationState<N> {
        &mut self.state
    }

    pub fn into_state(self) -> SimulationState<N> {
        self.state
    }

    pub fn stats(&self) -> &Stats {
        &self.state.stats
    }

    pub fn train_env(&self) -> &FixedTable {
        &self.train_env
    }

    pub fn test_env(&self) -> &FixedTable {
        &self.test_env
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn needs_new_run(&self) -> bool {
        self.needs_new_run
    }

    /// Max epochs in effect: the active phase's, else the configured one.
    pub fn max_epochs(&self) -> usize {
        self.max_epochs_override.unwrap_or(self.config.max_epochs)
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            max_epochs: self.max_epochs(),
            nzero_stop: self.config.nzero_stop,
        }
    }

    /// Restart from `start_run` with fresh weights.
    pub fn init(&mut self) -> SimResult<()> {
        self.reset_run_counter();
        self.complete = false;
        self.new_run()
    }

    /// Start the run at the current run index: reseed, reset environments,
    /// time, weights and per-run stats, and clear the epoch logs.
    pub fn new_run(&mut self) -> SimResult<()> {
        let run = self.train_env.run.cur;
        let seed = self.config.seed_for_run(run);
        self.state.net.reseed(seed);
        self.train_env.reseed(seed);
        self.test_env.reseed(seed);
        self.train_env.init(run);
        self.test_env.init(run);
        self.state.time.reset();
        self.state.net.reset_weights();
        self.init_stats();
        self.train_acc = EpochAccumulator::default();
        self.test_acc = EpochAccumulator::default();
        self.clear_diagnostics();
        self.logs.reset(Mode::Train, Timescale::Epoch);
        self.logs.reset(Mode::Test, Timescale::Epoch);
        self.needs_new_run = false;
        self.stat_counters(true);
        info!(run, seed, net = self.state.net.name(), "new run");
        Ok(())
    }

    /// Replace the per-run seeds from the wall clock.
    pub fn new_rnd_seed(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.config.reseed_from(now);
        info!(base = now, "new random seeds");
    }

    /// Run one training trial, or handle the epoch boundary that precedes it.
    pub fn train_trial(&mut self) -> SimResult<TrialStep> {
        self.step_training(RunAdvance::Next)
    }

    fn step_training(&mut self, advance: RunAdvance) -> SimResult<TrialStep> {
        if advance == RunAdvance::Next && self.complete {
            return Ok(TrialStep::Complete);
        }
        if self.needs_new_run {
            self.new_run()?;
        }

        let change = self.train_env.step();
        let epoch = self.train_env.epoch.cur;
        if change.epoch_changed {
            self.epoch_end(epoch)?;
            let nzero = self.state.stats.int("NZero");
            if let Some(reason) = self.stop_policy().evaluate(epoch, nzero) {
                self.run_end(reason)?;
                if advance == RunAdvance::Next {
                    if self.train_env.run.incr() {
                        self.complete = true;
                        info!(runs = self.config.max_runs, "training complete");
                    } else {
                        self.needs_new_run = true;
                    }
                }
                return Ok(TrialStep::Stopped(reason));
            }
        }

        self.apply_inputs(Mode::Train)?;
        self.alpha_cycle(true);
        let err = self.trial_stats(Mode::Train);
        let trial = self.train_env.trial.cur;
        self.logs
            .log(Mode::Train, Timescale::Trial, Some(trial), &self.state.stats);
        trace!(
            epoch,
            trial,
            name = self.train_env.trial_name(),
            sse = err.sse,
            "train trial"
        );

        if self.diagnostics_recording(epoch) {
            for (slot, (id, _)) in self.diag_samples.iter_mut().zip(&self.diag_layers) {
                slot.push(self.state.net.layer_activations(*id).to_vec());
            }
            self.logs
                .log(Mode::Analyze, Timescale::Trial, None, &self.state.stats);
        }
        Ok(TrialStep::Trained)
    }

    /// One alpha cycle: four quarters of `cycles_per_quarter` cycles, then
    /// (training only) exactly one weight update.
    pub fn alpha_cycle(&mut self, train: bool) {
        self.state.net.begin_trial(train);
        self.state.time.alpha_cycle_start(train);
        for _ in 0..QUARTERS {
            for _ in 0..self.state.time.cycles_per_quarter {
                self.state.net.step_cycle(&self.state.time);
                self.stat_counters(train);
                if !train {
                    let row = self.state.time.trial_cycle;
                    self.logs
                        .log(Mode::Test, Timescale::Cycle, Some(row), &self.state.stats);
                }
                self.state.time.cycle_inc();
            }
            self.state.net.finalize_quarter(&self.state.time);
            self.state.time.quarter_inc();
        }
        self.stat_counters(train);

        if train {
            let delta = self.state.net.compute_weight_delta();
            self.state.net.apply_weight_delta(delta);
        }
    }

    /// Apply the current trial record of the train or test environment.
    pub fn apply_inputs(&mut self, mode: Mode) -> SimResult<()> {
        let env = match mode {
            Mode::Train => &self.train_env,
            Mode::Test | Mode::Analyze => &self.test_env,
        };
        let Some(record) = env.current_trial() else {
            return Ok(());
        };
        let trial = env.trial.cur;
        self.state
            .apply_record(record)
            .map_err(|source| SimError::TrialAborted {
                mode,
                run: self.train_env.run.cur,
                epoch: self.train_env.epoch.cur,
                trial,
                source,
            })
    }

    /// Trial-level error over the stat layers, written into the stats and
    /// folded into the epoch accumulator for `mode`.
    pub fn trial_stats(&mut self, mode: Mode) -> TrialError {
        let tolerance = self.config.error_tolerance;
        let errors: Vec<LayerError> = self
            .error_layers()
            .into_iter()
            .map(|id| self.state.net.layer_error(id, tolerance))
            .collect();
        let err = TrialError::from_layers(&errors);
        err.write_to(&mut self.state.stats);
        match mode {
            Mode::Train => self.train_acc.add(&err),
            Mode::Test => self.test_acc.add(&err),
            Mode::Analyze => {}
        }
        err
    }

    /// Configured stat layers, or every active target/compare layer.
    fn error_layers(&self) -> Vec<LayerId> {
        if !self.stat_layers.is_empty() {
            return self
                .stat_layers
                .iter()
                .copied()
                .filter(|&id| self.state.is_active(id))
                .collect();
        }
        self.state
            .layers()
            .driven()
            .iter()
            .map(|l| l.id)
            .filter(|&id| self.state.is_active(id))
            .filter(|&id| self.state.role(id).is_some_and(LayerRole::takes_target))
            .collect()
    }

    /// Close the epoch that just finished; `epoch` is the new counter value.
    fn epoch_end(&mut self, epoch: usize) -> SimResult<()> {
        let completed = epoch.saturating_sub(1);
        let summary = self.train_acc.finish();
        summary.write_to(&mut self.state.stats);
        update_zero_streak(&mut self.state.stats, &summary, completed);
        self.state.stats.set_int("Epoch", completed as i64);

        let interval = self.config.diagnostic_interval;
        if interval > 0 && (epoch as i64 - 1) % interval == 0 {
            self.run_diagnostics();
        }

        self.logs
            .log(Mode::Train, Timescale::Epoch, None, &self.state.stats);
        debug!(
            epoch = completed,
            sse = summary.sse,
            pct_cor = summary.pct_cor,
            nzero = self.state.stats.int("NZero"),
            "epoch"
        );

        let test = self.config.test_interval;
        if test > 0 && epoch as i64 % test == 0 {
            self.test_all()?;
        }
        Ok(())
    }

    fn diagnostics_recording(&self, epoch: usize) -> bool {
        let interval = self.config.diagnostic_interval;
        !self.diag_layers.is_empty() && interval > 0 && epoch as i64 % interval == 0
    }

    /// PCA over the activations recorded since the last diagnostic pass.
    fn run_diagnostics(&mut self) {
        for ((_, name), samples) in self.diag_layers.iter().zip(&self.diag_samples) {
            if samples.is_empty() {
                continue;
            }
            let summary = pca::summarize(samples);
            summary.write_to(&mut self.state.stats, name);
            debug!(layer = %name, n_strong = summary.n_strong, "pca");
        }
        self.clear_diagnostics();
    }

    fn clear_diagnostics(&mut self) {
        for samples in &mut self.diag_samples {
            samples.clear();
        }
        self.logs.reset(Mode::Analyze, Timescale::Trial);
    }

    /// Log the run row and optionally save weights.
    fn run_end(&mut self, reason: StopReason) -> SimResult<()> {
        let run = self.train_env.run.cur;
        let epoch = self.train_env.epoch.cur;
        self.state.stats.set_string("StopReason", reason.to_string());
        self.logs
            .log(Mode::Train, Timescale::Run, None, &self.state.stats);
        info!(
            run,
            epochs = epoch,
            reason = %reason,
            first_zero = self.state.stats.int("FirstZero"),
            "run end"
        );

        if self.config.save_weights {
            let name = self
                .config
                .weights_name(self.state.net.name(), run, epoch);
            info!(%name, "saving weights");
            self.state.net.save_checkpoint(&name)?;
        }
        Ok(())
    }

    // -- loops --------------------------------------------------------------

    /// Train until every configured run is done or a stop is requested.
    pub fn train(&mut self) -> SimResult<Option<StopReason>> {
        let _guard = self.control.try_begin()?;
        self.train_loop(Scope::All)
    }

    /// Train for the rest of the current run.
    pub fn train_run(&mut self) -> SimResult<Option<StopReason>> {
        let _guard = self.control.try_begin()?;
        self.train_loop(Scope::Run)
    }

    /// Train for the rest of the current epoch.
    pub fn train_epoch(&mut self) -> SimResult<Option<StopReason>> {
        let _guard = self.control.try_begin()?;
        self.train_loop(Scope::Epoch)
    }

    /// Returns the last stop reason seen, if any.
    pub(crate) fn train_loop(&mut self, scope: Scope) -> SimResult<Option<StopReason>> {
        let epoch = self.train_env.epoch.cur;
        let run = self.train_env.run.cur;
        let mut last = None;
        loop {
            match self.train_trial()? {
                TrialStep::Complete => break,
                TrialStep::Stopped(reason) => last = Some(reason),
                TrialStep::Trained => {}
            }
            if self.complete || self.control.stop_requested() {
                break;
            }
            let boundary = match scope {
                Scope::Epoch => self.train_env.epoch.cur != epoch || last.is_some(),
                Scope::Run => self.train_env.run.cur != run,
                Scope::All => false,
            };
            if boundary {
                break;
            }
        }
        if self.control.stop_requested() {
            warn!(
                run = self.train_env.run.cur,
                epoch = self.train_env.epoch.cur,
                "training stopped by request"
            );
        }
        Ok(last)
    }

    /// Train the current phase until its stopping policy fires. `None` when
    /// a stop was requested first.
    pub(crate) fn train_until_stop(&mut self) -> SimResult<Option<StopReason>> {
        loop {
            match self.step_training(RunAdvance::Hold)? {
                TrialStep::Stopped(reason) => return Ok(Some(reason)),
                TrialStep::Trained | TrialStep::Complete => {}
            }
            if self.control.stop_requested() {
                return Ok(None);
            }
        }
    }

    // -- testing ------------------------------------------------------------

    /// One testing trial; no weight change. Returns true when the test
    /// environment wrapped into a new epoch, in which case no trial ran
    /// if `return_on_change` is set.
    pub fn test_trial(&mut self, return_on_change: bool) -> SimResult<bool> {
        let change = self.test_env.step();
        if change.epoch_changed {
            let summary = self.test_acc.finish();
            let mut row = self.state.stats.clone();
            summary.write_to(&mut row);
            self.logs.log(Mode::Test, Timescale::Epoch, None, &row);
            debug!(pct_cor = summary.pct_cor, sse = summary.sse, "test epoch");
            if return_on_change {
                return Ok(true);
            }
        }

        // Test trials score into a scratch row; the live stats keep the
        // training trial's values.
        let live = self.state.stats.clone();
        let result = self.apply_inputs(Mode::Test).map(|()| {
            self.alpha_cycle(false);
            self.trial_stats(Mode::Test);
        });
        let row = std::mem::replace(&mut self.state.stats, live);
        result?;
        let trial = self.test_env.trial.cur;
        self.logs.log(Mode::Test, Timescale::Trial, Some(trial), &row);
        Ok(change.epoch_changed)
    }

    /// Test the table row at `index` without moving any counter.
    pub fn test_item(&mut self, index: usize) -> SimResult<TrialError> {
        let prev = self.test_env.present_row(index).ok_or_else(|| {
            SimError::Configuration(format!(
                "test item {index} out of range ({} rows)",
                self.test_env.table().len()
            ))
        })?;
        let live = self.state.stats.clone();
        let result = self.apply_inputs(Mode::Test).map(|()| {
            self.alpha_cycle(false);
            self.trial_stats(Mode::Analyze)
        });
        self.state.stats = live;
        self.test_env.restore_position(prev);
        result
    }

    /// One sequential pass over the test table. Returns false when a stop
    /// request cut it short.
    pub fn test_all(&mut self) -> SimResult<bool> {
        self.test_env.init(self.train_env.run.cur);
        self.test_acc = EpochAccumulator::default();
        loop {
            if self.test_trial(true)? {
                return Ok(true);
            }
            if self.control.stop_requested() {
                return Ok(false);
            }
        }
    }

    /// [`Self::test_all`] as a cancellable top-level task.
    pub fn run_test_all(&mut self) -> SimResult<bool> {
        let _guard = self.control.try_begin()?;
        self.test_all()
    }

    // -- protocol hooks -----------------------------------------------------

    /// Fresh convergence window on `table` at the current run index.
    pub(crate) fn begin_phase(&mut self, name: &str, table: Arc<TrialTable>, max_epochs: usize) {
        self.train_env.epoch.init();
        self.train_env.set_table(table);
        self.train_env.init(self.train_env.run.cur);
        self.train_acc = EpochAccumulator::default();
        self.clear_diagnostics();
        self.max_epochs_override = Some(max_epochs);
        self.state.stats.set_string("Phase", name);
        self.state.stats.set_int("NZero", 0);
        self.state.stats.set_int("FirstZero", -1);
    }

    pub(crate) fn end_phase(&mut self) {
        self.max_epochs_override = None;
    }

    /// Select the run index `run` for the next [`Self::new_run`].
    pub(crate) fn set_run(&mut self, run: usize) {
        self.train_env.run.set(run);
        self.complete = false;
    }

    // -- helpers ------------------------------------------------------------

    fn reset_run_counter(&mut self) {
        self.train_env.run.set(self.config.start_run);
        self.train_env.run.max = self.config.end_run();
        self.needs_new_run = true;
    }

    fn init_stats(&mut self) {
        let stats = &mut self.state.stats;
        stats.set_float("TrlErr", 0.0);
        stats.set_float("TrlSSE", 0.0);
        stats.set_float("TrlAvgSSE", 0.0);
        stats.set_float("TrlCosDiff", 0.0);
        stats.set_int("FirstZero", -1);
        stats.set_int("NZero", 0);
        stats.set_string("StopReason", "");
    }

    /// Copy counters into the stats for logging.
    fn stat_counters(&mut self, train: bool) {
        let env = if train { &self.train_env } else { &self.test_env };
        let stats = &mut self.state.stats;
        stats.set_int("Run", self.train_env.run.cur as i64);
        stats.set_int("Epoch", self.train_env.epoch.cur as i64);
        stats.set_int("Trial", env.trial.cur as i64);
        stats.set_string("TrialName", env.trial_name());
        stats.set_int("Cycle", self.state.time.trial_cycle as i64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mock::{Call, RecordingNet};
    use crate::observer::MemoryLog;

    fn table(n: usize) -> Arc<TrialTable> {
        let records = (0..n)
            .map(|i| {
                TrialRecord::new(format!("t{i}"))
                    .with_field("In", vec![i as f32, 1.0])
                    .with_field("Out", vec![1.0, 0.0])
            })
            .collect();
        Arc::new(TrialTable::new("pats", records))
    }

    fn controller(
        net: RecordingNet,
        trials: usize,
        config: RunConfig,
    ) -> (RunController<RecordingNet>, Arc<Mutex<MemoryLog>>) {
        let driven = [
            ("In".to_string(), LayerRole::Input),
            ("Out".to_string(), LayerRole::Target),
        ];
        let state = SimulationState::new(net, &driven, config.cycles_per_quarter).unwrap();
        let mem = MemoryLog::new().skipping(Timescale::Cycle).shared();
        let ctl = RunController::new(state, config, table(trials), table(trials))
            .unwrap()
            .with_sink(Arc::clone(&mem));
        (ctl, mem)
    }

    fn net() -> RecordingNet {
        RecordingNet::new(&[("In", 2), ("Hidden", 3), ("Out", 2)])
    }

    fn quick(max_epochs: usize) -> RunConfig {
        RunConfig {
            max_epochs,
            cycles_per_quarter: 1,
            diagnostic_interval: -1,
            ..Default::default()
        }
    }

    #[test]
    fn end_to_end_counts() {
        let (mut ctl, mem) = controller(net(), 4, quick(2));
        let reason = ctl.train().unwrap();
        assert_eq!(reason, Some(StopReason::MaxEpochs));
        assert!(ctl.is_complete());

        let net = &ctl.state().net;
        assert_eq!(net.count(|c| matches!(c, Call::BeginTrial(true))), 8);
        assert_eq!(net.count(|c| *c == Call::ComputeDelta), 8);
        assert_eq!(net.weights.len(), 8);

        let mem = mem.lock().unwrap();
        assert_eq!(mem.len(Mode::Train, Timescale::Epoch), 2);
        assert_eq!(mem.len(Mode::Train, Timescale::Run), 1);
        assert_eq!(
            mem.table(Mode::Train, Timescale::Run)[0].string("StopReason"),
            "MaxEpochs"
        );
    }

    #[test]
    fn max_epochs_without_streak_runs_exactly() {
        let (mut ctl, mem) = controller(net(), 3, quick(5));
        ctl.train().unwrap();
        assert_eq!(mem.lock().unwrap().len(Mode::Train, Timescale::Epoch), 5);
        assert_eq!(ctl.state().net.count(|c| *c == Call::ApplyDelta), 15);
    }

    #[test]
    fn zero_error_streak_stops_early() {
        let n = 4;
        // Zero SSE for every trial of epochs 2, 3 and 4.
        let net = net().with_sse(move |t| if (2 * n..5 * n).contains(&t) { 0.0 } else { 1.0 });
        let config = RunConfig {
            nzero_stop: 3,
            ..quick(100)
        };
        let (mut ctl, mem) = controller(net, n, config);
        let reason = ctl.train().unwrap();

        assert_eq!(reason, Some(StopReason::ZeroErrorStreak));
        assert_eq!(ctl.state().net.count(|c| *c == Call::ComputeDelta), 5 * n);
        let mem = mem.lock().unwrap();
        assert_eq!(mem.len(Mode::Train, Timescale::Epoch), 5);
        let run = &mem.table(Mode::Train, Timescale::Run)[0];
        assert_eq!(run.string("StopReason"), "ZeroErrorStreak");
        assert_eq!(run.int("FirstZero"), 2);
        assert_eq!(run.int("NZero"), 3);
    }

    #[test]
    fn settle_loop_call_order() {
        let config = RunConfig {
            cycles_per_quarter: 2,
            ..quick(1)
        };
        let (mut ctl, _) = controller(net(), 1, config);
        assert_eq!(ctl.train_trial().unwrap(), TrialStep::Trained);

        let calls: Vec<Call> = ctl
            .state()
            .net
            .calls
            .iter()
            .filter(|c| !matches!(c, Call::SetRole(..) | Call::Reset))
            .cloned()
            .collect();
        let mut expected = vec![Call::ApplyExt(LayerId(0)), Call::ApplyExt(LayerId(2))];
        expected.push(Call::BeginTrial(true));
        for q in 0..QUARTERS {
            expected.push(Call::StepCycle { quarter: q, cycle: 0 });
            expected.push(Call::StepCycle { quarter: q, cycle: 1 });
            expected.push(Call::FinalizeQuarter(q));
        }
        expected.push(Call::ComputeDelta);
        expected.push(Call::ApplyDelta);
        assert_eq!(calls, expected);
    }

    #[test]
    fn test_all_applies_no_delta_and_keeps_train_counters() {
        let (mut ctl, mem) = controller(net(), 3, quick(10));
        for _ in 0..4 {
            ctl.train_trial().unwrap();
        }
        let (epoch, trial) = (ctl.train_env().epoch.cur, ctl.train_env().trial.cur);
        let deltas = ctl.state().net.count(|c| *c == Call::ComputeDelta);

        assert!(ctl.test_all().unwrap());

        assert_eq!(ctl.state().net.count(|c| *c == Call::ComputeDelta), deltas);
        assert_eq!(ctl.state().net.count(|c| matches!(c, Call::BeginTrial(false))), 3);
        assert_eq!((ctl.train_env().epoch.cur, ctl.train_env().trial.cur), (epoch, trial));
        let mem = mem.lock().unwrap();
        assert_eq!(mem.len(Mode::Test, Timescale::Trial), 3);
        assert_eq!(mem.len(Mode::Test, Timescale::Epoch), 1);
    }

    #[test]
    fn compare_layer_is_driven_and_scored() {
        let out = LayerId(2);
        let (mut ctl, mem) = controller(net(), 3, quick(1));
        ctl.state_mut().set_role(out, LayerRole::Compare);
        assert_eq!(ctl.error_layers(), vec![out]);

        ctl.train().unwrap();
        assert_eq!(ctl.state().net.count(|c| *c == Call::ApplyExt(out)), 3);
        let mem = mem.lock().unwrap();
        let epoch = &mem.table(Mode::Train, Timescale::Epoch)[0];
        assert_eq!(epoch.float("EpcSSE"), 1.0);

        let (mut ctl, _) = controller(net(), 3, quick(1));
        ctl.state_mut().set_role(out, LayerRole::Input);
        assert!(ctl.error_layers().is_empty());
    }

    #[test]
    fn run_row_keeps_training_trial_fields() {
        let config = RunConfig {
            test_interval: 1,
            ..quick(2)
        };
        // Three train trials then three test trials per epoch; the test
        // trials report a distinct SSE.
        let net = net().with_sse(|t| if t % 6 >= 3 { 0.25 } else { 1.0 });
        let (mut ctl, mem) = controller(net, 3, config);
        ctl.train().unwrap();

        let mem = mem.lock().unwrap();
        assert_eq!(mem.len(Mode::Test, Timescale::Epoch), 2);
        assert_eq!(
            mem.table(Mode::Test, Timescale::Trial)[0].float("TrlSSE"),
            0.25
        );
        let run = &mem.table(Mode::Train, Timescale::Run)[0];
        assert_eq!(run.float("TrlSSE"), 1.0);
        assert_eq!(ctl.state().stats.float("TrlSSE"), 1.0);
    }

    #[test]
    fn test_item_leaves_position() {
        let (mut ctl, _) = controller(net(), 3, quick(10));
        ctl.init().unwrap();
        ctl.test_trial(false).unwrap();
        let pos = ctl.test_env().trial.cur;
        ctl.test_item(2).unwrap();
        assert_eq!(ctl.test_env().trial.cur, pos);
        assert!(ctl.test_item(9).unwrap_err().is_configuration());
    }

    #[test]
    fn stop_is_idempotent_when_idle() {
        let (mut ctl, _) = controller(net(), 2, quick(1));
        ctl.train().unwrap();
        let control = ctl.control();
        let calls = ctl.state().net.calls.len();
        control.stop();
        control.stop();
        assert!(!control.is_running());
        assert!(!control.stop_requested());
        assert_eq!(ctl.state().net.calls.len(), calls);
    }

    #[test]
    fn second_start_is_rejected() {
        let (mut ctl, _) = controller(net(), 2, quick(1));
        let _guard = ctl.control().try_begin().unwrap();
        assert!(matches!(ctl.train(), Err(SimError::AlreadyRunning)));
    }

    #[test]
    fn bad_pattern_aborts_trial_without_delta() {
        let driven = [("In".to_string(), LayerRole::Input)];
        let state = SimulationState::new(net(), &driven, 1).unwrap();
        let bad = Arc::new(TrialTable::new(
            "bad",
            vec![TrialRecord::new("short").with_field("In", vec![1.0])],
        ));
        let mut ctl = RunController::new(state, quick(3), Arc::clone(&bad), bad).unwrap();

        let err = ctl.train_trial().unwrap_err();
        match err {
            SimError::TrialAborted {
                mode,
                run,
                epoch,
                trial,
                source: NetworkError::InvalidPatternShape { expected, actual, .. },
            } => {
                assert_eq!((mode, run, epoch, trial), (Mode::Train, 0, 0, 0));
                assert_eq!((expected, actual), (2, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ctl.state().net.count(|c| *c == Call::ComputeDelta), 0);
    }

    #[test]
    fn multiple_runs_reset_weights() {
        let config = RunConfig {
            max_runs: 2,
            ..quick(1)
        };
        let (mut ctl, mem) = controller(net(), 2, config);
        ctl.train().unwrap();
        assert_eq!(ctl.state().net.count(|c| *c == Call::Reset), 2);
        assert_eq!(mem.lock().unwrap().len(Mode::Train, Timescale::Run), 2);
        assert_eq!(ctl.train_trial().unwrap(), TrialStep::Complete);
    }

    #[test]
    fn stop_policy_prefers_streak() {
        let policy = StopPolicy {
            max_epochs: 5,
            nzero_stop: 2,
        };
        assert_eq!(policy.evaluate(4, 1), None);
        assert_eq!(policy.evaluate(5, 0), Some(StopReason::MaxEpochs));
        assert_eq!(policy.evaluate(5, 2), Some(StopReason::ZeroErrorStreak));
        let disabled = StopPolicy {
            max_epochs: 5,
            nzero_stop: -1,
        };
        assert_eq!(disabled.evaluate(3, 99), None);
    }

    #[test]
    fn diagnostics_record_hidden_activity() {
        let config = RunConfig {
            diagnostic_interval: 1,
            diagnostic_layers: vec!["Hidden".into()],
            ..quick(2)
        };
        let (mut ctl, _) = controller(net(), 3, config);
        ctl.train().unwrap();
        // Constant activity has no variance, so nothing is strong.
        assert!(ctl.stats().floats().any(|(k, _)| k == "Hidden_PCA_Top5"));
        assert_eq!(ctl.stats().float("Hidden_PCA_NStrong"), 0.0);
    }
}
