//! Run parameters and the JSON simulation description used by the binaries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::controller::{RunController, SimulationState};
use crate::engine::{NetSpec, RateNet};
use crate::env::TrialTable;
use crate::error::{SimError, SimResult};
use crate::layers::LayerOp;
use crate::network::LayerRole;
use crate::protocol::{Phase, Protocol};
use crate::storage::CheckpointStore;
use crate::task::Session;

/// Number of per-run seeds kept by default.
pub const SEED_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RunConfig {
    /// Runs to perform, counted from `start_run`.
    pub max_runs: usize,
    pub max_epochs: usize,
    /// Stop after this many consecutive zero-error epochs; <= 0 disables.
    pub nzero_stop: i64,
    /// Test pass every N training epochs; <= 0 disables.
    pub test_interval: i64,
    /// Hidden-layer PCA every N epochs; <= 0 disables.
    pub diagnostic_interval: i64,
    pub cycles_per_quarter: usize,
    /// Save weights at the end of every run.
    pub save_weights: bool,
    pub start_run: usize,
    /// Extra tag for file names.
    pub tag: String,
    /// Parameter-set name, part of the run name.
    pub params: String,
    /// Seed per run index.
    pub seeds: Vec<u64>,
    /// Layers whose error feeds the trial statistics.
    pub stat_layers: Vec<String>,
    /// Layers whose activity is sampled for PCA diagnostics.
    pub diagnostic_layers: Vec<String>,
    /// Per-unit error tolerance for SSE.
    pub error_tolerance: f32,
    /// Present training trials in table order instead of a fresh permutation.
    pub sequential: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_runs: 1,
            max_epochs: 100,
            nzero_stop: -1,
            test_interval: -1,
            diagnostic_interval: 5,
            cycles_per_quarter: 25,
            save_weights: false,
            start_run: 0,
            tag: String::new(),
            params: "Base".to_string(),
            seeds: (1..=SEED_COUNT as u64).collect(),
            stat_layers: Vec::new(),
            diagnostic_layers: Vec::new(),
            error_tolerance: 0.5,
            sequential: false,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> SimResult<()> {
        if self.max_runs == 0 {
            return Err(SimError::Configuration("max_runs must be positive".into()));
        }
        if self.max_epochs == 0 {
            return Err(SimError::Configuration(
                "max_epochs must be positive".into(),
            ));
        }
        if self.cycles_per_quarter == 0 {
            return Err(SimError::Configuration(
                "cycles_per_quarter must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Seed for `run`. Runs beyond the seed list derive one from the index.
    pub fn seed_for_run(&self, run: usize) -> u64 {
        self.seeds.get(run).copied().unwrap_or(run as u64 + 1)
    }

    /// Replace every seed with `base + i`.
    pub fn reseed_from(&mut self, base: u64) {
        let n = self.seeds.len().max(SEED_COUNT);
        self.seeds = (0..n as u64).map(|i| base.wrapping_add(i)).collect();
    }

    /// One past the last run index.
    pub fn end_run(&self) -> usize {
        self.start_run + self.max_runs
    }

    /// `tag_params[_start]`
    pub fn run_name(&self) -> String {
        let mut name = String::new();
        if !self.tag.is_empty() {
            name.push_str(&self.tag);
            name.push('_');
        }
        name.push_str(&self.params);
        if self.start_run > 0 {
            name.push_str(&format!("_{:03}", self.start_run));
        }
        name
    }

    pub fn weights_name(&self, net: &str, run: usize, epoch: usize) -> String {
        format!("{net}_{}_{}", self.run_name(), run_epoch_name(run, epoch))
    }
}

/// Zero-padded `run_epoch`, three and five digits.
pub fn run_epoch_name(run: usize, epoch: usize) -> String {
    format!("{run:03}_{epoch:05}")
}

/// A layer that receives values from trial records.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DrivenSpec {
    pub name: String,
    pub role: LayerRole,
}

/// Declarative phase, tables referenced by name.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhaseSpec {
    pub name: String,
    pub table: String,
    pub max_epochs: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ops: Vec<LayerOp>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub load_checkpoint: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub save_checkpoint: Option<String>,
}

/// Everything the CLI needs to build and run a simulation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimConfig {
    pub network: NetSpec,
    #[cfg_attr(feature = "serde", serde(default))]
    pub run: RunConfig,
    pub driven: Vec<DrivenSpec>,
    pub tables: Vec<TrialTable>,
    /// Table used by plain training and as the first protocol table.
    pub train_table: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub test_table: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub phases: Vec<PhaseSpec>,
    /// Directory for checkpoint files; in memory when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub checkpoint_dir: Option<PathBuf>,
}

impl SimConfig {
    #[cfg(feature = "serde")]
    pub fn load(path: &Path) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: SimConfig = serde_json::from_str(&text)?;
        cfg.run.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "serde")]
    pub fn save(&self, path: &Path) -> SimResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn driven_layers(&self) -> Vec<(String, LayerRole)> {
        self.driven
            .iter()
            .map(|d| (d.name.clone(), d.role))
            .collect()
    }

    /// Tables by name, shared.
    pub fn table_index(&self) -> HashMap<String, Arc<TrialTable>> {
        self.tables
            .iter()
            .map(|t| (t.name.clone(), Arc::new(t.clone())))
            .collect()
    }

    pub fn table(&self, name: &str) -> SimResult<Arc<TrialTable>> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .map(|t| Arc::new(t.clone()))
            .ok_or_else(|| SimError::Configuration(format!("unknown table `{name}`")))
    }

    /// The test table, falling back to the training table.
    pub fn test_table(&self) -> SimResult<Arc<TrialTable>> {
        self.table(self.test_table.as_deref().unwrap_or(&self.train_table))
    }

    /// Phases with their tables resolved.
    pub fn phases(&self) -> SimResult<Vec<Phase>> {
        let tables = self.table_index();
        self.phases
            .iter()
            .map(|spec| {
                let table = tables.get(&spec.table).cloned().ok_or_else(|| {
                    SimError::Configuration(format!(
                        "phase `{}` references unknown table `{}`",
                        spec.name, spec.table
                    ))
                })?;
                let mut phase = Phase::new(spec.name.clone(), table, spec.max_epochs);
                phase.ops = spec.ops.clone();
                phase.load_checkpoint = spec.load_checkpoint.clone();
                phase.save_checkpoint = spec.save_checkpoint.clone();
                Ok(phase)
            })
            .collect()
    }

    /// Reference engine, controller and (when phases are listed) protocol.
    pub fn build(&self) -> SimResult<Session<RateNet>> {
        let mut net = RateNet::new(&self.network)?;
        if let Some(dir) = &self.checkpoint_dir {
            net = net.with_store(CheckpointStore::dir(dir));
        }
        let state = SimulationState::new(net, &self.driven_layers(), self.run.cycles_per_quarter)?;
        let controller = RunController::new(
            state,
            self.run.clone(),
            self.table(&self.train_table)?,
            self.test_table()?,
        )?;
        let session = Session::new(controller);
        if self.phases.is_empty() {
            return Ok(session);
        }
        let protocol = Protocol::build(session.controller.state(), self.phases()?)?;
        Ok(session.with_protocol(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.max_runs, 1);
        assert_eq!(cfg.max_epochs, 100);
        assert_eq!(cfg.nzero_stop, -1);
        assert_eq!(cfg.test_interval, -1);
        assert_eq!(cfg.diagnostic_interval, 5);
        assert_eq!(cfg.seeds.len(), SEED_COUNT);
        assert_eq!(cfg.seed_for_run(0), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn names_are_zero_padded() {
        let mut cfg = RunConfig {
            tag: "pit".into(),
            ..Default::default()
        };
        assert_eq!(run_epoch_name(3, 42), "003_00042");
        assert_eq!(cfg.run_name(), "pit_Base");
        cfg.start_run = 2;
        assert_eq!(cfg.weights_name("Depress", 2, 7), "Depress_pit_Base_002_002_00007");
    }

    #[test]
    fn reseed_replaces_every_seed() {
        let mut cfg = RunConfig::default();
        cfg.reseed_from(1000);
        assert_eq!(cfg.seed_for_run(0), 1000);
        assert_eq!(cfg.seed_for_run(99), 1099);
    }

    #[test]
    fn zero_epochs_rejected() {
        let cfg = RunConfig {
            max_epochs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn demo_config_builds_a_session() {
        let cfg = crate::experiments::depress::sim_config(1, 1);
        let session = cfg.build().unwrap();
        assert!(session.protocol.is_some());
        assert_eq!(session.controller.train_env().table().name, "Instrumental");

        let mut bad = cfg.clone();
        bad.train_table = "Missing".into();
        assert!(bad.build().err().is_some_and(|e| e.is_configuration()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn sim_config_survives_json() {
        let cfg = crate::experiments::depress::sim_config(2, 3);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SimConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phases, cfg.phases);
        assert_eq!(back.network, cfg.network);
        assert_eq!(back.tables.len(), 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn run_config_fills_defaults_from_partial_json() {
        let cfg: RunConfig = serde_json::from_str(r#"{"max_epochs": 7, "tag": "x"}"#).unwrap();
        assert_eq!(cfg.max_epochs, 7);
        assert_eq!(cfg.max_runs, 1);
        assert_eq!(cfg.error_tolerance, 0.5);
    }
}
