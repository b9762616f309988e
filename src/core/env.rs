//! Trial environments: a replayable enumerator over a table of named trial
//! records with nested Run ⊃ Epoch ⊃ Trial counters.

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::prng::Prng;

/// One row of a training or testing table.
///
/// Field names are matched against layer names when inputs are applied.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialRecord {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: HashMap<String, Vec<f32>>,
}

impl TrialRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, pattern: Vec<f32>) -> Self {
        self.fields.insert(field.into(), pattern);
        self
    }

    pub fn field(&self, field: &str) -> Option<&[f32]> {
        self.fields.get(field).map(|v| v.as_slice())
    }
}

/// Ordered sequence of trial records: the data-source contract.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialTable {
    pub name: String,
    pub records: Vec<TrialRecord>,
}

impl TrialTable {
    pub fn new(name: impl Into<String>, records: Vec<TrialRecord>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Row indices whose name contains `needle`, case-insensitively.
    pub fn rows_matching(&self, needle: &str) -> Vec<usize> {
        let needle = needle.to_lowercase();
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.name.to_lowercase().contains(&needle))
            .map(|(i, _)| i)
            .collect()
    }
}

/// A counter with change tracking. `max == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counter {
    pub cur: usize,
    pub prev: usize,
    pub changed: bool,
    pub max: usize,
}

impl Counter {
    pub fn set(&mut self, value: usize) -> bool {
        self.changed = value != self.cur;
        self.prev = self.cur;
        self.cur = value;
        self.changed
    }

    pub fn init(&mut self) {
        self.prev = 0;
        self.cur = 0;
        self.changed = false;
    }

    /// Increment; returns true when `max` is positive and has been reached.
    pub fn incr(&mut self) -> bool {
        self.prev = self.cur;
        self.cur += 1;
        self.changed = true;
        self.max > 0 && self.cur >= self.max
    }
}

/// Which counters moved on the last [`FixedTable::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepChange {
    pub epoch_changed: bool,
    pub run_changed: bool,
}

/// Environment that walks a fixed table once per epoch, either in table
/// order or in a fresh permutation each epoch.
#[derive(Debug, Clone)]
pub struct FixedTable {
    pub name: String,
    table: Arc<TrialTable>,
    order: Vec<usize>,
    pub sequential: bool,
    rng: Prng,

    pub run: Counter,
    pub epoch: Counter,
    pub trial: Counter,
    trial_name: String,

    // Set by `init`: the next `step` presents trial 0 without advancing.
    armed: bool,
}

impl FixedTable {
    pub fn new(name: impl Into<String>, table: Arc<TrialTable>) -> Self {
        let order = (0..table.len()).collect();
        Self {
            name: name.into(),
            table,
            order,
            sequential: false,
            rng: Prng::new(1),
            run: Counter::default(),
            epoch: Counter::default(),
            trial: Counter::default(),
            trial_name: String::new(),
            armed: true,
        }
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn table(&self) -> &Arc<TrialTable> {
        &self.table
    }

    /// Swap the data source. Counters are left alone; call [`Self::init`].
    pub fn set_table(&mut self, table: Arc<TrialTable>) {
        self.table = table;
        self.order = (0..self.table.len()).collect();
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.table.is_empty() {
            return Err(SimError::Configuration(format!(
                "environment `{}`: table `{}` has no trials",
                self.name, self.table.name
            )));
        }
        Ok(())
    }

    /// Reset to the start of `run`: Epoch=0, Trial=0.
    pub fn init(&mut self, run: usize) {
        self.run.set(run);
        self.run.changed = false;
        self.epoch.init();
        self.trial.init();
        self.trial.max = self.table.len();
        self.armed = true;
        self.reorder();
        self.set_trial_name();
    }

    /// Advance one trial, wrapping into the next epoch (and run) as needed.
    pub fn step(&mut self) -> StepChange {
        let mut change = StepChange::default();
        self.epoch.changed = false;
        self.run.changed = false;

        if self.armed {
            self.armed = false;
            self.trial.changed = false;
            self.set_trial_name();
            return change;
        }

        if self.trial.incr() {
            self.trial.set(0);
            self.reorder();
            change.epoch_changed = true;
            if self.epoch.incr() {
                self.epoch.set(0);
                self.epoch.changed = true;
                self.run.incr();
                change.run_changed = true;
            }
        }
        self.set_trial_name();
        change
    }

    pub fn current_index(&self) -> usize {
        self.order.get(self.trial.cur).copied().unwrap_or(0)
    }

    pub fn current_trial(&self) -> Option<&TrialRecord> {
        self.table.records.get(self.current_index())
    }

    pub fn trial_name(&self) -> &str {
        &self.trial_name
    }

    /// Point the trial counter at a table row directly (for single-item tests).
    pub(crate) fn present_row(&mut self, row: usize) -> Option<usize> {
        if row >= self.table.len() {
            return None;
        }
        let pos = self.order.iter().position(|&r| r == row)?;
        let prev = self.trial.cur;
        self.trial.cur = pos;
        self.set_trial_name();
        Some(prev)
    }

    pub(crate) fn restore_position(&mut self, pos: usize) {
        self.trial.cur = pos;
        self.set_trial_name();
    }

    fn reorder(&mut self) {
        let n = self.table.len();
        if self.sequential {
            self.order = (0..n).collect();
        } else {
            self.order = self.rng.permutation(n);
        }
    }

    fn set_trial_name(&mut self) {
        self.trial_name = self
            .current_trial()
            .map(|r| r.name.clone())
            .unwrap_or_default();
    }
}
