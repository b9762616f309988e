//! Read-only observers of a running simulation.
//!
//! The controller updates [`Stats`] and then notifies every sink with a
//! `(mode, timescale, row)` key. Sinks decide what to keep and how to
//! format it; they cannot steer the controller.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    Train,
    Test,
    Analyze,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Train => "Train",
            Mode::Test => "Test",
            Mode::Analyze => "Analyze",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Timescale {
    Cycle,
    Trial,
    Epoch,
    Run,
}

impl fmt::Display for Timescale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Timescale::Cycle => "Cycle",
            Timescale::Trial => "Trial",
            Timescale::Epoch => "Epoch",
            Timescale::Run => "Run",
        })
    }
}

/// Receiver of log-row notifications.
pub trait LogSink: Send {
    fn log_row(&mut self, mode: Mode, time: Timescale, row: usize, stats: &Stats);

    fn reset_log(&mut self, _mode: Mode, _time: Timescale) {}
}

/// A reader that panicked while holding the lock leaves the sink itself
/// intact, so rows keep flowing into a poisoned mutex.
impl<T: LogSink> LogSink for Arc<Mutex<T>> {
    fn log_row(&mut self, mode: Mode, time: Timescale, row: usize, stats: &Stats) {
        let mut inner = self.lock().unwrap_or_else(|p| p.into_inner());
        inner.log_row(mode, time, row, stats);
    }

    fn reset_log(&mut self, mode: Mode, time: Timescale) {
        let mut inner = self.lock().unwrap_or_else(|p| p.into_inner());
        inner.reset_log(mode, time);
    }
}

/// Fan-out to every attached sink, tracking append positions per table.
#[derive(Default)]
pub struct Logs {
    sinks: Vec<Box<dyn LogSink>>,
    rows: HashMap<(Mode, Timescale), usize>,
}

impl Logs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sink: impl LogSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn with(mut self, sink: impl LogSink + 'static) -> Self {
        self.attach(sink);
        self
    }

    /// Log at `row`, or append when `row` is `None`.
    pub fn log(&mut self, mode: Mode, time: Timescale, row: Option<usize>, stats: &Stats) {
        let next = self.rows.entry((mode, time)).or_insert(0);
        let row = match row {
            Some(r) => r,
            None => *next,
        };
        *next = (*next).max(row + 1);
        for sink in &mut self.sinks {
            sink.log_row(mode, time, row, stats);
        }
    }

    pub fn reset(&mut self, mode: Mode, time: Timescale) {
        self.rows.remove(&(mode, time));
        for sink in &mut self.sinks {
            sink.reset_log(mode, time);
        }
    }

    pub fn rows(&self, mode: Mode, time: Timescale) -> usize {
        self.rows.get(&(mode, time)).copied().unwrap_or(0)
    }
}

/// Forwards rows to `tracing`: runs at info, epochs at debug, the rest at trace.
#[derive(Debug, Clone, Default)]
pub struct TracingLog;

const TRIAL_KEYS: &[&str] = &["Run", "Epoch", "Trial", "TrialName", "TrlSSE", "TrlCosDiff"];
const EPOCH_KEYS: &[&str] = &["Phase", "Run", "Epoch", "EpcSSE", "EpcPctCor", "EpcCosDiff", "NZero"];
const RUN_KEYS: &[&str] = &["Phase", "Run", "Epoch", "StopReason", "FirstZero", "EpcPctCor"];

impl LogSink for TracingLog {
    fn log_row(&mut self, mode: Mode, time: Timescale, row: usize, stats: &Stats) {
        match time {
            Timescale::Run => info!(%mode, row, "run: {}", stats.print(RUN_KEYS)),
            Timescale::Epoch => debug!(%mode, row, "epoch: {}", stats.print(EPOCH_KEYS)),
            Timescale::Trial => trace!(%mode, row, "trial: {}", stats.print(TRIAL_KEYS)),
            Timescale::Cycle => trace!(%mode, row, cycle = stats.int("Cycle")),
        }
    }
}

/// Keeps every row in memory, keyed by `(mode, timescale)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    tables: HashMap<(Mode, Timescale), Vec<Stats>>,
    /// Timescales to ignore (per-cycle rows are numerous).
    skip: Vec<Timescale>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skipping(mut self, time: Timescale) -> Self {
        self.skip.push(time);
        self
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn table(&self, mode: Mode, time: Timescale) -> &[Stats] {
        self.tables
            .get(&(mode, time))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self, mode: Mode, time: Timescale) -> usize {
        self.table(mode, time).len()
    }

    /// Test trials that had any error, and their summed SSE.
    pub fn test_errors(&self) -> (Vec<Stats>, f64) {
        let rows: Vec<Stats> = self
            .table(Mode::Test, Timescale::Trial)
            .iter()
            .filter(|s| s.float("TrlErr") > 0.0)
            .cloned()
            .collect();
        let sse = rows.iter().map(|s| s.float("TrlSSE")).sum();
        (rows, sse)
    }

    /// Descriptive stats over all logged runs.
    pub fn run_summary(&self) -> RunSummary {
        let runs = self.table(Mode::Train, Timescale::Run);
        let first_zero: Vec<f64> = runs
            .iter()
            .map(|s| s.int("FirstZero"))
            .filter(|&v| v >= 0)
            .map(|v| v as f64)
            .collect();
        let pct_cor: Vec<f64> = runs.iter().map(|s| s.float("EpcPctCor")).collect();
        RunSummary {
            runs: runs.len(),
            converged: runs
                .iter()
                .filter(|s| s.string("StopReason") == "ZeroErrorStreak")
                .count(),
            first_zero: Describe::of(&first_zero),
            pct_cor: Describe::of(&pct_cor),
        }
    }
}

impl LogSink for MemoryLog {
    fn log_row(&mut self, mode: Mode, time: Timescale, row: usize, stats: &Stats) {
        if self.skip.contains(&time) {
            return;
        }
        let table = self.tables.entry((mode, time)).or_default();
        if row < table.len() {
            table[row] = stats.clone();
        } else {
            table.push(stats.clone());
        }
    }

    fn reset_log(&mut self, mode: Mode, time: Timescale) {
        self.tables.remove(&(mode, time));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Describe {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Describe {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sum: f64 = values.iter().sum();
        Self {
            count: values.len(),
            mean: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunSummary {
    pub runs: usize,
    pub converged: usize,
    pub first_zero: Describe,
    pub pct_cor: Describe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_append_and_overwrite_rows() {
        let mem = MemoryLog::new().shared();
        let mut logs = Logs::new().with(Arc::clone(&mem));
        let mut stats = Stats::new();

        stats.set_int("Trial", 0);
        logs.log(Mode::Train, Timescale::Trial, Some(0), &stats);
        stats.set_int("Trial", 1);
        logs.log(Mode::Train, Timescale::Trial, Some(1), &stats);
        stats.set_int("Trial", 7);
        logs.log(Mode::Train, Timescale::Trial, Some(0), &stats);
        logs.log(Mode::Train, Timescale::Epoch, None, &stats);
        logs.log(Mode::Train, Timescale::Epoch, None, &stats);

        let mem = mem.lock().unwrap();
        assert_eq!(mem.len(Mode::Train, Timescale::Trial), 2);
        assert_eq!(mem.table(Mode::Train, Timescale::Trial)[0].int("Trial"), 7);
        assert_eq!(mem.len(Mode::Train, Timescale::Epoch), 2);
        assert_eq!(logs.rows(Mode::Train, Timescale::Epoch), 2);
    }

    #[test]
    fn poisoned_sink_keeps_recording() {
        let mem = MemoryLog::new().shared();
        let held = Arc::clone(&mem);
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("reader died holding the log");
        })
        .join();
        assert!(mem.is_poisoned());

        let mut logs = Logs::new().with(Arc::clone(&mem));
        let stats = Stats::new();
        logs.log(Mode::Train, Timescale::Epoch, None, &stats);
        logs.log(Mode::Train, Timescale::Epoch, None, &stats);
        let recorded = mem.lock().unwrap_or_else(|p| p.into_inner());
        assert_eq!(recorded.len(Mode::Train, Timescale::Epoch), 2);
    }

    #[test]
    fn reset_clears_table() {
        let mem = MemoryLog::new().shared();
        let mut logs = Logs::new().with(Arc::clone(&mem));
        logs.log(Mode::Test, Timescale::Epoch, None, &Stats::new());
        logs.reset(Mode::Test, Timescale::Epoch);
        assert_eq!(mem.lock().unwrap().len(Mode::Test, Timescale::Epoch), 0);
        assert_eq!(logs.rows(Mode::Test, Timescale::Epoch), 0);
    }

    #[test]
    fn run_summary_describes_runs() {
        let mut mem = MemoryLog::new();
        for (fz, reason) in [(4, "ZeroErrorStreak"), (-1, "MaxEpochs"), (8, "ZeroErrorStreak")] {
            let mut s = Stats::new();
            s.set_int("FirstZero", fz);
            s.set_float("EpcPctCor", 1.0);
            s.set_string("StopReason", reason);
            mem.log_row(Mode::Train, Timescale::Run, usize::MAX, &s);
        }
        let summary = mem.run_summary();
        assert_eq!(summary.runs, 3);
        assert_eq!(summary.converged, 2);
        assert_eq!(summary.first_zero.count, 2);
        assert_eq!(summary.first_zero.mean, 6.0);
        assert_eq!(summary.pct_cor.min, 1.0);
    }

    #[test]
    fn test_errors_filters_error_trials() {
        let mut mem = MemoryLog::new();
        for (i, sse) in [0.0, 1.5, 0.0, 2.0].into_iter().enumerate() {
            let mut s = Stats::new();
            s.set_float("TrlSSE", sse);
            s.set_float("TrlErr", if sse > 0.0 { 1.0 } else { 0.0 });
            mem.log_row(Mode::Test, Timescale::Trial, i, &s);
        }
        let (rows, sse) = mem.test_errors();
        assert_eq!(rows.len(), 2);
        assert_eq!(sse, 3.5);
    }

    #[test]
    fn skipped_timescales_are_dropped() {
        let mut mem = MemoryLog::new().skipping(Timescale::Cycle);
        mem.log_row(Mode::Test, Timescale::Cycle, 0, &Stats::new());
        assert_eq!(mem.len(Mode::Test, Timescale::Cycle), 0);
    }
}
