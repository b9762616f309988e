//! Scalar statistics written by the controller and read by log sinks.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::network::LayerError;

/// Named floats, ints and strings.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stats {
    floats: BTreeMap<String, f64>,
    ints: BTreeMap<String, i64>,
    strings: BTreeMap<String, String>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_float(&mut self, name: &str, value: f64) {
        self.floats.insert(name.to_string(), value);
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.ints.insert(name.to_string(), value);
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.strings.insert(name.to_string(), value.into());
    }

    /// Missing floats read as 0.
    pub fn float(&self, name: &str) -> f64 {
        self.floats.get(name).copied().unwrap_or(0.0)
    }

    /// Missing ints read as 0.
    pub fn int(&self, name: &str) -> i64 {
        self.ints.get(name).copied().unwrap_or(0)
    }

    pub fn string(&self, name: &str) -> &str {
        self.strings.get(name).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn floats(&self) -> impl Iterator<Item = (&str, f64)> {
        self.floats.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn ints(&self) -> impl Iterator<Item = (&str, i64)> {
        self.ints.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn strings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.strings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `name:value` pairs for the given keys, in order, whichever map holds them.
    pub fn print(&self, keys: &[&str]) -> String {
        let mut out = String::new();
        for key in keys {
            let value = if let Some(v) = self.ints.get(*key) {
                v.to_string()
            } else if let Some(v) = self.floats.get(*key) {
                format!("{v:.4}")
            } else if let Some(v) = self.strings.get(*key) {
                v.clone()
            } else {
                continue;
            };
            if !out.is_empty() {
                out.push('\t');
            }
            out.push_str(key);
            out.push(':');
            out.push_str(&value);
        }
        out
    }
}

/// Trial-level error summed over the configured stat layers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrialError {
    pub sse: f64,
    pub avg_sse: f64,
    pub cos_diff: f64,
}

impl TrialError {
    pub fn from_layers(errors: &[LayerError]) -> Self {
        if errors.is_empty() {
            return Self::default();
        }
        let n = errors.len() as f64;
        Self {
            sse: errors.iter().map(|e| e.sse as f64).sum(),
            avg_sse: errors.iter().map(|e| e.avg_sse as f64).sum::<f64>() / n,
            cos_diff: errors.iter().map(|e| e.cos_diff as f64).sum::<f64>() / n,
        }
    }

    pub fn is_error(&self) -> bool {
        self.sse > 0.0
    }

    pub fn write_to(&self, stats: &mut Stats) {
        stats.set_float("TrlSSE", self.sse);
        stats.set_float("TrlAvgSSE", self.avg_sse);
        stats.set_float("TrlCosDiff", self.cos_diff);
        stats.set_float("TrlErr", if self.is_error() { 1.0 } else { 0.0 });
    }
}

/// Epoch-level aggregate over the trials of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EpochSummary {
    pub trials: usize,
    pub sse: f64,
    pub avg_sse: f64,
    pub pct_err: f64,
    pub pct_cor: f64,
    pub cos_diff: f64,
}

impl EpochSummary {
    pub fn is_zero_error(&self) -> bool {
        self.trials > 0 && self.pct_err == 0.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    trials: usize,
    errors: usize,
    sse: f64,
    avg_sse: f64,
    cos_diff: f64,
}

impl EpochAccumulator {
    pub fn add(&mut self, err: &TrialError) {
        self.trials += 1;
        if err.is_error() {
            self.errors += 1;
        }
        self.sse += err.sse;
        self.avg_sse += err.avg_sse;
        self.cos_diff += err.cos_diff;
    }

    pub fn trials(&self) -> usize {
        self.trials
    }

    /// Means over the accumulated trials; resets the accumulator.
    pub fn finish(&mut self) -> EpochSummary {
        let summary = if self.trials == 0 {
            EpochSummary::default()
        } else {
            let n = self.trials as f64;
            let pct_err = self.errors as f64 / n;
            EpochSummary {
                trials: self.trials,
                sse: self.sse / n,
                avg_sse: self.avg_sse / n,
                pct_err,
                pct_cor: 1.0 - pct_err,
                cos_diff: self.cos_diff / n,
            }
        };
        *self = Self::default();
        summary
    }
}

impl EpochSummary {
    pub fn write_to(&self, stats: &mut Stats) {
        stats.set_float("EpcSSE", self.sse);
        stats.set_float("EpcAvgSSE", self.avg_sse);
        stats.set_float("EpcPctErr", self.pct_err);
        stats.set_float("EpcPctCor", self.pct_cor);
        stats.set_float("EpcCosDiff", self.cos_diff);
    }
}

/// Update the zero-error streak after a training epoch.
///
/// `NZero` counts consecutive zero-error epochs; `FirstZero` records the
/// first such epoch of the run (-1 until one happens).
pub fn update_zero_streak(stats: &mut Stats, summary: &EpochSummary, epoch: usize) {
    if summary.is_zero_error() {
        stats.set_int("NZero", stats.int("NZero") + 1);
        if stats.int("FirstZero") < 0 {
            stats.set_int("FirstZero", epoch as i64);
        }
    } else {
        stats.set_int("NZero", 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(sse: f64) -> TrialError {
        TrialError {
            sse,
            avg_sse: sse / 2.0,
            cos_diff: 0.5,
        }
    }

    #[test]
    fn accumulator_means_and_reset() {
        let mut acc = EpochAccumulator::default();
        acc.add(&err(0.0));
        acc.add(&err(2.0));
        let s = acc.finish();
        assert_eq!(s.trials, 2);
        assert_eq!(s.sse, 1.0);
        assert_eq!(s.pct_err, 0.5);
        assert_eq!(s.pct_cor, 0.5);
        assert_eq!(acc.trials(), 0);
    }

    #[test]
    fn zero_streak_counts_and_resets() {
        let mut stats = Stats::new();
        stats.set_int("FirstZero", -1);
        let zero = EpochSummary {
            trials: 4,
            ..Default::default()
        };
        let miss = EpochSummary {
            trials: 4,
            pct_err: 0.25,
            ..Default::default()
        };
        update_zero_streak(&mut stats, &miss, 0);
        update_zero_streak(&mut stats, &zero, 1);
        update_zero_streak(&mut stats, &zero, 2);
        assert_eq!(stats.int("NZero"), 2);
        assert_eq!(stats.int("FirstZero"), 1);
        update_zero_streak(&mut stats, &miss, 3);
        assert_eq!(stats.int("NZero"), 0);
        assert_eq!(stats.int("FirstZero"), 1);
    }

    #[test]
    fn empty_epoch_is_not_zero_error() {
        assert!(!EpochSummary::default().is_zero_error());
    }

    #[test]
    fn print_picks_keys_in_order() {
        let mut stats = Stats::new();
        stats.set_int("Epoch", 3);
        stats.set_string("TrialName", "t1");
        stats.set_float("TrlSSE", 0.5);
        assert_eq!(
            stats.print(&["Epoch", "TrialName", "Missing", "TrlSSE"]),
            "Epoch:3\tTrialName:t1\tTrlSSE:0.5000"
        );
    }
}
