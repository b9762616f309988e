//! Cycle/quarter bookkeeping for one alpha cycle (one trial's settle period).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of quarters in one alpha cycle.
pub const QUARTERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeState {
    /// Cycle within the current quarter, `0..cycles_per_quarter`.
    pub cycle: usize,
    /// Quarter within the alpha cycle, `0..QUARTERS`.
    pub quarter: usize,
    pub cycles_per_quarter: usize,
    /// Cycle count since the start of the current alpha cycle.
    pub trial_cycle: usize,
    /// Cycle count since the last [`TimeState::reset`].
    pub total_cycles: u64,
    pub training: bool,
}

impl Default for TimeState {
    fn default() -> Self {
        Self::new(25)
    }
}

impl TimeState {
    pub fn new(cycles_per_quarter: usize) -> Self {
        Self {
            cycle: 0,
            quarter: 0,
            cycles_per_quarter: cycles_per_quarter.max(1),
            trial_cycle: 0,
            total_cycles: 0,
            training: false,
        }
    }

    /// Full reset, including the running cycle total.
    pub fn reset(&mut self) {
        self.cycle = 0;
        self.quarter = 0;
        self.trial_cycle = 0;
        self.total_cycles = 0;
    }

    pub fn alpha_cycle_start(&mut self, training: bool) {
        self.cycle = 0;
        self.quarter = 0;
        self.trial_cycle = 0;
        self.training = training;
    }

    pub fn cycle_inc(&mut self) {
        self.cycle += 1;
        self.trial_cycle += 1;
        self.total_cycles += 1;
    }

    pub fn quarter_inc(&mut self) {
        self.quarter += 1;
        self.cycle = 0;
    }

    /// The plus phase is the final quarter, when targets are clamped.
    pub fn is_plus_phase(&self) -> bool {
        self.quarter + 1 == QUARTERS
    }

    pub fn cycles_per_trial(&self) -> usize {
        self.cycles_per_quarter * QUARTERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_cycle_counts() {
        let mut t = TimeState::new(3);
        t.alpha_cycle_start(true);
        for _ in 0..QUARTERS {
            for _ in 0..t.cycles_per_quarter {
                t.cycle_inc();
            }
            t.quarter_inc();
        }
        assert_eq!(t.trial_cycle, 12);
        assert_eq!(t.total_cycles, 12);
        assert_eq!(t.quarter, QUARTERS);

        t.alpha_cycle_start(false);
        assert_eq!(t.trial_cycle, 0);
        assert_eq!(t.total_cycles, 12);
        assert!(!t.training);
    }

    #[test]
    fn zero_cycles_per_quarter_is_clamped() {
        assert_eq!(TimeState::new(0).cycles_per_quarter, 1);
    }

    #[test]
    fn plus_phase_is_last_quarter() {
        let mut t = TimeState::new(1);
        t.quarter = 2;
        assert!(!t.is_plus_phase());
        t.quarter = 3;
        assert!(t.is_plus_phase());
    }
}
