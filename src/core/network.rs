//! The boundary between the controller and the simulation engine.
//!
//! The controller never looks inside the engine: it applies patterns, steps
//! cycles, closes quarters, asks for a weight delta once per training trial
//! and moves weights in and out of named checkpoints. Everything else
//! (activation function, inhibition, learning rule) belongs to the
//! implementation.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::time::TimeState;

/// Opaque handle to a layer, resolved once from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerId(pub usize);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structural role of an externally driven layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerRole {
    /// Receives driving input for the whole trial.
    Input,
    /// Receives a target that is clamped in the plus phase; drives learning.
    Target,
    /// Receives a target for error statistics only; never clamped.
    Compare,
}

impl LayerRole {
    /// Whether applied values are targets rather than inputs.
    pub fn takes_target(self) -> bool {
        matches!(self, LayerRole::Target | LayerRole::Compare)
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerRole::Input => "Input",
            LayerRole::Target => "Target",
            LayerRole::Compare => "Compare",
        };
        f.write_str(s)
    }
}

/// Trial-level error for one layer, minus phase against target.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerError {
    /// Sum-squared error over units whose error exceeds the tolerance.
    pub sse: f32,
    /// `sse` divided by the number of units.
    pub avg_sse: f32,
    /// Cosine similarity between minus- and plus-phase activity.
    pub cos_diff: f32,
}

/// Contract the controller requires from a network engine.
///
/// Call order within one trial is fixed: `apply_external_values` for each
/// driven layer, `begin_trial`, then for each of the four quarters
/// `step_cycle` × `cycles_per_quarter` followed by `finalize_quarter`, and
/// finally (training only) `compute_weight_delta` + `apply_weight_delta`.
pub trait Network {
    /// Pending weight change produced by one trial.
    type Delta;

    fn name(&self) -> &str;

    fn layer_by_name(&self, name: &str) -> Option<LayerId>;
    fn layer_name(&self, id: LayerId) -> &str;
    fn layer_size(&self, id: LayerId) -> usize;

    fn begin_trial(&mut self, training: bool);
    fn step_cycle(&mut self, time: &TimeState);
    fn finalize_quarter(&mut self, time: &TimeState);

    fn compute_weight_delta(&mut self) -> Self::Delta;
    fn apply_weight_delta(&mut self, delta: Self::Delta);

    fn set_layer_role(&mut self, id: LayerId, role: LayerRole);
    fn set_layer_active(&mut self, id: LayerId, active: bool);

    /// Fails with [`NetworkError::InvalidPatternShape`] when `pattern.len()`
    /// differs from the layer size.
    fn apply_external_values(&mut self, id: LayerId, pattern: &[f32]) -> Result<(), NetworkError>;

    fn save_checkpoint(&mut self, name: &str) -> Result<(), NetworkError>;
    /// Fails with [`NetworkError::CheckpointNotFound`] when `name` is absent.
    fn load_checkpoint(&mut self, name: &str) -> Result<(), NetworkError>;

    /// Seed the engine's random source used by [`Network::reset_weights`].
    fn reseed(&mut self, seed: u64);
    /// Fresh random initialization.
    fn reset_weights(&mut self);

    fn layer_error(&self, id: LayerId, tolerance: f32) -> LayerError;
    /// Minus-phase activity, for diagnostics.
    fn layer_activations(&self, id: LayerId) -> &[f32];
}

/// Resolve a layer name or fail with [`crate::error::SimError::UnknownLayer`].
pub fn resolve<N: Network + ?Sized>(net: &N, name: &str) -> crate::error::SimResult<LayerId> {
    net.layer_by_name(name)
        .ok_or_else(|| crate::error::SimError::UnknownLayer(name.to_string()))
}
