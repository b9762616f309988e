//! Call-recording network used by the controller and protocol tests.

use std::collections::HashMap;

use crate::error::NetworkError;
use crate::network::{LayerError, LayerId, LayerRole, Network};
use crate::time::TimeState;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BeginTrial(bool),
    StepCycle { quarter: usize, cycle: usize },
    FinalizeQuarter(usize),
    ComputeDelta,
    ApplyDelta,
    SetRole(LayerId, LayerRole),
    SetActive(LayerId, bool),
    ApplyExt(LayerId),
    Save(String),
    Load(String),
    Reset,
}

type SseFn = Box<dyn Fn(usize) -> f32 + Send>;

pub struct RecordingNet {
    layers: Vec<(String, usize)>,
    acts: Vec<Vec<f32>>,
    pub calls: Vec<Call>,
    /// One scalar per applied delta; stands in for the weight state.
    pub weights: Vec<f32>,
    pub checkpoints: HashMap<String, Vec<f32>>,
    /// `weights.len()` observed at each `begin_trial`.
    pub begin_weights: Vec<usize>,
    trials_begun: usize,
    sse: SseFn,
}

impl RecordingNet {
    pub fn new(layers: &[(&str, usize)]) -> Self {
        Self {
            layers: layers.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            acts: layers.iter().map(|(_, s)| vec![0.0; *s]).collect(),
            calls: Vec::new(),
            weights: Vec::new(),
            checkpoints: HashMap::new(),
            begin_weights: Vec::new(),
            trials_begun: 0,
            sse: Box::new(|_| 1.0),
        }
    }

    /// SSE reported for the n-th trial (0-based, counting every `begin_trial`).
    pub fn with_sse(mut self, f: impl Fn(usize) -> f32 + Send + 'static) -> Self {
        self.sse = Box::new(f);
        self
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl Network for RecordingNet {
    type Delta = f32;

    fn name(&self) -> &str {
        "Mock"
    }

    fn layer_by_name(&self, name: &str) -> Option<LayerId> {
        self.layers.iter().position(|(n, _)| n == name).map(LayerId)
    }

    fn layer_name(&self, id: LayerId) -> &str {
        &self.layers[id.0].0
    }

    fn layer_size(&self, id: LayerId) -> usize {
        self.layers[id.0].1
    }

    fn begin_trial(&mut self, training: bool) {
        self.trials_begun += 1;
        self.begin_weights.push(self.weights.len());
        self.calls.push(Call::BeginTrial(training));
    }

    fn step_cycle(&mut self, time: &TimeState) {
        self.calls.push(Call::StepCycle {
            quarter: time.quarter,
            cycle: time.cycle,
        });
    }

    fn finalize_quarter(&mut self, time: &TimeState) {
        self.calls.push(Call::FinalizeQuarter(time.quarter));
    }

    fn compute_weight_delta(&mut self) -> f32 {
        self.calls.push(Call::ComputeDelta);
        1.0
    }

    fn apply_weight_delta(&mut self, delta: f32) {
        self.calls.push(Call::ApplyDelta);
        self.weights.push(delta);
    }

    fn set_layer_role(&mut self, id: LayerId, role: LayerRole) {
        self.calls.push(Call::SetRole(id, role));
    }

    fn set_layer_active(&mut self, id: LayerId, active: bool) {
        self.calls.push(Call::SetActive(id, active));
    }

    fn apply_external_values(&mut self, id: LayerId, pattern: &[f32]) -> Result<(), NetworkError> {
        self.calls.push(Call::ApplyExt(id));
        let (name, size) = &self.layers[id.0];
        if pattern.len() != *size {
            return Err(NetworkError::InvalidPatternShape {
                layer: name.clone(),
                expected: *size,
                actual: pattern.len(),
            });
        }
        self.acts[id.0].copy_from_slice(pattern);
        Ok(())
    }

    fn save_checkpoint(&mut self, name: &str) -> Result<(), NetworkError> {
        self.calls.push(Call::Save(name.to_string()));
        self.checkpoints.insert(name.to_string(), self.weights.clone());
        Ok(())
    }

    fn load_checkpoint(&mut self, name: &str) -> Result<(), NetworkError> {
        self.calls.push(Call::Load(name.to_string()));
        match self.checkpoints.get(name) {
            Some(w) => {
                self.weights = w.clone();
                Ok(())
            }
            None => Err(NetworkError::CheckpointNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn reseed(&mut self, _seed: u64) {}

    fn reset_weights(&mut self) {
        self.calls.push(Call::Reset);
        self.weights.clear();
    }

    fn layer_error(&self, _id: LayerId, _tolerance: f32) -> LayerError {
        let sse = (self.sse)(self.trials_begun.saturating_sub(1));
        LayerError {
            sse,
            avg_sse: sse,
            cos_diff: 1.0 - sse.min(1.0),
        }
    }

    fn layer_activations(&self, id: LayerId) -> &[f32] {
        &self.acts[id.0]
    }
}
