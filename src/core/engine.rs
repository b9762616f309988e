//! Reference network engine.
//!
//! A small rate-coded layered network with two-phase (minus/plus) settling
//! and a contrastive Hebbian weight update. It exists so the controller can
//! be driven end to end; nothing in the controller depends on its internals.
//!
//! Per cycle, every active layer's net input is the sum over incoming
//! projections from active senders. Forward projections contribute the
//! sender activity weighted and averaged over active senders; inhibitory
//! projections subtract the sender's mean activity. Input layers are
//! clamped for the whole trial, target layers only in the plus phase.

use std::io::{self, Read, Write};

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NetworkError, SimError, SimResult};
use crate::network::{LayerError, LayerId, LayerRole, Network};
use crate::prng::Prng;
use crate::storage::{self, CheckpointStore};
use crate::time::{TimeState, QUARTERS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerKind {
    Input,
    #[default]
    Hidden,
    Target,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerSpec {
    pub name: String,
    pub size: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub kind: LayerKind,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, size: usize, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            size,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Pattern {
    #[default]
    Full,
    OneToOne,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProjKind {
    #[default]
    Forward,
    Inhib,
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProjSpec {
    pub from: String,
    pub to: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub pattern: Pattern,
    #[cfg_attr(feature = "serde", serde(default))]
    pub kind: ProjKind,
    /// Also connect `to -> from`, scaled by [`EngineParams::back_scale`].
    #[cfg_attr(feature = "serde", serde(default))]
    pub bidir: bool,
    #[cfg_attr(feature = "serde", serde(default = "default_scale"))]
    pub scale: f32,
}

impl ProjSpec {
    pub fn full(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            pattern: Pattern::Full,
            kind: ProjKind::Forward,
            bidir: false,
            scale: 1.0,
        }
    }

    pub fn one_to_one(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            pattern: Pattern::OneToOne,
            ..Self::full(from, to)
        }
    }

    pub fn inhib(mut self) -> Self {
        self.kind = ProjKind::Inhib;
        self
    }

    pub fn bidir(mut self) -> Self {
        self.bidir = true;
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineParams {
    pub lrate: f32,
    pub gain: f32,
    /// Net input at which activation is one half.
    pub thr: f32,
    /// Integration rate of activation toward its steady state.
    pub dt: f32,
    pub init_mean: f32,
    pub init_var: f32,
    pub back_scale: f32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            lrate: 0.04,
            gain: 6.0,
            thr: 0.5,
            dt: 0.3,
            init_mean: 0.5,
            init_var: 0.25,
            back_scale: 0.3,
        }
    }
}

/// Network layout, as loaded from a configuration file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetSpec {
    pub name: String,
    pub layers: Vec<LayerSpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub projections: Vec<ProjSpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub params: EngineParams,
}

impl NetSpec {
    fn layer_index(&self, name: &str) -> SimResult<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| SimError::UnknownLayer(name.to_string()))
    }

    pub fn validate(&self) -> SimResult<()> {
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.size == 0 {
                return Err(SimError::Configuration(format!(
                    "layer `{}` has no units",
                    layer.name
                )));
            }
            if self.layers[..i].iter().any(|l| l.name == layer.name) {
                return Err(SimError::Configuration(format!(
                    "layer `{}` defined twice",
                    layer.name
                )));
            }
        }
        for proj in &self.projections {
            let from = self.layer_index(&proj.from)?;
            let to = self.layer_index(&proj.to)?;
            if proj.pattern == Pattern::OneToOne && self.layers[from].size != self.layers[to].size {
                return Err(SimError::Configuration(format!(
                    "one-to-one projection {} -> {} joins layers of different sizes",
                    proj.from, proj.to
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Layer {
    name: String,
    size: usize,
    role: Option<LayerRole>,
    active: bool,
    ext: Option<Vec<f32>>,
    /// Set by `apply_external_values` since the last `begin_trial`.
    ext_fresh: bool,
    act: Vec<f32>,
    act_m: Vec<f32>,
    act_p: Vec<f32>,
}

impl Layer {
    fn new(spec: &LayerSpec) -> Self {
        let role = match spec.kind {
            LayerKind::Input => Some(LayerRole::Input),
            LayerKind::Target => Some(LayerRole::Target),
            LayerKind::Hidden => None,
        };
        Self {
            name: spec.name.clone(),
            size: spec.size,
            role,
            active: true,
            ext: None,
            ext_fresh: false,
            act: vec![0.0; spec.size],
            act_m: vec![0.0; spec.size],
            act_p: vec![0.0; spec.size],
        }
    }

    fn clamp(&self, plus: bool) -> Option<&[f32]> {
        match self.role {
            Some(LayerRole::Input) => self.ext.as_deref(),
            Some(LayerRole::Target) if plus => self.ext.as_deref(),
            _ => None,
        }
    }

    fn clear_acts(&mut self) {
        self.act.fill(0.0);
        self.act_m.fill(0.0);
        self.act_p.fill(0.0);
    }
}

#[derive(Debug, Clone)]
struct Projection {
    from: usize,
    to: usize,
    pattern: Pattern,
    kind: ProjKind,
    scale: f32,
    /// `to x from`, row-major, for full projections; one per unit otherwise.
    weights: Vec<f32>,
}

impl Projection {
    fn learns(&self) -> bool {
        self.kind == ProjKind::Forward && self.pattern == Pattern::Full
    }

    /// Contribution to every receiving unit's net input.
    fn send(&self, from_act: &[f32], to_size: usize, out: &mut [f32]) {
        match (self.kind, self.pattern) {
            (ProjKind::Inhib, _) => {
                let mean = from_act.iter().sum::<f32>() / from_act.len().max(1) as f32;
                match self.pattern {
                    Pattern::Full => out.iter_mut().for_each(|o| *o -= self.scale * mean),
                    Pattern::OneToOne => {
                        for (o, &a) in out.iter_mut().zip(from_act) {
                            *o -= self.scale * a;
                        }
                    }
                }
            }
            (ProjKind::Forward, Pattern::OneToOne) => {
                for ((o, &a), &w) in out.iter_mut().zip(from_act).zip(&self.weights) {
                    *o += self.scale * w * a;
                }
            }
            (ProjKind::Forward, Pattern::Full) => {
                let norm = from_act.iter().sum::<f32>().max(1.0);
                let n_from = from_act.len();
                let row = |i: usize| -> f32 {
                    let w = &self.weights[i * n_from..(i + 1) * n_from];
                    w.iter().zip(from_act).map(|(w, a)| w * a).sum::<f32>() * self.scale / norm
                };

                #[cfg(feature = "parallel")]
                let contrib: Vec<f32> = (0..to_size).into_par_iter().map(row).collect();
                #[cfg(not(feature = "parallel"))]
                let contrib: Vec<f32> = (0..to_size).map(row).collect();

                for (o, c) in out.iter_mut().zip(contrib) {
                    *o += c;
                }
            }
        }
    }
}

/// Per-projection weight changes from one trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightDelta(pub Vec<Vec<f32>>);

#[derive(Debug)]
pub struct RateNet {
    name: String,
    params: EngineParams,
    layers: Vec<Layer>,
    projs: Vec<Projection>,
    rng: Prng,
    store: CheckpointStore,
}

impl RateNet {
    /// Build from `spec` with in-memory checkpoints. Weights are initialized
    /// from seed 1 until [`Network::reseed`] and [`Network::reset_weights`].
    pub fn new(spec: &NetSpec) -> SimResult<Self> {
        spec.validate()?;
        let mut projs = Vec::new();
        for p in &spec.projections {
            let from = spec.layer_index(&p.from)?;
            let to = spec.layer_index(&p.to)?;
            let mut push = |from: usize, to: usize, scale: f32| {
                let n = match p.pattern {
                    Pattern::Full => spec.layers[from].size * spec.layers[to].size,
                    Pattern::OneToOne => spec.layers[to].size,
                };
                projs.push(Projection {
                    from,
                    to,
                    pattern: p.pattern,
                    kind: p.kind,
                    scale,
                    weights: vec![0.0; n],
                });
            };
            push(from, to, p.scale);
            if p.bidir {
                push(to, from, p.scale * spec.params.back_scale);
            }
        }

        let mut net = Self {
            name: spec.name.clone(),
            params: spec.params.clone(),
            layers: spec.layers.iter().map(Layer::new).collect(),
            projs,
            rng: Prng::new(1),
            store: CheckpointStore::memory(),
        };
        net.reset_weights();
        Ok(net)
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    pub fn projection_count(&self) -> usize {
        self.projs.len()
    }

    pub fn weights(&self, proj: usize) -> &[f32] {
        &self.projs[proj].weights
    }

    pub fn is_active(&self, id: LayerId) -> bool {
        self.layers[id.0].active
    }

    pub fn role(&self, id: LayerId) -> Option<LayerRole> {
        self.layers[id.0].role
    }

    /// Activity recorded at the end of the plus phase.
    pub fn plus_activations(&self, id: LayerId) -> &[f32] {
        &self.layers[id.0].act_p
    }

    fn net_inputs(&self) -> Vec<Vec<f32>> {
        let mut nets: Vec<Vec<f32>> = self.layers.iter().map(|l| vec![0.0; l.size]).collect();
        for p in &self.projs {
            let (from, to) = (&self.layers[p.from], &self.layers[p.to]);
            if !from.active || !to.active {
                continue;
            }
            p.send(&from.act, to.size, &mut nets[p.to]);
        }
        nets
    }

    // -- checkpoint image -------------------------------------------------

    /// Write the weight image: header, `NETW` shape chunk, `WGTS` weights.
    pub fn save_weights_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_header(w)?;
        storage::write_chunk(w, *b"NETW", &self.shape_payload()?)?;

        let mut weights = Vec::new();
        storage::write_u32_le(&mut weights, self.projs.len() as u32)?;
        for p in &self.projs {
            storage::write_f32s(&mut weights, &p.weights)?;
        }
        storage::write_chunk_lz4(w, *b"WGTS", &weights)
    }

    /// Replace every weight from an image written by [`Self::save_weights_to`]
    /// for a network of the same shape.
    pub fn load_weights_from<R: Read>(&mut self, r: &mut R) -> io::Result<()> {
        storage::read_header(r)?;
        let expected = self.shape_payload()?;
        let mut shape_ok = false;
        let mut weights: Option<Vec<Vec<f32>>> = None;

        storage::for_each_chunk(r, |tag, take| {
            match &tag {
                b"NETW" => {
                    let mut shape = Vec::new();
                    take.read_to_end(&mut shape)?;
                    shape_ok = shape == expected;
                }
                b"WGTS" => {
                    let payload = storage::read_chunk_lz4(take)?;
                    let mut p = payload.as_slice();
                    let n = storage::read_u32_le(&mut p)? as usize;
                    weights = Some(
                        (0..n)
                            .map(|_| storage::read_f32s(&mut p))
                            .collect::<io::Result<_>>()?,
                    );
                }
                _ => {}
            }
            Ok(())
        })?;

        if !shape_ok {
            return Err(invalid("checkpoint shape does not match network"));
        }
        let weights = weights.ok_or_else(|| invalid("missing WGTS"))?;
        if weights.len() != self.projs.len()
            || weights
                .iter()
                .zip(&self.projs)
                .any(|(w, p)| w.len() != p.weights.len())
        {
            return Err(invalid("WGTS size mismatch"));
        }
        for (p, w) in self.projs.iter_mut().zip(weights) {
            p.weights = w;
        }
        Ok(())
    }

    /// Exact serialized size of the weight image.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_weights_to(&mut cw)?;
        Ok(cw.written())
    }

    fn shape_payload(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        storage::write_string(&mut buf, &self.name)?;
        storage::write_u32_le(&mut buf, self.layers.len() as u32)?;
        for l in &self.layers {
            storage::write_string(&mut buf, &l.name)?;
            storage::write_u32_le(&mut buf, l.size as u32)?;
        }
        storage::write_u32_le(&mut buf, self.projs.len() as u32)?;
        for p in &self.projs {
            storage::write_u32_le(&mut buf, p.from as u32)?;
            storage::write_u32_le(&mut buf, p.to as u32)?;
            storage::write_u32_le(&mut buf, p.weights.len() as u32)?;
        }
        Ok(buf)
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

impl Network for RateNet {
    type Delta = WeightDelta;

    fn name(&self) -> &str {
        &self.name
    }

    fn layer_by_name(&self, name: &str) -> Option<LayerId> {
        self.layers.iter().position(|l| l.name == name).map(LayerId)
    }

    fn layer_name(&self, id: LayerId) -> &str {
        &self.layers[id.0].name
    }

    fn layer_size(&self, id: LayerId) -> usize {
        self.layers[id.0].size
    }

    fn begin_trial(&mut self, _training: bool) {
        for layer in &mut self.layers {
            if !layer.ext_fresh {
                layer.ext = None;
            }
            layer.ext_fresh = false;
            layer.clear_acts();
        }
    }

    fn step_cycle(&mut self, time: &TimeState) {
        let plus = time.is_plus_phase();
        let nets = self.net_inputs();
        let EngineParams { gain, thr, dt, .. } = self.params;
        for (layer, net) in self.layers.iter_mut().zip(nets) {
            if !layer.active {
                continue;
            }
            if let Some(clamp) = layer.clamp(plus) {
                let clamp = clamp.to_vec();
                layer.act.copy_from_slice(&clamp);
                continue;
            }
            for (a, n) in layer.act.iter_mut().zip(net) {
                *a += dt * (sigmoid(gain * (n - thr)) - *a);
            }
        }
    }

    fn finalize_quarter(&mut self, time: &TimeState) {
        if time.quarter + 2 == QUARTERS {
            for layer in &mut self.layers {
                layer.act_m.copy_from_slice(&layer.act);
            }
        } else if time.is_plus_phase() {
            for layer in &mut self.layers {
                layer.act_p.copy_from_slice(&layer.act);
            }
        }
    }

    fn compute_weight_delta(&mut self) -> WeightDelta {
        let lrate = self.params.lrate;
        let deltas = self
            .projs
            .iter()
            .map(|p| {
                let (from, to) = (&self.layers[p.from], &self.layers[p.to]);
                if !p.learns() || !from.active || !to.active {
                    return Vec::new();
                }
                let mut dw = Vec::with_capacity(p.weights.len());
                for i in 0..to.size {
                    for j in 0..from.size {
                        let plus = to.act_p[i] * from.act_p[j];
                        let minus = to.act_m[i] * from.act_m[j];
                        dw.push(lrate * (plus - minus));
                    }
                }
                dw
            })
            .collect();
        WeightDelta(deltas)
    }

    fn apply_weight_delta(&mut self, delta: WeightDelta) {
        for (p, dw) in self.projs.iter_mut().zip(delta.0) {
            if dw.len() != p.weights.len() {
                continue;
            }
            for (w, d) in p.weights.iter_mut().zip(dw) {
                *w = (*w + d).clamp(0.0, 1.0);
            }
        }
    }

    fn set_layer_role(&mut self, id: LayerId, role: LayerRole) {
        self.layers[id.0].role = Some(role);
    }

    fn set_layer_active(&mut self, id: LayerId, active: bool) {
        let layer = &mut self.layers[id.0];
        layer.active = active;
        if !active {
            layer.ext = None;
            layer.clear_acts();
        }
    }

    fn apply_external_values(&mut self, id: LayerId, pattern: &[f32]) -> Result<(), NetworkError> {
        let layer = &mut self.layers[id.0];
        if pattern.len() != layer.size {
            return Err(NetworkError::InvalidPatternShape {
                layer: layer.name.clone(),
                expected: layer.size,
                actual: pattern.len(),
            });
        }
        layer.ext = Some(pattern.to_vec());
        layer.ext_fresh = true;
        Ok(())
    }

    fn save_checkpoint(&mut self, name: &str) -> Result<(), NetworkError> {
        let mut buf = Vec::new();
        self.save_weights_to(&mut buf)?;
        debug!(%name, bytes = buf.len(), "save checkpoint");
        self.store.put(name, buf)
    }

    fn load_checkpoint(&mut self, name: &str) -> Result<(), NetworkError> {
        let bytes = self.store.get(name)?;
        self.load_weights_from(&mut bytes.as_slice())?;
        debug!(%name, "loaded checkpoint");
        Ok(())
    }

    fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    fn reset_weights(&mut self) {
        let EngineParams {
            init_mean,
            init_var,
            ..
        } = self.params;
        for p in &mut self.projs {
            if p.learns() {
                for w in &mut p.weights {
                    *w = self
                        .rng
                        .gen_range_f32(init_mean - init_var, init_mean + init_var)
                        .clamp(0.0, 1.0);
                }
            } else {
                p.weights.fill(1.0);
            }
        }
        for layer in &mut self.layers {
            layer.clear_acts();
        }
    }

    fn layer_error(&self, id: LayerId, tolerance: f32) -> LayerError {
        let layer = &self.layers[id.0];
        let cos_diff = cosine(&layer.act_m, &layer.act_p);
        let Some(target) = &layer.ext else {
            return LayerError {
                cos_diff,
                ..LayerError::default()
            };
        };
        let sse: f32 = target
            .iter()
            .zip(&layer.act_m)
            .map(|(t, a)| t - a)
            .filter(|d| d.abs() >= tolerance)
            .map(|d| d * d)
            .sum();
        LayerError {
            sse,
            avg_sse: sse / layer.size as f32,
            cos_diff,
        }
    }

    fn layer_activations(&self, id: LayerId) -> &[f32] {
        &self.layers[id.0].act_m
    }
}
