//! Depression / Pavlovian-to-instrumental transfer experiment.
//!
//! Environmental features and interoceptive state drive approach and
//! avoidance motives through `Hidden1`; the motives drive a 16-way behavior
//! choice through `Hidden2`. Training alternates an INSTRUMENTAL phase
//! (motives clamped as inputs, behavior learned, perception lesioned) with a
//! PAVLOV phase (perception drives motives, behavior pathway lesioned). Both
//! phases hand weights on through the `trained` checkpoint.
//!
//! The trial tables here are synthetic stand-ins with the right shapes.

use std::sync::Arc;

use crate::config::{DrivenSpec, PhaseSpec, RunConfig, SimConfig};
use crate::engine::{EngineParams, LayerKind, LayerSpec, NetSpec, ProjSpec};
use crate::env::{TrialRecord, TrialTable};
use crate::layers::LayerOp;
use crate::network::LayerRole;
use crate::protocol::Phase;

pub const NET_NAME: &str = "Depress";
pub const CHECKPOINT: &str = "trained";

pub const ENV: &str = "EnviroFeatures";
pub const INTERO: &str = "InteroState";
pub const MB_APP: &str = "MBApp";
pub const MB_AV: &str = "MBAv";
pub const APPROACH: &str = "Approach";
pub const AVOIDANCE: &str = "Avoidance";
pub const BEHAVIOR: &str = "Behavior";
pub const COST: &str = "Cost";
pub const DYDA: &str = "DyDA";
pub const VTA: &str = "VTA";
pub const HIDDEN1: &str = "Hidden1";
pub const HIDDEN2: &str = "Hidden2";

const N_ENV: usize = 8;
const N_APP: usize = 5;
const N_AV: usize = 3;
const N_BEH: usize = 16;
const HIDDEN: usize = 5 * 20;

/// Layers that receive values from trial records, with their baseline roles.
pub fn driven_layers() -> Vec<(String, LayerRole)> {
    [
        (ENV, LayerRole::Input),
        (INTERO, LayerRole::Input),
        (MB_APP, LayerRole::Input),
        (MB_AV, LayerRole::Input),
        (APPROACH, LayerRole::Target),
        (AVOIDANCE, LayerRole::Target),
        (BEHAVIOR, LayerRole::Target),
        (COST, LayerRole::Input),
        (DYDA, LayerRole::Input),
    ]
    .into_iter()
    .map(|(n, r)| (n.to_string(), r))
    .collect()
}

pub fn net_spec() -> NetSpec {
    use LayerKind::*;
    NetSpec {
        name: NET_NAME.to_string(),
        layers: vec![
            LayerSpec::new(ENV, N_ENV, Input),
            LayerSpec::new(INTERO, N_ENV, Input),
            LayerSpec::new(MB_APP, N_APP, Input),
            LayerSpec::new(MB_AV, N_AV, Input),
            LayerSpec::new(APPROACH, N_APP, Target),
            LayerSpec::new(AVOIDANCE, N_AV, Target),
            LayerSpec::new(BEHAVIOR, N_BEH, Target),
            LayerSpec::new(VTA, 1, Hidden),
            LayerSpec::new(COST, N_BEH, Input),
            LayerSpec::new(DYDA, 1, Input),
            LayerSpec::new(HIDDEN1, HIDDEN, Hidden),
            LayerSpec::new(HIDDEN2, HIDDEN, Hidden),
        ],
        projections: vec![
            ProjSpec::full(ENV, HIDDEN1),
            ProjSpec::full(INTERO, HIDDEN1),
            ProjSpec::one_to_one(MB_APP, APPROACH),
            ProjSpec::one_to_one(MB_AV, AVOIDANCE),
            ProjSpec::full(VTA, APPROACH),
            ProjSpec::full(HIDDEN1, APPROACH).bidir(),
            ProjSpec::full(HIDDEN1, AVOIDANCE).bidir(),
            ProjSpec::full(APPROACH, HIDDEN2).bidir(),
            ProjSpec::full(AVOIDANCE, HIDDEN2).bidir(),
            ProjSpec::full(HIDDEN2, BEHAVIOR).bidir(),
            ProjSpec::full(VTA, AVOIDANCE).inhib(),
            ProjSpec::one_to_one(COST, BEHAVIOR).inhib(),
            ProjSpec::full(DYDA, APPROACH).inhib(),
            ProjSpec::full(DYDA, VTA).inhib(),
        ],
        params: EngineParams::default(),
    }
}

fn one_hot(n: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; n];
    v[i % n] = 1.0;
    v
}

/// Motive for environment `i`: the first five approach, the rest avoid.
fn motive(i: usize) -> (Vec<f32>, Vec<f32>) {
    if i < N_APP {
        (one_hot(N_APP, i), vec![0.0; N_AV])
    } else {
        (vec![0.0; N_APP], one_hot(N_AV, i - N_APP))
    }
}

/// Behavior chosen for motive index `i`, with a cost on the mirrored choice.
fn behavior(i: usize) -> (Vec<f32>, Vec<f32>) {
    (one_hot(N_BEH, 2 * i), one_hot(N_BEH, 2 * i + 1))
}

/// Motive -> behavior pairs.
pub fn instrumental_table() -> TrialTable {
    let records = (0..N_ENV)
        .map(|i| {
            let (app, av) = motive(i);
            let (beh, cost) = behavior(i);
            TrialRecord::new(format!("instr_{i}"))
                .with_field(APPROACH, app)
                .with_field(AVOIDANCE, av)
                .with_field(BEHAVIOR, beh)
                .with_field(COST, cost)
                .with_field(DYDA, vec![0.0])
        })
        .collect();
    TrialTable::new("Instrumental", records)
}

/// Cue -> motive pairs, with interoceptive state and motive bias.
pub fn pavlov_table() -> TrialTable {
    let records = (0..N_ENV)
        .map(|i| {
            let (app, av) = motive(i);
            TrialRecord::new(format!("pvlv_{i}"))
                .with_field(ENV, one_hot(N_ENV, i))
                .with_field(INTERO, one_hot(N_ENV, (i + 1) % N_ENV))
                .with_field(MB_APP, app.clone())
                .with_field(MB_AV, av.clone())
                .with_field(APPROACH, app)
                .with_field(AVOIDANCE, av)
                .with_field(DYDA, vec![0.0])
        })
        .collect();
    TrialTable::new("Pavlov", records)
}

/// Cue -> motive -> behavior, the full transfer chain.
pub fn test_table() -> TrialTable {
    let records = (0..N_ENV)
        .map(|i| {
            let (app, av) = motive(i);
            let (beh, cost) = behavior(i);
            TrialRecord::new(format!("test_{i}"))
                .with_field(ENV, one_hot(N_ENV, i))
                .with_field(INTERO, one_hot(N_ENV, (i + 1) % N_ENV))
                .with_field(APPROACH, app)
                .with_field(AVOIDANCE, av)
                .with_field(BEHAVIOR, beh)
                .with_field(COST, cost)
                .with_field(DYDA, vec![0.0])
        })
        .collect();
    TrialTable::new("Test", records)
}

pub fn instrumental_ops() -> Vec<LayerOp> {
    vec![
        LayerOp::unlesion(HIDDEN2),
        LayerOp::unlesion(BEHAVIOR),
        LayerOp::role(ENV, LayerRole::Input),
        LayerOp::role(INTERO, LayerRole::Input),
        LayerOp::role(APPROACH, LayerRole::Input),
        LayerOp::role(AVOIDANCE, LayerRole::Input),
        LayerOp::role(BEHAVIOR, LayerRole::Target),
        LayerOp::lesion(ENV),
        LayerOp::lesion(INTERO),
        LayerOp::lesion(HIDDEN1),
    ]
}

pub fn pavlov_ops() -> Vec<LayerOp> {
    vec![
        LayerOp::role(ENV, LayerRole::Input),
        LayerOp::role(INTERO, LayerRole::Input),
        LayerOp::role(APPROACH, LayerRole::Target),
        LayerOp::role(AVOIDANCE, LayerRole::Target),
        LayerOp::role(BEHAVIOR, LayerRole::Target),
        LayerOp::lesion(HIDDEN2),
        LayerOp::lesion(BEHAVIOR),
    ]
}

/// INSTRUMENTAL then PAVLOV. Neither phase loads on the first pass; each
/// saves to [`CHECKPOINT`], and PAVLOV resumes from it.
pub fn phases(instr_epochs: usize, pvlv_epochs: usize) -> Vec<Phase> {
    let mut instr = Phase::new("INSTRUMENTAL", Arc::new(instrumental_table()), instr_epochs)
        .save(CHECKPOINT);
    instr.ops = instrumental_ops();
    let mut pvlv = Phase::new("PAVLOV", Arc::new(pavlov_table()), pvlv_epochs)
        .load(CHECKPOINT)
        .save(CHECKPOINT);
    pvlv.ops = pavlov_ops();
    vec![instr, pvlv]
}

pub fn run_config() -> RunConfig {
    RunConfig {
        max_epochs: 100,
        test_interval: -1,
        diagnostic_interval: 5,
        stat_layers: vec![BEHAVIOR.to_string()],
        diagnostic_layers: vec![HIDDEN1.to_string(), HIDDEN2.to_string()],
        ..RunConfig::default()
    }
}

/// The whole experiment as a serializable configuration.
pub fn sim_config(instr_epochs: usize, pvlv_epochs: usize) -> SimConfig {
    let phase_spec = |p: &Phase| PhaseSpec {
        name: p.name.clone(),
        table: p.table.name.clone(),
        max_epochs: p.max_epochs,
        ops: p.ops.clone(),
        load_checkpoint: p.load_checkpoint.clone(),
        save_checkpoint: p.save_checkpoint.clone(),
    };
    SimConfig {
        network: net_spec(),
        run: run_config(),
        driven: driven_layers()
            .into_iter()
            .map(|(name, role)| DrivenSpec { name, role })
            .collect(),
        tables: vec![instrumental_table(), pavlov_table(), test_table()],
        train_table: "Instrumental".to_string(),
        test_table: Some("Test".to_string()),
        phases: phases(instr_epochs, pvlv_epochs)
            .iter()
            .map(phase_spec)
            .collect(),
        checkpoint_dir: None,
    }
}
