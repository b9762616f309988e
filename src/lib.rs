//! pitsim: run control for trial-based neural-network simulations.
//!
//! The [`controller::RunController`] drives a network through nested
//! Run/Epoch/Trial/Cycle loops; a [`protocol::Protocol`] sequences phases that
//! each swap the training table, reconfigure layer roles and lesions, and
//! hand weights on through named checkpoints.
//!
//! # Features
//!
//! - `serde` (default): configuration files and serializable reports
//! - `parallel`: rayon net-input computation in the reference engine

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/env.rs"]
pub mod env;

#[path = "core/time.rs"]
pub mod time;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/layers.rs"]
pub mod layers;

#[path = "core/stats.rs"]
pub mod stats;

#[path = "core/pca.rs"]
pub mod pca;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/controller.rs"]
pub mod controller;

#[path = "core/protocol.rs"]
pub mod protocol;

#[path = "core/task.rs"]
pub mod task;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/engine.rs"]
pub mod engine;

pub mod observer;

pub mod experiments {
    pub mod depress;
}

#[cfg(test)]
#[path = "core/mock.rs"]
mod mock;

pub mod prelude {
    pub use crate::config::{RunConfig, SimConfig};
    pub use crate::controller::{RunControl, RunController, SimulationState, StopReason, TrialStep};
    pub use crate::engine::{NetSpec, RateNet};
    pub use crate::env::{TrialRecord, TrialTable};
    pub use crate::error::{NetworkError, SimError, SimResult};
    pub use crate::layers::LayerOp;
    pub use crate::network::{LayerId, LayerRole, Network};
    pub use crate::observer::{LogSink, MemoryLog, Mode, Timescale, TracingLog};
    pub use crate::protocol::{Phase, Protocol, ProtocolReport};
    pub use crate::task::{Job, JobOutcome, Session, TrainingTask};
}
