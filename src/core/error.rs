//! Error taxonomy for the controller, the protocol sequencer and the
//! network boundary.

use std::io;

use thiserror::Error;

use crate::observer::Mode;

/// Errors reported by a [`crate::network::Network`] implementation.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("pattern for layer `{layer}` has {actual} values, expected {expected}")]
    InvalidPatternShape {
        layer: String,
        expected: usize,
        actual: usize,
    },

    #[error("checkpoint `{name}` not found")]
    CheckpointNotFound { name: String },

    #[error("invalid checkpoint name `{name}`: must be a single file name")]
    InvalidCheckpointName { name: String },

    #[error("checkpoint I/O failed: {0}")]
    Checkpoint(#[from] io::Error),
}

/// Top-level error for everything above the network boundary.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown layer `{0}`")]
    UnknownLayer(String),

    #[error("{mode} trial aborted at run {run}, epoch {epoch}, trial {trial}: {source}")]
    TrialAborted {
        mode: Mode,
        run: usize,
        epoch: usize,
        trial: usize,
        #[source]
        source: NetworkError,
    },

    #[error("phase `{phase}` failed{}: {source} (completed: {})",
        on_checkpoint(.checkpoint), completed_list(.completed))]
    PhaseFailed {
        phase: String,
        checkpoint: Option<String>,
        completed: Vec<String>,
        #[source]
        source: Box<SimError>,
    },

    #[error("a training task is already running")]
    AlreadyRunning,

    #[error("training task panicked")]
    TaskPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[cfg(feature = "serde")]
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Errors caught before any training begins.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SimError::Configuration(_) | SimError::UnknownLayer(_))
    }

    /// True when the root cause is a missing checkpoint.
    pub fn is_checkpoint_not_found(&self) -> bool {
        match self {
            SimError::Network(NetworkError::CheckpointNotFound { .. }) => true,
            SimError::PhaseFailed { source, .. } => source.is_checkpoint_not_found(),
            _ => false,
        }
    }
}

fn on_checkpoint(checkpoint: &Option<String>) -> String {
    match checkpoint {
        Some(name) => format!(" on checkpoint `{name}`"),
        None => String::new(),
    }
}

fn completed_list(completed: &[String]) -> String {
    if completed.is_empty() {
        "none".to_string()
    } else {
        completed.join(", ")
    }
}

pub type SimResult<T> = Result<T, SimError>;
