//! Error taxonomy shared by every crate in the workspace.
//!
//! Nothing here is recovered automatically: every variant propagates to the
//! caller and ends the run. The last periodic checkpoint is the recovery point.

use std::path::PathBuf;

/// Errors raised while configuring, training, or checkpointing the animator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── Configuration ───────────────────────────────────────────────────────
    /// The configuration file does not exist.
    #[error("config file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    /// The configuration is malformed or misses a required key.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Checkpoints ─────────────────────────────────────────────────────────
    /// The checkpoint path given for resuming does not exist.
    #[error("checkpoint not found: {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    /// The checkpoint cannot be restored into the live modules.
    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    // ── Training ────────────────────────────────────────────────────────────
    /// A malformed batch reached the reconstruction step (a caller bug).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The dataset collaborator failed to produce a batch.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A device replica failed or was aborted.
    #[error("replication error: {0}")]
    Replication(String),

    // ── Wrapped ─────────────────────────────────────────────────────────────
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
