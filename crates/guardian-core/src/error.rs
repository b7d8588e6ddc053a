//! Error types for guardian-core.
//!
//! Launch-path errors are always recovered locally by the supervisor
//! (degrading to the failsafe environment); keeper errors are surfaced to
//! the caller and end up as a non-zero exit code.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout guardian-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Replica manifest is missing or malformed.
    #[error("replica manifest error at {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// Crash log entries could not be used.
    #[error("crash log corrupt: {0}")]
    LogCorruption(String),

    /// The target interpreter could not be executed.
    #[error("failed to launch {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No replica holds a valid copy of the guardian binary.
    #[error("unrecoverable: no valid guardian binary among {checked} replica path(s); reinstall required")]
    Unrecoverable { checked: usize },

    /// A single replica could not be restored.
    #[error("failed to repair replica {path}: {message}")]
    ReplicaRepair { path: PathBuf, message: String },

    /// Service registration with the host supervisor failed.
    #[error("service error: {0}")]
    Service(String),

    /// Shell hook installation failed.
    #[error("setup error: {0}")]
    SetupError(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is the fatal "no source of truth left" condition.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}
