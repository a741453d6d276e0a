//! Crate-wide error and result types.

use std::path::PathBuf;

/// Errors returned by checkpoint/restart operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on cache, control, or file system storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error while reading a config file.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid value for a configuration key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },

    /// Required configuration is missing.
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    /// A persisted structure failed to decode.
    #[error("corrupt data in {path}: {reason}")]
    Corrupt {
        /// File the data was read from.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A message-passing operation failed.
    #[error("communication error: {0}")]
    Comm(String),

    /// Redundancy topology could not be built (missing or colocated partner).
    #[error("invalid topology: {0}")]
    Topology(String),

    /// File contents do not match their recorded metadata.
    #[error("integrity check failed for {path}: {reason}")]
    Integrity {
        /// File that failed the check.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// One or more processes is missing checkpoint files and the loss
    /// exceeds what the redundancy scheme can recover.
    #[error("checkpoint {0} is unrecoverable")]
    Unrecoverable(u64),

    /// The requested operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A collective phase failed on some process.
    #[error("{0} failed on one or more processes")]
    CollectiveFailed(&'static str),

    /// A halt condition fired; the caller should stop taking checkpoints
    /// and exit. The active checkpoint has already been flushed.
    #[error("halt condition: {0}")]
    Halt(String),

    /// Unrecoverable setup failure; the job cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
