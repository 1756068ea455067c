//! Custom error types for the recorder.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to transport
//! failures and checkpoint I/O.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically related to file parsing or
//!   type mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration
//!   (e.g. `timeout_noncomm >= timeout_offline`). A reload that fails with this error
//!   leaves the previous configuration active.
//! - **`Transport`**: Connection loss or malformed payloads on a transport reader. These
//!   are logged by the reader and retried with backoff; they never reach the
//!   communicator or other readers.
//! - **`CheckpointWrite`**: A checkpoint could not be made durable. The cursor is left
//!   untouched and the write is retried on the next checkpoint tick.
//! - **`TrackLoad`**: A stored track file could not be read for replay or listing.
//!
//! Nothing in the pipeline treats these errors as fatal; see [`DaqError::is_recoverable`].

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the recorder.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration sources could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A transport reader lost its connection or received garbage.
    #[error("Transport '{transport}' error: {message}")]
    Transport {
        /// Reader name, e.g. `serial:port1` or `mqtt:broker.local`.
        transport: String,
        /// Human readable cause.
        message: String,
    },

    /// A checkpoint file could not be written durably.
    #[error("Checkpoint write to '{}' failed: {source}", path.display())]
    CheckpointWrite {
        /// Destination of the failed write.
        path: PathBuf,
        /// Underlying I/O cause.
        #[source]
        source: std::io::Error,
    },

    /// A stored track file could not be loaded.
    #[error("Failed to load track from '{}': {message}", path.display())]
    TrackLoad {
        /// File that was being read.
        path: PathBuf,
        /// Human readable cause.
        message: String,
    },

    /// No stored track matches the requested index or filename.
    #[error("Track not found: {0}")]
    TrackNotFound(String),

    /// The requested save-mode transition is not valid from the current state.
    #[error("Invalid save mode transition: {0}")]
    InvalidSaveMode(String),

    /// A topic string does not follow `<unit>/<sensor>/<quantity>`.
    #[error("Malformed address '{0}': expected <unit>/<sensor>/<quantity>")]
    MalformedAddress(String),

    /// Recording was started twice.
    #[error("Recorder is already running in {0} mode")]
    AlreadyRunning(String),

    /// A running recorder was required.
    #[error("Recorder is not running")]
    NotRunning,

    /// An operation needed an active track.
    #[error("No active track")]
    NoActiveTrack,

    /// Functionality compiled out through feature flags.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Shorthand for building a [`DaqError::Transport`].
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Whether the pipeline can keep running after this error.
    ///
    /// Only errors that stop a component from being constructed at all are
    /// reported as unrecoverable; everything raised while running is retried or
    /// skipped by the component that saw it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DaqError::Config(_) | DaqError::FeatureNotEnabled(_) | DaqError::AlreadyRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_recoverable() {
        let err = DaqError::transport("serial:port1", "unexpected EOF");
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Transport 'serial:port1' error: unexpected EOF"
        );
    }

    #[test]
    fn checkpoint_error_names_path() {
        let err = DaqError::CheckpointWrite {
            path: PathBuf::from("/data/chk/a-000001.chk.json"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(err.is_recoverable());
        let msg = err.to_string();
        assert!(msg.contains("a-000001.chk.json"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn feature_errors_are_fatal() {
        assert!(!DaqError::FeatureNotEnabled("serial".into()).is_recoverable());
    }
}
