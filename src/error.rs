//! Unified error types for Kait with a closed failure taxonomy.
//!
//! Every error is classified into one of four classes that determine the
//! propagation policy: transient errors are retried locally and then
//! degraded, bad input is rejected without retry, invariant violations are
//! logged and quarantined, and fatal errors terminate the daemon.
//!
//! The advisory path additionally follows a fail-open rule: the agent never
//! blocks on Kait, so advisory faults degrade to empty results instead of
//! propagating.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Kait operations.
#[derive(Error, Debug)]
pub enum KaitError {
    /// I/O errors from queue, snapshot, or log file operations.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON or TOML parsing/serialization errors.
    #[error("serialization error: {message}")]
    Serde { message: String },

    /// Rejected input: malformed events, oversized batches, bad auth.
    #[error("bad input: {message}")]
    BadInput { message: String },

    /// Durable store failures (cognitive snapshot, EIDOS database).
    #[error("store error: {message}")]
    Store { message: String },

    /// Invariant violations: corrupt records, contradictory counters,
    /// orphaned steps.
    #[error("invariant violation: {message}")]
    Invariant { message: String },

    /// Configuration or startup errors.
    #[error("config error: {message}")]
    Config { message: String },

    /// A deadline expired before the operation completed.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

/// A specialized Result type for Kait operations.
pub type Result<T> = std::result::Result<T, KaitError>;

/// Closed classification of every error, driving the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry locally with backoff, then degrade.
    Transient,
    /// Reject, do not retry.
    BadInput,
    /// Log, quarantine the item, keep running.
    Invariant,
    /// Exit the process.
    Fatal,
}

impl KaitError {
    /// Create a storage error from an I/O error.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Create a serialization error.
    pub fn serde(message: impl Into<String>) -> Self {
        Self::Serde {
            message: message.into(),
        }
    }

    /// Create a bad-input error.
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput {
            message: message.into(),
        }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an invariant-violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Classify this error for the propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Storage { .. } | Self::Store { .. } | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::Serde { .. } | Self::BadInput { .. } => ErrorClass::BadInput,
            Self::Invariant { .. } => ErrorClass::Invariant,
            Self::Config { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether a worker may recover from this error and keep running.
    pub fn is_recoverable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

impl From<io::Error> for KaitError {
    fn from(err: io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for KaitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for KaitError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Trait for fail-open error handling on the advisory path.
///
/// The agent never blocks on Kait: errors in the advice path log a warning
/// and return a safe default rather than surfacing to the caller.
pub trait FailOpen<T> {
    /// Handle an error by logging a warning and returning the default value.
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default;

    /// Handle an error by logging a warning and returning the provided fallback.
    fn fail_open_with(self, context: &str, fallback: T) -> T;
}

impl<T> FailOpen<T> for Result<T> {
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default,
    {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using default)", context, err);
                T::default()
            }
        }
    }

    fn fail_open_with(self, context: &str, fallback: T) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using fallback)", context, err);
                fallback
            }
        }
    }
}

/// Exit codes for the kait binary.
pub mod exit_codes {
    /// Clean shutdown.
    pub const CLEAN: i32 = 0;

    /// Configuration or startup error.
    pub const CONFIG: i32 = 1;

    /// Data directory not writable.
    pub const DATA_DIR: i32 = 2;

    /// Port bind conflict.
    pub const PORT_BIND: i32 = 3;
}
