//! Application-wide error types.
//!
//! Two layers: [`Error`] is what the public API returns, [`StageError`] is
//! what a pipeline stage fails with. A stage error carries an [`ErrorKind`]
//! from the caller-visible taxonomy plus a transient flag that drives the
//! retry policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-visible failure categories.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum ErrorKind {
    AccessDenied,
    CapacityExceeded,
    SourceUnavailable,
    QuotaExceeded,
    IOFailure,
    UnsupportedFormat,
    Cancelled,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Access denied for user {user_id}")]
    AccessDenied { user_id: i64 },

    #[error("User {user_id} already has {limit} outstanding jobs")]
    CapacityExceeded { user_id: i64, limit: usize },

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Taxonomy kind for errors that map onto one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::AccessDenied { .. } => Some(ErrorKind::AccessDenied),
            Self::CapacityExceeded { .. } => Some(ErrorKind::CapacityExceeded),
            Self::Io(_) | Self::IoPath { .. } => Some(ErrorKind::IOFailure),
            _ => None,
        }
    }
}

/// Failure of a single pipeline stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether retrying the same stage may succeed.
    pub transient: bool,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, transient: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            transient,
        }
    }

    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, true)
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, false)
    }

    pub fn cancelled() -> Self {
        Self::fatal(ErrorKind::Cancelled, "job was cancelled")
    }

    pub fn is_transient(&self) -> bool {
        self.transient && self.kind != ErrorKind::Cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Classify a local filesystem error. A full disk is fatal, timeouts and
    /// interrupts may clear up. Local permission problems are I/O failures;
    /// `AccessDenied` is reserved for the access gate.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        // ENOSPC
        let disk_full = err.kind() == Io::StorageFull || err.raw_os_error() == Some(28);
        let message = format!("{context}: {err}");
        if disk_full {
            return Self::fatal(ErrorKind::IOFailure, message);
        }
        match err.kind() {
            Io::TimedOut | Io::Interrupted | Io::WouldBlock => {
                Self::transient(ErrorKind::IOFailure, message)
            }
            _ => Self::fatal(ErrorKind::IOFailure, message),
        }
    }

    /// Classify an HTTP client error on a remote endpoint.
    pub fn from_reqwest(context: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_http_status(context, status.as_u16());
        }
        let message = format!("{context}: {err}");
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(ErrorKind::SourceUnavailable, message)
        } else {
            Self::fatal(ErrorKind::SourceUnavailable, message)
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_http_status(context: &str, status: u16) -> Self {
        let message = format!("{context}: HTTP {status}");
        match status {
            413 => Self::fatal(ErrorKind::QuotaExceeded, message),
            429 => Self::transient(ErrorKind::QuotaExceeded, message),
            408 | 500..=599 => Self::transient(ErrorKind::SourceUnavailable, message),
            _ => Self::fatal(ErrorKind::SourceUnavailable, message),
        }
    }
}

impl From<StageError> for Error {
    fn from(err: StageError) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::IOFailure.to_string(), "IOFailure");
        assert_eq!(
            ErrorKind::from_str("SourceUnavailable").unwrap(),
            ErrorKind::SourceUnavailable
        );
    }

    #[test]
    fn test_http_status_classification() {
        assert!(StageError::from_http_status("fetch", 503).is_transient());
        assert!(StageError::from_http_status("fetch", 429).is_transient());
        assert_eq!(
            StageError::from_http_status("fetch", 429).kind,
            ErrorKind::QuotaExceeded
        );

        let not_found = StageError::from_http_status("fetch", 404);
        assert!(!not_found.is_transient());
        assert_eq!(not_found.kind, ErrorKind::SourceUnavailable);

        let too_large = StageError::from_http_status("deliver", 413);
        assert!(!too_large.is_transient());
        assert_eq!(too_large.kind, ErrorKind::QuotaExceeded);

        let forbidden = StageError::from_http_status("fetch", 403);
        assert!(!forbidden.is_transient());
        assert_eq!(forbidden.kind, ErrorKind::SourceUnavailable);
    }

    #[test]
    fn test_io_classification() {
        let full = std::io::Error::from_raw_os_error(28);
        let err = StageError::from_io("write", &full);
        assert_eq!(err.kind, ErrorKind::IOFailure);
        assert!(!err.is_transient());

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(StageError::from_io("read", &timeout).is_transient());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!StageError::from_io("read", &missing).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = StageError::from_io("write", &denied);
        assert_eq!(err.kind, ErrorKind::IOFailure);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_cancelled_is_never_transient() {
        let err = StageError::new(ErrorKind::Cancelled, "stop", true);
        assert!(!err.is_transient());
        assert!(err.is_cancelled());
    }
}
