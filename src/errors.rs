// dbvault/src/errors.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{tool} failed with status {status}: {stderr}")]
    Execution {
        tool: String,
        status: String,
        stdout: String,
        stderr: String,
        hint: Option<String>,
    },

    #[error("Rejected by server: {message}")]
    Rejected { message: String, hint: Option<String> },

    #[error("Operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Archive(err.to_string())
    }
}

/// Coarse classification of an [`AppError`], stored on failed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Execution,
    Rejected,
    Timeout,
    Storage,
    Busy,
    NotFound,
    Cancelled,
    Verification,
    Archive,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Execution => "execution",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Storage => "storage",
            ErrorKind::Busy => "busy",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Verification => "verification",
            ErrorKind::Archive => "archive",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Configuration(_) => ErrorKind::Configuration,
            AppError::Connection(_) => ErrorKind::Connection,
            AppError::Execution { .. } => ErrorKind::Execution,
            AppError::Rejected { .. } => ErrorKind::Rejected,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Storage(_) => ErrorKind::Storage,
            AppError::Busy(_) => ErrorKind::Busy,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::Verification(_) => ErrorKind::Verification,
            AppError::Archive(_) => ErrorKind::Archive,
            AppError::Io(_) => ErrorKind::Io,
            AppError::Internal(_) | AppError::SerdeJson(_) => ErrorKind::Internal,
        }
    }

    /// Connection failures and timeouts may succeed on the next natural trigger.
    /// Everything else needs an operator to fix something first.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Connection(_) | AppError::Timeout(_))
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            AppError::Execution { hint, .. } | AppError::Rejected { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_connection_and_timeout() {
        assert!(AppError::Connection("refused".into()).is_transient());
        assert!(AppError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!AppError::Configuration("bad cron".into()).is_transient());
        let exec = AppError::Execution {
            tool: "pg_dump".into(),
            status: "exit status: 1".into(),
            stdout: String::new(),
            stderr: "boom".into(),
            hint: None,
        };
        assert!(!exec.is_transient());
        assert_eq!(exec.kind(), ErrorKind::Execution);
    }

    #[test]
    fn execution_message_keeps_stderr_verbatim() {
        let exec = AppError::Execution {
            tool: "mongodump".into(),
            status: "exit status: 2".into(),
            stdout: String::new(),
            stderr: "Failed: can't create session".into(),
            hint: Some("connection".into()),
        };
        assert_eq!(
            exec.to_string(),
            "mongodump failed with status exit status: 2: Failed: can't create session"
        );
        assert_eq!(exec.hint(), Some("connection"));
    }

    #[test]
    fn server_rejection_is_permanent_and_keeps_hint() {
        let rejected = AppError::Rejected {
            message: "password authentication failed".into(),
            hint: Some("Authentication error: the password was rejected.".into()),
        };
        assert!(!rejected.is_transient());
        assert_eq!(rejected.kind().as_str(), "rejected");
        assert_eq!(rejected.hint(), Some("Authentication error: the password was rejected."));
    }

    #[test]
    fn kind_serializes_snake_case() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&ErrorKind::NotFound)?, "\"not_found\"");
        Ok(())
    }
}
