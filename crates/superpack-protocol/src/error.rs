//! Error types for download operations

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status: {0}")]
    HttpStatus(StatusCode),

    #[error("Timeout")]
    Timeout,

    #[error("Range not supported by server")]
    RangeNotSupported,

    #[error("Invalid Content-Range header: {0}")]
    InvalidContentRange(String),

    #[error("Server did not report a size for {0}")]
    SizeUnknown(String),

    #[error("Incomplete data: expected {expected} bytes, received {received}")]
    IncompleteData { expected: u64, received: u64 },

    #[error("No space left on device writing {}", .0.display())]
    NoSpaceLeft(PathBuf),

    #[error("Writer error: {0}")]
    Writer(#[source] std::io::Error),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unknown task {0}")]
    UnknownTask(u64),

    #[error("Downloader is shutting down")]
    ShuttingDown,

    #[error("Runtime error: {0}")]
    Runtime(#[source] std::io::Error),
}

impl DownloadError {
    /// Check if the transfer may succeed when attempted again
    ///
    /// Connection failures, timeouts and short bodies are transient. Any
    /// HTTP status error is terminal for the task, as are writer and
    /// verification failures.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Timeout | Self::IncompleteData { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    /// Classify a writer failure, separating out a full disk
    pub fn from_writer(error: std::io::Error, location: Option<PathBuf>) -> Self {
        if is_storage_full(&error) {
            Self::NoSpaceLeft(location.unwrap_or_default())
        } else if error.kind() == std::io::ErrorKind::InvalidData {
            Self::Verification(error.to_string())
        } else {
            Self::Writer(error)
        }
    }
}

/// Whether an I/O error means the device is out of space
pub fn is_storage_full(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::StorageFull
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Crate-level alias for external users
pub type DownloadResult<T> = Result<T>;

/// Outcome of a finished task, kept in [`crate::TaskStatus`]
///
/// A cloneable snapshot of the [`DownloadError`] that ended a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Connection, timeout or protocol failure after all retries
    #[error("transport error: {0}")]
    Transport(String),

    /// Server answered with an error status
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// Destination ran out of space
    #[error("no space left on device: {}", .0.display())]
    NoSpaceLeft(PathBuf),

    /// Destination rejected the data (size or CRC mismatch)
    #[error("verification failed: {0}")]
    Verification(String),

    /// Destination could not be written
    #[error("write error: {0}")]
    Io(String),

    /// Task was removed before finishing
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    /// Whether this outcome came from the network side
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HttpStatus(_))
    }
}

impl From<&DownloadError> for TaskError {
    fn from(error: &DownloadError) -> Self {
        match error {
            DownloadError::HttpStatus(status) => Self::HttpStatus(status.as_u16()),
            DownloadError::NoSpaceLeft(path) => Self::NoSpaceLeft(path.clone()),
            DownloadError::Verification(message) => Self::Verification(message.clone()),
            DownloadError::Writer(e) => Self::Io(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_status_errors_are_terminal() {
        assert!(!DownloadError::HttpStatus(StatusCode::NOT_FOUND).should_retry());
        assert!(!DownloadError::HttpStatus(StatusCode::SERVICE_UNAVAILABLE).should_retry());
        assert!(DownloadError::Timeout.should_retry());
        assert!(
            DownloadError::IncompleteData {
                expected: 10,
                received: 3
            }
            .should_retry()
        );
        assert!(!DownloadError::RangeNotSupported.should_retry());
    }

    #[test]
    fn test_writer_error_classification() {
        let full = io::Error::new(io::ErrorKind::StorageFull, "disk full");
        let err = DownloadError::from_writer(full, Some(PathBuf::from("/tmp/a.dvpl")));
        assert!(matches!(err, DownloadError::NoSpaceLeft(ref p) if p == &PathBuf::from("/tmp/a.dvpl")));
        assert!(!err.should_retry());

        let bad = io::Error::new(io::ErrorKind::InvalidData, "crc mismatch");
        assert!(matches!(
            DownloadError::from_writer(bad, None),
            DownloadError::Verification(_)
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            DownloadError::from_writer(denied, None),
            DownloadError::Writer(_)
        ));
    }

    #[test]
    fn test_task_error_snapshot() {
        let err = DownloadError::HttpStatus(StatusCode::FORBIDDEN);
        assert_eq!(TaskError::from(&err), TaskError::HttpStatus(403));
        assert!(TaskError::from(&err).is_transport());

        let err = DownloadError::NoSpaceLeft(PathBuf::from("x"));
        assert_eq!(
            TaskError::from(&err),
            TaskError::NoSpaceLeft(PathBuf::from("x"))
        );
        assert!(!TaskError::Cancelled.is_transport());
    }
}
