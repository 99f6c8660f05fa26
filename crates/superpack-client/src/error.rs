//! Error types for the DLC manager

use std::io;
use std::path::PathBuf;
use superpack_formats::FormatError;
use superpack_protocol::{DownloadError, TaskError, is_storage_full};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DlcError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No space left on device writing {}", .0.display())]
    NoSpaceLeft(PathBuf),

    #[error("Superpack is {size} bytes, smaller than its {minimum}-byte footer")]
    ServerDataTooSmall { size: u64, minimum: u64 },

    #[error("Superpack lists {files} files, more than the limit of {limit}")]
    TooManyFiles { files: usize, limit: usize },

    #[error("Metadata describes {meta} files but the file table has {table}")]
    FileCountMismatch { meta: usize, table: usize },

    #[error("File name {0:?} escapes the download directory")]
    UnsafeFileName(String),

    #[error("Manager is not initialized")]
    NotInitialized,

    #[error("Unknown request handle {0}")]
    UnknownRequest(usize),

    #[error("Background scan thread failed: {0}")]
    ScanThread(String),
}

impl DlcError {
    /// Wrap an I/O error with its path, separating out a full device
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_storage_full(&source) {
            Self::NoSpaceLeft(path)
        } else {
            Self::Io { path, source }
        }
    }

    /// Whether the device ran out of space
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpaceLeft(_) | Self::Task(TaskError::NoSpaceLeft(_)))
    }

    /// Path that could not be written, for the no-space notification
    pub fn no_space_path(&self) -> Option<&PathBuf> {
        match self {
            Self::NoSpaceLeft(path) | Self::Task(TaskError::NoSpaceLeft(path)) => Some(path),
            _ => None,
        }
    }

    /// Whether the error came from the network rather than from the data
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::Download(_) => true,
            Self::Task(e) => e.is_transport(),
            _ => false,
        }
    }

    /// Whether server data failed validation
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Format(e) => e.is_validation_error() || e.is_meta_error(),
            Self::Task(TaskError::Verification(_)) => true,
            Self::ServerDataTooSmall { .. } | Self::FileCountMismatch { .. } => true,
            _ => false,
        }
    }
}

pub type DlcResult<T> = std::result::Result<T, DlcError>;
