//! Error types for the orchestration core

use crate::model::{DownloadStatus, FileId, QueueId};
use rivulet_config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Kinds of download errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-cancellation failure reported by the transport
    Transport,
    /// Download was cancelled
    Cancelled,
    /// Not enough free space for the remaining bytes
    InsufficientDiskSpace,
    /// Operation not allowed in the current status
    InvalidState,
    /// File or queue not found
    NotFound,
    /// A duplicate-link action must be chosen before the URL can be added
    DuplicateActionRequired,
    /// Persistence collaborator failed
    Storage,
    Config,
    Io,
}

/// Error type for download orchestration
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download file not found: {0}")]
    FileNotFound(FileId),

    #[error("download queue not found: {0}")]
    QueueNotFound(QueueId),

    #[error("cannot {action} file {id} while it is {status}")]
    InvalidState {
        id: FileId,
        action: &'static str,
        status: DownloadStatus,
    },

    #[error("not enough free space in {}: {required} bytes required, {available} available", path.display())]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("size of file {0} is unknown")]
    UnknownSize(FileId),

    #[error("an action for duplicate link {url} must be chosen first")]
    DuplicateActionRequired { url: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn invalid_state(id: FileId, action: &'static str, status: DownloadStatus) -> Self {
        Self::InvalidState { id, action, status }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound(_) | Self::QueueNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InsufficientDiskSpace { .. } | Self::UnknownSize(_) => {
                ErrorKind::InsufficientDiskSpace
            }
            Self::DuplicateActionRequired { .. } => ErrorKind::DuplicateActionRequired,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for download operations
pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DownloadError::FileNotFound(FileId(1)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DownloadError::UnknownSize(FileId(1)).kind(),
            ErrorKind::InsufficientDiskSpace
        );
        assert_eq!(
            DownloadError::transport("reset by peer").kind(),
            ErrorKind::Transport
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(DownloadError::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_error_messages() {
        let err = DownloadError::invalid_state(FileId(7), "pause", DownloadStatus::Stopping);
        assert_eq!(err.to_string(), "cannot pause file 7 while it is Stopping");

        let err = DownloadError::InsufficientDiskSpace {
            path: PathBuf::from("/downloads"),
            required: 500,
            available: 100,
        };
        assert!(err.to_string().contains("500 bytes required"));
    }
}
