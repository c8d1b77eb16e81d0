// TaktX error types

use thiserror::Error;

/// Whether a download failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// Network drops, rate limits, timeouts. Retried by the job engine.
    Transient,
    /// Invalid URL, private or removed video. Never retried.
    Permanent,
}

#[derive(Error, Debug)]
pub enum TaktError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Download error ({kind:?}): {message}")]
    Download {
        kind: DownloadErrorKind,
        message: String,
    },

    #[error("Trim error: {0}")]
    Trim(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("{0}")]
    Other(String),
}

impl TaktError {
    pub fn transient_download(message: impl Into<String>) -> Self {
        TaktError::Download {
            kind: DownloadErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent_download(message: impl Into<String>) -> Self {
        TaktError::Download {
            kind: DownloadErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True for failures the job engine retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaktError::Download {
                kind: DownloadErrorKind::Transient,
                ..
            }
        )
    }
}

impl From<anyhow::Error> for TaktError {
    fn from(err: anyhow::Error) -> Self {
        TaktError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaktError>;
