//! Error types for zip-fanout

use std::io;
use thiserror::Error;

/// Result type for zip-fanout operations
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Error types that can occur while fanning out an archive
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The container object could not be opened for reading
    #[error("source unavailable: {bucket}/{key}: {cause}")]
    SourceUnavailable {
        bucket: String,
        key: String,
        cause: String,
    },

    /// Invalid ZIP format or structure
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// The selector or destination namer rejected an entry path
    #[error("selector failed for {path:?}: {message}")]
    SelectorError { path: String, message: String },

    /// A single upload failed; never aborts the run
    #[error("upload of {key} failed: {cause}")]
    UploadFailed { key: String, cause: String },

    /// Unsupported compression method
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FanoutError {
    /// Whether this error ends the whole run rather than a single upload.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FanoutError::UploadFailed { .. })
    }

    /// Recover a `FanoutError` that travelled through an `io::Error`
    /// (e.g. out of an `AsyncRead` body).
    pub fn from_io(err: io::Error) -> Self {
        let kind = err.kind();
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<FanoutError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(fanout) = inner.downcast::<FanoutError>() {
                    return *fanout;
                }
            }
            return FanoutError::Io(io::Error::from(kind));
        }
        match kind {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                FanoutError::CorruptContainer(err.to_string())
            }
            _ => FanoutError::Io(err),
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FanoutError::CorruptContainer(msg.into())
    }

    pub(crate) fn upload_failed(key: impl Into<String>, cause: impl ToString) -> Self {
        FanoutError::UploadFailed {
            key: key.into(),
            cause: cause.to_string(),
        }
    }
}

impl From<FanoutError> for io::Error {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::Io(e) => e,
            FanoutError::CorruptContainer(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            FanoutError::UnsupportedCompression(_) => {
                io::Error::new(io::ErrorKind::Unsupported, err)
            }
            other => io::Error::other(other),
        }
    }
}
