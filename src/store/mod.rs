//! Object storage capability used by the fan-out pipeline
//!
//! A store hands out a readable byte stream for the container and a writable
//! sink per destination object. Sinks upload in the background: bytes written
//! to [`UploadSink`] are accepted under the store's own backpressure, and its
//! completion future settles once the store has durably accepted the object.
//!
//! ## Available Stores
//!
//! - **Memory** - in-process map, used by tests and dry runs
//! - **S3** - AWS S3 (and S3-compatible services) via `GetObject` and
//!   multipart upload (requires the `s3` feature)

use crate::error::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;

#[cfg(feature = "s3")]
pub mod s3;

pub use memory::MemoryObjectStore;

#[cfg(feature = "s3")]
pub use s3::{S3ObjectStore, S3ObjectStoreBuilder, S3UploadWriter};

/// Default part size for multipart uploads (5MB - S3 minimum)
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum part size (5GB - S3 maximum)
pub const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts (S3 limit)
pub const MAX_PARTS: usize = 10_000;

/// Bucket and key of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Readable body of a stored object
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// Future that settles when an upload has been accepted or has failed
pub type UploadCompletion = BoxFuture<'static, Result<UploadReceipt>>;

/// What the store reported for a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub locator: ObjectLocator,
    pub bytes: u64,
    pub e_tag: Option<String>,
}

/// Writable side of one upload plus its completion signal
///
/// Shutting the writer down marks the end of the data; it does not wait for
/// the store. The upload runs in the background whether or not the
/// completion is polled. Dropping the writer without shutting it down
/// abandons the upload.
pub struct UploadSink {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    completion: UploadCompletion,
}

impl UploadSink {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Send>, completion: UploadCompletion) -> Self {
        Self { writer, completion }
    }

    pub fn into_parts(self) -> (Box<dyn AsyncWrite + Unpin + Send>, UploadCompletion) {
        (self.writer, self.completion)
    }
}

/// Object store used as both the container source and the upload target
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streaming read of `locator`.
    ///
    /// A missing or unreadable object fails with `SourceUnavailable`.
    async fn open_read(&self, locator: &ObjectLocator) -> Result<ByteSource>;

    /// Start an upload to `locator`.
    async fn open_write(&self, locator: &ObjectLocator) -> Result<UploadSink>;
}
