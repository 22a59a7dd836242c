//! AWS S3 object store: streaming reads and multipart uploads.
//!
//! ## How it Works
//!
//! - Reads issue a single `GetObject` and hand its body out as an `AsyncRead`,
//!   so the archive is consumed as it downloads
//! - Writes go through [`S3UploadWriter`], which buffers up to one part
//!   (minimum 5MB per part, except the last part)
//! - Filled parts are handed to a background Tokio task over a bounded
//!   channel; when the channel is full the writer stops accepting bytes
//! - The multipart upload is created lazily, completed on shutdown, and
//!   aborted if anything fails. Empty objects use a single `PutObject`
//!
//! ## Example
//!
//! ```no_run
//! use zip_fanout::store::{ObjectLocator, ObjectStore, S3ObjectStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = S3ObjectStore::builder()
//!     .endpoint_url("http://localhost:9000")
//!     .region("us-east-1")
//!     .build()
//!     .await;
//!
//! let body = store
//!     .open_read(&ObjectLocator::new("my-bucket", "zip/test.zip"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use super::{
    ByteSource, ObjectLocator, ObjectStore, UploadReceipt, UploadSink, DEFAULT_PART_SIZE,
    MAX_PARTS, MAX_PART_SIZE,
};
use crate::error::{FanoutError, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures_util::FutureExt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Parts that may wait for the upload worker before writes stall
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

/// S3-backed [`ObjectStore`]
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    part_size: usize,
    queue_depth: usize,
}

/// Builder for `S3ObjectStore` with configuration options.
pub struct S3ObjectStoreBuilder {
    client: Option<Client>,
    endpoint_url: Option<String>,
    region: Option<String>,
    part_size: usize,
    queue_depth: usize,
}

impl S3ObjectStore {
    /// Create a store with default settings around an existing client.
    ///
    /// Uses 5MB part size (S3 minimum).
    pub fn new(client: Client) -> Self {
        Self {
            client,
            part_size: DEFAULT_PART_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Create a builder for configuring the S3 store.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use zip_fanout::store::S3ObjectStore;
    /// # async fn example() {
    /// let store = S3ObjectStore::builder()
    ///     .region("ap-southeast-1")
    ///     .part_size(16 * 1024 * 1024)
    ///     .build()
    ///     .await;
    /// # }
    /// ```
    pub fn builder() -> S3ObjectStoreBuilder {
        S3ObjectStoreBuilder {
            client: None,
            endpoint_url: None,
            region: None,
            part_size: DEFAULT_PART_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }
}

impl S3ObjectStoreBuilder {
    /// Use an already configured client; endpoint and region are ignored.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    ///
    /// Enables path-style addressing.
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the part size for multipart upload.
    ///
    /// # Panics
    ///
    /// Panics if part_size < 5MB or > 5GB.
    pub fn part_size(mut self, part_size: usize) -> Self {
        assert!(
            part_size >= DEFAULT_PART_SIZE,
            "Part size must be at least 5MB"
        );
        assert!(part_size <= MAX_PART_SIZE, "Part size must not exceed 5GB");
        self.part_size = part_size;
        self
    }

    /// Number of filled parts that may queue behind the worker.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Load AWS configuration from the environment and build the store.
    pub async fn build(self) -> S3ObjectStore {
        let client = match self.client {
            Some(client) => client,
            None => {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = self.region {
                    loader = loader.region(aws_config::Region::new(region));
                }
                let sdk_config = loader.load().await;

                let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest());
                if let Some(url) = self.endpoint_url {
                    s3_config = s3_config.endpoint_url(url).force_path_style(true);
                }
                Client::from_conf(s3_config.build())
            }
        };

        S3ObjectStore {
            client,
            part_size: self.part_size,
            queue_depth: self.queue_depth,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn open_read(&self, locator: &ObjectLocator) -> Result<ByteSource> {
        let response = self
            .client
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| FanoutError::SourceUnavailable {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                cause: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn open_write(&self, locator: &ObjectLocator) -> Result<UploadSink> {
        let (tx, rx) = mpsc::channel(self.queue_depth);

        // Spawn background task for uploading parts
        let worker = tokio::spawn(upload_worker(self.client.clone(), locator.clone(), rx));

        let key = locator.key.clone();
        let completion = async move {
            match worker.await {
                Ok(result) => result,
                Err(e) => Err(FanoutError::upload_failed(
                    key,
                    format!("Upload task panicked: {}", e),
                )),
            }
        }
        .boxed();

        Ok(UploadSink::new(
            Box::new(S3UploadWriter::new(tx, self.part_size)),
            completion,
        ))
    }
}

/// Commands sent to the background upload task
#[derive(Debug)]
enum UploadCommand {
    /// Upload the next part
    UploadPart { data: Vec<u8> },
    /// Complete the upload with optional final part
    Complete { final_data: Option<Vec<u8>> },
}

/// Write half of an S3 upload.
///
/// Buffers one part at a time; `poll_write` returns `Pending` while the
/// worker's queue is full, which is what throttles the archive download.
pub struct S3UploadWriter {
    upload_tx: PollSender<UploadCommand>,

    /// Write buffer (accumulates data until part_size)
    buffer: Vec<u8>,
    part_size: usize,

    /// Flag to prevent sending Complete command multiple times
    shutdown_initiated: bool,
}

impl S3UploadWriter {
    fn new(tx: mpsc::Sender<UploadCommand>, part_size: usize) -> Self {
        Self {
            upload_tx: PollSender::new(tx),
            buffer: Vec::with_capacity(part_size),
            part_size,
            shutdown_initiated: false,
        }
    }

    /// Wait for a queue slot, then build and send the command
    fn poll_send(
        &mut self,
        cx: &mut Context<'_>,
        cmd: impl FnOnce(&mut Self) -> UploadCommand,
    ) -> Poll<io::Result<()>> {
        if ready!(self.upload_tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(upload_task_gone()));
        }
        let cmd = cmd(self);
        if self.upload_tx.send_item(cmd).is_err() {
            return Poll::Ready(Err(upload_task_gone()));
        }
        Poll::Ready(Ok(()))
    }
}

fn upload_task_gone() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "Upload task terminated unexpectedly",
    )
}

impl AsyncWrite for S3UploadWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shutdown_initiated {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }

        // Hand a full part to the worker before taking more bytes
        if this.buffer.len() >= this.part_size {
            ready!(this.poll_send(cx, |w| {
                let part_size = w.part_size;
                UploadCommand::UploadPart {
                    data: std::mem::replace(&mut w.buffer, Vec::with_capacity(part_size)),
                }
            }))?;
        }

        let n = buf.len().min(this.part_size - this.buffer.len());
        this.buffer.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Flushing is handled by the background task
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Only send Complete command once
        if !this.shutdown_initiated {
            ready!(this.poll_send(cx, |w| {
                let final_data = if w.buffer.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut w.buffer))
                };
                UploadCommand::Complete { final_data }
            }))?;
            this.shutdown_initiated = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Background worker that handles S3 multipart upload operations.
async fn upload_worker(
    client: Client,
    locator: ObjectLocator,
    mut rx: mpsc::Receiver<UploadCommand>,
) -> Result<UploadReceipt> {
    let mut upload = MultipartUpload {
        client,
        locator,
        upload_id: None,
        parts: Vec::new(),
        bytes: 0,
    };

    let result = upload.drive(&mut rx).await;
    if result.is_err() {
        upload.abort().await;
    }
    result
}

struct MultipartUpload {
    client: Client,
    locator: ObjectLocator,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    bytes: u64,
}

impl MultipartUpload {
    async fn drive(&mut self, rx: &mut mpsc::Receiver<UploadCommand>) -> Result<UploadReceipt> {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                UploadCommand::UploadPart { data } => self.upload_part(data).await?,
                UploadCommand::Complete { final_data } => {
                    if let Some(data) = final_data.filter(|d| !d.is_empty()) {
                        self.upload_part(data).await?;
                    }
                    return self.complete().await;
                }
            }
        }

        Err(self.failure("writer dropped before the upload was completed"))
    }

    fn failure(&self, cause: impl ToString) -> FanoutError {
        FanoutError::upload_failed(&self.locator.key, cause)
    }

    fn sdk_failure<E: std::error::Error>(&self, what: &str, err: E) -> FanoutError {
        self.failure(format!("{}: {}", what, DisplayErrorContext(&err)))
    }

    async fn upload_id(&mut self) -> Result<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.locator.bucket)
            .key(&self.locator.key)
            .send()
            .await
            .map_err(|e| self.sdk_failure("Failed to create multipart upload", e))?;

        let id = response
            .upload_id()
            .ok_or_else(|| self.failure("No upload_id returned from S3"))?
            .to_string();
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, data: Vec<u8>) -> Result<()> {
        let part_number = self.parts.len() + 1;
        if part_number > MAX_PARTS {
            return Err(self.failure(format!(
                "object needs more than {} parts; raise the part size",
                MAX_PARTS
            )));
        }

        let upload_id = self.upload_id().await?;
        let len = data.len() as u64;
        let response = self
            .client
            .upload_part()
            .bucket(&self.locator.bucket)
            .key(&self.locator.key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.sdk_failure(&format!("Failed to upload part {}", part_number), e))?;

        let etag = response
            .e_tag()
            .ok_or_else(|| self.failure(format!("No ETag returned for part {}", part_number)))?
            .to_string();

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number as i32)
                .e_tag(etag)
                .build(),
        );
        self.bytes += len;
        tracing::trace!(key = %self.locator.key, part_number, len, "uploaded part");
        Ok(())
    }

    async fn complete(&mut self) -> Result<UploadReceipt> {
        let Some(upload_id) = self.upload_id.clone() else {
            // Nothing was written: multipart needs at least one part
            let response = self
                .client
                .put_object()
                .bucket(&self.locator.bucket)
                .key(&self.locator.key)
                .body(ByteStream::from(Vec::new()))
                .send()
                .await
                .map_err(|e| self.sdk_failure("Failed to put empty object", e))?;
            return Ok(UploadReceipt {
                locator: self.locator.clone(),
                bytes: 0,
                e_tag: response.e_tag().map(str::to_string),
            });
        };

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.locator.bucket)
            .key(&self.locator.key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.parts)))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.sdk_failure("Failed to complete multipart upload", e))?;

        // Completed; nothing left to abort
        self.upload_id = None;

        Ok(UploadReceipt {
            locator: self.locator.clone(),
            bytes: self.bytes,
            e_tag: response.e_tag().map(str::to_string),
        })
    }

    async fn abort(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.locator.bucket)
            .key(&self.locator.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %self.locator.key,
                error = %DisplayErrorContext(&e),
                "failed to abort multipart upload"
            );
        }
    }
}
