//! Archive fan-out pipeline
//!
//! Downloads a ZIP container, walks its entries in order, drains the ones the
//! selector rejects and re-uploads the rest. Each upload settles on its own
//! task; the pipeline reports every settlement and then exactly one
//! [`PipelineEvent::AllDone`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use zip_fanout::{ArchiveFanoutPipeline, PipelineEvent};
//! use zip_fanout::store::{MemoryObjectStore, ObjectLocator};
//!
//! # async fn example() -> zip_fanout::Result<()> {
//! let store = Arc::new(MemoryObjectStore::new());
//! let pipeline = ArchiveFanoutPipeline::builder(store).build();
//!
//! let mut events = pipeline.run(ObjectLocator::new("pf-test-zip-bucket", "zip/test.zip"));
//! while let Some(event) = events.next().await {
//!     match event? {
//!         PipelineEvent::Uploaded(outcome) => println!("{}: {}", outcome.key, outcome.is_success()),
//!         PipelineEvent::AllDone(summary) => println!("done: {:?}", summary),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::demux::{ZipStreamEntry, ZipStreamReader, DEFAULT_BUFFER_SIZE};
use crate::error::{FanoutError, Result};
use crate::select::{basename, DestinationNamer, EntrySelector, ExtensionFilter, PrefixNamer};
use crate::store::{ByteSource, ObjectLocator, ObjectStore, UploadCompletion, UploadReceipt};
use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Default chunk size when copying an entry into its upload (64KB)
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of undelivered events before uploads wait on the consumer
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Dispatched and settled upload counts for one run.
///
/// `completed` never exceeds `dispatched`. A task is counted as dispatched
/// once its entry is selected and named, before the entry is piped into the
/// upload, and as completed only after the upload has settled. An upload cut
/// off by a fatal error still counts as completed.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    dispatched: AtomicU64,
    completed: AtomicU64,
}

impl CompletionCounter {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// `(completed, dispatched)` read in an order that keeps the invariant
    /// visible to concurrent observers
    pub fn snapshot(&self) -> (u64, u64) {
        let completed = self.completed();
        let dispatched = self.dispatched();
        (completed, dispatched)
    }

    pub fn is_settled(&self) -> bool {
        let (completed, dispatched) = self.snapshot();
        completed == dispatched
    }

    fn dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Settlement of one re-upload
#[derive(Debug)]
pub struct UploadOutcome {
    /// Entry path inside the archive
    pub path: String,
    /// Destination key
    pub key: String,
    /// Receipt, or `FanoutError::UploadFailed`
    pub result: Result<UploadReceipt>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Totals for a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub entries_seen: u64,
    pub drained: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// The run stopped reading entries because it was cancelled
    pub cancelled: bool,
}

/// Item of the run's result sequence
#[derive(Debug)]
pub enum PipelineEvent {
    /// An upload settled (in settlement order, not dispatch order)
    Uploaded(UploadOutcome),
    /// End of container reached and every dispatched upload settled
    AllDone(RunSummary),
}

/// Collected result of a whole run
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<UploadOutcome>,
    pub summary: RunSummary,
}

pin_project! {
    /// Events of one run
    ///
    /// `AllDone` is the last item of a completed run. A fatal error is
    /// reported once; uploads already in flight may still report after it.
    pub struct FanoutStream {
        #[pin]
        inner: ReceiverStream<Result<PipelineEvent>>,
    }
}

impl Stream for FanoutStream {
    type Item = Result<PipelineEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl FanoutStream {
    /// Drive the run to the end, collecting every outcome.
    ///
    /// Fails with the run's fatal error, if any.
    pub async fn collect_report(mut self) -> Result<RunReport> {
        let mut outcomes = Vec::new();
        while let Some(event) = self.next().await {
            match event? {
                PipelineEvent::Uploaded(outcome) => outcomes.push(outcome),
                PipelineEvent::AllDone(summary) => return Ok(RunReport { outcomes, summary }),
            }
        }
        Err(FanoutError::Io(io::Error::other(
            "pipeline stopped before reporting completion",
        )))
    }
}

/// Builder for `ArchiveFanoutPipeline`
pub struct ArchiveFanoutPipelineBuilder {
    store: Arc<dyn ObjectStore>,
    selector: Arc<dyn EntrySelector>,
    namer: Arc<dyn DestinationNamer>,
    destination_bucket: Option<String>,
    cancel: CancellationToken,
    read_buffer_size: usize,
    copy_chunk_size: usize,
    event_capacity: usize,
}

impl ArchiveFanoutPipelineBuilder {
    /// Which entries to forward (default: `.xlsx`/`.pdf`, no hidden files)
    pub fn selector(mut self, selector: impl EntrySelector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    /// How to name destinations (default: `unzipped/<basename>`)
    pub fn namer(mut self, namer: impl DestinationNamer + 'static) -> Self {
        self.namer = Arc::new(namer);
        self
    }

    /// Upload into another bucket instead of the source's
    pub fn destination_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.destination_bucket = Some(bucket.into());
        self
    }

    /// Stop reading new entries once `token` is cancelled.
    ///
    /// Uploads already dispatched finish on their own; the run still ends
    /// with `AllDone`, flagged as cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Buffer in front of the container stream
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Chunk size for copying an entry into its upload
    pub fn copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ArchiveFanoutPipeline {
        ArchiveFanoutPipeline {
            store: self.store,
            selector: self.selector,
            namer: self.namer,
            destination_bucket: self.destination_bucket,
            cancel: self.cancel,
            read_buffer_size: self.read_buffer_size,
            copy_chunk_size: self.copy_chunk_size,
            event_capacity: self.event_capacity,
            counter: Arc::new(CompletionCounter::default()),
        }
    }
}

/// Download → demultiplex → filter → concurrent re-upload
pub struct ArchiveFanoutPipeline {
    store: Arc<dyn ObjectStore>,
    selector: Arc<dyn EntrySelector>,
    namer: Arc<dyn DestinationNamer>,
    destination_bucket: Option<String>,
    cancel: CancellationToken,
    read_buffer_size: usize,
    copy_chunk_size: usize,
    event_capacity: usize,
    counter: Arc<CompletionCounter>,
}

/// Upload whose bytes have all been handed to the store
type Settlement = BoxFuture<'static, Result<UploadReceipt>>;

enum PumpError {
    Read(FanoutError),
    Write(io::Error),
}

impl ArchiveFanoutPipeline {
    pub fn builder(store: Arc<dyn ObjectStore>) -> ArchiveFanoutPipelineBuilder {
        ArchiveFanoutPipelineBuilder {
            store,
            selector: Arc::new(ExtensionFilter::default()),
            namer: Arc::new(PrefixNamer::default()),
            destination_bucket: None,
            cancel: CancellationToken::new(),
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Counters of this pipeline's run, observable while it is in flight
    pub fn counter(&self) -> Arc<CompletionCounter> {
        self.counter.clone()
    }

    /// Start the run on the current Tokio runtime.
    ///
    /// Fatal errors (`SourceUnavailable`, `CorruptContainer`,
    /// `SelectorError`, transport errors) end the walk and are yielded as an
    /// `Err` item. Uploads that were already dispatched are not cancelled;
    /// their outcomes are dropped once the stream is gone.
    pub fn run(self, source: ObjectLocator) -> FanoutStream {
        let (tx, rx) = mpsc::channel(self.event_capacity);
        tokio::spawn(self.drive(source, tx));
        FanoutStream {
            inner: ReceiverStream::new(rx),
        }
    }

    async fn drive(self, source: ObjectLocator, events: mpsc::Sender<Result<PipelineEvent>>) {
        let span = tracing::info_span!("fanout", source = %source);
        async move {
            match self.walk(&source, &events).await {
                Ok(summary) => {
                    tracing::info!(?summary, "all done");
                    let _ = events.send(Ok(PipelineEvent::AllDone(summary))).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "fan-out aborted");
                    let _ = events.send(Err(err)).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn walk(
        &self,
        source: &ObjectLocator,
        events: &mpsc::Sender<Result<PipelineEvent>>,
    ) -> Result<RunSummary> {
        let body = self.store.open_read(source).await?;
        let mut zip = ZipStreamReader::with_buffer_size(body, self.read_buffer_size);
        let destination_bucket = self
            .destination_bucket
            .clone()
            .unwrap_or_else(|| source.bucket.clone());

        let mut summary = RunSummary::default();
        let mut tasks = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("cancelled, no further entries will be read");
                summary.cancelled = true;
                break;
            }

            let Some(entry) = zip.next_entry().await? else {
                break;
            };
            summary.entries_seen += 1;
            let path = entry.path().to_string();

            if entry.is_dir() || !self.select(&path)? {
                tracing::debug!(entry = %path, "draining");
                entry.drain().await?;
                summary.drained += 1;
                continue;
            }

            let key = self.destination(&path)?;
            let destination = ObjectLocator::new(destination_bucket.clone(), key);
            tracing::info!(entry = %path, key = %destination.key, "Uploading file {}", basename(&path));

            // Counted before the entry is piped
            self.counter.dispatch();
            summary.dispatched += 1;
            let settlement = match self.forward(entry, &destination).await {
                Ok(settlement) => settlement,
                Err(err) => {
                    // The upload is abandoned along with the run
                    self.counter.complete();
                    return Err(err);
                }
            };

            tasks.push(tokio::spawn(settle(
                settlement,
                path,
                destination.key,
                self.counter.clone(),
                events.clone(),
            )));
        }

        for task in tasks {
            match task.await {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    // The outcome was never reported; keep the counts whole
                    tracing::error!(error = %e, "upload task panicked");
                    self.counter.complete();
                    summary.failed += 1;
                }
            }
        }

        debug_assert!(self.counter.is_settled());
        Ok(summary)
    }

    fn select(&self, path: &str) -> Result<bool> {
        self.selector
            .select(path)
            .map_err(|e| as_selector_error(path, e))
    }

    fn destination(&self, path: &str) -> Result<String> {
        self.namer
            .destination(path)
            .map_err(|e| as_selector_error(path, e))
    }

    /// Stream one entry into a fresh upload.
    ///
    /// Returns the settlement of the upload, which is already failed when the
    /// store refused the upload. Errors returned here are fatal to the run.
    async fn forward(
        &self,
        mut entry: ZipStreamEntry<'_, ByteSource>,
        destination: &ObjectLocator,
    ) -> Result<Settlement> {
        let key = destination.key.clone();

        if !entry.is_supported() {
            let header = entry.header();
            let cause = if header.is_encrypted() {
                "entry is encrypted".to_string()
            } else {
                format!(
                    "unsupported compression method: {}",
                    header.compression_method
                )
            };
            entry.drain().await?;
            return Ok(future::ready(Err(FanoutError::upload_failed(key, cause))).boxed());
        }

        let sink = match self.store.open_write(destination).await {
            Ok(sink) => sink,
            Err(err) => {
                entry.drain().await?;
                return Ok(future::ready(Err(as_upload_failure(&key, err))).boxed());
            }
        };
        let (mut writer, completion) = sink.into_parts();

        match pump(&mut entry, &mut writer, self.copy_chunk_size).await {
            Ok(bytes) => tracing::trace!(key = %key, bytes, "entry handed to store"),
            Err(PumpError::Read(err)) => return Err(err),
            Err(PumpError::Write(err)) => {
                entry.drain().await?;
                return Ok(after_write_failure(writer, completion, key, err));
            }
        }

        // Verifies the checksum; a corrupt entry must not be committed
        entry.finish().await?;

        if let Err(err) = writer.shutdown().await {
            return Ok(after_write_failure(writer, completion, key, err));
        }
        drop(writer);
        Ok(completion)
    }
}

/// Copy `reader` into `writer` through one fixed chunk, telling read and
/// write failures apart
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
) -> std::result::Result<u64, PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| PumpError::Read(FanoutError::from_io(e)))?;
        if n == 0 {
            return Ok(total);
        }
        writer
            .write_all(&chunk[..n])
            .await
            .map_err(PumpError::Write)?;
        total += n as u64;
    }
}

/// The writer broke; report the store's own error when it has one
fn after_write_failure(
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    completion: UploadCompletion,
    key: String,
    cause: io::Error,
) -> Settlement {
    // Dropping the writer abandons the upload so the completion can settle
    drop(writer);
    async move {
        let err = match completion.await {
            Err(err) => err,
            Ok(_) => FanoutError::upload_failed(&key, cause),
        };
        Err(as_upload_failure(&key, err))
    }
    .boxed()
}

async fn settle(
    settlement: Settlement,
    path: String,
    key: String,
    counter: Arc<CompletionCounter>,
    events: mpsc::Sender<Result<PipelineEvent>>,
) -> bool {
    let result = settlement.await.map_err(|e| as_upload_failure(&key, e));
    counter.complete();

    match &result {
        Ok(receipt) => {
            tracing::info!(entry = %path, key = %key, bytes = receipt.bytes, "uploaded")
        }
        Err(err) => tracing::warn!(entry = %path, key = %key, error = %err, "upload failed"),
    }

    let success = result.is_ok();
    // A dropped stream only means nobody is listening any more
    let _ = events
        .send(Ok(PipelineEvent::Uploaded(UploadOutcome { path, key, result })))
        .await;
    success
}

fn as_upload_failure(key: &str, err: FanoutError) -> FanoutError {
    match err {
        err @ FanoutError::UploadFailed { .. } => err,
        other => FanoutError::upload_failed(key, other),
    }
}

fn as_selector_error(path: &str, err: FanoutError) -> FanoutError {
    match err {
        err @ FanoutError::SelectorError { .. } => err,
        other => FanoutError::SelectorError {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}
