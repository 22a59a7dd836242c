//! In-memory object store
//!
//! Uploads travel through a bounded `tokio::io::duplex` pipe into a background
//! task, so writers feel real backpressure. Failures and latency can be
//! injected per destination.

use super::{ByteSource, ObjectLocator, ObjectStore, UploadReceipt, UploadSink};
use crate::error::{FanoutError, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, DuplexStream};

/// Default capacity of the pipe between writer and store (64KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectLocator, Vec<u8>>,
    failing_writes: HashSet<ObjectLocator>,
    failing_opens: HashSet<ObjectLocator>,
    delays: HashMap<ObjectLocator, Duration>,
    writes_opened: Vec<ObjectLocator>,
}

/// Object store backed by a `HashMap`; clones share the same contents
#[derive(Clone)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
    pipe_capacity: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Set how many bytes a writer may run ahead of the store
    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            pipe_capacity: pipe_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map still holds consistent data; every update is one insert
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, locator: ObjectLocator, data: impl Into<Vec<u8>>) {
        self.lock().objects.insert(locator, data.into());
    }

    pub fn get(&self, locator: &ObjectLocator) -> Option<Vec<u8>> {
        self.lock().objects.get(locator).cloned()
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter(|l| l.bucket == bucket)
            .map(|l| l.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Destinations for which an upload was opened, in order
    pub fn writes_opened(&self) -> Vec<ObjectLocator> {
        self.lock().writes_opened.clone()
    }

    /// Accept the bytes for `locator` but fail the upload on completion
    pub fn fail_writes_to(&self, locator: ObjectLocator) {
        self.lock().failing_writes.insert(locator);
    }

    /// Refuse to open an upload to `locator`
    pub fn fail_open_for(&self, locator: ObjectLocator) {
        self.lock().failing_opens.insert(locator);
    }

    /// Hold back completion of uploads to `locator`
    pub fn delay_completion(&self, locator: ObjectLocator, delay: Duration) {
        self.lock().delays.insert(locator, delay);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_read(&self, locator: &ObjectLocator) -> Result<ByteSource> {
        let data = self
            .get(locator)
            .ok_or_else(|| FanoutError::SourceUnavailable {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                cause: "no such key".to_string(),
            })?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn open_write(&self, locator: &ObjectLocator) -> Result<UploadSink> {
        let (delay, fail) = {
            let mut inner = self.lock();
            inner.writes_opened.push(locator.clone());
            if inner.failing_opens.contains(locator) {
                return Err(FanoutError::upload_failed(&locator.key, "access denied"));
            }
            (
                inner.delays.get(locator).copied(),
                inner.failing_writes.contains(locator),
            )
        };

        let (writer, mut reader) = tokio::io::duplex(self.pipe_capacity);
        let committed = Arc::new(AtomicBool::new(false));
        let store = self.clone();
        let target = locator.clone();
        let commit_flag = committed.clone();

        let task = tokio::spawn(async move {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| FanoutError::upload_failed(&target.key, e))?;

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !commit_flag.load(Ordering::Acquire) {
                return Err(FanoutError::upload_failed(
                    &target.key,
                    "writer dropped before the end of data",
                ));
            }
            if fail {
                return Err(FanoutError::upload_failed(&target.key, "access denied"));
            }

            let bytes = data.len() as u64;
            store.put(target.clone(), data);
            Ok(UploadReceipt {
                locator: target,
                bytes,
                e_tag: None,
            })
        });

        let key = locator.key.clone();
        let completion = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FanoutError::upload_failed(
                    key,
                    format!("upload task panicked: {}", e),
                )),
            }
        }
        .boxed();

        Ok(UploadSink::new(
            Box::new(MemoryWriter {
                pipe: writer,
                committed,
            }),
            completion,
        ))
    }
}

/// Write half of an in-memory upload
struct MemoryWriter {
    pipe: DuplexStream,
    committed: Arc<AtomicBool>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.committed.store(true, Ordering::Release);
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}
