//! # zip-fanout: Streaming ZIP Fan-out for Object Storage
//!
//! `zip-fanout` downloads a ZIP archive from an object store, walks its entries
//! as the bytes arrive, and re-uploads the entries you select as individual
//! objects. Neither the archive nor any entry is ever held in memory as a whole.
//!
//! ## Features
//!
//! - **Streaming Demultiplexer**: Forward-only ZIP reader over any `AsyncRead`, no seeking
//! - **Concurrent Re-upload**: Each selected entry becomes an independent upload task
//! - **Backpressure**: Slow uploads throttle the archive download, not your memory
//! - **Completion Tracking**: Dispatched/completed counters and exactly one `AllDone`
//! - **Pluggable Storage**: AWS S3 (multipart) or an in-memory store for tests
//!
//! ## Quick Start
//!
//! ### Fanning out an archive on S3
//!
//! ```no_run
//! use std::sync::Arc;
//! use zip_fanout::{FanoutConfig, PipelineEvent};
//! use zip_fanout::store::S3ObjectStore;
//! use futures_util::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FanoutConfig::default();
//! let store = Arc::new(S3ObjectStore::builder().build().await);
//!
//! let mut events = config.pipeline(store)?.run(config.source());
//! while let Some(event) = events.next().await {
//!     if let PipelineEvent::AllDone(summary) = event? {
//!         println!("{} uploaded, {} failed", summary.succeeded, summary.failed);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Custom selection
//!
//! ```no_run
//! use std::sync::Arc;
//! use zip_fanout::ArchiveFanoutPipeline;
//! use zip_fanout::store::{MemoryObjectStore, ObjectLocator};
//!
//! # async fn example() -> zip_fanout::Result<()> {
//! let store = Arc::new(MemoryObjectStore::new());
//! let report = ArchiveFanoutPipeline::builder(store)
//!     .selector(|path: &str| path.starts_with("reports/"))
//!     .namer(|path: &str| format!("flat/{}", path.replace('/', "_")))
//!     .build()
//!     .run(ObjectLocator::new("bucket", "drop/archive.zip"))
//!     .collect_report()
//!     .await?;
//!
//! println!("{} entries forwarded", report.summary.dispatched);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod demux;
pub mod error;
mod lookahead;
pub mod pipeline;
pub mod select;
pub mod store;

pub use config::FanoutConfig;
pub use demux::{EntryHeader, ZipStreamEntry, ZipStreamReader};
pub use error::{FanoutError, Result};
pub use pipeline::{
    ArchiveFanoutPipeline, ArchiveFanoutPipelineBuilder, CompletionCounter, FanoutStream,
    PipelineEvent, RunReport, RunSummary, UploadOutcome,
};
pub use select::{DestinationNamer, EntrySelector, ExtensionFilter, PrefixNamer};
