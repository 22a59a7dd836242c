//! Run configuration for zip-fanout

use crate::error::{FanoutError, Result};
use crate::pipeline::{ArchiveFanoutPipeline, DEFAULT_COPY_CHUNK_SIZE};
use crate::demux::DEFAULT_BUFFER_SIZE;
use crate::select::{ExtensionFilter, PrefixNamer};
use crate::store::{ObjectLocator, ObjectStore, DEFAULT_PART_SIZE, MAX_PART_SIZE};
use std::sync::Arc;

/// Bucket of the reference run
pub const DEFAULT_BUCKET: &str = "pf-test-zip-bucket";

/// Archive key of the reference run
pub const DEFAULT_KEY: &str = "zip/test.zip";

/// Destination prefix of the reference run
pub const DEFAULT_PREFIX: &str = "unzipped/";

/// Extensions forwarded by the reference run
pub const DEFAULT_EXTENSIONS: [&str; 2] = [".xlsx", ".pdf"];

/// Everything one fan-out run needs, minus the store
///
/// `Default` is the reference run: `pf-test-zip-bucket/zip/test.zip`,
/// `.xlsx`/`.pdf` entries without hidden files, re-uploaded as
/// `unzipped/<basename>` in the same bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Bucket holding the archive (default: "pf-test-zip-bucket")
    pub bucket: String,

    /// Key of the archive (default: "zip/test.zip")
    pub key: String,

    /// Bucket to upload into (None = the archive's bucket)
    pub destination_bucket: Option<String>,

    /// Prepended to each entry's basename (default: "unzipped/")
    pub prefix: String,

    /// Extensions to forward, with their leading dot (default: .xlsx, .pdf)
    pub extensions: Vec<String>,

    /// Also forward entries whose basename starts with `.` (default: false)
    pub include_hidden: bool,

    /// Compare extensions case-insensitively (default: false)
    pub ignore_case: bool,

    /// Multipart part size in bytes (default: 5 MiB, the S3 minimum)
    pub part_size: usize,

    /// Buffer in front of the archive stream (default: 64 KiB)
    pub read_buffer_size: usize,

    /// Chunk used to copy an entry into its upload (default: 64 KiB)
    pub copy_chunk_size: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            key: DEFAULT_KEY.to_string(),
            destination_bucket: None,
            prefix: DEFAULT_PREFIX.to_string(),
            extensions: default_extensions(),
            include_hidden: false,
            ignore_case: false,
            part_size: DEFAULT_PART_SIZE,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl FanoutConfig {
    pub fn with_source(mut self, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self.key = key.into();
        self
    }

    pub fn with_destination_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.destination_bucket = Some(bucket.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the extension set; an empty iterator keeps the defaults
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let extensions: Vec<String> = extensions.into_iter().map(Into::into).collect();
        if !extensions.is_empty() {
            self.extensions = extensions;
        }
        self
    }

    pub fn with_include_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    pub fn with_ignore_case(mut self, ignore: bool) -> Self {
        self.ignore_case = ignore;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Check every field, reporting the first problem as `FanoutError::Config`.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(FanoutError::Config("source bucket must not be empty".into()));
        }
        if self.key.trim().is_empty() {
            return Err(FanoutError::Config("source key must not be empty".into()));
        }
        if matches!(&self.destination_bucket, Some(b) if b.trim().is_empty()) {
            return Err(FanoutError::Config(
                "destination bucket must not be empty".into(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(FanoutError::Config(
                "at least one extension is required".into(),
            ));
        }
        if let Some(bad) = self
            .extensions
            .iter()
            .find(|e| !e.starts_with('.') || e.len() < 2)
        {
            return Err(FanoutError::Config(format!(
                "extension {:?} must be a dot followed by a suffix, e.g. \".pdf\"",
                bad
            )));
        }
        if self.part_size < DEFAULT_PART_SIZE || self.part_size > MAX_PART_SIZE {
            return Err(FanoutError::Config(format!(
                "part size {} is outside {}..={} bytes",
                self.part_size, DEFAULT_PART_SIZE, MAX_PART_SIZE
            )));
        }
        if self.read_buffer_size == 0 || self.copy_chunk_size == 0 {
            return Err(FanoutError::Config("buffer sizes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn source(&self) -> ObjectLocator {
        ObjectLocator::new(self.bucket.clone(), self.key.clone())
    }

    /// Bucket uploads go to
    pub fn destination_bucket(&self) -> &str {
        self.destination_bucket.as_deref().unwrap_or(&self.bucket)
    }

    pub fn selector(&self) -> ExtensionFilter {
        ExtensionFilter::new(self.extensions.iter().cloned())
            .include_hidden(self.include_hidden)
            .ignore_case(self.ignore_case)
    }

    pub fn namer(&self) -> PrefixNamer {
        PrefixNamer::new(self.prefix.clone())
    }

    /// Validate and assemble a pipeline over `store`
    pub fn pipeline(&self, store: Arc<dyn ObjectStore>) -> Result<ArchiveFanoutPipeline> {
        self.validate()?;
        Ok(ArchiveFanoutPipeline::builder(store)
            .selector(self.selector())
            .namer(self.namer())
            .destination_bucket(self.destination_bucket())
            .read_buffer_size(self.read_buffer_size)
            .copy_chunk_size(self.copy_chunk_size)
            .build())
    }
}
