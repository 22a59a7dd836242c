use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures_util::{Stream, StreamExt};
use tracing_subscriber::EnvFilter;
use zip_fanout::store::{ObjectLocator, S3ObjectStore};
use zip_fanout::{config, FanoutConfig, PipelineEvent, RunSummary};

const MIB: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "zip-fanout",
    version,
    about = "Unpack a ZIP archive stored on S3 into individual objects"
)]
struct Cli {
    /// Bucket holding the archive
    #[arg(long, env = "ZIP_FANOUT_BUCKET", default_value = config::DEFAULT_BUCKET)]
    bucket: String,

    /// Key of the archive
    #[arg(long, env = "ZIP_FANOUT_KEY", default_value = config::DEFAULT_KEY)]
    key: String,

    /// Bucket to upload into [default: the archive's bucket]
    #[arg(long, env = "ZIP_FANOUT_DESTINATION_BUCKET")]
    destination_bucket: Option<String>,

    /// Prefix for uploaded keys
    #[arg(long, default_value = config::DEFAULT_PREFIX)]
    prefix: String,

    /// Extension to forward, with its dot; repeat for several [default: .xlsx .pdf]
    #[arg(long = "extension", value_name = "EXT")]
    extensions: Vec<String>,

    /// Also forward files whose name starts with a dot
    #[arg(long)]
    include_hidden: bool,

    /// Match extensions case-insensitively
    #[arg(long)]
    ignore_case: bool,

    /// Multipart upload part size in MiB
    #[arg(long, default_value_t = 5)]
    part_size_mib: usize,

    /// AWS region [default: from the environment]
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Endpoint of an S3-compatible service (uses path-style addressing)
    #[arg(long, env = "ZIP_FANOUT_ENDPOINT_URL")]
    endpoint_url: Option<String>,
}

impl Cli {
    fn into_config(self) -> FanoutConfig {
        let mut config = FanoutConfig::default()
            .with_source(self.bucket, self.key)
            .with_prefix(self.prefix)
            .with_extensions(self.extensions)
            .with_include_hidden(self.include_hidden)
            .with_ignore_case(self.ignore_case)
            .with_part_size(self.part_size_mib.saturating_mul(MIB));
        if let Some(bucket) = self.destination_bucket {
            config = config.with_destination_bucket(bucket);
        }
        config
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let region = cli.region.clone();
    let endpoint_url = cli.endpoint_url.clone();
    let config = cli.into_config();
    config.validate().context("invalid arguments")?;

    let mut builder = S3ObjectStore::builder().part_size(config.part_size);
    if let Some(region) = region {
        builder = builder.region(region);
    }
    if let Some(url) = endpoint_url {
        builder = builder.endpoint_url(url);
    }
    let store = Arc::new(builder.build().await);

    let source = config.source();
    let events = config.pipeline(store)?.run(source.clone());
    let summary = report(events, &source).await?;
    tracing::debug!(?summary, "run summary");
    Ok(())
}

/// Print each settled upload and the final `All Done!!!` line.
///
/// A stream that ends without reporting completion is an error.
async fn report<S>(mut events: S, source: &ObjectLocator) -> anyhow::Result<RunSummary>
where
    S: Stream<Item = zip_fanout::Result<PipelineEvent>> + Unpin,
{
    while let Some(event) = events.next().await {
        match event.with_context(|| format!("fan-out of {} failed", source))? {
            PipelineEvent::Uploaded(outcome) => match outcome.result {
                Ok(receipt) => println!("uploaded {} ({} bytes)", outcome.key, receipt.bytes),
                Err(err) => eprintln!("failed {}: {}", outcome.key, err),
            },
            PipelineEvent::AllDone(summary) => {
                println!("All Done!!!");
                return Ok(summary);
            }
        }
    }
    anyhow::bail!("fan-out of {} stopped before reporting completion", source)
}
