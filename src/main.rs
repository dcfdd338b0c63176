use anyhow::{bail, Context};
use bucketsync::{BucketEnumerator, HttpStorage, MirrorConfig, ObjectStorage, ProgressStore};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    /// Mirror one bucket, or every bucket when --bucket is absent
    Download,
    /// Move objects written flat at the bucket root into their directories
    Verify,
    /// Replay the failure ledger of one bucket
    Failure,
    /// Report object counts and sizes of every bucket
    Info,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Env {
    Local,
    Online,
}

#[derive(Parser, Debug)]
#[command(name = "bucketsync")]
#[command(about = "Mirror object-storage buckets to local disk with resumable, verified downloads", long_about = None)]
#[command(version)]
struct Args {
    /// What to do
    #[arg(short, long, value_enum, default_value_t = Action::Download)]
    action: Action,

    /// Bucket to work on (required for verify and failure)
    #[arg(short, long)]
    bucket: Option<String>,

    /// Which destination root to use
    #[arg(short, long, value_enum)]
    env: Env,

    /// Destination root for --env local
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// Destination root for --env online
    #[arg(long)]
    online_root: Option<PathBuf>,

    /// Storage service endpoint URL
    #[arg(long)]
    endpoint: String,

    /// Directory for progress markers and failure ledgers
    #[arg(long, default_value = "logs")]
    state_dir: PathBuf,

    /// Objects requested per listing call
    #[arg(long, default_value_t = 500)]
    page_size: usize,

    /// Maximum concurrent transfers
    #[arg(short, long, default_value_t = 16)]
    concurrency: usize,

    /// Failure replay passes before giving up for this run
    #[arg(long, default_value_t = 5)]
    max_retry_passes: u32,

    /// Pause between failure replay passes (e.g. "60s", "2m")
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    retry_cooldown: Duration,

    /// Never accept a download whose checksum could not be verified
    #[arg(long)]
    no_unverified_retry: bool,

    /// Forget saved listing positions before starting
    #[arg(long)]
    fresh: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Checks combinations clap cannot express and builds the engine config.
    fn mirror_config(&self) -> anyhow::Result<MirrorConfig> {
        let destination_root = match self.env {
            Env::Local => self.local_root.clone(),
            Env::Online => self.online_root.clone(),
        };
        let Some(destination_root) = destination_root else {
            bail!(
                "--env {:?} needs --{}-root",
                self.env,
                if self.env == Env::Local { "local" } else { "online" }
            );
        };
        if matches!(self.action, Action::Verify | Action::Failure) && self.bucket.is_none() {
            bail!("--action {:?} needs --bucket", self.action);
        }
        if self.page_size == 0 || self.concurrency == 0 {
            bail!("--page-size and --concurrency must be at least 1");
        }

        Ok(MirrorConfig {
            destination_root,
            page_size: self.page_size,
            max_concurrent_downloads: self.concurrency,
            max_retry_passes: self.max_retry_passes,
            retry_cooldown: self.retry_cooldown,
            accept_unverified_retry: !self.no_unverified_retry,
            show_progress: atty::is(atty::Stream::Stderr),
            ..MirrorConfig::default()
        })
    }
}

async fn run(args: Args, config: MirrorConfig) -> anyhow::Result<()> {
    let storage: Arc<dyn ObjectStorage> =
        Arc::new(HttpStorage::new(args.endpoint.as_str()).context("invalid --endpoint")?);
    let enumerator = BucketEnumerator::new(storage, ProgressStore::new(&args.state_dir), config);
    let bucket = args.bucket.as_deref();

    if args.fresh {
        info!(bucket = ?bucket, "Clearing saved progress");
        enumerator.reset(bucket).await?;
    }

    match (args.action, bucket) {
        (Action::Download, Some(bucket)) => {
            let summary = enumerator.download_bucket(bucket).await?;
            info!(
                bucket,
                succeeded = summary.succeeded,
                skipped = summary.skipped_existing,
                failed = summary.failed,
                remaining = summary.remaining_failures,
                "Download finished"
            );
        }
        (Action::Download, None) => {
            enumerator.run().await?;
        }
        (Action::Verify, Some(bucket)) => {
            enumerator.correct_bucket(bucket).await?;
        }
        (Action::Failure, Some(bucket)) => {
            let report = enumerator.retry_failures(bucket).await?;
            info!(
                bucket,
                passes = report.passes,
                recovered = report.recovered,
                remaining = report.remaining,
                "Failure replay finished"
            );
        }
        (Action::Info, _) => {
            let report = enumerator.storage_report().await?;
            println!(
                "{} buckets, {} objects, {:.2} GiB",
                report.buckets.len(),
                report.total.object_count,
                report.total_gib()
            );
        }
        (action, None) => bail!("--action {:?} needs --bucket", action),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Bad arguments are reported but are not a failed run.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };
    let config = match args.mirror_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(0);
        }
    };

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bucketsync={}", log_level))
        .init();

    info!(
        action = ?args.action,
        env = ?args.env,
        root = %config.destination_root.display(),
        endpoint = %args.endpoint,
        "BucketSync starting"
    );

    if let Err(e) = run(args, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
