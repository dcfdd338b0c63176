//! Main orchestration logic for mirroring buckets.

use crate::correct::PathCorrector;
use crate::download::DownloadWorkerPool;
use crate::error::MirrorError;
use crate::ledger::{replay_failures, FailureLedger, ReplayPolicy};
use crate::listing::{ListingCursor, ListingRetry};
use crate::progress::ProgressStore;
use crate::storage::ObjectStorage;
use crate::types::{
    CorrectionReport, DownloadOutcome, MirrorConfig, ReplayReport, RunSummary, StorageReport,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Mirrors buckets one at a time, resuming wherever the last run stopped.
///
/// # Example
///
/// ```no_run
/// use bucketsync::{BucketEnumerator, HttpStorage, MirrorConfig, ProgressStore};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Arc::new(HttpStorage::new("https://storage.example.com")?);
/// let enumerator = BucketEnumerator::new(storage, ProgressStore::new("logs"), MirrorConfig::default());
/// let summary = enumerator.run().await?;
/// println!("{} objects downloaded", summary.succeeded);
/// # Ok(())
/// # }
/// ```
pub struct BucketEnumerator {
    storage: Arc<dyn ObjectStorage>,
    store: ProgressStore,
    config: MirrorConfig,
}

impl BucketEnumerator {
    pub fn new(storage: Arc<dyn ObjectStorage>, store: ProgressStore, config: MirrorConfig) -> Self {
        Self {
            storage,
            store,
            config,
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    fn listing_retry(&self) -> ListingRetry {
        ListingRetry::from_config(&self.config)
    }

    fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy {
            max_passes: self.config.max_retry_passes,
            cooldown: self.config.retry_cooldown,
            accept_unverified: self.config.accept_unverified_retry,
        }
    }

    fn progress_bar(&self, bucket: &str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix} {pos} objects | {msg} | {elapsed_precise} elapsed",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_prefix(bucket.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    fn pool(&self, pb: ProgressBar) -> DownloadWorkerPool {
        DownloadWorkerPool::new(
            Arc::clone(&self.storage),
            self.config.max_concurrent_downloads,
            pb,
        )
    }

    /// Downloads every bucket, skipping those finished by an earlier run.
    ///
    /// Buckets listed before the recorded current bucket are assumed complete
    /// and are not re-verified.
    pub async fn run(&self) -> Result<RunSummary, MirrorError> {
        let started = Instant::now();
        let buckets = self.storage.list_buckets().await?;

        let start = match self.store.load_current_bucket().await? {
            Some(current) => match buckets.iter().position(|b| *b == current) {
                Some(index) => {
                    info!(bucket = %current, skipped = index, "Resuming interrupted run");
                    index
                }
                None => {
                    warn!(bucket = %current, "Recorded bucket no longer exists; starting from the first bucket");
                    0
                }
            },
            None => {
                info!(buckets = buckets.len(), "All buckets starting");
                0
            }
        };

        let mut total = RunSummary::default();
        for bucket in &buckets[start..] {
            self.store.save_current_bucket(bucket).await?;
            let summary = self.download_bucket(bucket).await?;
            total.merge(&summary);
        }

        info!(
            succeeded = total.succeeded,
            skipped = total.skipped_existing + total.skipped_directories,
            failed = total.failed,
            recovered = total.recovered,
            remaining = total.remaining_failures,
            elapsed = %humantime::format_duration(std::time::Duration::from_secs(started.elapsed().as_secs())),
            "All buckets finished"
        );
        Ok(total)
    }

    /// Lists and downloads one bucket page by page, then replays its failures.
    pub async fn download_bucket(&self, bucket: &str) -> Result<RunSummary, MirrorError> {
        let bucket_root = self.config.bucket_root(bucket);
        tokio::fs::create_dir_all(&bucket_root)
            .await
            .map_err(|e| MirrorError::filesystem(&bucket_root, e))?;
        info!(bucket, root = %bucket_root.display(), "Bucket download started");

        let pb = self.progress_bar(bucket);
        let pool = self.pool(pb.clone());
        let ledger = FailureLedger::new(self.store.failure_ledger_path(bucket));
        let mut cursor = ListingCursor::resume(
            self.storage.as_ref(),
            &self.store,
            bucket,
            self.config.page_size,
            self.listing_retry(),
        )
        .await?;

        let mut summary = RunSummary::default();
        while let Some(page) = cursor.next_page().await? {
            let results = pool.fetch_page(bucket, &page.objects, &bucket_root).await;
            for (record, outcome) in results {
                summary.record(outcome);
                if let DownloadOutcome::Failed(kind) = outcome {
                    warn!(bucket, key = %record.key, ?kind, "Download failed, recorded for replay");
                    ledger.append(&record).await?;
                }
            }
            cursor.complete_page().await?;
        }
        pb.finish_with_message("listing exhausted");

        info!(bucket, "Download failure replay starting");
        let report = replay_failures(&pool, &ledger, bucket, &bucket_root, &self.replay_policy()).await?;
        summary.recovered = report.recovered;
        summary.remaining_failures = report.remaining;
        info!(bucket, recovered = report.recovered, remaining = report.remaining, "Download failure replay done");

        info!(
            bucket,
            succeeded = summary.succeeded,
            skipped = summary.skipped_existing,
            directories = summary.skipped_directories,
            failed = summary.failed,
            "Bucket download finished"
        );
        Ok(summary)
    }

    /// Replays a bucket's failure ledger without listing.
    pub async fn retry_failures(&self, bucket: &str) -> Result<ReplayReport, MirrorError> {
        let bucket_root = self.config.bucket_root(bucket);
        tokio::fs::create_dir_all(&bucket_root)
            .await
            .map_err(|e| MirrorError::filesystem(&bucket_root, e))?;

        info!(bucket, "Download failure replay starting");
        let pool = self.pool(self.progress_bar(bucket));
        let ledger = FailureLedger::new(self.store.failure_ledger_path(bucket));
        let report = replay_failures(&pool, &ledger, bucket, &bucket_root, &self.replay_policy()).await?;
        info!(bucket, recovered = report.recovered, remaining = report.remaining, "Download failure replay done");
        Ok(report)
    }

    /// Moves flat-written objects of a bucket into their directories.
    pub async fn correct_bucket(&self, bucket: &str) -> Result<CorrectionReport, MirrorError> {
        let corrector = PathCorrector::new(
            self.storage.as_ref(),
            &self.store,
            self.config.page_size,
            self.listing_retry(),
        );
        corrector
            .correct_bucket(bucket, &self.config.bucket_root(bucket))
            .await
    }

    /// Object counts and sizes of every bucket, for disk planning.
    pub async fn storage_report(&self) -> Result<StorageReport, MirrorError> {
        let mut report = StorageReport::default();

        for bucket in self.storage.list_buckets().await? {
            let info = match self.storage.bucket_storage_info(&bucket).await {
                Ok(info) => info,
                Err(e) => {
                    error!(bucket = %bucket, "Failed to read storage info: {}", e);
                    return Err(e);
                }
            };
            info!(
                bucket = %bucket,
                objects = info.object_count,
                bytes = info.total_size_bytes,
                "Bucket storage info"
            );
            report.total.object_count += info.object_count;
            report.total.total_size_bytes += info.total_size_bytes;
            report.buckets.push((bucket, info));
        }

        info!(
            objects = report.total.object_count,
            bytes = report.total.total_size_bytes,
            size = %format!("{:.2} GiB", report.total_gib()),
            "Total storage"
        );
        Ok(report)
    }

    /// Forgets resume state so the next run lists from the top.
    ///
    /// With a bucket, only that bucket's marker is cleared; without one, every
    /// bucket's marker and the current-bucket pointer are cleared. Failure
    /// ledgers are kept.
    pub async fn reset(&self, bucket: Option<&str>) -> Result<(), MirrorError> {
        match bucket {
            Some(bucket) => self.store.clear_bucket(bucket).await,
            None => {
                for bucket in self.storage.list_buckets().await? {
                    self.store.clear_bucket(&bucket).await?;
                }
                self.store.clear_current_bucket().await
            }
        }
    }
}
