//! Concurrent per-page object download with checksum skip and verification.

use crate::error::MirrorError;
use crate::paths;
use crate::storage::ObjectStorage;
use crate::types::{DownloadOutcome, FailureKind, ObjectRecord, Verification};
use crate::verify::{compute_file_etag, etags_match, is_locally_correct, is_multipart_etag};
use indicatif::ProgressBar;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Downloads one object into `bucket_root`, following the key's directories.
///
/// Never returns an error: every failure is folded into
/// [`DownloadOutcome::Failed`] so one object cannot abort a page.
pub async fn download_object(
    storage: &dyn ObjectStorage,
    bucket: &str,
    record: &ObjectRecord,
    bucket_root: &Path,
    verification: Verification,
) -> DownloadOutcome {
    let key = record.key.as_str();

    if paths::basename(key).is_none() {
        debug!(bucket, key, "Directory marker, nothing to fetch");
        return DownloadOutcome::SkippedIsDirectoryMarker;
    }

    let destination = paths::nested_path(bucket_root, key);
    let parent = destination
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| bucket_root.to_path_buf());

    // Sibling tasks may race on the same directory; create_dir_all tolerates that.
    if let Err(e) = tokio::fs::create_dir_all(&parent).await {
        error!(bucket, key, path = %parent.display(), "Failed to create directory: {}", e);
        return DownloadOutcome::Failed(FailureKind::Filesystem);
    }

    if verification == Verification::Checksum
        && is_locally_correct(&destination, &record.checksum).await
    {
        debug!(bucket, key, "Already present with matching checksum");
        return DownloadOutcome::SkippedExists;
    }

    let written = match storage.get_object(bucket, key, &parent).await {
        Ok(path) => path,
        Err(e) => {
            warn!(bucket, key, "Transfer failed: {}", e);
            return DownloadOutcome::Failed(FailureKind::Transfer);
        }
    };

    if verification == Verification::KeyOnly {
        warn!(
            bucket,
            key,
            listed_checksum = %record.checksum,
            "Accepted download without checksum verification"
        );
        return DownloadOutcome::Success;
    }

    verify_written(bucket, record, &written).await
}

async fn verify_written(bucket: &str, record: &ObjectRecord, written: &Path) -> DownloadOutcome {
    let key = record.key.as_str();
    let actual = match compute_file_etag(written).await {
        Ok(etag) => etag,
        Err(e) => {
            warn!(bucket, key, "Could not hash downloaded file: {}", e);
            return DownloadOutcome::Failed(FailureKind::Transfer);
        }
    };

    if etags_match(&actual, &record.checksum) {
        info!(bucket, key, "Downloaded and verified");
        return DownloadOutcome::Success;
    }

    if is_multipart_etag(&record.checksum) {
        warn!(
            bucket,
            key,
            expected = %record.checksum,
            "Multipart ETag is not a content MD5; download cannot be verified"
        );
    } else {
        let mismatch = MirrorError::ChecksumMismatch {
            key: key.to_string(),
            expected: record.checksum.clone(),
            actual,
        };
        error!(bucket, key, "{}", mismatch);
    }
    // The ledger replays this key; don't leave unverified content behind.
    if let Err(e) = tokio::fs::remove_file(written).await {
        debug!(bucket, key, path = %written.display(), "Could not remove unverified file: {}", e);
    }
    DownloadOutcome::Failed(FailureKind::ChecksumMismatch)
}

/// Fetches listing pages with a bounded number of concurrent transfers.
pub struct DownloadWorkerPool {
    storage: Arc<dyn ObjectStorage>,
    semaphore: Arc<Semaphore>,
    pb: ProgressBar,
}

impl DownloadWorkerPool {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        max_concurrent_downloads: usize,
        pb: ProgressBar,
    ) -> Self {
        Self {
            storage,
            semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            pb,
        }
    }

    pub fn storage(&self) -> &dyn ObjectStorage {
        self.storage.as_ref()
    }

    /// Fetches a single object, holding one worker slot.
    pub async fn fetch_object(
        &self,
        bucket: &str,
        record: &ObjectRecord,
        bucket_root: &Path,
        verification: Verification,
    ) -> DownloadOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return DownloadOutcome::Failed(FailureKind::Transfer),
        };
        download_object(self.storage.as_ref(), bucket, record, bucket_root, verification).await
    }

    /// Downloads every object of a page and waits for all of them.
    ///
    /// Results come back in page order.
    pub async fn fetch_page(
        &self,
        bucket: &str,
        objects: &[ObjectRecord],
        bucket_root: &Path,
    ) -> Vec<(ObjectRecord, DownloadOutcome)> {
        let mut download_tasks = Vec::with_capacity(objects.len());

        for record in objects {
            let storage = Arc::clone(&self.storage);
            let semaphore = Arc::clone(&self.semaphore);
            let pb = self.pb.clone();
            let bucket = bucket.to_string();
            let task_record = record.clone();
            let bucket_root = bucket_root.to_path_buf();

            let task = tokio::spawn(async move {
                let record = task_record;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return DownloadOutcome::Failed(FailureKind::Transfer),
                };
                pb.set_message(record.key.clone());
                let outcome = download_object(
                    storage.as_ref(),
                    &bucket,
                    &record,
                    &bucket_root,
                    Verification::Checksum,
                )
                .await;
                pb.inc(1);
                outcome
            });

            download_tasks.push((record.clone(), task));
        }

        // Barrier: the caller only moves to the next page once all of these finish.
        let mut results = Vec::with_capacity(download_tasks.len());
        for (record, task) in download_tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(bucket, key = %record.key, "Download task failed: {}", e);
                    DownloadOutcome::Failed(FailureKind::Transfer)
                }
            };
            results.push((record, outcome));
        }
        results
    }
}
