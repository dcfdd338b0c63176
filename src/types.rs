//! Data structures shared across the mirror engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One stored object as reported by a listing page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Service-reported content identity (the ETag, kept verbatim with quotes).
    pub checksum: String,
    /// Object key, `/`-separated.
    pub key: String,
}

impl ObjectRecord {
    pub fn new(checksum: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.checksum, self.key)
    }
}

/// An object that did not end up verified on disk.
pub type FailureRecord = ObjectRecord;

/// One page of a paginated bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub objects: Vec<ObjectRecord>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Durable listing position for one bucket.
///
/// `page_marker` lists the page currently being processed; `next_marker`
/// lists the one after it. Until `page_complete` is set a restart re-lists
/// from `page_marker`, so no page is ever skipped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressMarker {
    pub bucket: String,
    pub page_marker: Option<String>,
    pub next_marker: Option<String>,
    pub is_truncated: bool,
    pub page_complete: bool,
}

/// Object count and byte total for a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStorageInfo {
    pub object_count: u64,
    pub total_size_bytes: u64,
}

/// Storage totals for disk planning before a mirror run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageReport {
    pub buckets: Vec<(String, BucketStorageInfo)>,
    pub total: BucketStorageInfo,
}

impl StorageReport {
    /// Total size in GiB (1 GiB = 1024^3 bytes).
    pub fn total_gib(&self) -> f64 {
        self.total.total_size_bytes as f64 / 1_073_741_824.0
    }
}

/// Why a download attempt did not produce a verified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The storage collaborator errored.
    Transfer,
    /// The transfer completed but the content hash disagrees.
    ChecksumMismatch,
    /// Local directory creation failed.
    Filesystem,
}

/// Result of processing a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Transferred and verified.
    Success,
    /// Already on disk with the right checksum; no network call made.
    SkippedExists,
    /// Key denotes a directory placeholder; nothing to do.
    SkippedIsDirectoryMarker,
    /// Needs another attempt; goes to the failure ledger.
    Failed(FailureKind),
}

impl DownloadOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadOutcome::Failed(_))
    }
}

/// Whether a fetch compares content against the listed checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Skip if already correct, verify after transfer.
    Checksum,
    /// Always fetch, accept whatever the service returns.
    KeyOnly,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: u64,
    pub skipped_existing: u64,
    pub skipped_directories: u64,
    pub failed: u64,
    pub recovered: u64,
    pub remaining_failures: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::Success => self.succeeded += 1,
            DownloadOutcome::SkippedExists => self.skipped_existing += 1,
            DownloadOutcome::SkippedIsDirectoryMarker => self.skipped_directories += 1,
            DownloadOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.succeeded += other.succeeded;
        self.skipped_existing += other.skipped_existing;
        self.skipped_directories += other.skipped_directories;
        self.failed += other.failed;
        self.recovered += other.recovered;
        self.remaining_failures += other.remaining_failures;
    }
}

/// Result of replaying a failure ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub passes: u32,
    pub recovered: u64,
    pub remaining: u64,
}

/// Result of a path-correction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionReport {
    pub moved: u64,
    pub removed_duplicates: u64,
    pub untouched: u64,
    pub failures: u64,
}

/// Configuration for mirroring buckets.
///
/// # Example
///
/// ```
/// use bucketsync::MirrorConfig;
///
/// let config = MirrorConfig {
///     destination_root: "/data/mirror".into(),
///     max_concurrent_downloads: 32,
///     ..MirrorConfig::default()
/// };
/// assert_eq!(config.page_size, 500);
/// ```
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Local root; each bucket lands in `<destination_root>/<bucket>`.
    pub destination_root: PathBuf,
    /// Objects requested per listing call (default: 500).
    pub page_size: usize,
    /// Maximum number of concurrent transfers (default: 16).
    ///
    /// Independent of `page_size`: a page of 500 objects still runs at most
    /// this many transfers at once.
    pub max_concurrent_downloads: usize,
    /// Attempts for a failing listing call before giving up (default: 5).
    pub listing_retries: usize,
    /// Base delay for listing backoff (default: 1s).
    pub listing_retry_base: Duration,
    /// Upper bound on a single listing backoff delay (default: 60s).
    pub listing_retry_max: Duration,
    /// Failure-ledger replay passes before leaving records for a later run (default: 5).
    pub max_retry_passes: u32,
    /// Pause between replay passes (default: 60s).
    pub retry_cooldown: Duration,
    /// Accept a key-only re-download when the verified retry fails (default: true).
    ///
    /// This tolerates listing checksums that are wrong for some keys, at the
    /// cost of accepting content that could not be verified.
    pub accept_unverified_retry: bool,
    /// Draw progress bars on stderr (default: false).
    pub show_progress: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            destination_root: PathBuf::from("mirror"),
            page_size: 500,
            max_concurrent_downloads: 16,
            listing_retries: 5,
            listing_retry_base: Duration::from_secs(1),
            listing_retry_max: Duration::from_secs(60),
            max_retry_passes: 5,
            retry_cooldown: Duration::from_secs(60),
            accept_unverified_retry: true,
            show_progress: false,
        }
    }
}

impl MirrorConfig {
    /// Local directory for one bucket.
    pub fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.destination_root.join(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_each_outcome() {
        let mut summary = RunSummary::default();
        summary.record(DownloadOutcome::Success);
        summary.record(DownloadOutcome::SkippedExists);
        summary.record(DownloadOutcome::SkippedExists);
        summary.record(DownloadOutcome::SkippedIsDirectoryMarker);
        summary.record(DownloadOutcome::Failed(FailureKind::ChecksumMismatch));

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped_existing, 2);
        assert_eq!(summary.skipped_directories, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_record_display_is_ledger_line() {
        let record = ObjectRecord::new("\"abc\"", "dir/a:b.txt");
        assert_eq!(record.to_string(), "\"abc\":dir/a:b.txt");
    }
}
