//! BucketSync - Resumable, verified mirroring of object-storage buckets to local disk
//!
//! This library walks every bucket of an S3-compatible service page by page and
//! downloads each object to a local path that mirrors its key, checking content
//! against the service-reported ETag.
//!
//! # Features
//!
//! - **Resumable Runs**: Listing position and current bucket survive restarts
//! - **MD5 Verification**: Objects already on disk with the right checksum are skipped
//! - **Bounded Concurrency**: Transfer parallelism is independent of page size
//! - **Failure Replay**: Failed objects are kept in a ledger and retried in bounded passes
//! - **Path Correction**: Repairs files an older layout wrote flat at the bucket root
//!
//! # Example
//!
//! ```no_run
//! use bucketsync::{BucketEnumerator, HttpStorage, MirrorConfig, ProgressStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MirrorConfig {
//!     destination_root: "/data/mirror".into(),
//!     ..MirrorConfig::default()
//! };
//! let storage = Arc::new(HttpStorage::new("https://storage.example.com")?);
//! let enumerator = BucketEnumerator::new(storage, ProgressStore::new("logs"), config);
//!
//! enumerator.download_bucket("photos").await?;
//! # Ok(())
//! # }
//! ```

pub mod correct;
pub mod download;
pub mod error;
pub mod ledger;
pub mod listing;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod s3;
pub mod storage;
pub mod types;
pub mod verify;

#[cfg(test)]
mod testing;

pub use correct::{correct_object, CorrectionAction, PathCorrector};
pub use download::{download_object, DownloadWorkerPool};
pub use error::MirrorError;
pub use ledger::{replay_failures, FailureLedger, ReplayPolicy};
pub use listing::{ListingCursor, ListingRetry};
pub use orchestrator::BucketEnumerator;
pub use progress::ProgressStore;
pub use s3::HttpStorage;
pub use storage::ObjectStorage;
pub use types::{
    BucketStorageInfo, CorrectionReport, DownloadOutcome, FailureKind, FailureRecord,
    ListingPage, MirrorConfig, ObjectRecord, ProgressMarker, ReplayReport, RunSummary,
    StorageReport, Verification,
};
