//! Repairs objects that older runs wrote flat at the bucket root instead of
//! inside their key's directories.

use crate::error::MirrorError;
use crate::listing::{ListingCursor, ListingRetry};
use crate::paths;
use crate::progress::ProgressStore;
use crate::storage::ObjectStorage;
use crate::types::{CorrectionReport, ObjectRecord};
use crate::verify::is_locally_correct;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// What happened to one listed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionAction {
    /// Key has no directory part, so it cannot be misplaced.
    NotNested,
    /// Directory placeholder.
    DirectoryMarker,
    /// No flat copy on disk, or the flat and nested locations are the same file.
    AlreadyCorrect,
    /// A flat file exists but its content is not this object's.
    FlatCopyUnverified,
    /// Both copies existed; the flat one was deleted.
    RemovedDuplicate,
    /// Only the flat copy existed; it was moved into place.
    Moved,
}

/// A nested object together with its two candidate locations.
#[derive(Debug, Clone)]
struct CorrectionTarget<'r> {
    record: &'r ObjectRecord,
    flat_path: PathBuf,
    nested_path: PathBuf,
}

impl<'r> CorrectionTarget<'r> {
    fn for_record(bucket_root: &Path, record: &'r ObjectRecord) -> Option<Self> {
        let flat_path = paths::flat_path(bucket_root, &record.key)?;
        Some(Self {
            record,
            flat_path,
            nested_path: paths::nested_path(bucket_root, &record.key),
        })
    }
}

async fn exists(path: &Path) -> Result<bool, MirrorError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| MirrorError::filesystem(path, e))
}

/// Moves or deletes the flat copy of one object as needed.
pub async fn correct_object(
    bucket_root: &Path,
    record: &ObjectRecord,
) -> Result<CorrectionAction, MirrorError> {
    if !paths::is_nested(&record.key) {
        return Ok(CorrectionAction::NotNested);
    }
    let Some(target) = CorrectionTarget::for_record(bucket_root, record) else {
        return Ok(CorrectionAction::DirectoryMarker);
    };

    if target.flat_path == target.nested_path || !exists(&target.flat_path).await? {
        return Ok(CorrectionAction::AlreadyCorrect);
    }

    // The flat file may belong to a root-level key with the same basename.
    if !is_locally_correct(&target.flat_path, &target.record.checksum).await {
        debug!(
            key = %target.record.key,
            path = %target.flat_path.display(),
            "Flat file does not match, left in place"
        );
        return Ok(CorrectionAction::FlatCopyUnverified);
    }

    if exists(&target.nested_path).await? {
        tokio::fs::remove_file(&target.flat_path)
            .await
            .map_err(|e| MirrorError::filesystem(&target.flat_path, e))?;
        info!(key = %target.record.key, path = %target.flat_path.display(), "Removed misplaced duplicate");
        return Ok(CorrectionAction::RemovedDuplicate);
    }

    if let Some(parent) = target.nested_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MirrorError::filesystem(parent, e))?;
    }
    tokio::fs::rename(&target.flat_path, &target.nested_path)
        .await
        .map_err(|e| MirrorError::filesystem(&target.flat_path, e))?;
    info!(
        key = %target.record.key,
        from = %target.flat_path.display(),
        to = %target.nested_path.display(),
        "Moved object into its directory"
    );
    Ok(CorrectionAction::Moved)
}

/// Walks a whole bucket listing and repairs misplaced local files.
pub struct PathCorrector<'a> {
    storage: &'a dyn ObjectStorage,
    store: &'a ProgressStore,
    page_size: usize,
    retry: ListingRetry,
}

impl<'a> PathCorrector<'a> {
    pub fn new(
        storage: &'a dyn ObjectStorage,
        store: &'a ProgressStore,
        page_size: usize,
        retry: ListingRetry,
    ) -> Self {
        Self {
            storage,
            store,
            page_size,
            retry,
        }
    }

    /// Runs one correction pass. Per-object failures are recorded in the
    /// bucket's correction-failure file and do not stop the pass.
    pub async fn correct_bucket(
        &self,
        bucket: &str,
        bucket_root: &Path,
    ) -> Result<CorrectionReport, MirrorError> {
        info!(bucket, "Path correction started");
        tokio::fs::create_dir_all(bucket_root)
            .await
            .map_err(|e| MirrorError::filesystem(bucket_root, e))?;

        let failure_path = self.store.correction_failure_path(bucket);
        if let Some(parent) = failure_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MirrorError::filesystem(parent, e))?;
        }
        let mut failure_log = tokio::fs::File::create(&failure_path)
            .await
            .map_err(|e| MirrorError::filesystem(&failure_path, e))?;

        let mut report = CorrectionReport::default();
        let mut cursor =
            ListingCursor::ephemeral(self.storage, bucket, self.page_size, self.retry.clone());

        while let Some(page) = cursor.next_page().await? {
            for record in &page.objects {
                match correct_object(bucket_root, record).await {
                    Ok(CorrectionAction::Moved) => report.moved += 1,
                    Ok(CorrectionAction::RemovedDuplicate) => report.removed_duplicates += 1,
                    Ok(action) => {
                        debug!(bucket, key = %record.key, ?action, "No correction needed");
                        report.untouched += 1;
                    }
                    Err(e) => {
                        warn!(bucket, key = %record.key, "Path correction failed: {}", e);
                        failure_log
                            .write_all(format!("{}\n", record).as_bytes())
                            .await?;
                        report.failures += 1;
                    }
                }
            }
        }
        failure_log.flush().await?;

        info!(
            bucket,
            moved = report.moved,
            removed = report.removed_duplicates,
            untouched = report.untouched,
            failures = report.failures,
            "Path correction finished"
        );
        Ok(report)
    }
}
