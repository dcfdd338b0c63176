//! Durable resume state: a listing marker per bucket plus the current-bucket pointer.

use crate::error::MirrorError;
use crate::types::ProgressMarker;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const STATE_VERSION: u32 = 1;
const CURRENT_BUCKET_FILE: &str = "current_bucket.json";
const PROGRESS_FILE: &str = "progress.json";
const FAILURE_LEDGER_FILE: &str = "download_failure.txt";
const CORRECTION_FAILURE_FILE: &str = "correction_failure.log";

#[derive(Serialize, Deserialize, Debug)]
struct Envelope<T> {
    version: u32,
    record: T,
}

#[derive(Serialize, Deserialize, Debug)]
struct CurrentBucket {
    bucket: String,
}

/// Writes `contents` next to `path` and renames it into place, so readers
/// only ever see the old or the new file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), MirrorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MirrorError::filesystem(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| MirrorError::filesystem(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| MirrorError::filesystem(path, e))?;
    Ok(())
}

/// Per-bucket and global resume state under one state directory.
///
/// One bucket is processed at a time, so every file here has a single writer.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    root: PathBuf,
}

impl ProgressStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State directory of one bucket.
    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    pub fn failure_ledger_path(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join(FAILURE_LEDGER_FILE)
    }

    pub fn correction_failure_path(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join(CORRECTION_FAILURE_FILE)
    }

    fn marker_path(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket).join(PROGRESS_FILE)
    }

    fn current_bucket_path(&self) -> PathBuf {
        self.root.join(CURRENT_BUCKET_FILE)
    }

    async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MirrorError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MirrorError::filesystem(path, e)),
        };
        let envelope: Envelope<T> = serde_json::from_slice(&content)?;
        if envelope.version != STATE_VERSION {
            return Err(MirrorError::UnsupportedStateVersion {
                path: path.to_path_buf(),
                version: envelope.version,
            });
        }
        Ok(Some(envelope.record))
    }

    async fn save<T: Serialize>(path: &Path, record: &T) -> Result<(), MirrorError> {
        let envelope = Envelope {
            version: STATE_VERSION,
            record,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(path, &json).await
    }

    async fn remove(path: &Path) -> Result<(), MirrorError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::filesystem(path, e)),
        }
    }

    pub async fn load_bucket_marker(
        &self,
        bucket: &str,
    ) -> Result<Option<ProgressMarker>, MirrorError> {
        Self::load(&self.marker_path(bucket)).await
    }

    pub async fn save_bucket_marker(&self, marker: &ProgressMarker) -> Result<(), MirrorError> {
        debug!(
            bucket = %marker.bucket,
            page_marker = ?marker.page_marker,
            next_marker = ?marker.next_marker,
            truncated = marker.is_truncated,
            complete = marker.page_complete,
            "Saving progress marker"
        );
        Self::save(&self.marker_path(&marker.bucket), marker).await
    }

    /// Forgets a bucket's listing position so the next run starts from the top.
    pub async fn clear_bucket(&self, bucket: &str) -> Result<(), MirrorError> {
        Self::remove(&self.marker_path(bucket)).await
    }

    pub async fn load_current_bucket(&self) -> Result<Option<String>, MirrorError> {
        let current: Option<CurrentBucket> = Self::load(&self.current_bucket_path()).await?;
        Ok(current.map(|c| c.bucket))
    }

    pub async fn save_current_bucket(&self, bucket: &str) -> Result<(), MirrorError> {
        let current = CurrentBucket {
            bucket: bucket.to_string(),
        };
        Self::save(&self.current_bucket_path(), &current).await
    }

    pub async fn clear_current_bucket(&self) -> Result<(), MirrorError> {
        Self::remove(&self.current_bucket_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(bucket: &str) -> ProgressMarker {
        ProgressMarker {
            bucket: bucket.to_string(),
            page_marker: Some("a/0499".to_string()),
            next_marker: Some("a/0999".to_string()),
            is_truncated: true,
            page_complete: false,
        }
    }

    #[tokio::test]
    async fn test_bucket_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());

        assert_eq!(store.load_bucket_marker("photos").await.unwrap(), None);

        store.save_bucket_marker(&marker("photos")).await.unwrap();
        assert_eq!(
            store.load_bucket_marker("photos").await.unwrap(),
            Some(marker("photos"))
        );
        assert_eq!(store.load_bucket_marker("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        store.save_bucket_marker(&marker("photos")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.bucket_dir("photos"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PROGRESS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_current_bucket_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());

        assert_eq!(store.load_current_bucket().await.unwrap(), None);
        store.save_current_bucket("photos").await.unwrap();
        store.save_current_bucket("logs").await.unwrap();
        assert_eq!(
            store.load_current_bucket().await.unwrap().as_deref(),
            Some("logs")
        );

        store.clear_current_bucket().await.unwrap();
        store.clear_current_bucket().await.unwrap();
        assert_eq!(store.load_current_bucket().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        std::fs::write(
            dir.path().join(CURRENT_BUCKET_FILE),
            r#"{"version": 7, "record": {"bucket": "photos"}}"#,
        )
        .unwrap();

        let err = store.load_current_bucket().await.unwrap_err();
        assert!(matches!(
            err,
            MirrorError::UnsupportedStateVersion { version: 7, .. }
        ));
    }

    #[tokio::test]
    async fn test_clear_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        store.save_bucket_marker(&marker("photos")).await.unwrap();
        store.clear_bucket("photos").await.unwrap();
        assert_eq!(store.load_bucket_marker("photos").await.unwrap(), None);
    }
}
