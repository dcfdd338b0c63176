//! The object-storage collaborator interface.

use crate::error::MirrorError;
use crate::types::{BucketStorageInfo, ListingPage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Authenticated listing and retrieval against a storage service.
///
/// The engine only ever talks to storage through this trait, so a different
/// client (signed S3, vendor SDK, test double) can be swapped in.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Names of every bucket visible to the client.
    async fn list_buckets(&self) -> Result<Vec<String>, MirrorError>;

    /// Object count and total size of one bucket.
    async fn bucket_storage_info(&self, bucket: &str) -> Result<BucketStorageInfo, MirrorError>;

    /// One page of objects, starting after `marker`.
    async fn list_objects(
        &self,
        bucket: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListingPage, MirrorError>;

    /// Writes the object into `destination_dir`, named by the key's basename.
    ///
    /// Returns the path of the written file.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, MirrorError>;
}
