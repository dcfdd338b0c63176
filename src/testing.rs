//! In-memory `ObjectStorage` for tests.

use crate::error::MirrorError;
use crate::paths;
use crate::storage::ObjectStorage;
use crate::types::{BucketStorageInfo, ListingPage, ObjectRecord};
use crate::verify::etag_for_bytes;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MemoryStorage {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    /// Remaining forced failures per key for `get_object`.
    get_failures: Mutex<HashMap<String, u32>>,
    /// Checksums reported by listings instead of the real content hash.
    reported_checksums: Mutex<HashMap<String, String>>,
    /// Remaining forced failures for `list_objects`.
    list_failures: AtomicUsize,
    /// Markers passed to every `list_objects` call, in order.
    listed_markers: Mutex<Vec<Option<String>>>,
    get_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    get_delay: Mutex<Option<Duration>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, content: &[u8]) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), content.to_vec());
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
    }

    /// Makes the next `times` fetches of `key` fail.
    pub fn fail_gets(&self, key: &str, times: u32) {
        self.get_failures
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
    }

    /// Makes the next `times` listing calls fail.
    pub fn fail_lists(&self, times: usize) {
        self.list_failures.store(times, Ordering::SeqCst);
    }

    /// Listings report `checksum` for `key` regardless of its content.
    pub fn report_checksum(&self, key: &str, checksum: &str) {
        self.reported_checksums
            .lock()
            .unwrap()
            .insert(key.to_string(), checksum.to_string());
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    pub fn record(&self, bucket: &str, key: &str) -> ObjectRecord {
        let buckets = self.buckets.lock().unwrap();
        let content = &buckets[bucket][key];
        ObjectRecord::new(self.checksum_for(key, content), key)
    }

    fn checksum_for(&self, key: &str, content: &[u8]) -> String {
        self.reported_checksums
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| etag_for_bytes(content))
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn listed_markers(&self) -> Vec<Option<String>> {
        self.listed_markers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn list_buckets(&self) -> Result<Vec<String>, MirrorError> {
        Ok(self.buckets.lock().unwrap().keys().cloned().collect())
    }

    async fn bucket_storage_info(&self, bucket: &str) -> Result<BucketStorageInfo, MirrorError> {
        let buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| MirrorError::Storage(format!("no such bucket {}", bucket)))?;
        Ok(BucketStorageInfo {
            object_count: objects.len() as u64,
            total_size_bytes: objects.values().map(|c| c.len() as u64).sum(),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListingPage, MirrorError> {
        self.listed_markers
            .lock()
            .unwrap()
            .push(marker.map(str::to_string));

        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MirrorError::Storage("listing unavailable".to_string()));
        }

        let buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| MirrorError::Storage(format!("no such bucket {}", bucket)))?;

        let mut after = objects
            .iter()
            .filter(|(key, _)| marker.map_or(true, |m| key.as_str() > m));
        let page: Vec<ObjectRecord> = after
            .by_ref()
            .take(page_size)
            .map(|(key, content)| ObjectRecord::new(self.checksum_for(key, content), key.clone()))
            .collect();
        let is_truncated = after.next().is_some();
        let next_marker = if is_truncated {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListingPage {
            objects: page,
            is_truncated,
            next_marker,
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, MirrorError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = (|| {
            {
                let mut failures = self.get_failures.lock().unwrap();
                if let Some(left) = failures.get_mut(key) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(MirrorError::TransferFailed {
                            key: key.to_string(),
                            reason: "connection reset".to_string(),
                        });
                    }
                }
            }

            let content = self
                .buckets
                .lock()
                .unwrap()
                .get(bucket)
                .and_then(|objects| objects.get(key))
                .cloned()
                .ok_or_else(|| MirrorError::Storage(format!("no such key {}", key)))?;
            let name = paths::basename(key).ok_or_else(|| MirrorError::TransferFailed {
                key: key.to_string(),
                reason: "key has no file name".to_string(),
            })?;
            let destination = destination_dir.join(name);
            std::fs::write(&destination, content)?;
            Ok(destination)
        })();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
