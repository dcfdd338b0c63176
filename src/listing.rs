//! Resumable, page-at-a-time bucket listing.

use crate::error::MirrorError;
use crate::progress::ProgressStore;
use crate::storage::ObjectStorage;
use crate::types::{ListingPage, MirrorConfig, ProgressMarker};
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{info, warn};

/// Backoff applied to failing listing calls.
#[derive(Debug, Clone)]
pub struct ListingRetry {
    /// Retries after the first failed call.
    pub retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ListingRetry {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            retries: config.listing_retries,
            base_delay: config.listing_retry_base,
            max_delay: config.listing_retry_max,
        }
    }

    /// `base, 2*base, 4*base, ...` capped at `max_delay`, with full jitter.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() / 2) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.retries)
    }
}

/// Walks one bucket's listing a page at a time.
///
/// In durable mode every page's position is saved to the [`ProgressStore`]
/// before the page is handed out, and again once the caller reports the page
/// done via [`complete_page`](Self::complete_page). A crash in between makes
/// the next run re-list that same page.
pub struct ListingCursor<'a> {
    storage: &'a dyn ObjectStorage,
    store: Option<&'a ProgressStore>,
    bucket: String,
    page_size: usize,
    retry: ListingRetry,
    position: Option<String>,
    in_flight: Option<ProgressMarker>,
    exhausted: bool,
}

impl<'a> ListingCursor<'a> {
    fn new(
        storage: &'a dyn ObjectStorage,
        store: Option<&'a ProgressStore>,
        bucket: &str,
        page_size: usize,
        retry: ListingRetry,
    ) -> Self {
        Self {
            storage,
            store,
            bucket: bucket.to_string(),
            page_size: page_size.max(1),
            retry,
            position: None,
            in_flight: None,
            exhausted: false,
        }
    }

    /// Durable cursor positioned wherever the last run for `bucket` stopped.
    pub async fn resume(
        storage: &'a dyn ObjectStorage,
        store: &'a ProgressStore,
        bucket: &str,
        page_size: usize,
        retry: ListingRetry,
    ) -> Result<Self, MirrorError> {
        let mut cursor = Self::new(storage, Some(store), bucket, page_size, retry);

        match store.load_bucket_marker(bucket).await? {
            Some(marker) if marker.page_complete => {
                info!(bucket, next_marker = ?marker.next_marker, "Resuming after last completed page");
                cursor.advance(&marker);
            }
            Some(marker) => {
                info!(bucket, page_marker = ?marker.page_marker, "Re-listing interrupted page");
                cursor.position = marker.page_marker;
            }
            None => {}
        }

        Ok(cursor)
    }

    /// Cursor that keeps its position in memory only.
    pub fn ephemeral(
        storage: &'a dyn ObjectStorage,
        bucket: &str,
        page_size: usize,
        retry: ListingRetry,
    ) -> Self {
        Self::new(storage, None, bucket, page_size, retry)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.in_flight.is_none()
    }

    fn advance(&mut self, marker: &ProgressMarker) {
        if !marker.is_truncated {
            self.exhausted = true;
            return;
        }
        match &marker.next_marker {
            Some(next) if Some(next) != marker.page_marker.as_ref() => {
                self.position = Some(next.clone());
            }
            _ => {
                warn!(
                    bucket = %self.bucket,
                    "Listing is truncated but gives no way forward; stopping"
                );
                self.exhausted = true;
            }
        }
    }

    async fn list_with_backoff(&self) -> Result<ListingPage, MirrorError> {
        let storage = self.storage;
        let bucket = self.bucket.as_str();
        let page_size = self.page_size;
        let marker = self.position.clone();

        Retry::spawn(self.retry.strategy(), || {
            let marker = marker.clone();
            async move {
                match storage.list_objects(bucket, marker.as_deref(), page_size).await {
                    Ok(page) => Ok(page),
                    Err(e) => {
                        warn!(bucket, marker = ?marker, "Listing failed: {}", e);
                        RetryError::to_transient(e)
                    }
                }
            }
        })
        .await
        .map_err(|e| MirrorError::ListingFailed {
            bucket: bucket.to_string(),
            reason: e.to_string(),
        })
    }

    /// Fetches the next page, or `None` once the bucket is exhausted.
    ///
    /// A page still in flight is completed first.
    pub async fn next_page(&mut self) -> Result<Option<ListingPage>, MirrorError> {
        self.complete_page().await?;
        if self.exhausted {
            return Ok(None);
        }

        let page = self.list_with_backoff().await?;
        let marker = ProgressMarker {
            bucket: self.bucket.clone(),
            page_marker: self.position.clone(),
            next_marker: page.next_marker.clone(),
            is_truncated: page.is_truncated,
            page_complete: false,
        };
        if let Some(store) = self.store {
            store.save_bucket_marker(&marker).await?;
        }
        self.in_flight = Some(marker);

        Ok(Some(page))
    }

    /// Records that every object of the current page has been processed.
    pub async fn complete_page(&mut self) -> Result<(), MirrorError> {
        let Some(mut marker) = self.in_flight.take() else {
            return Ok(());
        };
        marker.page_complete = true;
        if let Some(store) = self.store {
            store.save_bucket_marker(&marker).await?;
        }
        self.advance(&marker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;

    fn no_wait(retries: usize) -> ListingRetry {
        ListingRetry {
            retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn storage_with(count: usize) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for i in 0..count {
            storage.put("photos", &format!("img/{:04}.jpg", i), b"x");
        }
        storage
    }

    #[tokio::test]
    async fn test_marker_saved_before_page_returned() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let storage = storage_with(5);

        let mut cursor = ListingCursor::resume(&storage, &store, "photos", 2, no_wait(0))
            .await
            .unwrap();
        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.objects.len(), 2);

        let saved = store.load_bucket_marker("photos").await.unwrap().unwrap();
        assert_eq!(saved.page_marker, None);
        assert_eq!(saved.next_marker.as_deref(), Some("img/0001.jpg"));
        assert!(saved.is_truncated);
        assert!(!saved.page_complete);

        cursor.complete_page().await.unwrap();
        let saved = store.load_bucket_marker("photos").await.unwrap().unwrap();
        assert!(saved.page_complete);
    }

    #[tokio::test]
    async fn test_walks_all_pages_then_exhausts() {
        let storage = storage_with(5);
        let mut cursor = ListingCursor::ephemeral(&storage, "photos", 2, no_wait(0));

        let mut sizes = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            sizes.push(page.objects.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.next_page().await.unwrap().map(|p| p.objects.len()), None);
    }

    #[tokio::test]
    async fn test_interrupted_page_is_relisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let storage = storage_with(5);

        {
            let mut cursor = ListingCursor::resume(&storage, &store, "photos", 2, no_wait(0))
                .await
                .unwrap();
            cursor.next_page().await.unwrap();
            cursor.complete_page().await.unwrap();
            // Second page handed out, process dies before completing it.
            cursor.next_page().await.unwrap();
        }

        let mut cursor = ListingCursor::resume(&storage, &store, "photos", 2, no_wait(0))
            .await
            .unwrap();
        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.objects[0].key, "img/0002.jpg");
    }

    #[tokio::test]
    async fn test_completed_bucket_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let storage = storage_with(3);

        let mut cursor = ListingCursor::resume(&storage, &store, "photos", 10, no_wait(0))
            .await
            .unwrap();
        while cursor.next_page().await.unwrap().is_some() {}
        let calls = storage.listed_markers().len();

        let mut cursor = ListingCursor::resume(&storage, &store, "photos", 10, no_wait(0))
            .await
            .unwrap();
        assert!(cursor.next_page().await.unwrap().is_none());
        assert_eq!(storage.listed_markers().len(), calls);
    }

    #[tokio::test]
    async fn test_listing_retries_then_succeeds() {
        let storage = storage_with(1);
        storage.fail_lists(2);
        let mut cursor = ListingCursor::ephemeral(&storage, "photos", 10, no_wait(3));

        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(storage.listed_markers().len(), 3);
    }

    #[tokio::test]
    async fn test_listing_failed_leaves_marker_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let storage = storage_with(5);

        let mut cursor = ListingCursor::resume(&storage, &store, "photos", 2, no_wait(1))
            .await
            .unwrap();
        cursor.next_page().await.unwrap();
        cursor.complete_page().await.unwrap();
        let before = store.load_bucket_marker("photos").await.unwrap();

        storage.fail_lists(5);
        let err = cursor.next_page().await.unwrap_err();
        assert!(matches!(err, MirrorError::ListingFailed { .. }));
        assert_eq!(store.load_bucket_marker("photos").await.unwrap(), before);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = ListingRetry {
            retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        let delays: Vec<Duration> = retry.strategy().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(250)));
    }
}
