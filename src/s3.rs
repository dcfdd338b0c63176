//! `ObjectStorage` over the plain S3 REST API (ListBuckets, ListObjects v1, GetObject).
//!
//! Requests are unsigned, so this works against public-read buckets and
//! S3-compatible gateways that allow anonymous access. Signed access belongs
//! in a different `ObjectStorage` implementation.

use crate::error::MirrorError;
use crate::paths;
use crate::storage::ObjectStorage;
use crate::types::{BucketStorageInfo, ListingPage, ObjectRecord};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// Page size used when walking a bucket to total its size.
const INFO_PAGE_SIZE: usize = 1000;

/// Distinguishes temp files of concurrent fetches within this process.
static PART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden, per-fetch unique temp path next to the final file, so it can't
/// clobber a sibling object such as `<name>.part`.
fn part_path(destination_dir: &Path, name: &str) -> PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    destination_dir.join(format!(".{}.{}-{}.bucketsync-part", name, std::process::id(), seq))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ListAllMyBucketsResult {
    #[serde(default)]
    buckets: BucketList,
}

#[derive(Deserialize, Debug, Default)]
struct BucketList {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<BucketEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct BucketEntry {
    name: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_marker: Option<String>,
    #[serde(default)]
    contents: Vec<Contents>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct Contents {
    key: String,
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    size: u64,
}

fn parse_bucket_names(xml: &str) -> Result<Vec<String>, MirrorError> {
    let result: ListAllMyBucketsResult = quick_xml::de::from_str(xml)?;
    Ok(result.buckets.bucket.into_iter().map(|b| b.name).collect())
}

/// Parses a ListObjects response, keeping per-object sizes for storage info.
fn parse_listing(xml: &str) -> Result<(ListingPage, u64), MirrorError> {
    let result: ListBucketResult = quick_xml::de::from_str(xml)?;
    let total_size = result.contents.iter().map(|c| c.size).sum();

    let objects: Vec<ObjectRecord> = result
        .contents
        .into_iter()
        .map(|c| ObjectRecord::new(c.etag, c.key))
        .collect();

    // V1 listings only carry NextMarker when a delimiter is set; otherwise the
    // last key of the page is the marker for the next one.
    let next_marker = result
        .next_marker
        .filter(|m| !m.is_empty())
        .or_else(|| {
            if result.is_truncated {
                objects.last().map(|o| o.key.clone())
            } else {
                None
            }
        });

    Ok((
        ListingPage {
            objects,
            is_truncated: result.is_truncated,
            next_marker,
        },
        total_size,
    ))
}

/// Percent-encodes each key segment, keeping `/` as the separator.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Anonymous S3-compatible storage reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpStorage {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, MirrorError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(MirrorError::InvalidConfig(
                "storage endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder().build()?;
        Ok(Self { endpoint, client })
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, MirrorError> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Storage(format!(
                "GET {} returned HTTP {}",
                url, status
            )));
        }
        Ok(response.text().await?)
    }

    async fn list_page(
        &self,
        bucket: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<(ListingPage, u64), MirrorError> {
        let url = format!("{}/{}", self.endpoint, bucket);
        let mut query = vec![("max-keys", page_size.to_string())];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        let body = self.get_text(&url, &query).await?;
        parse_listing(&body)
    }
}

#[async_trait]
impl ObjectStorage for HttpStorage {
    async fn list_buckets(&self) -> Result<Vec<String>, MirrorError> {
        let url = format!("{}/", self.endpoint);
        let body = self.get_text(&url, &[]).await?;
        parse_bucket_names(&body)
    }

    async fn bucket_storage_info(&self, bucket: &str) -> Result<BucketStorageInfo, MirrorError> {
        let mut info = BucketStorageInfo::default();
        let mut marker: Option<String> = None;

        loop {
            let (page, size) = self
                .list_page(bucket, marker.as_deref(), INFO_PAGE_SIZE)
                .await?;
            info.object_count += page.objects.len() as u64;
            info.total_size_bytes += size;

            if !page.is_truncated || page.next_marker.is_none() {
                break;
            }
            marker = page.next_marker;
        }

        Ok(info)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListingPage, MirrorError> {
        let (page, _) = self.list_page(bucket, marker, page_size).await?;
        debug!(
            bucket,
            objects = page.objects.len(),
            truncated = page.is_truncated,
            "Listed page"
        );
        Ok(page)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        destination_dir: &Path,
    ) -> Result<PathBuf, MirrorError> {
        let name = paths::basename(key).ok_or_else(|| MirrorError::TransferFailed {
            key: key.to_string(),
            reason: "key has no file name".to_string(),
        })?;
        let destination = destination_dir.join(name);
        let part_path = part_path(destination_dir, name);

        let url = format!("{}/{}/{}", self.endpoint, bucket, encode_key(key));
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::TransferFailed {
                key: key.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let mut file = BufWriter::new(tokio::fs::File::create(&part_path).await?);
        let mut byte_stream = response.bytes_stream();
        let mut bytes_written = 0u64;

        while let Some(piece) = byte_stream.next().await {
            let chunk = match piece {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    if let Err(cleanup) = tokio::fs::remove_file(&part_path).await {
                        debug!(key, path = %part_path.display(), "Could not remove partial file: {}", cleanup);
                    }
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part_path, &destination).await?;
        info!(bucket, key, bytes = bytes_written, "Fetched object");
        Ok(destination)
    }
}
