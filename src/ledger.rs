//! Durable record of objects that still need a verified download.
//!
//! One `checksum:key` line per record. Checksums never contain `:`, so the
//! first colon splits the line and keys are free to contain colons.

use crate::download::DownloadWorkerPool;
use crate::error::MirrorError;
use crate::progress::write_atomic;
use crate::types::{DownloadOutcome, FailureRecord, ReplayReport, Verification};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

fn parse_line(line: &str) -> Option<FailureRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    match line.split_once(':') {
        Some((checksum, key)) if !key.is_empty() => Some(FailureRecord::new(checksum, key)),
        _ => {
            warn!(line, "Skipping malformed failure ledger line");
            None
        }
    }
}

/// Append-only failure log for one bucket.
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Concurrent callers are serialized.
    pub async fn append(&self, record: &FailureRecord) -> Result<(), MirrorError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MirrorError::filesystem(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| MirrorError::filesystem(&self.path, e))?;
        file.write_all(format!("{}\n", record).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<FailureRecord>, MirrorError> {
        let _guard = self.lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MirrorError::filesystem(&self.path, e)),
        };
        Ok(content.lines().filter_map(parse_line).collect())
    }

    /// Atomically rewrites the ledger with exactly `records`.
    pub async fn replace_all(&self, records: &[FailureRecord]) -> Result<(), MirrorError> {
        let _guard = self.lock.lock().await;
        if records.is_empty() {
            return Self::remove(&self.path).await;
        }
        let mut content = String::new();
        for record in records {
            content.push_str(&record.to_string());
            content.push('\n');
        }
        write_atomic(&self.path, content.as_bytes()).await
    }

    pub async fn clear(&self) -> Result<(), MirrorError> {
        let _guard = self.lock.lock().await;
        Self::remove(&self.path).await
    }

    async fn remove(path: &Path) -> Result<(), MirrorError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::filesystem(path, e)),
        }
    }
}

/// How hard the replay loop tries before leaving records for a later run.
#[derive(Debug, Clone)]
pub struct ReplayPolicy {
    pub max_passes: u32,
    pub cooldown: Duration,
    /// Fall back to a key-only fetch when the verified one fails.
    pub accept_unverified: bool,
}

/// Retries one record: verified first, then key-only if the policy allows it.
async fn retry_record(
    pool: &DownloadWorkerPool,
    bucket: &str,
    record: &FailureRecord,
    bucket_root: &Path,
    policy: &ReplayPolicy,
) -> bool {
    let outcome = pool
        .fetch_object(bucket, record, bucket_root, Verification::Checksum)
        .await;
    if !outcome.is_failed() {
        return true;
    }
    if !policy.accept_unverified {
        return false;
    }
    let fallback = pool
        .fetch_object(bucket, record, bucket_root, Verification::KeyOnly)
        .await;
    fallback == DownloadOutcome::Success
}

/// One record per key, in first-seen order, carrying the last checksum seen
/// for that key.
fn latest_per_key(records: Vec<FailureRecord>) -> Vec<FailureRecord> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<FailureRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.key) {
            Some(&i) => latest[i] = record,
            None => {
                index.insert(record.key.clone(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

/// Replays the ledger until it is empty or `max_passes` passes have run.
///
/// `remaining` always reflects what is left in the ledger, even when no
/// pass runs.
pub async fn replay_failures(
    pool: &DownloadWorkerPool,
    ledger: &FailureLedger,
    bucket: &str,
    bucket_root: &Path,
    policy: &ReplayPolicy,
) -> Result<ReplayReport, MirrorError> {
    let mut report = ReplayReport::default();
    let mut records = latest_per_key(ledger.load_all().await?);
    report.remaining = records.len() as u64;

    while report.passes < policy.max_passes && !records.is_empty() {
        report.passes += 1;
        let mut remaining = Vec::new();
        info!(bucket, pass = report.passes, records = records.len(), "Replaying failed downloads");

        for record in records {
            if retry_record(pool, bucket, &record, bucket_root, policy).await {
                report.recovered += 1;
            } else {
                warn!(bucket, key = %record.key, "Still failing after replay");
                remaining.push(record);
            }
        }

        ledger.replace_all(&remaining).await?;
        report.remaining = remaining.len() as u64;
        records = remaining;

        if !records.is_empty() && report.passes < policy.max_passes {
            info!(
                bucket,
                remaining = records.len(),
                cooldown = %humantime::format_duration(policy.cooldown),
                "Cooling down before next replay pass"
            );
            tokio::time::sleep(policy.cooldown).await;
        }
    }

    if report.remaining > 0 {
        warn!(bucket, remaining = report.remaining, "Failures left in ledger for a later run");
    }
    Ok(report)
}
