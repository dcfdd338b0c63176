//! Local checksum verification (MD5 ETags).

use crate::error::MirrorError;
use md5::{Digest, Md5};
use std::path::Path;
use tracing::{debug, warn};

/// Renders an MD5 digest the way the storage service writes ETags: quoted lowercase hex.
fn format_etag(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2 + 2);
    hex.push('"');
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.push('"');
    hex
}

/// ETag of an in-memory buffer.
pub fn etag_for_bytes(data: &[u8]) -> String {
    format_etag(&Md5::digest(data))
}

/// Computes the ETag of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
pub async fn compute_file_etag(path: &Path) -> Result<String, MirrorError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok::<String, MirrorError>(format_etag(&hasher.finalize()))
    })
    .await
    .map_err(|e| MirrorError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Compares two ETags ignoring surrounding quotes.
pub fn etags_match(local: &str, expected: &str) -> bool {
    local.trim_matches('"') == expected.trim_matches('"')
}

/// Multipart uploads get `<hex>-<parts>` ETags, which are not a content MD5.
pub fn is_multipart_etag(etag: &str) -> bool {
    etag.trim_matches('"').contains('-')
}

/// Whether the file at `path` exists and hashes to `expected`.
///
/// A missing or unreadable file is simply "not correct".
pub async fn is_locally_correct(path: &Path, expected: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => {}
        _ => return false,
    }

    match compute_file_etag(path).await {
        Ok(local) => {
            let matched = etags_match(&local, expected);
            if !matched {
                debug!(path = %path.display(), local = %local, expected = %expected, "Checksum differs");
            }
            matched
        }
        Err(e) => {
            warn!(path = %path.display(), "Failed to compute checksum: {}", e);
            false
        }
    }
}
