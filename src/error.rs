//! Error types for mirror operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while mirroring buckets.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error while talking to the storage service.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error in persisted state.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Malformed XML in a listing response.
    #[error(transparent)]
    XmlError(#[from] quick_xml::DeError),

    /// The paginated listing call kept failing after all retries.
    #[error("Listing bucket '{bucket}' failed: {reason}")]
    ListingFailed { bucket: String, reason: String },

    /// The get-object call failed.
    #[error("Transfer of '{key}' failed: {reason}")]
    TransferFailed { key: String, reason: String },

    /// Downloaded content does not hash to the service-reported checksum.
    #[error("Checksum mismatch for '{key}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// Directory creation or file move/delete failure.
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The storage service answered with an unexpected status.
    #[error("Storage service error: {0}")]
    Storage(String),

    /// A state file was written by an incompatible version of this tool.
    #[error("Unsupported state version {version} in {}", path.display())]
    UnsupportedStateVersion { path: PathBuf, version: u32 },

    /// Bad arguments or configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MirrorError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MirrorError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
