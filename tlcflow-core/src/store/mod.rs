//! Destination object stores.
//!
//! The [`ObjectStore`] trait abstracts over where uploaded objects land, so the
//! transfer step and the local warehouse never know which backend they use.
//! Both implementations give all-or-nothing visibility: readers either see the
//! complete object or none of it.

pub mod gcs;
pub mod local;

pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Object store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not authenticated to bucket '{bucket}': {detail}")]
    Unauthenticated { bucket: String, detail: String },

    #[error("permission denied on bucket '{bucket}': {detail}")]
    PermissionDenied { bucket: String, detail: String },

    #[error("quota exceeded on bucket '{bucket}': {detail}")]
    QuotaExceeded { bucket: String, detail: String },

    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("HTTP {status} from object store: {detail}")]
    Status { status: u16, detail: String },

    #[error("network failure talking to object store: {0}")]
    Network(#[source] reqwest::Error),

    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid object store URL '{0}'")]
    InvalidUrl(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unexpected object store response: {0}")]
    Response(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Description of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub content_type: String,
    /// BLAKE3 hex digest of the object bytes.
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Trait for object stores (Cloud Storage, local filesystem).
pub trait ObjectStore: Send + Sync {
    /// Human-readable name of this store.
    fn name(&self) -> &str;

    /// Upload a local file under `key`, replacing nothing until the upload is complete.
    fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<ObjectMeta, StoreError>;

    /// Read a whole object.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;
}

/// Reject keys that are empty, absolute, or walk out of the bucket.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') {
        return Err(invalid("leading '/'"));
    }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(invalid("empty, '.' or '..' path segment"));
    }
    Ok(())
}

/// Size and BLAKE3 digest of a local file.
pub fn hash_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, hasher.finalize().to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("green/green_tripdata_2021-01.csv").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/").is_err());
    }

    #[test]
    fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"abc").unwrap();
        let (size, hash) = hash_file(&p).unwrap();
        assert_eq!(size, 3);
        assert_eq!(hash, blake3::hash(b"abc").to_hex().to_string());
    }
}
