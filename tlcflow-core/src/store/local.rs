//! Filesystem-backed object store.
//!
//! Layout: `{root}/{bucket}/{key}` with a `{key}.meta.json` sidecar. Objects
//! are copied to a temporary sibling and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{hash_file, validate_key, ObjectMeta, ObjectStore, StoreError};
use crate::locator::{normalize_bucket_name, validate_bucket_name};

const META_SUFFIX: &str = ".meta.json";

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let bucket = validate_bucket_name(bucket).map_err(|e| StoreError::InvalidKey {
            key: format!("{bucket}/{key}"),
            reason: e.to_string(),
        })?;
        validate_key(key)?;
        if key.ends_with(META_SUFFIX) || key.ends_with(".tmp") {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "reserved suffix".into(),
            });
        }
        Ok(self.root.join(bucket).join(key))
    }

    /// Read the sidecar written alongside an object.
    pub fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = sidecar(&self.object_path(bucket, key)?);
        let text = fs::read_to_string(&path).map_err(|e| not_found_or_io(bucket, key, &path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Response(format!("{}: {e}", path.display())))
    }
}

fn sidecar(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn not_found_or_io(bucket: &str, key: &str, path: &Path, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StoreError::io(path, e)
    }
}

/// Write `bytes` next to `path` and rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_sibling(path);
    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<ObjectMeta, StoreError> {
        let dest = self.object_path(bucket, key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let tmp = tmp_sibling(&dest);
        if let Err(e) = fs::copy(path, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, e));
        }
        let (size, content_hash) = match hash_file(&tmp) {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(StoreError::io(&tmp, e));
            }
        };

        let meta = ObjectMeta {
            bucket: normalize_bucket_name(bucket),
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
            content_hash,
            uploaded_at: Utc::now(),
        };

        fs::rename(&tmp, &dest).map_err(|e| StoreError::io(&dest, e))?;
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StoreError::Response(e.to_string()))?;
        write_atomic(&sidecar(&dest), &json)?;

        tracing::debug!(bucket, key, size, "stored object");
        Ok(meta)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| not_found_or_io(bucket, key, &path, e))
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.object_path(bucket, key)?.is_file())
    }
}
