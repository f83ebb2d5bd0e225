//! Cloud Storage object store over the JSON API.
//!
//! Uploads are single-request media uploads: the object becomes visible only
//! when the request completes, so a failed upload leaves nothing behind.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};

use super::{hash_file, validate_key, ObjectMeta, ObjectStore, StoreError};
use crate::locator::validate_bucket_name;

pub const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

pub struct GcsObjectStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl GcsObjectStore {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tlcflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Network)?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
        })
    }

    /// Point at an emulator or test server instead of Google.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| StoreError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        self.authorize(req).send().map_err(StoreError::Network)
    }
}

/// Map a non-success response onto the store error taxonomy.
fn status_error(bucket: &str, key: &str, resp: Response) -> StoreError {
    let status = resp.status();
    let detail = resp.text().unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => StoreError::Unauthenticated {
            bucket: bucket.to_string(),
            detail,
        },
        StatusCode::FORBIDDEN => StoreError::PermissionDenied {
            bucket: bucket.to_string(),
            detail,
        },
        StatusCode::TOO_MANY_REQUESTS => StoreError::QuotaExceeded {
            bucket: bucket.to_string(),
            detail,
        },
        StatusCode::NOT_FOUND => StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        other => StoreError::Status {
            status: other.as_u16(),
            detail,
        },
    }
}

fn checked(bucket: &str, key: &str) -> Result<String, StoreError> {
    validate_key(key)?;
    validate_bucket_name(bucket).map_err(|e| StoreError::InvalidKey {
        key: format!("{bucket}/{key}"),
        reason: e.to_string(),
    })
}

impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &str {
        "gcs"
    }

    fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<ObjectMeta, StoreError> {
        let bucket = checked(bucket, key)?;
        let (size, content_hash) = hash_file(path).map_err(|e| StoreError::io(path, e))?;
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;

        let url = self.url(&["upload", "storage", "v1", "b", &bucket, "o"])?;
        let req = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(file);
        let resp = self.send(req)?;
        if !resp.status().is_success() {
            return Err(status_error(&bucket, key, resp));
        }

        tracing::debug!(bucket = %bucket, key, size, "uploaded object");
        Ok(ObjectMeta {
            bucket,
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
            content_hash,
            uploaded_at: Utc::now(),
        })
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let bucket = checked(bucket, key)?;
        let url = self.url(&["storage", "v1", "b", &bucket, "o", key])?;
        let resp = self.send(self.client.get(url).query(&[("alt", "media")]))?;
        if !resp.status().is_success() {
            return Err(status_error(&bucket, key, resp));
        }
        let bytes = resp.bytes().map_err(StoreError::Network)?;
        Ok(bytes.to_vec())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        let bucket = checked(bucket, key)?;
        let url = self.url(&["storage", "v1", "b", &bucket, "o", key])?;
        let resp = self.send(self.client.get(url))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(&bucket, key, resp)),
        }
    }
}
