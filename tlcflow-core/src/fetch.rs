//! Source fetcher.
//!
//! The [`SourceFetcher`] trait abstracts the remote read so the transfer step
//! can be exercised without a network. [`HttpFetcher`] is the production
//! implementation: one blocking GET, body streamed straight into the sink.

use std::io::{self, Write};
use std::time::Duration;

use thiserror::Error;

/// Remote fetch failures. All are retried at task granularity.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source not found: {url}")]
    NotFound { url: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("network failure fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to stream body of {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Reads one remote artifact into a sink.
pub trait SourceFetcher: Send + Sync {
    /// Human-readable name of this fetcher.
    fn name(&self) -> &str;

    /// Fetch `url` into `sink`, returning the number of bytes written.
    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tlcflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

impl SourceFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let written = io::copy(&mut resp, sink).map_err(|source| FetchError::Io {
            url: url.to_string(),
            source,
        })?;
        tracing::debug!(url, bytes = written, "fetched source");
        Ok(written)
    }
}
