//! # Page Driver Contracts
//!
//! The engine only talks to the remote lookup page through these traits; the
//! concrete automation technology (plain HTTP, a headless browser, a test
//! script) lives behind [`PageDriver`] and [`DriverFactory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 페이지 드라이버 에러 타입
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum DriverError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Blocked by remote service: {0}")]
    Blocked(String),

    #[error("Page structure error: {0}")]
    Structure(String),

    #[error("HTTP error {0}: {1}")]
    Http(u16, String),

    #[error("Driver initialization error: {0}")]
    Initialization(String),

    #[error("Unexpected driver error: {0}")]
    Unexpected(String),
}

/// One sample of the observable markers on the current page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSample {
    /// Explicit success marker (artifact reference) if present
    pub success_marker: Option<String>,
    /// Explicit failure / empty-result panel text if present
    pub failure_marker: Option<String>,
    /// Text of the primary content region
    pub primary_text: String,
}

impl MarkerSample {
    #[must_use]
    pub fn text(primary_text: impl Into<String>) -> Self {
        Self {
            primary_text: primary_text.into(),
            ..Self::default()
        }
    }
}

/// Stateful handle to one interactive session with the lookup page
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to the lookup page
    async fn open(&mut self, target_url: &str) -> Result<(), DriverError>;

    /// Whether the key input field is present on the current page
    async fn locate_input_field(&mut self) -> Result<bool, DriverError>;

    /// Type the key and submit the form
    async fn fill_and_submit(&mut self, value: &str) -> Result<(), DriverError>;

    /// Sample the success/failure markers and primary text
    async fn sample_markers(&mut self) -> Result<MarkerSample, DriverError>;

    /// Download an artifact reference with this session's cookies and headers
    async fn fetch_artifact(&mut self, reference: &str) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Unexpected(format!("Artifact download not supported for {reference}")))
    }

    /// Source of the page currently shown, for debug snapshots
    fn page_source(&self) -> Option<String> {
        None
    }

    /// Tear the session down; default is a no-op
    async fn close(&mut self) {}
}

/// Creates fresh page drivers for execution contexts
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, worker_id: usize) -> Result<Box<dyn PageDriver>, DriverError>;
}

/// Basic connectivity check run before each attempt
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe that never reports an outage
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// HEAD request against a known URL; any HTTP response counts as online
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::Initialization(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_online(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Connectivity probe to {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Build the probe the configuration asks for
pub fn connectivity_probe_for(url: &str, timeout: Duration) -> Result<Arc<dyn ConnectivityProbe>, DriverError> {
    if url.trim().is_empty() {
        Ok(Arc::new(AlwaysOnline))
    } else {
        Ok(Arc::new(HttpConnectivityProbe::new(url, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_probe_url_means_always_online() {
        let probe = connectivity_probe_for("  ", Duration::from_secs(1)).unwrap();
        assert!(probe.is_online().await);
    }

    #[test]
    fn driver_error_display() {
        let err = DriverError::Http(429, "Too Many Requests".into());
        assert_eq!(err.to_string(), "HTTP error 429: Too Many Requests");
    }
}
