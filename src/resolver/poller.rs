//! # Terminal-State Poller
//!
//! Drives one submitted key to a terminal [`Outcome`] by sampling the page
//! markers at a fixed interval until a deadline:
//!
//! ```text
//! Submitted ──sample──▶ success marker      ──▶ Success
//!     │                 failure marker      ──▶ NoData
//!     │                 content changed     ──▶ Success (cleaned text)
//!     └──deadline──────────────────────────────▶ Timeout
//! ```
//!
//! Classification of a single sample is delegated to a
//! [`TerminalMarkerDetector`] so the keyword heuristics can be swapped per
//! deployment without touching the state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::{Outcome, Payload};
use crate::infrastructure::config::MarkerConfig;
use crate::infrastructure::http_driver::collapse_whitespace;
use crate::infrastructure::page_driver::{DriverError, MarkerSample, PageDriver};

/// Verdict on a single marker sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Success(Payload),
    NoData(String),
    Blocked(String),
    Pending,
}

/// Pluggable terminal-page classification strategy
pub trait TerminalMarkerDetector: Send + Sync {
    /// Classify one sample; markers are checked in priority order
    fn classify(&self, sample: &MarkerSample) -> Detection;

    /// Short diagnostic string from page text
    fn clean_message(&self, text: &str) -> String {
        collapse_whitespace(text)
    }
}

/// Keyword heuristics from [`MarkerConfig`]
#[derive(Debug, Clone)]
pub struct KeywordMarkerDetector {
    markers: MarkerConfig,
}

impl KeywordMarkerDetector {
    #[must_use]
    pub const fn new(markers: MarkerConfig) -> Self {
        Self { markers }
    }

    fn find_any<'a>(haystack: &str, needles: &'a [String]) -> Option<&'a str> {
        needles
            .iter()
            .map(String::as_str)
            .find(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
    }
}

impl Default for KeywordMarkerDetector {
    fn default() -> Self {
        Self::new(MarkerConfig::default())
    }
}

impl TerminalMarkerDetector for KeywordMarkerDetector {
    fn classify(&self, sample: &MarkerSample) -> Detection {
        if let Some(marker) = sample.success_marker.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            return Detection::Success(Payload::with_artifact(marker));
        }
        if let Some(panel) = sample.failure_marker.as_deref().filter(|m| !m.trim().is_empty()) {
            return Detection::NoData(self.clean_message(panel));
        }

        let lowered = sample.primary_text.to_lowercase();
        if let Some(signature) = Self::find_any(&lowered, &self.markers.block_signatures) {
            return Detection::Blocked(format!("Block signature detected: {signature}"));
        }
        if Self::find_any(&lowered, &self.markers.no_data_snippets).is_some() {
            return Detection::NoData(self.clean_message(&sample.primary_text));
        }
        Detection::Pending
    }

    /// Collapse whitespace, start at the first start keyword, cut at the first noise keyword
    fn clean_message(&self, text: &str) -> String {
        let collapsed = collapse_whitespace(text);
        if collapsed.is_empty() {
            return collapsed;
        }

        // ASCII lowercasing keeps byte offsets aligned with `collapsed`
        let lowered = collapsed.to_ascii_lowercase();
        let start = self
            .markers
            .start_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .find_map(|k| lowered.find(&k.to_ascii_lowercase()))
            .unwrap_or(0);

        let tail = &collapsed[start..];
        let tail_lowered = &lowered[start..];
        let cut = self
            .markers
            .noise_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .filter_map(|k| tail_lowered.find(&k.to_ascii_lowercase()))
            .min()
            .unwrap_or(tail.len());

        tail[..cut].trim().to_string()
    }
}

/// Map a driver failure to the outcome taxonomy
#[must_use]
pub fn outcome_for_driver_error(error: DriverError) -> Outcome {
    match error {
        DriverError::Network(detail) => Outcome::NetworkUnavailable { detail },
        DriverError::Blocked(reason) => Outcome::Blocked { reason },
        DriverError::Structure(detail) => Outcome::ParseFailed { detail },
        DriverError::Http(status, url) => Outcome::ParseFailed {
            detail: format!("HTTP {status} from {url}"),
        },
        DriverError::Initialization(message) | DriverError::Unexpected(message) => {
            Outcome::UnexpectedError { message }
        }
    }
}

/// Samples markers until a terminal outcome or the deadline
#[derive(Clone)]
pub struct TerminalStatePoller {
    detector: Arc<dyn TerminalMarkerDetector>,
    interval: Duration,
    timeout: Duration,
}

impl TerminalStatePoller {
    #[must_use]
    pub fn new(detector: Arc<dyn TerminalMarkerDetector>, interval: Duration, timeout: Duration) -> Self {
        Self {
            detector,
            interval,
            timeout,
        }
    }

    #[must_use]
    pub fn detector(&self) -> &dyn TerminalMarkerDetector {
        self.detector.as_ref()
    }

    /// Poll `driver` after a submit; `baseline` is the primary text before submission
    pub async fn poll(&self, driver: &mut dyn PageDriver, baseline: &str) -> Outcome {
        let deadline = Instant::now() + self.timeout;
        let baseline = collapse_whitespace(baseline);
        let mut samples = 0u32;

        loop {
            let sample = match driver.sample_markers().await {
                Ok(sample) => sample,
                Err(e) => {
                    debug!("Marker sampling failed: {}", e);
                    return outcome_for_driver_error(e);
                }
            };
            samples += 1;

            match self.detector.classify(&sample) {
                Detection::Success(payload) => return Outcome::Success { payload },
                Detection::NoData(message) => return Outcome::NoData { message },
                Detection::Blocked(reason) => return Outcome::Blocked { reason },
                Detection::Pending => {}
            }

            let text = collapse_whitespace(&sample.primary_text);
            if !text.is_empty() && text != baseline {
                debug!("Content changed without an explicit marker after {} samples", samples);
                return Outcome::Success {
                    payload: Payload::with_text(self.detector.clean_message(&text)),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No terminal marker after {} samples", samples);
                return Outcome::Timeout;
            }
            trace!("sample {} pending", samples);
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}
