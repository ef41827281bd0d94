//! # Result Records
//!
//! One [`Record`] per key survives in the output table. Column order is fixed by
//! [`RECORD_COLUMNS`]; the writer compares existing headers against it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::key::Key;
use super::outcome::{AttemptStep, ErrorKind, Outcome, Payload};

/// Output schema, in column order
pub const RECORD_COLUMNS: [&str; 9] = [
    "ZIP",
    "STATUS",
    "ERROR_STEP",
    "ERROR_TYPE",
    "ERROR_MESSAGE",
    "RESULT_TEXT",
    "RESULT_URL",
    "PAGE_URL",
    "ARTIFACT_FILE",
];

/// Column holding the key
pub const KEY_COLUMN: &str = "ZIP";

pub const NO_DATA_RESULT_TEXT: &str = "No results found";
pub const NO_DATA_FALLBACK_MESSAGE: &str = "No result available for this ZIP code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Ok,
    NoData,
    Error,
    Skipped,
}

impl RecordStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoData => "NO_DATA",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Counted as "skipped" in the progress counters
    #[must_use]
    pub const fn counts_as_skipped(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted row for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub status: RecordStatus,
    pub error_step: Option<AttemptStep>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: String,
    pub result_text: String,
    pub result_url: String,
    /// Page the key was resolved against
    pub source: String,
    /// Local copy of the result artifact, when downloads are enabled
    pub artifact_file: String,
}

impl Record {
    #[must_use]
    pub fn ok(key: Key, payload: Payload, source: impl Into<String>) -> Self {
        Self {
            key,
            status: RecordStatus::Ok,
            error_step: None,
            error_kind: None,
            error_message: String::new(),
            result_text: payload.text,
            result_url: payload.artifact.unwrap_or_default(),
            source: source.into(),
            artifact_file: String::new(),
        }
    }

    #[must_use]
    pub fn no_data(key: Key, message: &str, source: impl Into<String>) -> Self {
        let message = if message.trim().is_empty() {
            NO_DATA_FALLBACK_MESSAGE.to_string()
        } else {
            message.to_string()
        };
        Self {
            key,
            status: RecordStatus::NoData,
            error_step: Some(AttemptStep::WaitResult),
            error_kind: Some(ErrorKind::NoData),
            error_message: message,
            result_text: NO_DATA_RESULT_TEXT.to_string(),
            result_url: String::new(),
            source: source.into(),
            artifact_file: String::new(),
        }
    }

    /// Failure record (ERROR or SKIPPED) carrying the last error seen
    #[must_use]
    pub fn failed(
        key: Key,
        status: RecordStatus,
        step: AttemptStep,
        outcome: &Outcome,
        source: impl Into<String>,
    ) -> Self {
        Self {
            key,
            status,
            error_step: Some(step),
            error_kind: outcome.error_kind(),
            error_message: outcome.message(),
            result_text: String::new(),
            result_url: String::new(),
            source: source.into(),
            artifact_file: String::new(),
        }
    }

    /// Row aligned with [`RECORD_COLUMNS`]
    #[must_use]
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.key.to_string(),
            self.status.to_string(),
            self.error_step.map(|s| s.to_string()).unwrap_or_default(),
            self.error_kind.map(|k| k.to_string()).unwrap_or_default(),
            self.error_message.clone(),
            self.result_text.clone(),
            self.result_url.clone(),
            self.source.clone(),
            self.artifact_file.clone(),
        ]
    }
}

/// A key in flight; owned by the attempt controller handling it
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: Key,
    pub attempts: u32,
    pub last_error: Option<(AttemptStep, Outcome)>,
}

impl WorkItem {
    #[must_use]
    pub const fn new(key: Key) -> Self {
        Self {
            key,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn record_failure(&mut self, step: AttemptStep, outcome: Outcome) {
        self.last_error = Some((step, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    #[test]
    fn row_matches_schema_width() {
        let record = Record::ok(key("90210"), Payload::with_artifact("https://x/90210.pdf"), "https://x");
        let row = record.to_row();
        assert_eq!(row.len(), RECORD_COLUMNS.len());
        assert_eq!(row[0], "90210");
        assert_eq!(row[1], "OK");
        assert_eq!(row[6], "https://x/90210.pdf");
        assert_eq!(row[8], "");
    }

    #[test]
    fn no_data_falls_back_to_generic_message() {
        let record = Record::no_data(key("00000"), "  ", "https://x");
        assert_eq!(record.error_message, NO_DATA_FALLBACK_MESSAGE);
        assert_eq!(record.result_text, NO_DATA_RESULT_TEXT);
        assert_eq!(record.error_kind, Some(ErrorKind::NoData));
    }

    #[test]
    fn skipped_record_carries_last_error() {
        let record = Record::failed(
            key("99999"),
            RecordStatus::Skipped,
            AttemptStep::WaitResult,
            &Outcome::Timeout,
            "https://x",
        );
        let row = record.to_row();
        assert_eq!(&row[1..4], &["SKIPPED", "WAIT_RESULT", "RESULT_TIMEOUT"]);
        assert!(record.status.counts_as_skipped());
    }
}
