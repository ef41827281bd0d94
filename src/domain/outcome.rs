//! # Attempt Outcomes
//!
//! Every fallible step of an attempt returns an [`Outcome`] instead of an error;
//! the attempt controller switches on the variant to decide retry/terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a terminal page yielded on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Cleaned text extracted from the result region
    pub text: String,
    /// Result artifact reference (map URL, PDF link, hidden field value)
    pub artifact: Option<String>,
}

impl Payload {
    #[must_use]
    pub fn with_artifact(artifact: impl Into<String>) -> Self {
        Self {
            text: "Success".to_string(),
            artifact: Some(artifact.into()),
        }
    }

    #[must_use]
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            artifact: None,
        }
    }

    /// Nothing usable was extracted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.artifact.as_deref().is_none_or(|a| a.trim().is_empty())
    }

    #[must_use]
    pub fn has_artifact(&self) -> bool {
        self.artifact.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}

/// Result of one submit-and-poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { payload: Payload },
    /// Service confirmed the key has no data (terminal, not an error)
    NoData { message: String },
    Timeout,
    /// Anti-automation page, HTTP 403/429 or similar
    Blocked { reason: String },
    /// Page reached but not in the expected shape
    ParseFailed { detail: String },
    NetworkUnavailable { detail: String },
    /// Programming or environment fault; terminal for this key only
    UnexpectedError { message: String },
}

impl Outcome {
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::NoData { .. } => Some(ErrorKind::NoData),
            Self::Timeout => Some(ErrorKind::ResultTimeout),
            Self::Blocked { .. } => Some(ErrorKind::Blocked),
            Self::ParseFailed { .. } => Some(ErrorKind::ParseFailed),
            Self::NetworkUnavailable { .. } => Some(ErrorKind::NetworkUnavailable),
            Self::UnexpectedError { .. } => Some(ErrorKind::Exception),
        }
    }

    /// Human readable detail for the ERROR_MESSAGE column
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Success { .. } => String::new(),
            Self::NoData { message } => message.clone(),
            Self::Timeout => "Timed out waiting for results".to_string(),
            Self::Blocked { reason } => reason.clone(),
            Self::ParseFailed { detail } | Self::NetworkUnavailable { detail } => detail.clone(),
            Self::UnexpectedError { message } => message.clone(),
        }
    }
}

/// ERROR_TYPE column values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NoData,
    ResultTimeout,
    Blocked,
    ParseFailed,
    NetworkUnavailable,
    Exception,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoData => "NO_DATA",
            Self::ResultTimeout => "RESULT_TIMEOUT",
            Self::Blocked => "BLOCKED",
            Self::ParseFailed => "PARSE_FAILED",
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ERROR_STEP column values: where in the attempt the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStep {
    OpenPage,
    FindInput,
    Submit,
    WaitResult,
    Unexpected,
}

impl AttemptStep {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenPage => "OPEN_PAGE",
            Self::FindInput => "FIND_INPUT",
            Self::Submit => "SUBMIT",
            Self::WaitResult => "WAIT_RESULT",
            Self::Unexpected => "UNEXPECTED",
        }
    }
}

impl fmt::Display for AttemptStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_emptiness() {
        assert!(Payload::default().is_empty());
        assert!(Payload::with_text("   ").is_empty());
        assert!(!Payload::with_text("Beverly Hills, CA").is_empty());
        assert!(!Payload::with_artifact("https://maps.example/90210.pdf").is_empty());
        assert!(!Payload::with_text("x").has_artifact());
    }

    #[test]
    fn only_success_has_no_error_kind() {
        let outcomes = [
            Outcome::NoData { message: "no results".into() },
            Outcome::Timeout,
            Outcome::Blocked { reason: "captcha".into() },
            Outcome::ParseFailed { detail: "no input".into() },
            Outcome::NetworkUnavailable { detail: "dns".into() },
            Outcome::UnexpectedError { message: "boom".into() },
        ];
        assert!(outcomes.iter().all(|o| o.error_kind().is_some()));
        assert_eq!(Outcome::Success { payload: Payload::with_text("ok") }.error_kind(), None);
        assert_eq!(Outcome::UnexpectedError { message: "boom".into() }.error_kind(), Some(ErrorKind::Exception));
    }

    #[test]
    fn timeout_maps_to_result_timeout() {
        assert_eq!(Outcome::Timeout.error_kind(), Some(ErrorKind::ResultTimeout));
        assert_eq!(ErrorKind::ResultTimeout.to_string(), "RESULT_TIMEOUT");
        assert_eq!(AttemptStep::WaitResult.to_string(), "WAIT_RESULT");
    }
}
