//! Test utilities for postal-resolver
//!
//! Scripted page drivers and connectivity probes so the engine can be driven
//! end-to-end without a network. Each key gets a [`Script`] describing how the
//! lookup page reacts after it is submitted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::infrastructure::config::{AppConfig, PacingConfig};
use crate::infrastructure::page_driver::{ConnectivityProbe, DriverError, DriverFactory, MarkerSample, PageDriver};

/// How the page behaves once a key has been submitted
#[derive(Debug, Clone)]
pub enum Script {
    /// Success marker carrying an artifact reference
    Success(String),
    /// Explicit failure panel with this text
    NoData(String),
    /// Primary text changes, no explicit marker
    Text(String),
    /// Anti-automation page
    Blocked,
    /// Page never changes after submit
    Never,
    /// Sampling fails with this error
    Fail(DriverError),
    /// Form page until `Duration` after submit, then the inner script
    Delayed(Duration, Box<Script>),
    /// First `failures` submissions of the key fail (never terminate, or with `error`), then the inner script
    Flaky {
        failures: usize,
        error: Option<DriverError>,
        then: Box<Script>,
    },
}

impl Script {
    #[must_use]
    pub fn success(artifact: &str) -> Self {
        Self::Success(artifact.to_string())
    }

    #[must_use]
    pub fn no_data(message: &str) -> Self {
        Self::NoData(message.to_string())
    }

    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    #[must_use]
    pub fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    /// The first `failures` submissions never reach a terminal state
    #[must_use]
    pub fn failing_first(self, failures: usize) -> Self {
        Self::Flaky {
            failures,
            error: None,
            then: Box::new(self),
        }
    }

    /// The first `failures` submissions fail sampling with `error`
    #[must_use]
    pub fn failing_first_with(self, failures: usize, error: DriverError) -> Self {
        Self::Flaky {
            failures,
            error: Some(error),
            then: Box::new(self),
        }
    }
}

#[derive(Debug)]
struct Submission {
    key: String,
    at: Instant,
    /// 1-based count of submissions of this key across all drivers
    nth: usize,
}

/// Page behaviour shared by every driver of one factory
#[derive(Debug, Clone, Default)]
struct ScriptBook {
    scripts: HashMap<String, Script>,
    default: Option<Script>,
    submit_delay: Duration,
    hide_input: bool,
    fail_artifacts: bool,
}

impl ScriptBook {
    fn script_for(&self, key: &str) -> Script {
        self.scripts
            .get(key)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or(Script::Never)
    }
}

/// What the drivers of one factory did
#[derive(Debug, Default)]
struct DriverLog {
    submissions: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl DriverLog {
    fn record_submission(&self, key: &str) -> usize {
        let mut log = self.submissions.lock().unwrap_or_else(PoisonError::into_inner);
        log.push(key.to_string());
        log.iter().filter(|k| k.as_str() == key).count()
    }

    fn submissions(&self) -> Vec<String> {
        self.submissions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// In-memory page driver following a [`Script`] per key
pub struct ScriptedDriver {
    book: Arc<ScriptBook>,
    log: Arc<DriverLog>,
    submitted: Option<Submission>,
}

impl ScriptedDriver {
    /// Primary text of the lookup form before any submit
    pub const FORM_TEXT: &'static str = "Enter a ZIP code to view the service map";

    /// Driver whose every key follows `script`
    #[must_use]
    pub fn standalone(script: Script) -> Self {
        let book = ScriptBook {
            default: Some(script),
            ..ScriptBook::default()
        };
        Self {
            book: Arc::new(book),
            log: Arc::default(),
            submitted: None,
        }
    }

    /// Mark `key` as submitted without going through the async API
    pub fn submit_for_test(&mut self, key: &str) {
        let nth = self.log.record_submission(key);
        self.submitted = Some(Submission {
            key: key.to_string(),
            at: Instant::now(),
            nth,
        });
    }

    fn render(script: &Script, submission: &Submission) -> Result<MarkerSample, DriverError> {
        match script {
            Script::Success(artifact) => Ok(MarkerSample {
                success_marker: Some(artifact.clone()),
                failure_marker: None,
                primary_text: format!("Service map for {}", submission.key),
            }),
            Script::NoData(message) => Ok(MarkerSample {
                success_marker: None,
                failure_marker: Some(message.clone()),
                primary_text: format!("{} {}", Self::FORM_TEXT, message),
            }),
            Script::Text(text) => Ok(MarkerSample::text(text.clone())),
            Script::Blocked => Ok(MarkerSample::text("Access Denied - your request was blocked")),
            Script::Never => Ok(MarkerSample::text(Self::FORM_TEXT)),
            Script::Fail(error) => Err(error.clone()),
            Script::Delayed(delay, inner) => {
                if submission.at.elapsed() < *delay {
                    Ok(MarkerSample::text(Self::FORM_TEXT))
                } else {
                    Self::render(inner, submission)
                }
            }
            Script::Flaky { failures, error, then } => {
                if submission.nth > *failures {
                    Self::render(then, submission)
                } else if let Some(error) = error {
                    Err(error.clone())
                } else {
                    Ok(MarkerSample::text(Self::FORM_TEXT))
                }
            }
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn open(&mut self, _target_url: &str) -> Result<(), DriverError> {
        self.submitted = None;
        Ok(())
    }

    async fn locate_input_field(&mut self) -> Result<bool, DriverError> {
        Ok(!self.book.hide_input)
    }

    async fn fill_and_submit(&mut self, value: &str) -> Result<(), DriverError> {
        if !self.book.submit_delay.is_zero() {
            tokio::time::sleep(self.book.submit_delay).await;
        }
        self.submit_for_test(value);
        Ok(())
    }

    async fn sample_markers(&mut self) -> Result<MarkerSample, DriverError> {
        match &self.submitted {
            None => Ok(MarkerSample::text(Self::FORM_TEXT)),
            Some(submission) => Self::render(&self.book.script_for(&submission.key), submission),
        }
    }

    async fn fetch_artifact(&mut self, reference: &str) -> Result<Vec<u8>, DriverError> {
        if self.book.fail_artifacts {
            return Err(DriverError::Http(404, reference.to_string()));
        }
        Ok(format!("artifact:{reference}").into_bytes())
    }

    fn page_source(&self) -> Option<String> {
        let text = match &self.submitted {
            None => Self::FORM_TEXT.to_string(),
            Some(submission) => match Self::render(&self.book.script_for(&submission.key), submission) {
                Ok(sample) => sample.primary_text,
                Err(error) => error.to_string(),
            },
        };
        Some(format!("<html><body>{text}</body></html>"))
    }

    async fn close(&mut self) {
        self.log.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Factory handing out [`ScriptedDriver`]s that share one script book
#[derive(Default)]
pub struct ScriptedDriverFactory {
    book: Arc<ScriptBook>,
    log: Arc<DriverLog>,
    created: AtomicUsize,
}

impl ScriptedDriverFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn book_mut(&mut self) -> &mut ScriptBook {
        Arc::make_mut(&mut self.book)
    }

    #[must_use]
    pub fn with_script(mut self, key: &str, script: Script) -> Self {
        self.book_mut().scripts.insert(key.to_string(), script);
        self
    }

    /// Script for keys without their own entry (`Never` if unset)
    #[must_use]
    pub fn with_default(mut self, script: Script) -> Self {
        self.book_mut().default = Some(script);
        self
    }

    /// Lookup page without a recognisable input field
    #[must_use]
    pub fn without_input_field(mut self) -> Self {
        self.book_mut().hide_input = true;
        self
    }

    /// Every artifact download answers 404
    #[must_use]
    pub fn with_failing_artifacts(mut self) -> Self {
        self.book_mut().fail_artifacts = true;
        self
    }

    /// Simulated latency of every submit
    #[must_use]
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.book_mut().submit_delay = delay;
        self
    }

    /// Drivers created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Drivers closed so far
    pub fn closed(&self) -> usize {
        self.log.closed.load(Ordering::Relaxed)
    }

    /// Every submitted key, in submission order
    pub fn submissions(&self) -> Vec<String> {
        self.log.submissions()
    }

    pub fn submission_count(&self, key: &str) -> usize {
        self.submissions().iter().filter(|k| k.as_str() == key).count()
    }
}

#[async_trait]
impl DriverFactory for ScriptedDriverFactory {
    async fn create(&self, _worker_id: usize) -> Result<Box<dyn PageDriver>, DriverError> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ScriptedDriver {
            book: Arc::clone(&self.book),
            log: Arc::clone(&self.log),
            submitted: None,
        }))
    }
}

/// Connectivity probe replaying a fixed sequence of answers, online afterwards
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
}

impl ScriptedProbe {
    #[must_use]
    pub fn online() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn offline_for(checks: usize) -> Self {
        Self::sequence(std::iter::repeat_n(false, checks))
    }

    #[must_use]
    pub fn sequence(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn is_online(&self) -> bool {
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(true)
    }
}

/// Configuration for tests: no jitter or maintenance pauses, flush on every record, no log output
#[must_use]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pacing = PacingConfig::none();
    config.output.flush_every = 1;
    config.output.write_retries = 3;
    config.output.write_backoff_ms = 1;
    config.site.target_url = "https://lookup.test/servicemaps".to_string();
    config.site.connectivity_url = String::new();
    config.logging.console_output = false;
    config.logging.file_output = false;
    config
}
