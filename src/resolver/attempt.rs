//! # Attempt Controller
//!
//! Turns one key into exactly one [`Record`] (or none when stopped mid-key) by
//! running bounded submit-and-poll attempts. Between attempts it waits out
//! connectivity loss, maintenance pauses and pacing jitter, and invalidates
//! execution contexts after failures that suggest a stale or blocked session.
//!
//! When enabled, OK records get their artifact downloaded through the same
//! session, and failures worth a look leave a page snapshot behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{AttemptStep, Key, Outcome, Record, RecordStatus, WorkItem};
use crate::infrastructure::artifacts::{ArtifactStore, DebugSnapshots, SnapshotReason};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::page_driver::{ConnectivityProbe, PageDriver};
use crate::resolver::context_pool::ExecutionContextPool;
use crate::resolver::poller::{TerminalStatePoller, outcome_for_driver_error};
use crate::resolver::state::JobContext;

/// Retry, cooldown and pacing knobs for the controller
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    pub max_retries: u32,
    pub timeout_streak_limit: u32,
    pub timeout_cooldown: Duration,
    pub unresponsive_pause: Duration,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Successes without an artifact reference count as NO_DATA
    pub require_artifact: bool,
    pub target_url: String,
    /// Download artifacts of OK records here
    pub artifact_dir: Option<PathBuf>,
    /// Save page snapshots here
    pub debug_dir: Option<PathBuf>,
}

impl AttemptPolicy {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.resolver.max_retries,
            timeout_streak_limit: config.resolver.timeout_streak_limit,
            timeout_cooldown: config.resolver.timeout_cooldown(),
            unresponsive_pause: config.resolver.unresponsive_pause(),
            jitter_min_ms: config.pacing.jitter_min_ms,
            jitter_max_ms: config.pacing.jitter_max_ms,
            require_artifact: config.output.require_artifact,
            target_url: config.site.target_url.clone(),
            artifact_dir: config.output.save_artifacts.then(|| config.output.artifact_dir.clone()),
            debug_dir: config.output.debug_snapshots.then(|| config.output.debug_dir.clone()),
        }
    }

    /// Anchor relative artifact and snapshot directories at `output_dir`
    #[must_use]
    pub fn relative_to(mut self, output_dir: &Path) -> Self {
        let anchor = |dir: PathBuf| if dir.is_relative() { output_dir.join(dir) } else { dir };
        self.artifact_dir = self.artifact_dir.map(anchor);
        self.debug_dir = self.debug_dir.map(anchor);
        self
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        let low = self.jitter_min_ms.min(self.jitter_max_ms);
        Duration::from_millis(fastrand::u64(low..=self.jitter_max_ms))
    }
}

/// Per-worker attempt loop; owns the worker's consecutive-timeout streak
pub struct AttemptController {
    worker_id: usize,
    pool: Arc<ExecutionContextPool>,
    poller: Arc<TerminalStatePoller>,
    probe: Arc<dyn ConnectivityProbe>,
    job: Arc<JobContext>,
    policy: Arc<AttemptPolicy>,
    artifacts: Option<ArtifactStore>,
    snapshots: Option<DebugSnapshots>,
    timeout_streak: u32,
}

/// What one submit-and-poll cycle produced
struct AttemptReport {
    step: AttemptStep,
    outcome: Outcome,
    /// Page source at the end of the cycle, kept only when a snapshot may follow
    page: Option<String>,
}

impl AttemptReport {
    const fn new(step: AttemptStep, outcome: Outcome) -> Self {
        Self {
            step,
            outcome,
            page: None,
        }
    }

    /// Failures that may warrant a snapshot; timeouts only count once the streak limit is hit
    fn may_snapshot(&self) -> bool {
        matches!(
            (self.step, &self.outcome),
            (AttemptStep::FindInput, Outcome::ParseFailed { .. }) | (_, Outcome::Timeout | Outcome::UnexpectedError { .. })
        )
    }
}

impl AttemptController {
    pub fn new(
        worker_id: usize,
        pool: Arc<ExecutionContextPool>,
        poller: Arc<TerminalStatePoller>,
        probe: Arc<dyn ConnectivityProbe>,
        job: Arc<JobContext>,
        policy: Arc<AttemptPolicy>,
    ) -> Self {
        Self {
            worker_id,
            pool,
            poller,
            probe,
            job,
            artifacts: policy.artifact_dir.clone().map(ArtifactStore::new),
            snapshots: policy.debug_dir.clone().map(DebugSnapshots::new),
            policy,
            timeout_streak: 0,
        }
    }

    #[must_use]
    pub const fn timeout_streak(&self) -> u32 {
        self.timeout_streak
    }

    /// Resolve one key; `None` when a stop interrupted it before a record existed
    pub async fn resolve(&mut self, key: Key) -> Option<Record> {
        let mut item = WorkItem::new(key);
        let source = self.policy.target_url.clone();

        while item.attempts < self.policy.max_retries {
            if self.job.is_stop_requested() {
                info!("Stop requested, leaving {} unresolved", item.key);
                return None;
            }
            if !self.wait_for_connectivity().await {
                return None;
            }
            self.job.pass_maintenance_gate().await;

            item.attempts += 1;
            debug!("Attempt {}/{} for {}", item.attempts, self.policy.max_retries, item.key);

            self.pace().await;
            let AttemptReport { step, outcome, page } = self.attempt_once(&item.key).await;
            self.pace().await;

            if !matches!(outcome, Outcome::Timeout) {
                self.timeout_streak = 0;
            }

            match outcome {
                Outcome::Success { payload } => {
                    if payload.is_empty() || (self.policy.require_artifact && !payload.has_artifact()) {
                        debug!("{} succeeded without usable content, recording NO_DATA", item.key);
                        return Some(Record::no_data(item.key, "", source));
                    }
                    info!("✅ {} resolved", item.key);
                    let mut record = Record::ok(item.key, payload, source);
                    self.save_artifact(&mut record).await;
                    return Some(record);
                }
                Outcome::NoData { message } => {
                    info!("∅ {} has no data", item.key);
                    return Some(Record::no_data(item.key, &message, source));
                }
                Outcome::UnexpectedError { .. } => {
                    warn!("❌ {} failed at {}: {}", item.key, step, outcome.message());
                    self.snapshot(&item.key, SnapshotReason::Unexpected, page.as_deref()).await;
                    self.pool.invalidate();
                    return Some(Record::failed(
                        item.key,
                        RecordStatus::Error,
                        AttemptStep::Unexpected,
                        &outcome,
                        source,
                    ));
                }
                Outcome::Timeout => {
                    self.pool.invalidate();
                    self.timeout_streak += 1;
                    warn!(
                        "⏱️ {} timed out (attempt {}/{}, streak {})",
                        item.key, item.attempts, self.policy.max_retries, self.timeout_streak
                    );
                    item.record_failure(step, outcome);
                    if self.timeout_streak >= self.policy.timeout_streak_limit {
                        self.snapshot(&item.key, SnapshotReason::Timeout, page.as_deref()).await;
                        warn!(
                            "{} consecutive timeouts, cooling down for {:?}",
                            self.timeout_streak, self.policy.timeout_cooldown
                        );
                        self.job.sleep_unless_stopped(self.policy.timeout_cooldown).await;
                        self.timeout_streak = 0;
                    }
                }
                Outcome::NetworkUnavailable { .. } => {
                    self.pool.invalidate();
                    warn!("🌐 {} lost the network at {}: {}", item.key, step, outcome.message());
                    if !self.probe.is_online().await {
                        // connectivity loss does not consume the retry budget
                        item.attempts -= 1;
                    }
                    item.record_failure(step, outcome);
                }
                Outcome::Blocked { .. } | Outcome::ParseFailed { .. } => {
                    if step == AttemptStep::FindInput && matches!(outcome, Outcome::ParseFailed { .. }) {
                        self.snapshot(&item.key, SnapshotReason::NoInput, page.as_deref()).await;
                    }
                    self.pool.invalidate();
                    warn!(
                        "⚠️ {} attempt {}/{} failed at {}: {}",
                        item.key,
                        item.attempts,
                        self.policy.max_retries,
                        step,
                        outcome.message()
                    );
                    item.record_failure(step, outcome);
                }
            }
        }

        let (step, outcome) = item
            .last_error
            .take()
            .unwrap_or((AttemptStep::WaitResult, Outcome::Timeout));
        warn!("⏭️ {} skipped after {} attempts: {}", item.key, item.attempts, outcome.message());
        Some(Record::failed(item.key, RecordStatus::Skipped, step, &outcome, source))
    }

    /// One submit-and-poll cycle on this worker's context
    async fn attempt_once(&self, key: &Key) -> AttemptReport {
        let mut lease = match self.pool.acquire(self.worker_id).await {
            Ok(lease) => lease,
            Err(e) => return AttemptReport::new(AttemptStep::OpenPage, outcome_for_driver_error(e)),
        };
        let driver = lease.driver();

        let (step, outcome) = self.drive(&mut *driver, key).await;
        let mut report = AttemptReport::new(step, outcome);
        if self.snapshots.is_some() && report.may_snapshot() {
            report.page = driver.page_source();
        }
        report
    }

    async fn drive(&self, driver: &mut dyn PageDriver, key: &Key) -> (AttemptStep, Outcome) {
        if let Err(e) = driver.open(&self.policy.target_url).await {
            return (AttemptStep::OpenPage, outcome_for_driver_error(e));
        }

        match driver.locate_input_field().await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    AttemptStep::FindInput,
                    Outcome::ParseFailed {
                        detail: "Key input field not found".to_string(),
                    },
                );
            }
            Err(e) => return (AttemptStep::FindInput, outcome_for_driver_error(e)),
        }

        let baseline = match driver.sample_markers().await {
            Ok(sample) => sample.primary_text,
            Err(e) => {
                debug!("Baseline sample failed, polling against an empty baseline: {}", e);
                String::new()
            }
        };

        if let Err(e) = driver.fill_and_submit(key.as_str()).await {
            return (AttemptStep::Submit, outcome_for_driver_error(e));
        }

        (AttemptStep::WaitResult, self.poller.poll(driver, &baseline).await)
    }

    /// Download the artifact of an OK record; a failed download leaves the record OK
    async fn save_artifact(&self, record: &mut Record) {
        let Some(store) = &self.artifacts else {
            return;
        };
        if record.result_url.trim().is_empty() {
            return;
        }

        let bytes = match self.pool.acquire(self.worker_id).await {
            Ok(mut lease) => lease.driver().fetch_artifact(&record.result_url).await,
            Err(e) => Err(e),
        };
        let saved = match bytes {
            Ok(bytes) => store
                .save(&record.key, &record.result_url, &bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match saved {
            Ok(path) => record.artifact_file = path.display().to_string(),
            Err(e) => warn!("🖼️ Artifact of {} not saved: {}", record.key, e),
        }
    }

    async fn snapshot(&self, key: &Key, reason: SnapshotReason, page: Option<&str>) {
        let (Some(snapshots), Some(page)) = (&self.snapshots, page) else {
            return;
        };
        if let Err(e) = snapshots.save(key, reason, page).await {
            warn!("Snapshot of {} not saved: {}", key, e);
        }
    }

    /// Wait until the probe reports connectivity; `false` if stopped while waiting
    async fn wait_for_connectivity(&self) -> bool {
        while !self.probe.is_online().await {
            warn!(
                "📡 Connectivity check failed, pausing {:?} before retrying",
                self.policy.unresponsive_pause
            );
            if !self.job.sleep_unless_stopped(self.policy.unresponsive_pause).await {
                return false;
            }
        }
        true
    }

    async fn pace(&self) {
        let delay = self.policy.jitter();
        if !delay.is_zero() {
            self.job.sleep_unless_stopped(delay).await;
        }
    }
}
