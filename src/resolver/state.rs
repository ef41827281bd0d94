//! # Shared Job State
//!
//! One [`JobContext`] per batch run, shared by reference between the scheduler,
//! every worker and any external progress display. It carries the run counters,
//! the cooperative stop/pause signals and the maintenance gate.

#![allow(clippy::unnecessary_operation)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Key, Record};

/// Run counters exposed to progress reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStats {
    pub run_id: Uuid,
    /// Keys scheduled for this run (after resumption filtering)
    pub total: u64,
    /// Keys that produced a record
    pub processed: u64,
    /// Records that were not OK
    pub skipped: u64,
    pub last_key: Option<Key>,
    pub started_at: DateTime<Utc>,
}

impl Default for JobStats {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total: 0,
            processed: 0,
            skipped: 0,
            last_key: None,
            started_at: Utc::now(),
        }
    }
}

/// Thread-safe run state shared across all workers
#[derive(Debug)]
pub struct JobContext {
    /// Cooperative stop for the current run; replaced by [`JobContext::reset`]
    cancellation_token: Mutex<CancellationToken>,

    /// `true` while paused; workers wait on it before taking a new key
    pause_tx: watch::Sender<bool>,

    stats: RwLock<JobStats>,

    /// Held for writing during a maintenance pause
    maintenance_gate: RwLock<()>,
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

impl JobContext {
    #[must_use]
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            cancellation_token: Mutex::new(CancellationToken::new()),
            pause_tx,
            stats: RwLock::new(JobStats::default()),
            maintenance_gate: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start a fresh run: new run id, zeroed counters, stop and pause cleared
    pub async fn reset(&self, total: u64) -> Uuid {
        *self.cancellation_token.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.pause_tx.send_replace(false);

        let mut stats = self.stats.write().await;
        *stats = JobStats {
            total,
            ..JobStats::default()
        };
        info!("🆕 Run {} started with {} keys", stats.run_id, total);
        stats.run_id
    }

    pub async fn snapshot(&self) -> JobStats {
        self.stats.read().await.clone()
    }

    pub async fn mark_dispatched(&self, key: &Key) {
        self.stats.write().await.last_key = Some(key.clone());
    }

    /// Count a finished key; returns the processed total after this record
    pub async fn record_completed(&self, record: &Record) -> u64 {
        let mut stats = self.stats.write().await;
        stats.processed += 1;
        if record.status.counts_as_skipped() {
            stats.skipped += 1;
        }
        stats.last_key = Some(record.key.clone());
        stats.processed
    }

    // ----- stop -----

    fn token(&self) -> CancellationToken {
        self.cancellation_token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Requests a cooperative stop
    pub fn request_stop(&self) {
        info!("🛑 Stop requested");
        self.token().cancel();
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        self.token().cancelled().await;
    }

    /// Sleep for `duration` unless stopped first; `false` means stop interrupted the sleep
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stop_requested();
        }
        let token = self.token();
        tokio::select! {
            () = token.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    // ----- pause -----

    pub fn pause(&self) {
        info!("⏸️ Pause requested");
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        info!("▶️ Resume requested");
        self.pause_tx.send_replace(false);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Block while paused; returns early on stop
    pub async fn wait_if_paused(&self) {
        let token = self.token();
        let mut rx = self.pause_tx.subscribe();
        while *rx.borrow_and_update() {
            debug!("Worker waiting for resume");
            tokio::select! {
                () = token.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // ----- maintenance -----

    /// Wait out a maintenance pause in progress, if any
    pub async fn pass_maintenance_gate(&self) {
        drop(self.maintenance_gate.read().await);
    }

    /// Hold the gate for `pause`; workers reaching the gate wait until it is released
    pub async fn hold_maintenance(&self, pause: Duration) {
        let _gate = self.maintenance_gate.write().await;
        info!("🧹 Maintenance pause for {:?}", pause);
        self.sleep_unless_stopped(pause).await;
        debug!("Maintenance pause finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptStep, Outcome, Payload, RecordStatus};

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn counters_track_processed_and_skipped() {
        let job = JobContext::new();
        let first_run = job.reset(3).await;

        let ok = Record::ok(key("90210"), Payload::with_text("Beverly Hills"), "p");
        let skipped = Record::failed(key("99999"), RecordStatus::Skipped, AttemptStep::WaitResult, &Outcome::Timeout, "p");
        assert_eq!(job.record_completed(&ok).await, 1);
        assert_eq!(job.record_completed(&skipped).await, 2);

        let stats = job.snapshot().await;
        assert_eq!((stats.total, stats.processed, stats.skipped), (3, 2, 1));
        assert_eq!(stats.last_key, Some(key("99999")));

        let second_run = job.reset(1).await;
        assert_ne!(first_run, second_run);
        assert_eq!(job.snapshot().await.processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_until_resume() {
        let job = JobContext::shared();
        job.pause();

        let waiter = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        job.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn wait_if_paused_is_ready_when_running() {
        let job = JobContext::new();
        let mut wait = tokio_test::task::spawn(job.wait_if_paused());
        tokio_test::assert_ready!(wait.poll());
    }

    #[test]
    fn resume_wakes_paused_waiter() {
        let job = JobContext::new();
        job.pause();
        let mut wait = tokio_test::task::spawn(job.wait_if_paused());
        tokio_test::assert_pending!(wait.poll());

        job.resume();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_paused_workers_and_sleepers() {
        let job = JobContext::shared();
        job.pause();
        let waiter = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.wait_if_paused().await })
        };
        job.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        assert!(!job.sleep_unless_stopped(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn reset_clears_stop_and_pause_from_previous_run() {
        let job = JobContext::new();
        job.reset(2).await;
        job.request_stop();
        job.pause();
        assert!(job.is_stop_requested());

        job.reset(2).await;
        assert!(!job.is_stop_requested());
        assert!(!job.is_paused());
        assert!(job.sleep_unless_stopped(Duration::from_millis(1)).await);

        job.request_stop();
        assert!(job.is_stop_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_gate_holds_other_workers() {
        let job = JobContext::shared();
        let holder = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.hold_maintenance(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let start = tokio::time::Instant::now();
        job.pass_maintenance_gate().await;
        assert!(start.elapsed() >= Duration::from_secs(29));
        holder.await.unwrap();
    }
}
