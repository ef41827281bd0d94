//! # Scheduler
//!
//! Fixed-size worker pool over a shared key queue. Each worker resolves one key
//! end-to-end before taking the next, checks stop/pause before every new key,
//! and streams its records back over a channel. Keys already present in a prior
//! output are filtered out before dispatch so interrupted batches can resume.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::domain::{Key, Record};
use crate::infrastructure::config::PacingConfig;
use crate::infrastructure::page_driver::ConnectivityProbe;
use crate::resolver::attempt::{AttemptController, AttemptPolicy};
use crate::resolver::context_pool::ExecutionContextPool;
use crate::resolver::poller::TerminalStatePoller;
use crate::resolver::state::JobContext;

/// Keys left to dispatch after resumption filtering and in-run dedup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPlan {
    pub keys: Vec<Key>,
    /// Keys skipped because a prior output already holds them
    pub resumed: usize,
    /// Repeated keys within this input
    pub duplicates: usize,
}

impl DispatchPlan {
    /// Order-preserving filter of `keys` against `completed`
    #[must_use]
    pub fn build(keys: Vec<Key>, completed: &HashSet<Key>) -> Self {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut plan = Self::default();
        for key in keys {
            if !seen.insert(key.clone()) {
                plan.duplicates += 1;
            } else if completed.contains(&key) {
                plan.resumed += 1;
            } else {
                plan.keys.push(key);
            }
        }
        plan
    }
}

/// Bounded-concurrency dispatcher
pub struct Scheduler {
    workers: usize,
    pool: Arc<ExecutionContextPool>,
    poller: Arc<TerminalStatePoller>,
    probe: Arc<dyn ConnectivityProbe>,
    job: Arc<JobContext>,
    policy: Arc<AttemptPolicy>,
    pacing: PacingConfig,
}

impl Scheduler {
    pub fn new(
        pool: Arc<ExecutionContextPool>,
        poller: Arc<TerminalStatePoller>,
        probe: Arc<dyn ConnectivityProbe>,
        job: Arc<JobContext>,
        policy: AttemptPolicy,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            workers: pool.worker_slots().max(1),
            pool,
            poller,
            probe,
            job,
            policy: Arc::new(policy),
            pacing,
        }
    }

    /// Dispatch `keys` to the worker pool; the stream ends when every worker is done
    pub fn run(&self, keys: Vec<Key>) -> ReceiverStream<Record> {
        let (tx, rx) = mpsc::channel(self.workers * 2);
        let queue = Arc::new(Mutex::new(VecDeque::from(keys)));
        let mut workers = JoinSet::new();

        info!("🚀 Starting {} workers", self.workers);
        for worker_id in 0..self.workers {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                job: Arc::clone(&self.job),
                pool: Arc::clone(&self.pool),
                pacing: self.pacing.clone(),
                controller: AttemptController::new(
                    worker_id,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.poller),
                    Arc::clone(&self.probe),
                    Arc::clone(&self.job),
                    Arc::clone(&self.policy),
                ),
            };
            workers.spawn(worker.run().instrument(info_span!("worker", id = worker_id)));
        }
        drop(tx);

        tokio::spawn(async move {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("Worker task failed: {}", e);
                }
            }
            debug!("All workers finished");
        });

        ReceiverStream::new(rx)
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<Key>>>,
    tx: mpsc::Sender<Record>,
    job: Arc<JobContext>,
    pool: Arc<ExecutionContextPool>,
    pacing: PacingConfig,
    controller: AttemptController,
}

impl Worker {
    async fn run(mut self) {
        let mut handled = 0usize;
        loop {
            if self.job.is_stop_requested() {
                break;
            }
            self.job.wait_if_paused().await;
            if self.job.is_stop_requested() {
                break;
            }

            let Some(key) = self.queue.lock().await.pop_front() else {
                break;
            };
            self.job.mark_dispatched(&key).await;

            let span = info_span!("key", key = %key);
            let Some(record) = self.controller.resolve(key).instrument(span).await else {
                break;
            };
            handled += 1;

            let processed = self.job.record_completed(&record).await;
            if self.tx.send(record).await.is_err() {
                warn!("Record receiver dropped, worker {} exiting", self.id);
                break;
            }

            if self.pacing.maintenance_every > 0 && processed % self.pacing.maintenance_every == 0 {
                if self.pacing.maintenance_invalidate {
                    self.pool.invalidate();
                }
                self.job.hold_maintenance(self.pacing.maintenance_pause()).await;
            }
        }
        debug!("Worker {} finished after {} keys", self.id, handled);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::infrastructure::page_driver::DriverFactory;
    use crate::resolver::poller::KeywordMarkerDetector;
    use crate::test_utils::{Script, ScriptedDriverFactory, ScriptedProbe, test_config};

    fn keys(raw: &[&str]) -> Vec<Key> {
        raw.iter().map(|k| Key::parse(k).unwrap()).collect()
    }

    fn one_worker(factory: &Arc<ScriptedDriverFactory>, pacing: PacingConfig) -> (Scheduler, Arc<ExecutionContextPool>) {
        let config = test_config();
        let pool = Arc::new(ExecutionContextPool::new(Arc::clone(factory) as Arc<dyn DriverFactory>, 1));
        let poller = Arc::new(TerminalStatePoller::new(
            Arc::new(KeywordMarkerDetector::new(config.markers.clone())),
            config.resolver.poll_interval(),
            config.resolver.result_timeout(),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&pool),
            poller,
            Arc::new(ScriptedProbe::online()),
            JobContext::shared(),
            AttemptPolicy::from_config(&config),
            pacing,
        );
        (scheduler, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_pauses_and_recycles_contexts_on_cadence() {
        let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.example/m.pdf")));
        let pacing = PacingConfig {
            maintenance_every: 2,
            maintenance_pause_secs: 30,
            maintenance_invalidate: true,
            ..PacingConfig::none()
        };
        let (scheduler, pool) = one_worker(&factory, pacing);

        let start = tokio::time::Instant::now();
        let mut records = scheduler.run(keys(&["10001", "10002", "10003", "10004"]));
        let mut arrivals = Vec::new();
        while let Some(record) = records.next().await {
            arrivals.push((record.key.to_string(), start.elapsed()));
        }

        assert_eq!(arrivals.len(), 4);
        // the third key waits out the pause taken after the second
        assert!(arrivals[1].1 < Duration::from_secs(30));
        assert!(arrivals[2].1 >= Duration::from_secs(30));
        // the stream closes once the pause after the fourth key ends
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(65));

        assert_eq!(pool.version(), 2);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_cadence_never_pauses() {
        let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.example/m.pdf")));
        let (scheduler, pool) = one_worker(&factory, PacingConfig::none());

        let start = tokio::time::Instant::now();
        let records: Vec<Record> = scheduler.run(keys(&["10001", "10002", "10003"])).collect().await;

        assert_eq!(records.len(), 3);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.version(), 0);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn plan_filters_completed_and_duplicate_keys() {
        let completed: HashSet<Key> = keys(&["00501", "10001"]).into_iter().collect();
        let plan = DispatchPlan::build(keys(&["501", "90210", "10001", "90210", "60601"]), &completed);

        assert_eq!(plan.keys, keys(&["90210", "60601"]));
        assert_eq!(plan.resumed, 2);
        assert_eq!(plan.duplicates, 1);
    }

    #[test]
    fn empty_completed_set_keeps_order() {
        let plan = DispatchPlan::build(keys(&["3", "2", "1"]), &HashSet::new());
        assert_eq!(plan.keys, keys(&["00003", "00002", "00001"]));
        assert_eq!(plan.resumed, 0);
    }
}
