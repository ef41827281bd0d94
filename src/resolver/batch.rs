//! # Batch Entry Point
//!
//! `read keys → normalize → filter resumed → dispatch → aggregate → write`.
//! [`BatchRunner::run`] returns a [`BatchSummary`]; live counters are available
//! through the shared [`JobContext`] while the run is in progress.

#![allow(clippy::cast_possible_truncation)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::normalize_all;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http_driver::HttpDriverFactory;
use crate::infrastructure::page_driver::{ConnectivityProbe, DriverFactory, connectivity_probe_for};
use crate::infrastructure::tabular::{
    DelimitedResultWriter, ResultWriter, default_output_path, load_keys, substitute_writable_format,
};
use crate::resolver::ResolverError;
use crate::resolver::aggregator::ResultAggregator;
use crate::resolver::attempt::AttemptPolicy;
use crate::resolver::context_pool::ExecutionContextPool;
use crate::resolver::poller::{KeywordMarkerDetector, TerminalMarkerDetector, TerminalStatePoller};
use crate::resolver::scheduler::{DispatchPlan, Scheduler};
use crate::resolver::state::JobContext;

/// Interval between progress log lines
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(15);

/// Final report of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    /// Keys read from the input
    pub total: usize,
    /// Keys handed to the workers
    pub dispatched: usize,
    /// Keys that produced a record this run
    pub processed: u64,
    /// Records that were not OK
    pub skipped: u64,
    /// Keys already present in the output
    pub resumed: usize,
    pub duplicates: usize,
    pub contexts_created: u64,
    pub stopped: bool,
    pub output: PathBuf,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        f64::deserialize(d).map(Duration::from_secs_f64)
    }
}

/// Wires the engine together for one input/output pair
pub struct BatchRunner {
    config: AppConfig,
    factory: Arc<dyn DriverFactory>,
    probe: Arc<dyn ConnectivityProbe>,
    detector: Arc<dyn TerminalMarkerDetector>,
    job: Arc<JobContext>,
}

impl BatchRunner {
    pub fn new(config: AppConfig, factory: Arc<dyn DriverFactory>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        let detector = Arc::new(KeywordMarkerDetector::new(config.markers.clone()));
        Self {
            config,
            factory,
            probe,
            detector,
            job: JobContext::shared(),
        }
    }

    /// Runner backed by the HTTP page driver and connectivity probe from `config.site`
    pub fn from_config(config: AppConfig) -> Result<Self, ResolverError> {
        let factory = Arc::new(HttpDriverFactory::new(config.site.clone())?);
        let probe = connectivity_probe_for(
            &config.site.connectivity_url,
            Duration::from_secs(config.site.request_timeout_secs.min(10)),
        )?;
        Ok(Self::new(config, factory, probe))
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<dyn TerminalMarkerDetector>) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_job_context(mut self, job: Arc<JobContext>) -> Self {
        self.job = job;
        self
    }

    /// Shared state for progress displays and pause/stop control
    #[must_use]
    pub fn job(&self) -> Arc<JobContext> {
        Arc::clone(&self.job)
    }

    /// Resolve every key in `input` into `output` (default `result_<stem>.csv`)
    pub async fn run(&self, input: &Path, output: Option<&Path>) -> Result<BatchSummary, ResolverError> {
        let started = tokio::time::Instant::now();

        let raw = load_keys(input).await.map_err(ResolverError::Input)?;
        let keys = normalize_all(&raw);
        if keys.is_empty() {
            return Err(ResolverError::NoKeys(input.to_path_buf()));
        }
        let total = keys.len();
        info!("📥 Read {} keys from {:?} ({} raw rows)", total, input, raw.len());

        let output = resolve_output_path(input, output);
        let writer = Arc::new(
            DelimitedResultWriter::new(
                &output,
                self.config.output.write_retries,
                Duration::from_millis(self.config.output.write_backoff_ms),
            )
            .map_err(ResolverError::Output)?,
        );

        let completed = writer.existing_keys().await.map_err(ResolverError::Output)?;
        let plan = DispatchPlan::build(keys, &completed);
        if plan.resumed > 0 {
            info!("⏩ Resuming: {} keys already present in {:?}", plan.resumed, output);
        }
        if plan.duplicates > 0 {
            debug!("{} duplicate keys in input dispatched once", plan.duplicates);
        }

        let run_id = self.job.reset(plan.keys.len() as u64).await;
        let dispatched = plan.keys.len();

        let workers = self.config.resolver.max_workers.clamp(1, dispatched.max(1));
        let pool = Arc::new(ExecutionContextPool::new(Arc::clone(&self.factory), workers));
        let mut final_path = output.clone();

        if dispatched > 0 {
            let poller = Arc::new(TerminalStatePoller::new(
                Arc::clone(&self.detector),
                self.config.resolver.poll_interval(),
                self.config.resolver.result_timeout(),
            ));
            let scheduler = Scheduler::new(
                Arc::clone(&pool),
                poller,
                Arc::clone(&self.probe),
                Arc::clone(&self.job),
                AttemptPolicy::from_config(&self.config).relative_to(output.parent().unwrap_or_else(|| Path::new("."))),
                self.config.pacing.clone(),
            );

            let progress_token = CancellationToken::new();
            let reporter = spawn_progress_reporter(Arc::clone(&self.job), progress_token.clone());

            let mut aggregator = ResultAggregator::new(
                Arc::clone(&writer) as Arc<dyn ResultWriter>,
                self.config.output.flush_every,
            );
            let mut records = scheduler.run(plan.keys);
            while let Some(record) = records.next().await {
                if let Err(e) = aggregator.push(record).await {
                    warn!("Incremental write failed, will retry at the end: {}", e);
                }
            }

            let flushed = aggregator.flush().await;
            progress_token.cancel();
            let _ = reporter.await;
            pool.release_all().await;
            final_path = flushed.map_err(ResolverError::Output)?;
        } else {
            info!("Nothing to dispatch, every key is already in {:?}", output);
        }

        let stats = self.job.snapshot().await;
        let summary = BatchSummary {
            run_id,
            total,
            dispatched,
            processed: stats.processed,
            skipped: stats.skipped,
            resumed: plan.resumed,
            duplicates: plan.duplicates,
            contexts_created: pool.contexts_created(),
            stopped: self.job.is_stop_requested(),
            output: final_path,
            elapsed: started.elapsed(),
        };
        info!(
            "🏁 Batch finished: processed={}, skipped={}, resumed={}, output={:?}, elapsed={:.1}s",
            summary.processed,
            summary.skipped,
            summary.resumed,
            summary.output,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}

/// `runBatch(input, output)` with the HTTP driver configured from `config`
pub async fn run_batch(input: &Path, output: Option<&Path>, config: AppConfig) -> Result<BatchSummary, ResolverError> {
    BatchRunner::from_config(config)?.run(input, output).await
}

/// Requested (or default) output path, with unwritable formats switched to csv
#[must_use]
pub fn resolve_output_path(input: &Path, output: Option<&Path>) -> PathBuf {
    let requested = output.map_or_else(|| default_output_path(input), Path::to_path_buf);
    match substitute_writable_format(&requested) {
        Some(substitute) => {
            warn!(
                "Output format of {:?} is not writable, writing {:?} instead",
                requested, substitute
            );
            substitute
        }
        None => requested,
    }
}

fn spawn_progress_reporter(job: Arc<JobContext>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = job.snapshot().await;
                    info!(
                        "📊 Progress: {}/{} processed, {} skipped, last key {}",
                        stats.processed,
                        stats.total,
                        stats.skipped,
                        stats.last_key.as_ref().map_or("-", |k| k.as_str())
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_defaults_next_to_input() {
        assert_eq!(
            resolve_output_path(Path::new("/data/zips.csv"), None),
            PathBuf::from("/data/result_zips.csv")
        );
    }

    #[test]
    fn spreadsheet_output_is_switched_to_csv() {
        assert_eq!(
            resolve_output_path(Path::new("/data/zips.xlsx"), Some(Path::new("/out/maps.xlsx"))),
            PathBuf::from("/out/maps.csv")
        );
        assert_eq!(
            resolve_output_path(Path::new("/data/zips.csv"), Some(Path::new("/out/maps.tsv"))),
            PathBuf::from("/out/maps.tsv")
        );
    }

    #[test]
    fn summary_serializes_elapsed_as_seconds() {
        let summary = BatchSummary {
            run_id: Uuid::nil(),
            total: 3,
            dispatched: 3,
            processed: 3,
            skipped: 1,
            resumed: 0,
            duplicates: 0,
            contexts_created: 2,
            stopped: false,
            output: PathBuf::from("out.csv"),
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(1.5));
        assert_eq!(json["processed"], serde_json::json!(3));
    }
}
