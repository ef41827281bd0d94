//! Resolver engine - concurrent, resumable batch resolution of keys
//!
//! Data flow:
//! `Key normalizer → Scheduler → AttemptController → TerminalStatePoller
//! (on an ExecutionContext) → ResultAggregator → ResultWriter`

use std::path::PathBuf;

use thiserror::Error;

use crate::infrastructure::page_driver::DriverError;
use crate::infrastructure::tabular::TabularError;

pub mod aggregator;
pub mod attempt;
pub mod batch;
pub mod context_pool;
pub mod poller;
pub mod scheduler;
pub mod state;

pub use aggregator::ResultAggregator;
pub use attempt::{AttemptController, AttemptPolicy};
pub use batch::{BatchRunner, BatchSummary, run_batch};
pub use context_pool::{ContextLease, ExecutionContext, ExecutionContextPool};
pub use poller::{Detection, KeywordMarkerDetector, TerminalMarkerDetector, TerminalStatePoller};
pub use scheduler::{DispatchPlan, Scheduler};
pub use state::{JobContext, JobStats};

/// Batch-level failures; per-key failures become records instead
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("No keys found in input {0:?}")]
    NoKeys(PathBuf),

    #[error("Failed to read input: {0}")]
    Input(#[source] TabularError),

    #[error("Failed to write output: {0}")]
    Output(#[source] TabularError),

    #[error("Page driver setup failed: {0}")]
    Driver(#[from] DriverError),
}
