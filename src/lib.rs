//! Postal Resolver - concurrent, resumable batch resolution of postal codes
//!
//! Resolves a finite list of postal codes against a slow, stateful lookup page
//! with a small worker pool, bounded retries, anti-blocking pacing and a
//! crash-resilient, deduplicated result table.

// Module declarations
pub mod domain;
pub mod infrastructure;
pub mod resolver;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use domain::{Key, Outcome, Record, RecordStatus, normalize};
pub use infrastructure::config::AppConfig;
pub use resolver::{BatchRunner, BatchSummary, JobContext, ResolverError, run_batch};
