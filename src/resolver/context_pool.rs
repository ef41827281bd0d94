//! # Execution Context Pool
//!
//! One slot per worker, each holding that worker's live page driver and the pool
//! version it was created under. Bumping the global version invalidates every
//! slot at once; each worker notices on its next `acquire` and rebuilds its own
//! context lazily. Contexts never move between workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::infrastructure::page_driver::{DriverError, DriverFactory, PageDriver};

/// A worker's live session plus the version it was created under
pub struct ExecutionContext {
    driver: Box<dyn PageDriver>,
    version: u64,
}

impl ExecutionContext {
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn driver(&mut self) -> &mut dyn PageDriver {
        self.driver.as_mut()
    }
}

/// Exclusive access to a worker's context for the duration of one attempt
pub type ContextLease<'a> = MappedMutexGuard<'a, ExecutionContext>;

/// Per-worker arena of versioned execution contexts
pub struct ExecutionContextPool {
    factory: Arc<dyn DriverFactory>,
    version: AtomicU64,
    created: AtomicU64,
    slots: Vec<Mutex<Option<ExecutionContext>>>,
}

impl ExecutionContextPool {
    #[must_use]
    pub fn new(factory: Arc<dyn DriverFactory>, workers: usize) -> Self {
        Self {
            factory,
            version: AtomicU64::new(0),
            created: AtomicU64::new(0),
            slots: (0..workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Current context for `worker_id`, recreated if absent or stale
    pub async fn acquire(&self, worker_id: usize) -> Result<ContextLease<'_>, DriverError> {
        let slot = self
            .slots
            .get(worker_id)
            .ok_or_else(|| DriverError::Initialization(format!("No context slot for worker {worker_id}")))?;

        let mut guard = slot.lock().await;
        let current = self.version.load(Ordering::Acquire);

        if let Some(mut stale) = guard.take_if(|ctx| ctx.version != current) {
            debug!(
                "Worker {} context v{} is stale (pool v{}), recreating",
                worker_id, stale.version, current
            );
            stale.driver.close().await;
        }

        if guard.is_none() {
            let driver = self.factory.create(worker_id).await?;
            self.created.fetch_add(1, Ordering::Relaxed);
            *guard = Some(ExecutionContext {
                driver,
                version: current,
            });
        }

        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| DriverError::Unexpected(format!("Context slot {worker_id} emptied during acquire")))
    }

    /// Invalidate every context; returns the new version
    pub fn invalidate(&self) -> u64 {
        let next = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Execution contexts invalidated, pool version is now {}", next);
        next
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of contexts created over the pool's lifetime
    #[must_use]
    pub fn contexts_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn worker_slots(&self) -> usize {
        self.slots.len()
    }

    /// Close every live context
    pub async fn release_all(&self) {
        let mut closed = 0usize;
        for slot in &self.slots {
            if let Some(mut ctx) = slot.lock().await.take() {
                ctx.driver.close().await;
                closed += 1;
            }
        }
        info!("Released {} execution contexts", closed);
    }
}
