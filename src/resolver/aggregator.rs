//! # Result Aggregator
//!
//! Collects records as workers complete them (completion order is arbitrary),
//! keeps the latest record per key and hands the whole set to a
//! [`ResultWriter`] every `flush_every` new records and once at the end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{Key, Record};
use crate::infrastructure::tabular::{ResultWriter, TabularError};

pub struct ResultAggregator {
    writer: Arc<dyn ResultWriter>,
    flush_every: usize,
    order: Vec<Key>,
    records: HashMap<Key, Record>,
    unflushed: usize,
}

impl ResultAggregator {
    #[must_use]
    pub fn new(writer: Arc<dyn ResultWriter>, flush_every: usize) -> Self {
        Self {
            writer,
            flush_every: flush_every.max(1),
            order: Vec::new(),
            records: HashMap::new(),
            unflushed: 0,
        }
    }

    /// Add a record, replacing any earlier one for the same key
    pub async fn push(&mut self, record: Record) -> Result<(), TabularError> {
        if self.records.insert(record.key.clone(), record.clone()).is_none() {
            self.order.push(record.key);
        }
        self.unflushed += 1;

        if self.unflushed >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist everything collected so far; returns the path written
    pub async fn flush(&mut self) -> Result<PathBuf, TabularError> {
        if self.records.is_empty() {
            return Ok(self.writer.target().to_path_buf());
        }

        let batch: Vec<Record> = self
            .order
            .iter()
            .filter_map(|key| self.records.get(key).cloned())
            .collect();

        let path = self.writer.write(&batch).await?;
        if path != self.writer.target() {
            warn!("Results written to {:?} instead of {:?}", path, self.writer.target());
        }
        debug!("Flushed {} records", batch.len());
        self.unflushed = 0;
        Ok(path)
    }
}
