//! Compactor
//!
//! Decides when the append log gets collapsed to one row per key, and runs
//! the collapse as one relational statement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::{Backend, Statement};
use crate::error::Result;

/// Insert counter and compaction trigger
///
/// The counter stays in `[0, frequency)`. A call whose inserts push the
/// counter past `frequency` compacts immediately; any smaller call counts
/// as one unit and compacts when the counter wraps to zero.
pub(crate) struct Compactor {
    frequency: u64,
    enabled: bool,
    counter: Mutex<u64>,
    runs: AtomicU64,
}

impl Compactor {
    pub fn new(frequency: u64, enabled: bool) -> Self {
        Self {
            frequency: frequency.max(1),
            enabled,
            counter: Mutex::new(0),
            runs: AtomicU64::new(0),
        }
    }

    /// Account for `inserts` new rows; true when a compaction is due.
    ///
    /// Zero inserts leave the counter alone.
    pub fn record(&self, inserts: usize) -> bool {
        if !self.enabled || inserts == 0 {
            return false;
        }

        let mut counter = self.counter.lock();
        let inserts = inserts as u64;
        if *counter + inserts > self.frequency {
            *counter = (*counter + inserts) % self.frequency;
            return true;
        }

        *counter = (*counter + 1) % self.frequency;
        *counter == 0
    }

    /// Record `inserts` and compact `table` if due. Returns whether it ran.
    pub fn maybe_compact(&self, backend: &dyn Backend, table: &str, inserts: usize) -> Result<bool> {
        if !self.record(inserts) {
            return Ok(false);
        }
        self.compact(backend, table)?;
        Ok(true)
    }

    /// Delete every superseded row of `table`
    pub fn compact(&self, backend: &dyn Backend, table: &str) -> Result<usize> {
        let started = Instant::now();
        let removed = backend.execute(&Statement::Compact { table })?;
        self.runs.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            table,
            removed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "compacted log table"
        );
        Ok(removed)
    }

    #[cfg(test)]
    pub fn counter(&self) -> u64 {
        *self.counter.lock()
    }

    /// Compactions run so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}
