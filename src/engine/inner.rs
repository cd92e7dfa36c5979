//! Engine Core
//!
//! Write buffering, single-flight flushing, compaction scheduling and
//! read synchronization for one store instance.
//!
//! ## Shared state
//! `State` (buffer, in-flight flush, timer flag, open flag) sits behind one
//! mutex. Every transition of it is a critical section; relational calls
//! are made with the mutex released.
//!
//! ## Flush protocol
//! ```text
//!  caller ──► begin_flush ──┬─ buffer empty, nothing in flight ─► Idle
//!                           ├─ flush in flight ──────────────────► Join(ticket)
//!                           └─ otherwise: snapshot batch,
//!                              disarm timer, publish ticket ─────► Lead
//!
//!  Lead: transaction(batch) ─► drain batch ─► maybe compact
//!        ─► clear in-flight ─► wake writers ─► complete ticket
//! ```
//! Writers never append while a flush is in flight: they wait on `idle`.
//! So the buffer equals the batch for the whole flight, and a failed
//! flush leaves it untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::backend::{AutoCommit, Backend, KeyRange, LogRow, Transaction};
use crate::buffer::{check_key, insert_count, PendingOp, WriteBuffer};
use crate::codec::{self, ReadOptions, Value};
use crate::config::Options;
use crate::error::{Result, StoreError};
use crate::strategy::WriteStrategy;

use super::compactor::Compactor;
use super::timer::TimerHandle;

// =============================================================================
// Flush Ticket
// =============================================================================

/// Why a shared flush failed. Cloned to every caller of that flush.
#[derive(Debug, Clone)]
pub(crate) enum FlushFailure {
    Transaction(Arc<StoreError>),
    Compaction(Arc<StoreError>),
}

impl From<FlushFailure> for StoreError {
    fn from(failure: FlushFailure) -> Self {
        match failure {
            FlushFailure::Transaction(e) => StoreError::Transaction(e),
            FlushFailure::Compaction(e) => StoreError::Compaction(e),
        }
    }
}

type FlushOutcome = std::result::Result<(), FlushFailure>;

/// Completion of one in-flight flush, awaited by late joiners
pub(crate) struct FlushTicket {
    outcome: Mutex<Option<FlushOutcome>>,
    done: Condvar,
}

impl FlushTicket {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: FlushOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> FlushOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

enum FlushRole {
    /// Nothing to flush
    Idle,

    /// Another caller is flushing; wait for it
    Join(Arc<FlushTicket>),

    /// This caller runs the transaction
    Lead {
        ticket: Arc<FlushTicket>,
        batch: Vec<PendingOp>,
    },
}

// =============================================================================
// Core
// =============================================================================

struct State {
    buffer: WriteBuffer,
    in_flight: Option<Arc<FlushTicket>>,
    timer_armed: bool,
    open: bool,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Ops waiting in the write buffer
    pub buffered: usize,

    /// Flush transactions committed
    pub flushes: u64,

    /// Flush transactions that failed
    pub failed_flushes: u64,

    /// Compactions run
    pub compactions: u64,

    /// Stored values that failed to decode and were reported as missing
    pub decode_failures: u64,
}

pub(crate) struct Core {
    backend: Box<dyn Backend>,
    strategy: Box<dyn WriteStrategy>,
    options: Options,
    compactor: Compactor,
    timer: Option<TimerHandle>,
    state: Mutex<State>,
    /// Signalled whenever an in-flight flush finishes
    idle: Condvar,
    counters: Counters,
}

impl Core {
    pub fn new(
        backend: Box<dyn Backend>,
        strategy: Box<dyn WriteStrategy>,
        options: Options,
        timer: Option<TimerHandle>,
    ) -> Self {
        let compactor = Compactor::new(
            options.compact_frequency,
            !options.disable_compact && strategy.needs_compaction(),
        );
        Self {
            backend,
            strategy,
            options,
            compactor,
            timer,
            state: Mutex::new(State {
                buffer: WriteBuffer::new(),
                in_flight: None,
                timer_armed: false,
                open: true,
            }),
            idle: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn strategy(&self) -> &dyn WriteStrategy {
        self.strategy.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            buffered: self.state.lock().buffer.len(),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            compactions: self.compactor.runs(),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Apply `ops` in order, buffered or directly depending on config.
    ///
    /// A buffered write returns once the op is queued, unless it filled the
    /// buffer or `sync` is set; then it returns the flush outcome.
    pub fn write(&self, ops: Vec<PendingOp>, sync: bool) -> Result<()> {
        if !self.options.buffering() {
            self.ensure_open()?;
            return self.apply_direct(&ops);
        }

        let mut state = self.state.lock();
        loop {
            if !state.open {
                return Err(StoreError::NotOpen);
            }
            if state.in_flight.is_none() {
                break;
            }
            self.idle.wait(&mut state);
        }

        state.buffer.extend(ops);

        if sync || state.buffer.len() >= self.options.write_buffer_size {
            let role = self.begin_flush(&mut state);
            drop(state);
            return self.finish(role);
        }

        self.arm_timer(&mut state);
        Ok(())
    }

    /// Unbuffered write: one autocommit statement, or one transaction for
    /// several ops.
    fn apply_direct(&self, ops: &[PendingOp]) -> Result<()> {
        let table = self.options.table.as_str();

        match ops {
            [] => return Ok(()),
            [op] => {
                self.strategy
                    .apply(&mut AutoCommit(self.backend.as_ref()), table, op)?;
            }
            _ => {
                self.backend
                    .transaction(&mut |tx: &mut dyn Transaction| {
                        for op in ops {
                            self.strategy.apply(tx, table, op)?;
                        }
                        Ok(())
                    })
                    .map_err(|e| StoreError::Transaction(Arc::new(e)))?;
            }
        }

        self.compactor
            .maybe_compact(self.backend.as_ref(), table, insert_count(ops))
            .map_err(|e| {
                tracing::warn!(table, error = %e, "compaction failed");
                StoreError::Compaction(Arc::new(e))
            })?;
        Ok(())
    }

    // =========================================================================
    // Flush Coordination
    // =========================================================================

    /// Drain the buffer, or wait for the flush already doing so
    pub fn flush(&self) -> Result<()> {
        let role = {
            let mut state = self.state.lock();
            self.begin_flush(&mut state)
        };
        self.finish(role)
    }

    fn begin_flush(&self, state: &mut State) -> FlushRole {
        if let Some(ticket) = &state.in_flight {
            return FlushRole::Join(Arc::clone(ticket));
        }
        if state.buffer.is_empty() {
            return FlushRole::Idle;
        }

        self.disarm_timer(state);
        let ticket = Arc::new(FlushTicket::new());
        state.in_flight = Some(Arc::clone(&ticket));
        FlushRole::Lead {
            ticket,
            batch: state.buffer.snapshot(),
        }
    }

    fn finish(&self, role: FlushRole) -> Result<()> {
        match role {
            FlushRole::Idle => Ok(()),
            FlushRole::Join(ticket) => ticket.wait().map_err(StoreError::from),
            FlushRole::Lead { ticket, batch } => self.lead(ticket, batch),
        }
    }

    fn lead(&self, ticket: Arc<FlushTicket>, batch: Vec<PendingOp>) -> Result<()> {
        let table = self.options.table.as_str();
        let started = Instant::now();

        let committed = self.backend.transaction(&mut |tx: &mut dyn Transaction| {
            for op in &batch {
                self.strategy.apply(tx, table, op)?;
            }
            Ok(())
        });

        let outcome: FlushOutcome = match committed {
            Ok(()) => {
                self.state.lock().buffer.drain_committed(batch.len());
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    table,
                    ops = batch.len(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "flushed write buffer"
                );

                self.compactor
                    .maybe_compact(self.backend.as_ref(), table, insert_count(&batch))
                    .map(|_| ())
                    .map_err(|e| {
                        tracing::warn!(table, error = %e, "compaction after flush failed");
                        FlushFailure::Compaction(Arc::new(e))
                    })
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    table,
                    ops = batch.len(),
                    error = %e,
                    "flush failed, batch stays buffered"
                );
                Err(FlushFailure::Transaction(Arc::new(e)))
            }
        };

        {
            let mut state = self.state.lock();
            state.in_flight = None;
            // Keep a failed batch from being stranded until the next write
            if matches!(outcome, Err(FlushFailure::Transaction(_))) && !state.buffer.is_empty() {
                self.arm_timer(&mut state);
            }
        }
        self.idle.notify_all();
        ticket.complete(outcome.clone());

        outcome.map_err(StoreError::from)
    }

    fn arm_timer(&self, state: &mut State) {
        if let Some(timer) = &self.timer {
            if !state.timer_armed {
                state.timer_armed = true;
                timer.arm();
            }
        }
    }

    fn disarm_timer(&self, state: &mut State) {
        if let Some(timer) = &self.timer {
            if state.timer_armed {
                state.timer_armed = false;
                timer.disarm();
            }
        }
    }

    /// Called from the timer thread when the deadline passes
    pub fn on_timer(&self) {
        self.state.lock().timer_armed = false;
        if let Err(e) = self.flush() {
            tracing::warn!(table = %self.options.table, error = %e, "timed flush failed");
        }
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Flush, then compact regardless of the counter. Returns rows removed.
    pub fn compact_now(&self) -> Result<usize> {
        self.ensure_open()?;
        self.flush()?;
        if !self.strategy.needs_compaction() {
            return Ok(0);
        }
        self.compactor
            .compact(self.backend.as_ref(), &self.options.table)
            .map_err(|e| StoreError::Compaction(Arc::new(e)))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Latest value of `key`, after any pending writes are flushed
    pub fn read(&self, key: &[u8], options: &ReadOptions) -> Result<Value> {
        check_key(key)?;
        self.ensure_open()?;
        self.flush()?;

        let query = self.strategy.lookup(&self.options.table, key);
        let row = self
            .backend
            .query(&query)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)?;

        self.decode(&row, options)
    }

    /// One page of current rows for an iterator
    pub fn scan(&self, range: &KeyRange, reverse: bool, limit: Option<usize>) -> Result<Vec<LogRow>> {
        self.ensure_open()?;
        let query = self.strategy.scan(&self.options.table, range, reverse, limit);
        self.backend.query(&query)
    }

    /// Decode a stored value. Undecodable values read as `NotFound`.
    pub fn decode(&self, row: &LogRow, options: &ReadOptions) -> Result<Value> {
        codec::decode(&row.value, options).map_err(|e| {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                table = %self.options.table,
                row_id = row.id,
                key = %String::from_utf8_lossy(&row.key),
                error = %e,
                "stored value failed to decode, reporting key as not found"
            );
            StoreError::NotFound
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Flush everything, then mark closed and release the backend.
    ///
    /// A failed final flush transaction is returned and the store stays
    /// open, so the caller can retry instead of losing buffered writes.
    /// A failed compaction after a committed flush does not stop the close;
    /// it is returned once the store is closed.
    pub fn close(&self) -> Result<()> {
        let mut deferred = None;
        loop {
            let role = {
                let mut state = self.state.lock();
                if !state.open {
                    return Ok(());
                }
                match self.begin_flush(&mut state) {
                    FlushRole::Idle => {
                        state.open = false;
                        self.disarm_timer(&mut state);
                        break;
                    }
                    role => role,
                }
            };
            match self.finish(role) {
                Ok(()) => {}
                Err(e @ StoreError::Compaction(_)) => deferred = Some(e),
                Err(e) => return Err(e),
            }
        }

        // Wake writers parked on `idle` so they see the closed flag
        self.idle.notify_all();
        if let Some(timer) = &self.timer {
            timer.shutdown();
        }
        self.backend.close()?;
        tracing::info!(table = %self.options.table, backend = self.backend.name(), "store closed");

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
