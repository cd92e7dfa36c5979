//! Engine Module
//!
//! The key-value store: level-style get/put/delete/batch/iterate on top of
//! a relational log table.
//!
//! ## Responsibilities
//! - Create the log table and pick the write strategy at open
//! - Buffer writes and flush them in single transactions
//! - Keep the append log bounded through periodic compaction
//! - Make reads observe every write issued before them
//!
//! ## Data Flow
//! ```text
//!  put/delete/batch
//!        │
//!        ├── buffering off ──► insert/upsert/delete ──┐
//!        │                                            │
//!        ▼                                            ▼
//!  ┌─────────────┐  size / timer / read   ┌──────────────────┐
//!  │ WriteBuffer │ ─────────────────────► │ flush (1 txn)    │
//!  └─────────────┘                        └────────┬─────────┘
//!                                                  ▼
//!                                         ┌──────────────────┐
//!                                         │ Compactor        │
//!                                         └────────┬─────────┘
//!                                                  ▼
//!                                          log table (backend)
//! ```

mod compactor;
pub(crate) mod inner;
mod timer;

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::backend::{Backend, SqliteBackend, TableSchema};
use crate::buffer::BatchOp;
use crate::codec::{ReadOptions, Value};
use crate::config::Options;
use crate::error::Result;
use crate::iterator::{IterOptions, StoreIterator};
use crate::strategy;

use self::inner::Core;

pub use self::inner::EngineStats;

/// Per-write options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Flush (and wait for the flush) before returning
    pub sync: bool,
}

/// The key-value store
///
/// ## Concurrency Model
///
/// All methods take `&self`; share an `Engine` across threads by reference
/// or `Arc`.
///
/// - **Buffered writes** append to the write buffer under one mutex. While
///   a flush is in flight new writes wait for it to finish, so a flush
///   never races with appends to its own batch.
/// - **Flushes** are single-flight: at most one transaction per engine; any
///   caller that needs the buffer empty joins the running one.
/// - **Reads** flush (or join the flush) first, then query the table.
pub struct Engine {
    core: Arc<Core>,

    /// Flush timer thread, when buffering with a max delay
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open a store on `backend`
    ///
    /// On open:
    /// 1. Pick the write strategy from `options.write_mode` and backend features
    /// 2. Create the log table if it does not exist
    /// 3. Start the flush timer if buffering with a max delay
    pub fn open(backend: impl Backend + 'static, options: Options) -> Result<Self> {
        let strategy = strategy::select(options.write_mode, backend.features());

        backend.create_table(&TableSchema {
            name: options.table.clone(),
            key_size: options.key_size,
            value_size: options.value_size,
            unique_key: strategy.unique_keys(),
        })?;

        let (timer, timer_rx) = if options.buffering() && !options.max_delay.is_zero() {
            let (handle, rx) = timer::channel();
            (Some(handle), Some(rx))
        } else {
            (None, None)
        };

        tracing::info!(
            backend = backend.name(),
            table = %options.table,
            strategy = strategy.name(),
            write_buffer_size = options.write_buffer_size,
            max_delay_ms = options.max_delay.as_millis() as u64,
            "store opened"
        );

        let max_delay = options.max_delay;
        let core = Arc::new(Core::new(Box::new(backend), strategy, options, timer));

        let timer_thread = match timer_rx {
            Some(rx) => Some(timer::spawn(rx, Arc::downgrade(&core), max_delay)?),
            None => None,
        };

        Ok(Self {
            core,
            timer_thread: Mutex::new(timer_thread),
        })
    }

    /// Open a store on a SQLite database file
    pub fn open_path(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        Self::open(SqliteBackend::open(path)?, options)
    }

    /// Drop the backing table
    pub fn destroy(backend: &dyn Backend, options: &Options) -> Result<()> {
        backend.drop_table(&options.table)?;
        tracing::info!(backend = backend.name(), table = %options.table, "store destroyed");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the value of `key` as bytes
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        match self.core.read(key.as_ref(), &ReadOptions::default())? {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Json(json) => Ok(serde_json::to_vec(&json)?),
        }
    }

    /// Get the value of `key`, shaped per `options`
    pub fn get_with(&self, key: impl AsRef<[u8]>, options: &ReadOptions) -> Result<Value> {
        self.core.read(key.as_ref(), options)
    }

    /// Iterate current key/value pairs in key order
    pub fn iter(&self, options: IterOptions) -> Result<StoreIterator> {
        self.core.ensure_open()?;
        self.core.flush()?;
        Ok(StoreIterator::new(Arc::clone(&self.core), options))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl Into<Value>) -> Result<()> {
        self.write(vec![BatchOp::put(key, value)], &WriteOptions::default())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.write(vec![BatchOp::del(key)], &WriteOptions::default())
    }

    /// Apply puts and deletes in order, as one unit
    pub fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.write(ops, &WriteOptions::default())
    }

    pub fn write(&self, ops: Vec<BatchOp>, options: &WriteOptions) -> Result<()> {
        let pending = ops
            .into_iter()
            .map(BatchOp::into_pending)
            .collect::<Result<Vec<_>>>()?;
        self.core.write(pending, options.sync)
    }

    /// Commit everything in the write buffer
    pub fn flush(&self) -> Result<()> {
        self.core.ensure_open()?;
        self.core.flush()
    }

    /// Collapse the log to one row per key now. Returns rows removed.
    pub fn compact(&self) -> Result<usize> {
        self.core.compact_now()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush pending writes and release the backend
    ///
    /// If the final flush transaction fails the error is returned and the
    /// engine stays open with the writes still buffered. If only the
    /// compaction after it fails, the engine closes and the `Compaction`
    /// error is returned.
    pub fn close(&self) -> Result<()> {
        let result = self.core.close();
        if !self.core.is_open() {
            if let Some(handle) = self.timer_thread.lock().take() {
                if handle.join().is_err() {
                    tracing::warn!("flush timer thread panicked");
                }
            }
        }
        result
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn options(&self) -> &Options {
        self.core.options()
    }

    /// Name of the selected write strategy
    pub fn strategy_name(&self) -> &'static str {
        self.core.strategy().name()
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.backend().name()
    }

    /// Number of ops waiting in the write buffer
    pub fn buffered_len(&self) -> usize {
        self.core.buffered_len()
    }

    pub fn stats(&self) -> EngineStats {
        self.core.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        match self.close() {
            Ok(()) => {}
            Err(e) if self.core.is_open() => {
                tracing::warn!(error = %e, "closing store on drop failed, buffered writes lost");
            }
            Err(e) => tracing::warn!(error = %e, "store closed on drop with an error"),
        }
    }
}
