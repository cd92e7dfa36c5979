//! # sqlkv
//!
//! A level-style key-value store on top of a relational table:
//! - Append-only log table: every put is a row, the highest id per key wins
//! - Write buffering with size and time triggers, flushed in one transaction
//! - Single-flight flushes shared by every caller that needs them
//! - Periodic compaction down to one row per key
//! - Upsert mode for engines with native insert-or-update
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine                                │
//! │      get / put / delete / batch / iter / flush / close       │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ writes                            │ reads
//!            ▼                                   │ (flush first)
//!   ┌─────────────────┐   size/timer/read  ┌─────▼──────────┐
//!   │  WriteBuffer    │ ─────────────────► │ Flush (1 txn)  │
//!   │ (per instance)  │                    └─────┬──────────┘
//!   └─────────────────┘                          │
//!                                          ┌─────▼──────────┐
//!                                          │   Compactor    │
//!                                          └─────┬──────────┘
//!                                                │
//!                        ┌───────────────────────▼──────────┐
//!                        │  Backend (SQLite / in-memory)     │
//!                        │  id | key | value                 │
//!                        └──────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod buffer;
pub mod backend;
pub mod strategy;
pub mod engine;
pub mod iterator;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use backend::{Backend, MemoryBackend, SqliteBackend};
pub use buffer::BatchOp;
pub use codec::{ReadOptions, Value};
pub use config::Options;
pub use engine::{Engine, EngineStats, WriteOptions};
pub use error::{Result, StoreError};
pub use iterator::{IterOptions, StoreIterator};
pub use strategy::WriteMode;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sqlkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
