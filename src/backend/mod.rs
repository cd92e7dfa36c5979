//! Backend Module
//!
//! The relational engine the store sits on, reduced to the capabilities
//! the write path needs.
//!
//! ## Capabilities
//! - create / drop the log table
//! - run one statement with autocommit
//! - run a closure inside one transaction (all-or-nothing)
//! - run a read query returning log rows
//!
//! ## Table Layout
//! ```text
//! ┌──────────────────────┬────────────────────┬──────────────────┐
//! │ id (auto-increment)  │ key (indexed)      │ value (JSON text)│
//! ├──────────────────────┼────────────────────┼──────────────────┤
//! │ 1                    │ "a"                │ "\"1\""          │
//! │ 2                    │ "b"                │ "\"x\""          │
//! │ 3                    │ "a"                │ "\"2\""  ← latest│
//! └──────────────────────┴────────────────────┴──────────────────┘
//! ```

pub mod memory;
pub mod sqlite;

use std::ops::Bound;

use crate::error::Result;

pub use memory::{MemoryBackend, MemoryStats};
pub use sqlite::SqliteBackend;

/// Optional engine capabilities, probed once at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    /// Native insert-or-update on key conflict
    pub upsert: bool,
}

/// Shape of the log table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,

    /// VARCHAR width for `key`, TEXT when unset
    pub key_size: Option<u32>,

    /// VARCHAR width for `value`, TEXT when unset
    pub value_size: Option<u32>,

    /// One row per key, enforced by a unique index
    pub unique_key: bool,
}

/// One row of the log table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub id: i64,
    pub key: Vec<u8>,
    pub value: String,
}

/// Key bounds for a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= lo.as_slice(),
            Bound::Excluded(lo) => key > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= hi.as_slice(),
            Bound::Excluded(hi) => key < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Write statements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement<'a> {
    /// Append a new row
    Insert { table: &'a str, key: &'a [u8], value: &'a str },

    /// Insert, or update the value of the existing row for `key`
    Upsert { table: &'a str, key: &'a [u8], value: &'a str },

    /// Remove every row for `key`
    DeleteKey { table: &'a str, key: &'a [u8] },

    /// Delete every row whose id is not the max id of its key
    Compact { table: &'a str },
}

/// Read queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query<'a> {
    /// The row with the max id for `key`
    Latest { table: &'a str, key: &'a [u8] },

    /// The row for `key` on a unique-key table
    Point { table: &'a str, key: &'a [u8] },

    /// Key-ordered rows within `range`
    Scan {
        table: &'a str,
        range: &'a KeyRange,
        reverse: bool,
        limit: Option<usize>,
        /// Only the max-id row of each key
        latest_only: bool,
    },

    /// Every row, by id
    Rows { table: &'a str },
}

/// Statement execution inside an open transaction
pub trait Transaction {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<usize>;
}

/// The relational engine behind an Engine
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn features(&self) -> Features;

    /// Create the table (and its key index) if it does not exist
    fn create_table(&self, schema: &TableSchema) -> Result<()>;

    /// Drop the table if it exists
    fn drop_table(&self, table: &str) -> Result<()>;

    /// Run a single statement with autocommit
    fn execute(&self, statement: &Statement<'_>) -> Result<usize>;

    /// Run `body` in one transaction.
    ///
    /// Commits when `body` returns `Ok`; otherwise nothing it did is kept.
    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()>;

    fn query(&self, query: &Query<'_>) -> Result<Vec<LogRow>>;

    /// Release the connection. Later calls fail with `Connection`.
    fn close(&self) -> Result<()>;
}

/// Adapter that runs statements through `Backend::execute`
pub(crate) struct AutoCommit<'a>(pub &'a dyn Backend);

impl Transaction for AutoCommit<'_> {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<usize> {
        self.0.execute(statement)
    }
}
