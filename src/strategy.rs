//! Write Strategies
//!
//! How puts land in the table and how the current value of a key is found.
//!
//! - `AppendLog`: every put is a new row, the max id per key wins, and the
//!   table needs periodic compaction.
//! - `Upsert`: the key column is unique and a put updates the existing row,
//!   so the table never holds superseded rows.
//!
//! The strategy is picked once at open from `WriteMode` and the backend's
//! features.

use std::fmt;
use std::str::FromStr;

use crate::backend::{Features, KeyRange, Query, Statement, Transaction};
use crate::buffer::PendingOp;
use crate::error::{Result, StoreError};

/// Requested write strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    AppendLog,
    Upsert,

    /// Upsert when the backend supports it, append log otherwise
    Auto,
}

impl FromStr for WriteMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "append" | "appendlog" | "append_log" | "log" => Ok(WriteMode::AppendLog),
            "upsert" => Ok(WriteMode::Upsert),
            "auto" => Ok(WriteMode::Auto),
            other => Err(StoreError::Config(format!("unknown write mode '{}'", other))),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::AppendLog => write!(f, "append_log"),
            WriteMode::Upsert => write!(f, "upsert"),
            WriteMode::Auto => write!(f, "auto"),
        }
    }
}

/// Table-level write and lookup behaviour
pub trait WriteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the table keeps one row per key by constraint
    fn unique_keys(&self) -> bool;

    /// Whether superseded rows accumulate and need compaction
    fn needs_compaction(&self) -> bool;

    /// Statement that stores `value` under `key`
    fn put_statement<'a>(&self, table: &'a str, key: &'a [u8], value: &'a str) -> Statement<'a>;

    /// Query returning the current row for `key`
    fn lookup<'a>(&self, table: &'a str, key: &'a [u8]) -> Query<'a>;

    /// Query returning current rows in key order
    fn scan<'a>(
        &self,
        table: &'a str,
        range: &'a KeyRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Query<'a> {
        Query::Scan {
            table,
            range,
            reverse,
            limit,
            latest_only: self.needs_compaction(),
        }
    }

    /// Apply one op through `tx`
    fn apply(&self, tx: &mut dyn Transaction, table: &str, op: &PendingOp) -> Result<()> {
        let statement = match op {
            PendingOp::Put { key, value } => self.put_statement(table, key, value),
            PendingOp::Delete { key } => Statement::DeleteKey { table, key: &key[..] },
        };
        tx.execute(&statement)?;
        Ok(())
    }
}

/// Append-only log: one row per write, latest id wins
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendLog;

impl WriteStrategy for AppendLog {
    fn name(&self) -> &'static str {
        "append_log"
    }

    fn unique_keys(&self) -> bool {
        false
    }

    fn needs_compaction(&self) -> bool {
        true
    }

    fn put_statement<'a>(&self, table: &'a str, key: &'a [u8], value: &'a str) -> Statement<'a> {
        Statement::Insert { table, key, value }
    }

    fn lookup<'a>(&self, table: &'a str, key: &'a [u8]) -> Query<'a> {
        Query::Latest { table, key }
    }
}

/// Insert-or-update on a unique key column
#[derive(Debug, Clone, Copy, Default)]
pub struct Upsert;

impl WriteStrategy for Upsert {
    fn name(&self) -> &'static str {
        "upsert"
    }

    fn unique_keys(&self) -> bool {
        true
    }

    fn needs_compaction(&self) -> bool {
        false
    }

    fn put_statement<'a>(&self, table: &'a str, key: &'a [u8], value: &'a str) -> Statement<'a> {
        Statement::Upsert { table, key, value }
    }

    fn lookup<'a>(&self, table: &'a str, key: &'a [u8]) -> Query<'a> {
        Query::Point { table, key }
    }
}

/// Pick the strategy for `mode` given what the backend can do
pub fn select(mode: WriteMode, features: Features) -> Box<dyn WriteStrategy> {
    match mode {
        WriteMode::AppendLog => Box::new(AppendLog),
        WriteMode::Upsert if features.upsert => Box::new(Upsert),
        WriteMode::Upsert => {
            tracing::warn!("backend has no upsert support, falling back to append log");
            Box::new(AppendLog)
        }
        WriteMode::Auto if features.upsert => Box::new(Upsert),
        WriteMode::Auto => Box::new(AppendLog),
    }
}
