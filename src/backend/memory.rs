//! In-memory Backend
//!
//! A `Backend` with no external engine behind it. Each table is an ordered
//! map of rows; a transaction runs against a staged copy of every table and
//! replaces the originals only on commit.
//!
//! Clones share the same data but act as separate connections: closing one
//! leaves the others usable.
//!
//! Tests drive the write path through this backend because it can:
//! - fail the next N transactions or compactions
//! - hold each transaction open for a fixed delay
//! - count transactions, statements and compactions, and record how many
//!   transactions were ever running at once

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

use super::{Backend, Features, LogRow, Query, Statement, TableSchema, Transaction};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    /// id → (key, value)
    rows: BTreeMap<i64, (Vec<u8>, String)>,
    last_id: i64,
    unique_key: bool,
}

impl MemoryTable {
    fn insert(&mut self, key: &[u8], value: &str) -> usize {
        self.last_id += 1;
        self.rows.insert(self.last_id, (key.to_vec(), value.to_string()));
        1
    }

    fn find(&self, key: &[u8]) -> Option<i64> {
        self.rows
            .iter()
            .filter(|(_, (k, _))| k.as_slice() == key)
            .map(|(id, _)| *id)
            .next_back()
    }

    /// Keep only the latest row per key. Returns rows removed.
    fn collapse(&mut self) -> usize {
        let mut latest: HashMap<Vec<u8>, i64> = HashMap::new();
        for (id, (key, _)) in &self.rows {
            latest.insert(key.clone(), *id);
        }
        let before = self.rows.len();
        self.rows.retain(|id, (key, _)| latest.get(key) == Some(id));
        before - self.rows.len()
    }

    fn row(&self, id: i64) -> Option<LogRow> {
        self.rows.get(&id).map(|(key, value)| LogRow {
            id,
            key: key.clone(),
            value: value.clone(),
        })
    }
}

type Tables = HashMap<String, MemoryTable>;

#[derive(Debug, Default)]
struct Faults {
    transactions: usize,
    compactions: usize,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    delay: Mutex<Duration>,

    transactions: AtomicU64,
    statements: AtomicU64,
    compactions: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Counters observed by a MemoryBackend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Transactions started (committed or not)
    pub transactions: u64,

    /// Statements executed, inside or outside transactions
    pub statements: u64,

    /// Compaction statements executed successfully
    pub compactions: u64,

    /// Highest number of transactions running at the same time
    pub max_concurrent_transactions: usize,
}

/// In-process relational backend
#[derive(Debug)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    features: Features,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend that supports upsert
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            features: Features { upsert: true },
            closed: AtomicBool::new(false),
        }
    }

    /// Create an empty backend that reports no upsert support
    pub fn without_upsert() -> Self {
        Self {
            features: Features { upsert: false },
            ..Self::new()
        }
    }

    /// Make the next `count` transactions fail at commit
    pub fn fail_next_transactions(&self, count: usize) {
        self.shared.faults.lock().transactions = count;
    }

    /// Make the next `count` compaction statements fail
    pub fn fail_next_compactions(&self, count: usize) {
        self.shared.faults.lock().compactions = count;
    }

    /// Hold every transaction open for `delay`
    pub fn set_transaction_delay(&self, delay: Duration) {
        *self.shared.delay.lock() = delay;
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            transactions: self.shared.transactions.load(Ordering::SeqCst),
            statements: self.shared.statements.load(Ordering::SeqCst),
            compactions: self.shared.compactions.load(Ordering::SeqCst),
            max_concurrent_transactions: self.shared.max_active.load(Ordering::SeqCst),
        }
    }

    /// Every row of `table`, by id
    pub fn rows(&self, table: &str) -> Result<Vec<LogRow>> {
        self.query(&Query::Rows { table })
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.shared.tables.lock().contains_key(table)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection is closed".to_string()));
        }
        Ok(())
    }

    fn apply(&self, tables: &mut Tables, statement: &Statement<'_>) -> Result<usize> {
        self.shared.statements.fetch_add(1, Ordering::SeqCst);

        match *statement {
            Statement::Insert { table, key, value } => {
                let t = table_mut(tables, table)?;
                if t.unique_key && t.find(key).is_some() {
                    return Err(StoreError::Backend(format!(
                        "UNIQUE constraint failed: {}.key",
                        table
                    )));
                }
                Ok(t.insert(key, value))
            }
            Statement::Upsert { table, key, value } => {
                let t = table_mut(tables, table)?;
                if !t.unique_key {
                    return Err(StoreError::Backend(
                        "ON CONFLICT clause does not match any unique constraint".to_string(),
                    ));
                }
                match t.find(key) {
                    Some(id) => {
                        if let Some(row) = t.rows.get_mut(&id) {
                            row.1 = value.to_string();
                        }
                        Ok(1)
                    }
                    None => Ok(t.insert(key, value)),
                }
            }
            Statement::DeleteKey { table, key } => {
                let t = table_mut(tables, table)?;
                let before = t.rows.len();
                t.rows.retain(|_, (k, _)| k.as_slice() != key);
                Ok(before - t.rows.len())
            }
            Statement::Compact { table } => {
                {
                    let mut faults = self.shared.faults.lock();
                    if faults.compactions > 0 {
                        faults.compactions -= 1;
                        return Err(StoreError::Backend("injected compaction failure".to_string()));
                    }
                }
                let removed = table_mut(tables, table)?.collapse();
                self.shared.compactions.fetch_add(1, Ordering::SeqCst);
                Ok(removed)
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            features: self.features,
            closed: AtomicBool::new(false),
        }
    }
}

fn table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| StoreError::Backend(format!("no such table: {}", name)))
}

fn table_ref<'a>(tables: &'a Tables, name: &str) -> Result<&'a MemoryTable> {
    tables
        .get(name)
        .ok_or_else(|| StoreError::Backend(format!("no such table: {}", name)))
}

struct MemoryTransaction<'a> {
    backend: &'a MemoryBackend,
    staged: &'a mut Tables,
}

impl Transaction for MemoryTransaction<'_> {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<usize> {
        self.backend.apply(self.staged, statement)
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn features(&self) -> Features {
        self.features
    }

    fn create_table(&self, schema: &TableSchema) -> Result<()> {
        self.check_open()?;
        let mut tables = self.shared.tables.lock();
        let table = tables.entry(schema.name.clone()).or_default();
        // Same rule as a unique index created over an existing log
        if schema.unique_key && !table.unique_key {
            table.collapse();
        }
        table.unique_key = schema.unique_key;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.check_open()?;
        self.shared.tables.lock().remove(table);
        Ok(())
    }

    fn execute(&self, statement: &Statement<'_>) -> Result<usize> {
        self.check_open()?;
        let mut tables = self.shared.tables.lock();
        self.apply(&mut tables, statement)
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        self.check_open()?;
        self.shared.transactions.fetch_add(1, Ordering::SeqCst);
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active.fetch_max(active, Ordering::SeqCst);

        let result = (|| {
            let mut tables = self.shared.tables.lock();
            let delay = *self.shared.delay.lock();
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            let mut staged = tables.clone();
            body(&mut MemoryTransaction {
                backend: self,
                staged: &mut staged,
            })?;

            let mut faults = self.shared.faults.lock();
            if faults.transactions > 0 {
                faults.transactions -= 1;
                return Err(StoreError::Backend("injected transaction failure".to_string()));
            }
            *tables = staged;
            Ok(())
        })();

        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn query(&self, query: &Query<'_>) -> Result<Vec<LogRow>> {
        self.check_open()?;
        let tables = self.shared.tables.lock();

        let rows = match query {
            Query::Latest { table, key } | Query::Point { table, key } => {
                let t = table_ref(&tables, table)?;
                t.find(key).and_then(|id| t.row(id)).into_iter().collect()
            }
            Query::Scan {
                table,
                range,
                reverse,
                limit,
                latest_only,
            } => {
                let t = table_ref(&tables, table)?;
                let mut rows: Vec<LogRow> = t
                    .rows
                    .iter()
                    .filter(|(_, (key, _))| range.contains(key))
                    .map(|(id, (key, value))| LogRow {
                        id: *id,
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect();
                if *latest_only {
                    let mut latest: BTreeMap<Vec<u8>, LogRow> = BTreeMap::new();
                    for row in rows {
                        latest.insert(row.key.clone(), row);
                    }
                    rows = latest.into_values().collect();
                }
                rows.sort_by(|a, b| a.key.cmp(&b.key).then(a.id.cmp(&b.id)));
                if *reverse {
                    rows.reverse();
                }
                if let Some(limit) = limit {
                    rows.truncate(*limit);
                }
                rows
            }
            Query::Rows { table } => {
                let t = table_ref(&tables, table)?;
                t.rows.keys().filter_map(|id| t.row(*id)).collect()
            }
        };
        Ok(rows)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
