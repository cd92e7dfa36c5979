//! SQLite Backend
//!
//! `Backend` over a single rusqlite connection.
//!
//! Keys are bound as BLOBs so they order bytewise; values are TEXT.

use std::ops::Bound;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection};

use crate::error::{Result, StoreError};

use super::{Backend, Features, LogRow, Query, Statement, TableSchema, Transaction};

/// First SQLite release with `INSERT .. ON CONFLICT DO UPDATE`
const UPSERT_MIN_VERSION: i32 = 3_024_000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed relational engine
///
/// ## Concurrency:
/// - One connection behind a mutex; a transaction holds it until commit
/// - `None` after `close()`
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Option<Connection>>,
    features: Features,
}

impl SqliteBackend {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Connection(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Connection(format!("cannot open in-memory database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let features = Features {
            upsert: rusqlite::version_number() >= UPSERT_MIN_VERSION,
        };
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            features,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Connection("connection is closed".to_string()))?;
        f(conn)
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn features(&self) -> Features {
        self.features
    }

    fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let table = quote(&schema.name);
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     \"key\" {} NOT NULL, \
                     \"value\" {})",
                    table,
                    column_type(schema.key_size),
                    column_type(schema.value_size),
                ),
                [],
            )?;

            // A table keeps exactly one key index, matching the mode it was
            // last opened in. Switching to a unique index first collapses the
            // log to its latest row per key.
            let unique_index = format!("{}_key_uidx", schema.name);
            let plain_index = format!("{}_key_idx", schema.name);

            let tx = conn.transaction()?;
            if schema.unique_key {
                if !index_exists(&tx, &unique_index)? {
                    let removed = run_statement(&tx, &Statement::Compact { table: &schema.name })?;
                    tracing::debug!(
                        table = %schema.name,
                        removed,
                        "collapsed log before adding unique key index"
                    );
                    tx.execute(
                        &format!(
                            "CREATE UNIQUE INDEX {} ON {} (\"key\")",
                            quote(&unique_index),
                            table
                        ),
                        [],
                    )?;
                }
                tx.execute(&format!("DROP INDEX IF EXISTS {}", quote(&plain_index)), [])?;
            } else {
                tx.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {} (\"key\")",
                        quote(&plain_index),
                        table
                    ),
                    [],
                )?;
                tx.execute(&format!("DROP INDEX IF EXISTS {}", quote(&unique_index)), [])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), [])?;
            Ok(())
        })
    }

    fn execute(&self, statement: &Statement<'_>) -> Result<usize> {
        self.with_conn(|conn| run_statement(conn, statement))
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        self.with_conn(|conn| {
            // Dropping an uncommitted transaction rolls it back
            let tx = conn.transaction()?;
            body(&mut SqliteTransaction { conn: &tx })?;
            tx.commit()?;
            Ok(())
        })
    }

    fn query(&self, query: &Query<'_>) -> Result<Vec<LogRow>> {
        self.with_conn(|conn| run_query(conn, query))
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| StoreError::Connection(format!("close failed: {}", e))),
            None => Ok(()),
        }
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl Transaction for SqliteTransaction<'_> {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<usize> {
        run_statement(self.conn, statement)
    }
}

// =============================================================================
// SQL Rendering
// =============================================================================

fn run_statement(conn: &Connection, statement: &Statement<'_>) -> Result<usize> {
    let changed = match *statement {
        Statement::Insert { table, key, value } => conn
            .prepare_cached(&format!(
                "INSERT INTO {} (\"key\", \"value\") VALUES (?1, ?2)",
                quote(table)
            ))?
            .execute(params![key, value])?,
        Statement::Upsert { table, key, value } => conn
            .prepare_cached(&format!(
                "INSERT INTO {} (\"key\", \"value\") VALUES (?1, ?2) \
                 ON CONFLICT(\"key\") DO UPDATE SET \"value\" = excluded.\"value\"",
                quote(table)
            ))?
            .execute(params![key, value])?,
        Statement::DeleteKey { table, key } => conn
            .prepare_cached(&format!("DELETE FROM {} WHERE \"key\" = ?1", quote(table)))?
            .execute(params![key])?,
        Statement::Compact { table } => {
            let table = quote(table);
            conn.execute(
                &format!(
                    "DELETE FROM {t} WHERE id NOT IN \
                     (SELECT max(id) FROM {t} GROUP BY \"key\")",
                    t = table
                ),
                [],
            )?
        }
    };
    Ok(changed)
}

fn run_query(conn: &Connection, query: &Query<'_>) -> Result<Vec<LogRow>> {
    let (sql, args) = render_query(query);
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn render_query(query: &Query<'_>) -> (String, Vec<SqlValue>) {
    const COLUMNS: &str = "id, \"key\", \"value\"";

    match query {
        Query::Latest { table, key } => {
            let t = quote(table);
            (
                format!(
                    "SELECT {c} FROM {t} WHERE id = (SELECT max(id) FROM {t} WHERE \"key\" = ?1)",
                    c = COLUMNS,
                    t = t
                ),
                vec![SqlValue::Blob(key.to_vec())],
            )
        }
        Query::Point { table, key } => (
            format!("SELECT {} FROM {} WHERE \"key\" = ?1", COLUMNS, quote(table)),
            vec![SqlValue::Blob(key.to_vec())],
        ),
        Query::Scan {
            table,
            range,
            reverse,
            limit,
            latest_only,
        } => {
            let t = quote(table);
            let mut clauses = Vec::new();
            let mut args = Vec::new();

            if *latest_only {
                clauses.push(format!("id IN (SELECT max(id) FROM {} GROUP BY \"key\")", t));
            }
            for (bound, inclusive_op, exclusive_op) in
                [(&range.lower, ">=", ">"), (&range.upper, "<=", "<")]
            {
                let (op, key) = match bound {
                    Bound::Included(key) => (inclusive_op, key),
                    Bound::Excluded(key) => (exclusive_op, key),
                    Bound::Unbounded => continue,
                };
                args.push(SqlValue::Blob(key.clone()));
                clauses.push(format!("\"key\" {} ?{}", op, args.len()));
            }

            let mut sql = format!("SELECT {} FROM {}", COLUMNS, t);
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(if *reverse {
                " ORDER BY \"key\" DESC"
            } else {
                " ORDER BY \"key\" ASC"
            });
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            (sql, args)
        }
        Query::Rows { table } => (
            format!("SELECT {} FROM {} ORDER BY id", COLUMNS, quote(table)),
            Vec::new(),
        ),
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    let key = match row.get_ref(1)? {
        ValueRef::Blob(bytes) => bytes.to_vec(),
        ValueRef::Text(text) => text.to_vec(),
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                1,
                "key".to_string(),
                other.data_type(),
            ))
        }
    };
    Ok(LogRow {
        id: row.get(0)?,
        key,
        value: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
    })
}

fn index_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_type(size: Option<u32>) -> String {
    match size {
        Some(n) => format!("VARCHAR({})", n),
        None => "TEXT".to_string(),
    }
}
