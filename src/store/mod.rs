// ABOUTME: Relational store interface consumed by schema sync and the batch writer
// ABOUTME: Also hosts the transaction depth counter and the rendered row tuple type

pub mod dialect;
pub mod mysql;
pub mod postgres;

pub use dialect::{Dialect, PRIMARY_KEY, SYNC_HISTORY_TABLE};
pub use mysql::MySqlStore;
pub use postgres::PostgresStore;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::StorageColumn;

/// Literal written for missing values.
pub const NULL_LITERAL: &str = "NULL";

/// Format used for timestamps written to and read from the store.
pub const STORE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A local relational database used as the replication target.
///
/// Implementations hold a single connection; at most one transaction is open
/// at a time and nesting follows [`TransactionDepth`].
#[allow(async_fn_in_trait)]
pub trait RelationalStore {
    fn dialect(&self) -> Dialect;

    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Column name (lowercase) to storage type for an existing table.
    async fn get_columns(&mut self, table: &str) -> Result<BTreeMap<String, String>>;

    async fn create_table(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()>;

    async fn add_columns(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()>;

    /// Drop columns from a table. The replication engine never calls this.
    async fn drop_columns(&mut self, table: &str, columns: &[String]) -> Result<()>;

    /// Quote and escape a value for inclusion in a statement.
    fn quote(&self, value: &str) -> String {
        self.dialect().quote_literal(value)
    }

    /// Open a transaction, or join the open one when `continue_existing` is set.
    async fn begin_transaction(&mut self, continue_existing: bool) -> Result<()>;

    /// Leave one nesting level; `final_commit` commits regardless of depth.
    async fn commit(&mut self, final_commit: bool) -> Result<()>;

    /// Abort the open transaction completely, whatever the nesting depth.
    async fn rollback(&mut self) -> Result<()>;

    /// Start time of the most recent completed sync of `object`.
    async fn most_recent_sync(&mut self, object: &str) -> Result<Option<DateTime<Utc>>>;

    /// Append a sync history row.
    async fn record_sync(&mut self, object: &str, started_at: DateTime<Utc>) -> Result<()>;

    /// Write `rows` in one multi-row statement, replacing non-key columns on
    /// primary-key conflict. Returns the number of rows sent.
    async fn upsert_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[ValueTuple],
    ) -> Result<u64>;
}

/// Re-entrant transaction bookkeeping.
///
/// The counter only decides when the physical `BEGIN`, `COMMIT` and
/// `ROLLBACK` are issued; stores execute them on their own connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransactionDepth {
    depth: u32,
}

impl TransactionDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_open(&self) -> bool {
        self.depth > 0
    }

    /// Returns true when a physical transaction must be started.
    pub fn begin(&mut self, continue_existing: bool) -> Result<bool> {
        if self.depth > 0 && !continue_existing {
            bail!("Transaction already open (depth {})", self.depth);
        }
        self.depth += 1;
        Ok(self.depth == 1)
    }

    /// Returns true when the physical transaction must be committed.
    pub fn commit(&mut self, final_commit: bool) -> Result<bool> {
        if self.depth == 0 {
            bail!("No open transaction to commit");
        }
        self.depth -= 1;
        if self.depth > 0 && !final_commit {
            return Ok(false);
        }
        self.depth = 0;
        Ok(true)
    }

    /// Reset to depth 0. Returns true when a transaction was open.
    pub fn rollback(&mut self) -> bool {
        let was_open = self.depth > 0;
        self.depth = 0;
        was_open
    }
}

/// One transformed row, as SQL literals ready for a multi-row `VALUES` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTuple {
    values: Vec<String>,
}

impl ValueTuple {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for ValueTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.values.join(","))
    }
}

/// Format a timestamp the way the store columns hold it.
pub fn format_store_datetime(at: &DateTime<Utc>) -> String {
    at.format(STORE_DATETIME_FORMAT).to_string()
}

/// Parse a timestamp read back from the store, interpreted as UTC.
pub fn parse_store_datetime(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), STORE_DATETIME_FORMAT)
        .map_err(|e| anyhow::anyhow!("Invalid stored timestamp '{}': {}", value, e))?;
    Ok(naive.and_utc())
}
