// ABOUTME: SQL dialect differences between the supported relational stores
// ABOUTME: Builds DDL and multi-row conflict-replace upsert statements

use std::fmt;
use std::str::FromStr;

use super::ValueTuple;
use crate::error::ReplicationError;
use crate::schema::StorageColumn;
use crate::utils::{quote_ident, quote_literal, quote_mysql_ident, quote_mysql_literal};

/// Control table holding one row per completed object sync.
pub const SYNC_HISTORY_TABLE: &str = "_sync_history";

/// Primary key column of every replicated table.
pub const PRIMARY_KEY: &str = "id";

/// Column type used for `id` when the describe call did not provide one.
pub const DEFAULT_ID_TYPE: &str = "VARCHAR(18)";

/// Relational store dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mysql,
    Postgres,
}

impl FromStr for Dialect {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "postgres" | "postgresql" | "pgsql" => Ok(Dialect::Postgres),
            other => Err(ReplicationError::UnsupportedType(format!(
                "unsupported database type ({})",
                other
            ))),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Mysql => write!(f, "mysql"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

impl Dialect {
    pub fn quote_ident(&self, identifier: &str) -> String {
        match self {
            Dialect::Mysql => quote_mysql_ident(identifier),
            Dialect::Postgres => quote_ident(identifier),
        }
    }

    /// Quote and escape a string value.
    pub fn quote_literal(&self, value: &str) -> String {
        match self {
            Dialect::Mysql => quote_mysql_literal(value),
            Dialect::Postgres => quote_literal(value),
        }
    }

    /// Unquoted literal for a boolean column value.
    pub fn bool_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Mysql, true) => "1",
            (Dialect::Mysql, false) => "0",
            (Dialect::Postgres, true) => "TRUE",
            (Dialect::Postgres, false) => "FALSE",
        }
    }

    /// `CREATE TABLE` with `id` as the sole primary key.
    ///
    /// `id` is always emitted first; if `columns` does not carry it the
    /// default identifier type is used.
    pub fn create_table_sql(&self, table: &str, columns: &[StorageColumn]) -> String {
        let id_type = columns
            .iter()
            .find(|c| c.name == PRIMARY_KEY)
            .map(|c| c.storage_type.as_str())
            .unwrap_or(DEFAULT_ID_TYPE);

        let mut definitions = vec![format!("{} {} NOT NULL", self.quote_ident(PRIMARY_KEY), id_type)];
        definitions.extend(
            columns
                .iter()
                .filter(|c| c.name != PRIMARY_KEY)
                .map(|c| format!("{} {}", self.quote_ident(&c.name), c.storage_type)),
        );
        definitions.push(format!("PRIMARY KEY ({})", self.quote_ident(PRIMARY_KEY)));

        format!(
            "CREATE TABLE {} ({})",
            self.quote_ident(table),
            definitions.join(", ")
        )
    }

    /// One `ALTER TABLE` adding every column but `id`.
    ///
    /// Returns `None` when there is nothing to add.
    pub fn add_columns_sql(&self, table: &str, columns: &[StorageColumn]) -> Option<String> {
        let additions: Vec<String> = columns
            .iter()
            .filter(|c| c.name != PRIMARY_KEY)
            .map(|c| format!("ADD COLUMN {} {}", self.quote_ident(&c.name), c.storage_type))
            .collect();

        if additions.is_empty() {
            return None;
        }

        Some(format!(
            "ALTER TABLE {} {}",
            self.quote_ident(table),
            additions.join(", ")
        ))
    }

    /// One `ALTER TABLE` dropping the given columns. Never drops `id`.
    pub fn drop_columns_sql(&self, table: &str, columns: &[String]) -> Option<String> {
        let drops: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != PRIMARY_KEY)
            .map(|c| format!("DROP COLUMN {}", self.quote_ident(c)))
            .collect();

        if drops.is_empty() {
            return None;
        }

        Some(format!(
            "ALTER TABLE {} {}",
            self.quote_ident(table),
            drops.join(", ")
        ))
    }

    /// Build a multi-row conflict-replace upsert.
    ///
    /// MySQL:
    /// ```sql
    /// INSERT INTO `t` (`id`, `name`) VALUES ('a','x'),('b','y')
    /// ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)
    /// ```
    /// PostgreSQL:
    /// ```sql
    /// INSERT INTO "t" ("id", "name") VALUES ('a','x'),('b','y')
    /// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
    /// ```
    pub fn upsert_sql(&self, table: &str, columns: &[String], rows: &[ValueTuple]) -> String {
        let quoted_columns: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let values: Vec<String> = rows.iter().map(|r| r.to_string()).collect();

        let update_columns: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != PRIMARY_KEY)
            .map(|c| {
                let col = self.quote_ident(c);
                match self {
                    Dialect::Mysql => format!("{} = VALUES({})", col, col),
                    Dialect::Postgres => format!("{} = EXCLUDED.{}", col, col),
                }
            })
            .collect();

        let conflict_clause = match (self, update_columns.is_empty()) {
            (Dialect::Mysql, true) => format!(
                "ON DUPLICATE KEY UPDATE {0} = {0}",
                self.quote_ident(PRIMARY_KEY)
            ),
            (Dialect::Mysql, false) => {
                format!("ON DUPLICATE KEY UPDATE {}", update_columns.join(", "))
            }
            (Dialect::Postgres, true) => format!(
                "ON CONFLICT ({}) DO NOTHING",
                self.quote_ident(PRIMARY_KEY)
            ),
            (Dialect::Postgres, false) => format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                self.quote_ident(PRIMARY_KEY),
                update_columns.join(", ")
            ),
        };

        format!(
            "INSERT INTO {} ({}) VALUES {} {}",
            self.quote_ident(table),
            quoted_columns.join(", "),
            values.join(","),
            conflict_clause
        )
    }

    /// DDL for the sync history control table.
    pub fn sync_history_table_sql(&self) -> String {
        match self {
            Dialect::Mysql => format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id INT NOT NULL AUTO_INCREMENT, \
                 object_name VARCHAR(80) NOT NULL, \
                 sync_time DATETIME NOT NULL, \
                 PRIMARY KEY (id), \
                 INDEX idx_sync_history_object (object_name, sync_time))",
                SYNC_HISTORY_TABLE
            ),
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {0} (\
                 id SERIAL PRIMARY KEY, \
                 object_name VARCHAR(80) NOT NULL, \
                 sync_time TIMESTAMP NOT NULL); \
                 CREATE INDEX IF NOT EXISTS idx_sync_history_object ON {0} (object_name, sync_time)",
                SYNC_HISTORY_TABLE
            ),
        }
    }
}
