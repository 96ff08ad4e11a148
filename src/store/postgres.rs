// ABOUTME: PostgreSQL implementation of the relational store
// ABOUTME: tokio-postgres client with optional native TLS, ON CONFLICT upserts

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio_postgres::{Client, NoTls};

use super::{
    parse_store_datetime, Dialect, RelationalStore, TransactionDepth, ValueTuple,
    SYNC_HISTORY_TABLE,
};
use crate::config::StoreConfig;
use crate::error::ReplicationError;
use crate::schema::StorageColumn;
use crate::utils::validate_identifier;

const DEFAULT_PORT: u16 = 5432;

/// PostgreSQL replication target. Tables live in the connection's current schema.
pub struct PostgresStore {
    client: Client,
    tx: TransactionDepth,
}

impl PostgresStore {
    /// Connect using the store section of the configuration and make sure the
    /// sync history table exists.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port.unwrap_or(DEFAULT_PORT))
            .user(&config.user)
            .password(&config.pass)
            .dbname(&config.database);

        let client = if config.tls {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .context("Failed to build TLS connector")?;
            let connector = postgres_native_tls::MakeTlsConnector::new(connector);
            let (client, connection) = pg.connect(connector).await.with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL database '{}' on {}",
                    config.database, config.host
                )
            })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        } else {
            let (client, connection) = pg.connect(NoTls).await.with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL database '{}' on {}",
                    config.database, config.host
                )
            })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        };

        Self::initialise(client).await
    }

    /// Connect with a `postgresql://` URL, without TLS.
    pub async fn connect_url(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .context("Failed to connect to PostgreSQL database")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });
        Self::initialise(client).await
    }

    async fn initialise(client: Client) -> Result<Self> {
        let store = Self {
            client,
            tx: TransactionDepth::new(),
        };
        store
            .client
            .batch_execute(&Dialect::Postgres.sync_history_table_sql())
            .await
            .context("Failed to create sync history table")?;
        Ok(store)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        tracing::debug!("postgres: {}", sql);
        self.client
            .batch_execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {}", sql))
    }
}

/// Rebuild a full type string from information_schema parts.
fn column_type_string(data_type: &str, length: Option<i32>, precision: Option<i32>, scale: Option<i32>) -> String {
    match (data_type, length, precision) {
        (_, Some(len), _) => format!("{}({})", data_type, len),
        ("numeric", None, Some(p)) => format!("numeric({},{})", p, scale.unwrap_or(0)),
        _ => data_type.to_string(),
    }
}

impl RelationalStore for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_name = $1
                 )",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to check whether table '{}' exists", table))?;
        Ok(row.get(0))
    }

    async fn get_columns(&mut self, table: &str) -> Result<BTreeMap<String, String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text, data_type::text,
                        character_maximum_length::int4, numeric_precision::int4, numeric_scale::int4
                 FROM information_schema.columns
                 WHERE table_schema = current_schema() AND table_name = $1
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to get columns for '{}'", table))?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let column_type = column_type_string(&data_type, row.get(2), row.get(3), row.get(4));
                (name.to_lowercase(), column_type.to_lowercase())
            })
            .collect())
    }

    async fn create_table(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(&column.name)?;
        }
        self.execute(&Dialect::Postgres.create_table_sql(table, columns))
            .await
    }

    async fn add_columns(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(&column.name)?;
        }
        match Dialect::Postgres.add_columns_sql(table, columns) {
            Some(sql) => self.execute(&sql).await,
            None => Ok(()),
        }
    }

    async fn drop_columns(&mut self, table: &str, columns: &[String]) -> Result<()> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }
        match Dialect::Postgres.drop_columns_sql(table, columns) {
            Some(sql) => self.execute(&sql).await,
            None => Ok(()),
        }
    }

    async fn begin_transaction(&mut self, continue_existing: bool) -> Result<()> {
        if self.tx.begin(continue_existing)? {
            if let Err(e) = self.execute("BEGIN").await {
                self.tx.rollback();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn commit(&mut self, final_commit: bool) -> Result<()> {
        if self.tx.commit(final_commit)? {
            if let Err(e) = self.execute("COMMIT").await {
                if let Err(rollback_err) = self.client.batch_execute("ROLLBACK").await {
                    tracing::error!("Rollback after failed commit also failed: {:?}", rollback_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.tx.rollback() {
            self.execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn most_recent_sync(&mut self, object: &str) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT to_char(MAX(sync_time), 'YYYY-MM-DD HH24:MI:SS') FROM {} \
                     WHERE object_name = $1",
                    SYNC_HISTORY_TABLE
                ),
                &[&object],
            )
            .await
            .with_context(|| format!("Failed to read most recent sync for '{}'", object))?;

        let latest: Option<String> = row.get(0);
        latest.map(|s| parse_store_datetime(&s)).transpose()
    }

    async fn record_sync(&mut self, object: &str, started_at: DateTime<Utc>) -> Result<()> {
        let sync_time = started_at.naive_utc();
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (object_name, sync_time) VALUES ($1, $2)",
                    SYNC_HISTORY_TABLE
                ),
                &[&object, &sync_time],
            )
            .await
            .with_context(|| format!("Failed to record sync history for '{}'", object))?;
        Ok(())
    }

    async fn upsert_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[ValueTuple],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = Dialect::Postgres.upsert_sql(table, columns, rows);
        if let Err(e) = self.client.batch_execute(&sql).await {
            tracing::debug!("Failed upsert statement for {}: {}", table, sql);
            return Err(ReplicationError::transaction(table, e.to_string(), &sql).into());
        }

        Ok(rows.len() as u64)
    }
}
