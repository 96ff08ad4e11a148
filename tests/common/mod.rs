// ABOUTME: Test doubles shared by the integration tests
// ABOUTME: An in-memory relational store and a fake org behind the bulk query API

#![allow(dead_code)]

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use force_replicator::config::ObjectConfig;
use force_replicator::remote::{BatchState, BatchStatus, BulkApi, BulkExtractor, PollSettings};
use force_replicator::schema::{FieldDescriptor, StorageColumn};
use force_replicator::store::{Dialect, RelationalStore, TransactionDepth, ValueTuple, PRIMARY_KEY};
use force_replicator::transform::parse_remote_datetime;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    /// Column name to storage type
    pub columns: BTreeMap<String, String>,
    /// Primary key literal to column literals
    pub rows: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Snapshot {
    tables: BTreeMap<String, MemoryTable>,
    history: Vec<(String, DateTime<Utc>)>,
}

/// Relational store kept in memory. Values are stored as the SQL literals
/// the replicator renders, and a rollback restores the state at `BEGIN`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, MemoryTable>,
    history: Vec<(String, DateTime<Utc>)>,
    tx: TransactionDepth,
    snapshot: Option<Snapshot>,
    pub ddl: Vec<String>,
    pub upsert_calls: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Fail the upsert with this 1-based call number
    pub fail_upsert_call: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.get(name)
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|t| t.columns.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<&BTreeMap<String, String>> {
        self.tables.get(table)?.rows.get(&format!("'{}'", id))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn history(&self, object: &str) -> Vec<DateTime<Utc>> {
        self.history
            .iter()
            .filter(|(name, _)| name == object)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn transaction_depth(&self) -> u32 {
        self.tx.depth()
    }

    fn add_table_columns(&mut self, table: &str, columns: &[StorageColumn]) {
        let entry = self.tables.entry(table.to_string()).or_default();
        for column in columns {
            entry
                .columns
                .insert(column.name.clone(), column.storage_type.to_lowercase());
        }
    }
}

impl RelationalStore for MemoryStore {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.tables.contains_key(table))
    }

    async fn get_columns(&mut self, table: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn create_table(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()> {
        if self.tables.contains_key(table) {
            bail!("Table '{}' already exists", table);
        }
        self.ddl.push(Dialect::Mysql.create_table_sql(table, columns));
        self.add_table_columns(table, columns);
        Ok(())
    }

    async fn add_columns(&mut self, table: &str, columns: &[StorageColumn]) -> Result<()> {
        if !self.tables.contains_key(table) {
            bail!("Table '{}' does not exist", table);
        }
        if let Some(sql) = Dialect::Mysql.add_columns_sql(table, columns) {
            self.ddl.push(sql);
        }
        self.add_table_columns(table, columns);
        Ok(())
    }

    async fn drop_columns(&mut self, table: &str, _columns: &[String]) -> Result<()> {
        panic!("replication must never drop columns from {}", table)
    }

    async fn begin_transaction(&mut self, continue_existing: bool) -> Result<()> {
        if self.tx.begin(continue_existing)? {
            self.snapshot = Some(Snapshot {
                tables: self.tables.clone(),
                history: self.history.clone(),
            });
        }
        Ok(())
    }

    async fn commit(&mut self, final_commit: bool) -> Result<()> {
        if self.tx.commit(final_commit)? {
            self.snapshot = None;
            self.commits += 1;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.tx.rollback() {
            if let Some(snapshot) = self.snapshot.take() {
                self.tables = snapshot.tables;
                self.history = snapshot.history;
            }
            self.rollbacks += 1;
        }
        Ok(())
    }

    async fn most_recent_sync(&mut self, object: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.history(object).into_iter().max())
    }

    async fn record_sync(&mut self, object: &str, started_at: DateTime<Utc>) -> Result<()> {
        if !self.tx.is_open() {
            bail!("sync history must be written inside a transaction");
        }
        self.history.push((object.to_string(), started_at));
        Ok(())
    }

    async fn upsert_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[ValueTuple],
    ) -> Result<u64> {
        if !self.tx.is_open() {
            bail!("upserts must run inside a transaction");
        }
        self.upsert_calls += 1;
        if self.fail_upsert_call == Some(self.upsert_calls) {
            bail!("injected failure on upsert {}", self.upsert_calls);
        }

        let key = match columns.iter().position(|c| c == PRIMARY_KEY) {
            Some(key) => key,
            None => bail!("upsert into {} without a primary key column", table),
        };
        let target = match self.tables.get_mut(table) {
            Some(target) => target,
            None => bail!("Table '{}' does not exist", table),
        };
        for column in columns {
            if !target.columns.contains_key(column) {
                bail!("Unknown column '{}' in {}", column, table);
            }
        }

        for row in rows {
            let values = row.values();
            let stored = target.rows.entry(values[key].clone()).or_default();
            for (column, value) in columns.iter().zip(values) {
                stored.insert(column.clone(), value.clone());
            }
        }
        Ok(rows.len() as u64)
    }
}

/// A remote org with describe metadata and records, answering bulk queries.
pub struct FakeOrg {
    describe: HashMap<String, Vec<FieldDescriptor>>,
    records: Mutex<HashMap<String, Vec<BTreeMap<String, String>>>>,
    jobs: Mutex<Vec<Vec<String>>>,
    failing_objects: Mutex<Vec<String>>,
    pub queries: Mutex<Vec<String>>,
    pub describe_calls: Mutex<Vec<Vec<String>>>,
    /// Rows per result part
    pub part_size: usize,
}

impl Default for FakeOrg {
    fn default() -> Self {
        Self {
            describe: HashMap::new(),
            records: Mutex::new(HashMap::new()),
            jobs: Mutex::new(Vec::new()),
            failing_objects: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            describe_calls: Mutex::new(Vec::new()),
            part_size: 2,
        }
    }
}

impl FakeOrg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object; fields are `(Name, type, length, precision, scale)`.
    pub fn with_object(mut self, object: &str, fields: &[(&str, &str, u32, u32, u32)]) -> Self {
        self.describe.insert(
            object.to_lowercase(),
            fields
                .iter()
                .map(|(name, t, length, precision, scale)| FieldDescriptor {
                    name: name.to_string(),
                    field_type: t.to_string(),
                    length: *length,
                    precision: *precision,
                    scale: *scale,
                })
                .collect(),
        );
        self
    }

    /// The standard account fields used across the tests.
    pub fn with_account(self) -> Self {
        self.with_object(
            "account",
            &[
                ("Id", "id", 18, 0, 0),
                ("IsDeleted", "boolean", 0, 0, 0),
                ("Name", "string", 255, 0, 0),
                ("Industry", "picklist", 40, 0, 0),
                ("AnnualRevenue", "currency", 0, 18, 0),
                ("LastModifiedDate", "datetime", 0, 0, 0),
            ],
        )
    }

    /// Insert or replace a record; keys are lowercase field names.
    pub fn upsert_record(&self, object: &str, values: &[(&str, &str)]) {
        let record: BTreeMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        let mut records = self.records.lock().unwrap();
        let list = records.entry(object.to_lowercase()).or_default();
        match list.iter_mut().find(|r| r.get("id") == record.get("id")) {
            Some(existing) => existing.extend(record),
            None => list.push(record),
        }
    }

    /// Make every following job for `object` end in the failed state.
    pub fn fail_jobs_for(&self, object: &str) {
        self.failing_objects.lock().unwrap().push(object.to_lowercase());
    }

    fn header_name(&self, object: &str, field: &str) -> String {
        self.describe
            .get(object)
            .and_then(|fields| fields.iter().find(|f| f.name.eq_ignore_ascii_case(field)))
            .map(|f| f.name.clone())
            .unwrap_or_else(|| field.to_string())
    }

    fn render_parts(&self, object: &str, fields: &[String], since: Option<DateTime<Utc>>) -> Vec<String> {
        let records = self.records.lock().unwrap();
        let matching: Vec<&BTreeMap<String, String>> = records
            .get(object)
            .map(|list| {
                list.iter()
                    .filter(|r| match since {
                        None => true,
                        Some(since) => r
                            .get("lastmodifieddate")
                            .and_then(|v| parse_remote_datetime(v))
                            .is_some_and(|at| at >= since),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if matching.is_empty() {
            return vec!["Records not found for this query".to_string()];
        }

        matching
            .chunks(self.part_size.max(1))
            .map(|chunk| {
                let mut writer = csv::Writer::from_writer(Vec::new());
                let header: Vec<String> = fields.iter().map(|f| self.header_name(object, f)).collect();
                writer.write_record(&header).unwrap();
                for record in chunk {
                    let row: Vec<&str> = fields
                        .iter()
                        .map(|f| record.get(f).map(String::as_str).unwrap_or(""))
                        .collect();
                    writer.write_record(&row).unwrap();
                }
                String::from_utf8(writer.into_inner().unwrap()).unwrap()
            })
            .collect()
    }
}

/// Split a query built by the extractor back into its parts.
fn parse_query(query: &str) -> (String, Vec<String>, Option<DateTime<Utc>>) {
    let rest = query.strip_prefix("SELECT ").expect("query starts with SELECT");
    let (fields, rest) = rest.split_once(" FROM ").expect("query has FROM");
    let (object, since) = match rest.split_once(" WHERE LastModifiedDate >= ") {
        Some((object, since)) => (
            object,
            Some(
                DateTime::parse_from_rfc3339(since)
                    .expect("watermark in query")
                    .with_timezone(&Utc),
            ),
        ),
        None => (rest, None),
    };
    (
        object.to_string(),
        fields.split(", ").map(str::to_string).collect(),
        since,
    )
}

impl BulkApi for FakeOrg {
    async fn describe(&self, objects: &[String]) -> Result<HashMap<String, Vec<FieldDescriptor>>> {
        self.describe_calls.lock().unwrap().push(objects.to_vec());
        Ok(objects
            .iter()
            .filter_map(|o| self.describe.get(o).map(|f| (o.to_uppercase(), f.clone())))
            .collect())
    }

    async fn submit_query(&self, _object: &str, query: &str) -> Result<String> {
        self.queries.lock().unwrap().push(query.to_string());
        let (object, fields, since) = parse_query(query);
        let parts = self.render_parts(&object.to_lowercase(), &fields, since);

        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(parts);
        let prefix = if self.failing_objects.lock().unwrap().contains(&object) {
            "fail"
        } else {
            "750"
        };
        Ok(format!("{}-{}", prefix, jobs.len() - 1))
    }

    async fn job_status(&self, job_id: &str) -> Result<BatchStatus> {
        if job_id.starts_with("fail") {
            return Ok(BatchStatus::failed("InvalidBatch : simulated failure"));
        }
        Ok(BatchStatus::new(BatchState::Completed))
    }

    async fn fetch_result_part(
        &self,
        job_id: &str,
        locator: Option<&str>,
        sink: &mut (dyn Write + Send),
    ) -> Result<Option<String>> {
        let index: usize = job_id
            .rsplit('-')
            .next()
            .and_then(|i| i.parse().ok())
            .expect("job id from submit_query");
        let part: usize = locator.map(|l| l.parse().unwrap()).unwrap_or(0);

        let jobs = self.jobs.lock().unwrap();
        let parts = &jobs[index];
        sink.write_all(parts[part].as_bytes())?;
        Ok((part + 1 < parts.len()).then(|| (part + 1).to_string()))
    }
}

pub fn fast_poll() -> PollSettings {
    PollSettings::new(Duration::from_millis(1), Duration::from_millis(4))
}

pub fn extractor(org: FakeOrg) -> BulkExtractor<FakeOrg> {
    BulkExtractor::new(org, fast_poll())
}

pub fn object(name: &str, fields: &[&str]) -> ObjectConfig {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    ObjectConfig::new(name, &fields, None)
}

/// Remote timestamp format for `at`.
pub fn remote_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
