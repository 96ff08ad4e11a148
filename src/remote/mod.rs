// ABOUTME: Remote extraction interfaces: the low-level bulk API and the extraction service
// ABOUTME: The service runs one query job to completion and hands back a row stream

pub mod client;
pub mod extractor;
pub mod models;
pub mod rows;

pub use client::SalesforceClient;
pub use extractor::{BulkExtractor, PollSettings};
pub use models::{BatchState, BatchStatus, ExtractionJob, JobState};
pub use rows::{RawRow, RowStream};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;

use crate::schema::FieldDescriptor;

/// Result of running an extraction query.
pub enum Extraction {
    Rows(RowStream),
    /// The job completed without returning any records
    NoData,
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Extraction::Rows(stream) => write!(f, "Rows({:?})", stream.header()),
            Extraction::NoData => write!(f, "NoData"),
        }
    }
}

/// Raw operations of the remote bulk query API.
#[allow(async_fn_in_trait)]
pub trait BulkApi {
    /// Describe each object; keys and field names may be in any case.
    async fn describe(&self, objects: &[String]) -> Result<HashMap<String, Vec<FieldDescriptor>>>;

    /// Create a query job and return its remote id.
    async fn submit_query(&self, object: &str, query: &str) -> Result<String>;

    async fn job_status(&self, job_id: &str) -> Result<BatchStatus>;

    /// Write one result part into `sink` and return the locator of the next
    /// part, or `None` after the last one.
    async fn fetch_result_part(
        &self,
        job_id: &str,
        locator: Option<&str>,
        sink: &mut (dyn Write + Send),
    ) -> Result<Option<String>>;
}

/// What the replicator needs from the remote side.
#[allow(async_fn_in_trait)]
pub trait ExtractionService {
    /// Field descriptors per object, with object keys and field names lowercased.
    async fn describe(&self, objects: &[String]) -> Result<HashMap<String, Vec<FieldDescriptor>>>;

    /// Extract `fields` of `object`, modified at or after `since` when given.
    async fn run_query(
        &self,
        object: &str,
        fields: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Extraction>;
}
