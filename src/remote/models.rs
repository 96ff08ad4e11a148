// ABOUTME: Extraction job state machine and the wire models of the Bulk and REST APIs
// ABOUTME: Query text is built here so the client and the fakes agree on it

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;
use crate::schema::FieldDescriptor;

/// Timestamp format used in query filters.
pub const SOQL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Lifecycle of the job itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Open,
    Closed,
}

/// Progress of the query batch inside a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl BatchState {
    /// Map a Bulk API 2.0 job state onto the batch lifecycle.
    pub fn from_remote(state: &str) -> Result<Self> {
        match state {
            "Open" | "UploadComplete" => Ok(BatchState::Queued),
            "InProgress" => Ok(BatchState::InProgress),
            "JobComplete" => Ok(BatchState::Completed),
            "Failed" | "Aborted" => Ok(BatchState::Failed),
            other => bail!("Unknown job state '{}'", other),
        }
    }
}

/// Snapshot of a job returned by a status call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub state: BatchState,
    pub message: Option<String>,
    pub records_processed: Option<u64>,
}

impl BatchStatus {
    pub fn new(state: BatchState) -> Self {
        Self {
            state,
            message: None,
            records_processed: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: BatchState::Failed,
            message: Some(message.into()),
            records_processed: None,
        }
    }
}

/// Build the extraction query for `object`.
///
/// With a watermark only records modified at or after it are selected.
pub fn build_query(object: &str, fields: &[String], since: Option<DateTime<Utc>>) -> String {
    let mut query = format!("SELECT {} FROM {}", fields.join(", "), object);
    if let Some(since) = since {
        query.push_str(&format!(
            " WHERE LastModifiedDate >= {}",
            since.format(SOQL_DATETIME_FORMAT)
        ));
    }
    query
}

/// One remote extraction job, tracked from submission to completion.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    object: String,
    query: String,
    id: Option<String>,
    job_state: JobState,
    batch_state: BatchState,
    message: Option<String>,
}

impl ExtractionJob {
    pub fn new(object: &str, fields: &[String], since: Option<DateTime<Utc>>) -> Self {
        Self {
            object: object.to_string(),
            query: build_query(object, fields, since),
            id: None,
            job_state: JobState::Open,
            batch_state: BatchState::Queued,
            message: None,
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn job_state(&self) -> JobState {
        self.job_state
    }

    /// Record the remote id; the job is closed to further input from here on.
    pub fn submitted(&mut self, job_id: String) -> Result<()> {
        if self.job_state != JobState::Open {
            bail!("Job for {} was already submitted", self.object);
        }
        self.id = Some(job_id);
        self.job_state = JobState::Closed;
        self.batch_state = BatchState::Queued;
        Ok(())
    }

    /// Apply a status poll result.
    pub fn update(&mut self, status: BatchStatus) -> Result<()> {
        if self.job_state != JobState::Closed {
            bail!("Job for {} has not been submitted", self.object);
        }
        self.batch_state = status.state;
        if status.message.is_some() {
            self.message = status.message;
        }
        Ok(())
    }

    /// Whether results can be fetched; a failed job becomes `JobFailed`.
    pub fn check_finished(&self) -> Result<bool> {
        match self.batch_state {
            BatchState::Queued | BatchState::InProgress => Ok(false),
            BatchState::Completed => Ok(true),
            BatchState::Failed => Err(ReplicationError::JobFailed {
                object: self.object.clone(),
                job_id: self.id.clone().unwrap_or_default(),
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "no message from remote".to_string()),
            }
            .into()),
        }
    }
}

/// Body of a Bulk API 2.0 query job creation request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateQueryJob<'a> {
    pub operation: &'a str,
    pub query: &'a str,
}

/// Job information returned by job creation and status calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobInfo {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl QueryJobInfo {
    pub fn to_status(&self) -> Result<BatchStatus> {
        Ok(BatchStatus {
            state: BatchState::from_remote(&self.state)?,
            message: self.error_message.clone(),
            records_processed: self.number_records_processed,
        })
    }
}

/// Subset of the REST describe response.
#[derive(Debug, Clone, Deserialize)]
pub struct DescribeResponse {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Error entry of a REST error response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    #[serde(default)]
    pub error_code: Option<String>,
}
