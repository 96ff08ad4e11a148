// ABOUTME: Runs one bulk query job per object: submit, poll with backoff, spool results
// ABOUTME: Result parts go to anonymous temp files and come back as a single row stream

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;
use tracing::{debug, info};

use super::models::ExtractionJob;
use super::rows::RowStream;
use super::{BulkApi, Extraction, ExtractionService};
use crate::config::SourceConfig;
use crate::schema::FieldDescriptor;

/// Growth factor applied to the poll delay after every status check.
pub const POLL_BACKOFF_FACTOR: f64 = 1.1;

/// Marker the remote writes in place of CSV when a query matched nothing.
const NO_RECORDS_MARKER: &str = "Records not found for this query";
const PREVIEW_BYTES: usize = 32;

/// Status polling cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub initial: Duration,
    pub max: Duration,
}

impl PollSettings {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Next delay: grown by [`POLL_BACKOFF_FACTOR`], never above `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * POLL_BACKOFF_FACTOR)
            .map(|grown| grown.min(self.max))
            .unwrap_or(self.max)
    }
}

impl From<&SourceConfig> for PollSettings {
    fn from(config: &SourceConfig) -> Self {
        Self::new(config.poll_interval, config.max_poll_interval)
    }
}

/// [`ExtractionService`] over a [`BulkApi`].
pub struct BulkExtractor<B> {
    api: B,
    poll: PollSettings,
}

impl<B: BulkApi> BulkExtractor<B> {
    pub fn new(api: B, poll: PollSettings) -> Self {
        Self { api, poll }
    }

    pub fn api(&self) -> &B {
        &self.api
    }

    async fn wait_for_completion(&self, job: &mut ExtractionJob) -> Result<()> {
        let job_id = job
            .id()
            .map(str::to_string)
            .context("Cannot poll a job that was never submitted")?;
        let mut delay = self.poll.initial;

        while !job.check_finished()? {
            tokio::time::sleep(delay).await;
            delay = self.poll.next_delay(delay);

            let status = self.api.job_status(&job_id).await?;
            debug!(
                "Job {} for {}: {:?} ({} records processed)",
                job_id,
                job.object(),
                status.state,
                status.records_processed.unwrap_or(0)
            );
            job.update(status)?;
        }
        Ok(())
    }

    async fn spool_results(&self, job_id: &str) -> Result<Vec<File>> {
        let mut parts = Vec::new();
        let mut locator: Option<String> = None;

        loop {
            let mut file = tempfile::tempfile().context("Failed to create spool file")?;
            let next = self
                .api
                .fetch_result_part(job_id, locator.as_deref(), &mut file)
                .await
                .with_context(|| format!("Failed to fetch result part {} of job {}", parts.len() + 1, job_id))?;
            file.seek(SeekFrom::Start(0))
                .context("Failed to rewind spool file")?;
            parts.push(file);

            match next {
                Some(next) if locator.as_deref() == Some(next.as_str()) => {
                    bail!("Job {} returned the same result locator twice: {}", job_id, next)
                }
                Some(next) => locator = Some(next),
                None => break,
            }
        }

        Ok(parts)
    }
}

/// Whether a result part holds no records at all.
pub fn is_empty_result(part: &mut File) -> Result<bool> {
    let mut preview = Vec::with_capacity(PREVIEW_BYTES);
    part.by_ref()
        .take(PREVIEW_BYTES as u64)
        .read_to_end(&mut preview)
        .context("Failed to read spool file")?;
    part.seek(SeekFrom::Start(0))
        .context("Failed to rewind spool file")?;

    let preview = String::from_utf8_lossy(&preview);
    let preview = preview.trim();
    Ok(preview.is_empty() || preview.eq_ignore_ascii_case(NO_RECORDS_MARKER))
}

impl<B: BulkApi> ExtractionService for BulkExtractor<B> {
    async fn describe(&self, objects: &[String]) -> Result<HashMap<String, Vec<FieldDescriptor>>> {
        let described = self.api.describe(objects).await?;
        Ok(described
            .into_iter()
            .map(|(object, fields)| {
                (
                    object.to_lowercase(),
                    fields.into_iter().map(FieldDescriptor::normalized).collect(),
                )
            })
            .collect())
    }

    async fn run_query(
        &self,
        object: &str,
        fields: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Extraction> {
        let mut job = ExtractionJob::new(object, fields, since);
        debug!("Query for {}: {}", object, job.query());

        let job_id = self
            .api
            .submit_query(object, job.query())
            .await
            .with_context(|| format!("Failed to submit extraction job for {}", object))?;
        info!("Submitted extraction job {} for {}", job_id, object);
        job.submitted(job_id.clone())?;

        self.wait_for_completion(&mut job).await?;

        let mut parts = self.spool_results(&job_id).await?;
        let empty = match parts.first_mut() {
            Some(first) => is_empty_result(first)?,
            None => true,
        };
        if empty {
            return Ok(Extraction::NoData);
        }

        debug!("Job {} produced {} result part(s)", job_id, parts.len());
        let readers = parts
            .into_iter()
            .map(|part| Box::new(part) as Box<dyn Read + Send>)
            .collect();
        Ok(Extraction::Rows(RowStream::from_parts(readers)?))
    }
}
