// ABOUTME: Buffers transformed rows and writes them as fixed-size multi-row upserts
// ABOUTME: Records the sync history row just before the first batch of a run

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::store::{RelationalStore, ValueTuple};

/// Totals for one object's load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: u64,
    pub batches: u64,
    /// Whether a sync history row was written
    pub watermark_recorded: bool,
}

/// Batching upsert writer for one object.
///
/// Must be driven inside an open store transaction so that the history row
/// and every batch commit or roll back together.
pub struct BatchWriter {
    object: String,
    columns: Vec<String>,
    batch_size: usize,
    sync_started_at: DateTime<Utc>,
    buffer: Vec<ValueTuple>,
    summary: WriteSummary,
}

impl BatchWriter {
    pub fn new(
        object: &str,
        columns: Vec<String>,
        batch_size: usize,
        sync_started_at: DateTime<Utc>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            object: object.to_string(),
            columns,
            batch_size,
            sync_started_at,
            buffer: Vec::with_capacity(batch_size.min(crate::config::DEFAULT_BATCH_SIZE)),
            summary: WriteSummary::default(),
        }
    }

    /// Queue a row, writing a batch once `batch_size` rows are buffered.
    pub async fn push<S: RelationalStore>(&mut self, store: &mut S, row: ValueTuple) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush(store).await?;
        }
        Ok(())
    }

    async fn flush<S: RelationalStore>(&mut self, store: &mut S) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        if !self.summary.watermark_recorded {
            store.record_sync(&self.object, self.sync_started_at).await?;
            self.summary.watermark_recorded = true;
        }

        let written = store
            .upsert_batch(&self.object, &self.columns, &self.buffer)
            .await?;
        self.summary.batches += 1;
        self.summary.rows += written;
        debug!(
            "{}: batch {} wrote {} row(s)",
            self.object, self.summary.batches, written
        );
        self.buffer.clear();
        Ok(())
    }

    /// Write the final partial batch.
    pub async fn finish<S: RelationalStore>(mut self, store: &mut S) -> Result<WriteSummary> {
        self.flush(store).await?;
        Ok(self.summary)
    }
}

/// Upsert `rows` into `object` inside one transaction.
///
/// Issues `ceil(N / batch_size)` upserts; on any failure the transaction is
/// rolled back, history row included.
pub async fn upsert_rows<S, I>(
    store: &mut S,
    object: &str,
    columns: Vec<String>,
    rows: I,
    batch_size: usize,
    sync_started_at: DateTime<Utc>,
) -> Result<WriteSummary>
where
    S: RelationalStore,
    I: IntoIterator<Item = ValueTuple>,
{
    store.begin_transaction(false).await?;

    let result = async {
        let mut writer = BatchWriter::new(object, columns, batch_size, sync_started_at);
        for row in rows {
            writer.push(store, row).await?;
        }
        writer.finish(store).await
    }
    .await;

    finish_transaction(store, object, result).await
}

/// Commit on success, roll back on failure. The original error wins over a
/// failed rollback.
pub async fn finish_transaction<S, T>(store: &mut S, object: &str, result: Result<T>) -> Result<T>
where
    S: RelationalStore,
{
    match result {
        Ok(value) => {
            store.commit(false).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = store.rollback().await {
                tracing::error!("Rollback of {} failed: {:?}", object, rollback_err);
            }
            Err(e)
        }
    }
}
