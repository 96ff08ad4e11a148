// ABOUTME: Replicator - drives schema sync then one incremental load per configured object
// ABOUTME: Each object is extracted, transformed and upserted inside its own transaction

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{info, warn};

use super::writer::{finish_transaction, BatchWriter, WriteSummary};
use crate::config::{ObjectConfig, ReplicatorConfig};
use crate::error::ReplicationError;
use crate::remote::{Extraction, ExtractionService, RowStream};
use crate::schema::{ResolvedObject, SchemaSynchronizer};
use crate::store::RelationalStore;
use crate::transform::RecordTransformer;

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub objects: Vec<ObjectConfig>,
    /// Store-wide rows per upsert, used when an object has no override
    pub batch_size: usize,
    /// Continue with the next object after an object-level failure
    pub keep_going: bool,
}

impl RunContext {
    pub fn new(objects: Vec<ObjectConfig>, batch_size: usize) -> Self {
        Self {
            objects,
            batch_size,
            keep_going: false,
        }
    }

    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self::new(config.objects.clone(), config.store.batch_size)
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn batch_size_for(&self, object: &ResolvedObject) -> usize {
        object.batch_size.unwrap_or(self.batch_size)
    }
}

/// Outcome of one object's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    Synced(WriteSummary),
    /// The extraction returned no records; nothing was written
    NoData,
}

/// Statistics from a run.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub objects_synced: usize,
    pub objects_without_data: usize,
    pub rows_synced: u64,
    pub batches_written: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if every object synced without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Incremental replicator over one extraction service and one store.
pub struct Replicator<E, S> {
    context: RunContext,
    service: E,
    store: S,
    schema: SchemaSynchronizer,
}

impl<E, S> Replicator<E, S>
where
    E: ExtractionService,
    S: RelationalStore,
{
    pub fn new(context: RunContext, service: E, store: S) -> Self {
        Self {
            context,
            service,
            store,
            schema: SchemaSynchronizer::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn service(&self) -> &E {
        &self.service
    }

    /// Take back the service and the store, e.g. to run again with new settings.
    pub fn into_parts(self) -> (E, S) {
        (self.service, self.store)
    }

    /// Create or extend every configured table. Only the first call does work.
    pub async fn sync_schema(&mut self) -> Result<Vec<ResolvedObject>> {
        let resolved = self
            .schema
            .sync(&self.context.objects, &self.service, &mut self.store)
            .await?;
        Ok(resolved.to_vec())
    }

    /// Synchronize all configured objects.
    ///
    /// Schema errors abort immediately. An object failure rolls back that
    /// object and then either aborts the run or, with `keep_going`, is
    /// recorded in the returned stats.
    pub async fn run(&mut self) -> Result<SyncStats> {
        let start = std::time::Instant::now();
        let mut stats = SyncStats::default();

        let objects = self.sync_schema().await?;

        for object in &objects {
            match self.sync_object(object).await {
                Ok(ObjectOutcome::Synced(summary)) => {
                    stats.objects_synced += 1;
                    stats.rows_synced += summary.rows;
                    stats.batches_written += summary.batches;
                }
                Ok(ObjectOutcome::NoData) => {
                    stats.objects_without_data += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to sync {}: {:?}", object.name, e);
                    let run_fatal = e
                        .downcast_ref::<ReplicationError>()
                        .is_some_and(ReplicationError::is_run_fatal);
                    if run_fatal || !self.context.keep_going {
                        return Err(e.context(format!("Failed to sync {}", object.name)));
                    }
                    stats.errors.push(format!("Failed to sync {}: {}", object.name, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Extract everything modified since the last sync of `object` and upsert it.
    pub async fn sync_object(&mut self, object: &ResolvedObject) -> Result<ObjectOutcome> {
        let since = self.store.most_recent_sync(&object.name).await?;
        let started_at = sync_start(since);

        match since {
            Some(since) => info!("Starting sync - {} (modified since {})", object.name, since),
            None => info!("Starting sync - {} (full extraction)", object.name),
        }

        let extraction = self
            .service
            .run_query(&object.name, &object.fields, since)
            .await
            .with_context(|| format!("Extraction of {} failed", object.name))?;

        let rows = match extraction {
            Extraction::Rows(rows) => rows,
            Extraction::NoData => {
                warn!("No data returned for {}; skipping", object.name);
                return Ok(ObjectOutcome::NoData);
            }
        };

        let column_types = self.store.get_columns(&object.name).await?;
        let transformer =
            RecordTransformer::new(&object.name, rows.header(), &column_types, self.store.dialect())?;
        let batch_size = self.context.batch_size_for(object);

        self.store.begin_transaction(false).await?;
        let result = load(&mut self.store, &transformer, rows, batch_size, started_at).await;
        let summary = finish_transaction(&mut self.store, &object.name, result).await?;

        if summary.watermark_recorded {
            info!(
                "Finished sync - {}: {} row(s) in {} batch(es)",
                object.name, summary.rows, summary.batches
            );
        } else {
            info!("Finished sync - {}: no rows; watermark unchanged", object.name);
        }
        Ok(ObjectOutcome::Synced(summary))
    }
}

/// Start timestamp recorded for this sync, never earlier than the previous one.
fn sync_start(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(0);
    match previous {
        Some(previous) if previous > now => {
            warn!(
                "Clock is behind the last recorded sync ({}); keeping that watermark",
                previous
            );
            previous
        }
        _ => now,
    }
}

async fn load<S: RelationalStore>(
    store: &mut S,
    transformer: &RecordTransformer,
    rows: RowStream,
    batch_size: usize,
    started_at: DateTime<Utc>,
) -> Result<WriteSummary> {
    let mut writer = BatchWriter::new(
        transformer.object(),
        transformer.columns().to_vec(),
        batch_size,
        started_at,
    );
    for row in rows {
        let row = row?;
        let tuple = transformer.transform(&row, &*store)?;
        writer.push(store, tuple).await?;
    }
    writer.finish(store).await
}
