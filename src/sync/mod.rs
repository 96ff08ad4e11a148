// ABOUTME: Data synchronization: the run orchestrator and the batched upsert writer
// ABOUTME: Schema work happens first, then each object loads in its own transaction

pub mod replicator;
pub mod writer;

pub use replicator::{ObjectOutcome, Replicator, RunContext, SyncStats};
pub use writer::{upsert_rows, BatchWriter, WriteSummary};
