// ABOUTME: Library root for force-replicator
// ABOUTME: Incremental replication of remote CRM objects into a local SQL database

pub mod config;
pub mod error;
pub mod remote;
pub mod schema;
pub mod store;
pub mod sync;
pub mod transform;
pub mod utils;

pub use error::ReplicationError;
