// ABOUTME: Error taxonomy for the replication engine
// ABOUTME: Typed variants travel inside anyhow::Error so callers can downcast them

use thiserror::Error;

/// Errors raised by the replication engine.
///
/// Functions in this crate return `anyhow::Result`; these variants are wrapped
/// into the `anyhow::Error` so that context can be layered on top while the
/// original kind stays reachable through `downcast_ref::<ReplicationError>()`.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Required configuration keys are missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote field type or target dialect has no storage mapping
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Configured fields that do not exist on the remote objects, as `object.field`
    #[error("Invalid field(s): {}", fields.join(", "))]
    FieldMismatch { fields: Vec<String> },

    /// The remote describe call rejected an object
    #[error("Describe failed for {object}: {message}")]
    Describe { object: String, message: String },

    /// The remote extraction job finished in a failed state
    #[error("Extraction job {job_id} for {object} failed: {message}")]
    JobFailed {
        object: String,
        job_id: String,
        message: String,
    },

    /// A data row does not line up with the header
    #[error("Error parsing row {row} of {object}: {message}")]
    RowParse {
        object: String,
        row: u64,
        message: String,
    },

    /// The extraction header names a column the local table does not have
    #[error("Column '{column}' in {object} extraction is not present in the local table")]
    HeaderMismatch { object: String, column: String },

    /// The store rejected a write inside the object's transaction
    #[error("Transaction failed for {object}: {message}\n  Statement: {statement}")]
    Transaction {
        object: String,
        message: String,
        statement: String,
    },
}

impl ReplicationError {
    /// Create a Config error
    pub fn config(message: impl Into<String>) -> Self {
        ReplicationError::Config(message.into())
    }

    /// Create a RowParse error
    pub fn row_parse(object: impl Into<String>, row: u64, message: impl Into<String>) -> Self {
        ReplicationError::RowParse {
            object: object.into(),
            row,
            message: message.into(),
        }
    }

    /// Create a Transaction error, keeping only the head of the statement.
    pub fn transaction(
        object: impl Into<String>,
        message: impl Into<String>,
        statement: &str,
    ) -> Self {
        ReplicationError::Transaction {
            object: object.into(),
            message: message.into(),
            statement: statement_preview(statement),
        }
    }

    /// Whether this error should abort the whole run rather than one object.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::Config(_)
                | ReplicationError::UnsupportedType(_)
                | ReplicationError::FieldMismatch { .. }
                | ReplicationError::Describe { .. }
        )
    }
}

const STATEMENT_PREVIEW_CHARS: usize = 240;

fn statement_preview(statement: &str) -> String {
    let mut chars = statement.chars();
    let head: String = chars.by_ref().take(STATEMENT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
