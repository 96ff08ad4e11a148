// ABOUTME: Maps remote field descriptors to storage column types per SQL dialect
// ABOUTME: Unknown remote types are rejected before any DDL runs

use anyhow::Result;

use super::FieldDescriptor;
use crate::error::ReplicationError;
use crate::store::Dialect;

/// Text fields at or above this length become the dialect's large-text type.
pub const MAX_VARCHAR_LENGTH: u32 = 1024;

/// Integer fields report their width as `digits`, leaving `precision` at 0.
const DEFAULT_INT_PRECISION: u32 = 18;

/// Map a remote field descriptor to a storage column type for `dialect`.
///
/// Fails with [`ReplicationError::UnsupportedType`] when the remote type has no
/// mapping.
pub fn map_field_type(field: &FieldDescriptor, dialect: Dialect) -> Result<String> {
    let mapped = match (dialect, field.field_type.as_str()) {
        // Text-like
        (
            _,
            "id" | "reference" | "string" | "picklist" | "multipicklist" | "textarea" | "phone"
            | "email" | "url" | "combobox",
        ) => {
            if field.length >= MAX_VARCHAR_LENGTH {
                "TEXT".to_string()
            } else {
                format!("VARCHAR({})", field.length)
            }
        }

        // Boolean
        (Dialect::Mysql, "boolean") => "BIT(1)".to_string(),
        (Dialect::Postgres, "boolean") => "BOOLEAN".to_string(),

        // Date/time
        (_, "date") => "DATE".to_string(),
        (Dialect::Mysql, "datetime") => "DATETIME".to_string(),
        (Dialect::Postgres, "datetime") => "TIMESTAMP".to_string(),

        // Fixed point
        (Dialect::Mysql, "double" | "currency" | "percent") => {
            format!("DECIMAL({},{})", field.precision, field.scale)
        }
        (Dialect::Postgres, "double" | "currency" | "percent") => {
            format!("NUMERIC({},{})", field.precision, field.scale)
        }
        (Dialect::Mysql, "int") => format!("DECIMAL({},0)", int_precision(field)),
        (Dialect::Postgres, "int") => format!("NUMERIC({},0)", int_precision(field)),

        (_, other) => {
            return Err(ReplicationError::UnsupportedType(format!(
                "unsupported field type ({}) for field {}",
                other, field.name
            ))
            .into())
        }
    };

    Ok(mapped)
}

fn int_precision(field: &FieldDescriptor) -> u32 {
    if field.precision == 0 {
        DEFAULT_INT_PRECISION
    } else {
        field.precision
    }
}
