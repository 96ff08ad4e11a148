// ABOUTME: Turns raw extracted rows into SQL value tuples for the batch writer
// ABOUTME: A per-object plan picks one converter per column from its storage type

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;

use crate::error::ReplicationError;
use crate::remote::RawRow;
use crate::store::{Dialect, RelationalStore, ValueTuple, NULL_LITERAL, STORE_DATETIME_FORMAT};

/// Storage type family of a local column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Text,
    Bit,
    Date,
    DateTime,
    Decimal,
}

impl StorageKind {
    /// Classify a column type such as `varchar(80)` or `decimal(18,2)`.
    pub fn from_storage_type(storage_type: &str) -> Self {
        let base = storage_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        match base.as_str() {
            "bit" | "boolean" | "bool" => StorageKind::Bit,
            "date" => StorageKind::Date,
            "decimal" | "numeric" => StorageKind::Decimal,
            b if b == "datetime" || b.starts_with("timestamp") => StorageKind::DateTime,
            _ => StorageKind::Text,
        }
    }

    /// Whether non-NULL values need quoting.
    pub fn is_quoted(&self) -> bool {
        !matches!(self, StorageKind::Bit | StorageKind::Decimal)
    }

    fn converter(&self) -> Converter {
        match self {
            StorageKind::Text => passthrough,
            StorageKind::Bit => convert_boolean,
            StorageKind::Date => convert_date,
            StorageKind::DateTime => convert_datetime,
            StorageKind::Decimal => convert_decimal,
        }
    }
}

/// Converts one raw value; `Ok(None)` is written as NULL.
type Converter = fn(&str, Dialect) -> std::result::Result<Option<String>, String>;

fn passthrough(value: &str, _: Dialect) -> std::result::Result<Option<String>, String> {
    Ok(Some(value.to_string()))
}

fn convert_date(value: &str, _: Dialect) -> std::result::Result<Option<String>, String> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(value.to_string()))
}

fn convert_boolean(value: &str, dialect: Dialect) -> std::result::Result<Option<String>, String> {
    Ok(Some(dialect.bool_literal(value == "true").to_string()))
}

fn convert_decimal(value: &str, _: Dialect) -> std::result::Result<Option<String>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if !is_numeric_literal(value) {
        return Err(format!("'{}' is not a number", value));
    }
    Ok(Some(value.to_string()))
}

fn convert_datetime(value: &str, _: Dialect) -> std::result::Result<Option<String>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    parse_remote_datetime(value)
        .map(|at| Some(at.format(STORE_DATETIME_FORMAT).to_string()))
        .ok_or_else(|| format!("'{}' is not an ISO-8601 timestamp", value))
}

/// Parse an ISO-8601 timestamp; values without an offset are taken as UTC.
pub fn parse_remote_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Optional sign, digits with at most one decimal point, optional exponent.
fn is_numeric_literal(value: &str) -> bool {
    let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
        None => (unsigned, None),
    };

    let mut parts = mantissa.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next().unwrap_or_default();
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if whole.len() + fraction.len() == 0 || !digits(whole) || !digits(fraction) {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['-', '+']).unwrap_or(exp);
            !exp.is_empty() && digits(exp)
        }
    }
}

#[derive(Clone, Copy)]
struct ColumnPlan {
    kind: StorageKind,
    convert: Converter,
}

impl std::fmt::Debug for ColumnPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

/// Conversion plan for one object, resolved once from the extraction header.
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    object: String,
    columns: Vec<String>,
    plan: Vec<ColumnPlan>,
    dialect: Dialect,
}

impl RecordTransformer {
    /// Build the plan. Every header column must exist in `column_types`.
    pub fn new(
        object: &str,
        header: &[String],
        column_types: &BTreeMap<String, String>,
        dialect: Dialect,
    ) -> Result<Self> {
        let mut plan = Vec::with_capacity(header.len());
        for column in header {
            let storage_type =
                column_types
                    .get(column)
                    .ok_or_else(|| ReplicationError::HeaderMismatch {
                        object: object.to_string(),
                        column: column.clone(),
                    })?;
            let kind = StorageKind::from_storage_type(storage_type);
            plan.push(ColumnPlan {
                kind,
                convert: kind.converter(),
            });
        }

        Ok(Self {
            object: object.to_string(),
            columns: header.to_vec(),
            plan,
            dialect,
        })
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Column names in tuple order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Convert one row, quoting text values with the store's quoting.
    pub fn transform<S: RelationalStore>(&self, row: &RawRow, store: &S) -> Result<ValueTuple> {
        if row.fields.len() != self.plan.len() {
            return Err(ReplicationError::row_parse(
                &self.object,
                row.number,
                format!(
                    "expected {} fields, found {}",
                    self.plan.len(),
                    row.fields.len()
                ),
            )
            .into());
        }

        let mut values = Vec::with_capacity(self.plan.len());
        for ((raw, column), name) in row.fields.iter().zip(&self.plan).zip(&self.columns) {
            let converted = (column.convert)(raw, self.dialect).map_err(|message| {
                ReplicationError::row_parse(&self.object, row.number, format!("{}: {}", name, message))
            })?;
            values.push(match converted {
                None => NULL_LITERAL.to_string(),
                Some(value) if column.kind.is_quoted() => store.quote(&value),
                Some(value) => value,
            });
        }

        Ok(ValueTuple::new(values))
    }
}
