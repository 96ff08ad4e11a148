// ABOUTME: Brings every configured table up to the configured field set before any data moves
// ABOUTME: Validates all objects first, then applies one CREATE or one ALTER per object

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use super::{map_field_type, FieldDescriptor, StorageColumn};
use crate::config::{FieldSelection, ObjectConfig, IMPLICIT_FIELDS};
use crate::error::ReplicationError;
use crate::remote::ExtractionService;
use crate::store::RelationalStore;
use crate::utils::validate_identifier;

/// An object with its final, concrete field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    pub name: String,
    /// `id`, `lastmodifieddate`, then the remaining fields
    pub fields: Vec<String>,
    pub batch_size: Option<usize>,
}

/// What has to happen to one table.
#[derive(Debug)]
struct TablePlan {
    object: String,
    table_exists: bool,
    existing: BTreeMap<String, String>,
    /// Configured fields not yet in the table; `None` for all-fields objects
    missing: Option<Vec<String>>,
}

impl TablePlan {
    fn needs_describe(&self) -> bool {
        match &self.missing {
            None => true,
            Some(missing) => !missing.is_empty(),
        }
    }
}

/// Runs schema synchronization once per process.
#[derive(Debug, Default)]
pub struct SchemaSynchronizer {
    resolved: Option<Vec<ResolvedObject>>,
}

impl SchemaSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.resolved.is_some()
    }

    /// Create or extend the table of every object. Returns the resolved
    /// objects; later calls return the first result without touching the
    /// store again.
    pub async fn sync<E, S>(
        &mut self,
        objects: &[ObjectConfig],
        service: &E,
        store: &mut S,
    ) -> Result<&[ResolvedObject]>
    where
        E: ExtractionService,
        S: RelationalStore,
    {
        if self.resolved.is_none() {
            let resolved = synchronize(objects, service, store).await?;
            self.resolved = Some(resolved);
        }
        Ok(self.resolved.as_deref().unwrap_or_default())
    }
}

async fn synchronize<E, S>(
    objects: &[ObjectConfig],
    service: &E,
    store: &mut S,
) -> Result<Vec<ResolvedObject>>
where
    E: ExtractionService,
    S: RelationalStore,
{
    info!("Synchronizing schema for {} object(s)", objects.len());

    let mut plans = Vec::with_capacity(objects.len());
    for object in objects {
        validate_names(object)?;

        let table_exists = store.table_exists(&object.name).await?;
        let existing = if table_exists {
            store.get_columns(&object.name).await?
        } else {
            BTreeMap::new()
        };

        let missing = object.explicit_fields().map(|fields| {
            fields
                .iter()
                .filter(|f| !existing.contains_key(*f))
                .cloned()
                .collect::<Vec<_>>()
        });

        plans.push(TablePlan {
            object: object.name.clone(),
            table_exists,
            existing,
            missing,
        });
    }

    let to_describe: Vec<String> = plans
        .iter()
        .filter(|p| p.needs_describe())
        .map(|p| p.object.clone())
        .collect();

    let described = if to_describe.is_empty() {
        HashMap::new()
    } else {
        debug!("Describing {}", to_describe.join(", "));
        let described = service
            .describe(&to_describe)
            .await
            .context("Failed to describe remote objects")?;
        for object in &to_describe {
            if !described.contains_key(object) {
                return Err(ReplicationError::Describe {
                    object: object.clone(),
                    message: "object missing from describe result".to_string(),
                }
                .into());
            }
        }
        described
    };

    validate_fields(objects, &described)?;

    // Map every type before the first DDL so an unsupported type changes nothing
    let dialect = store.dialect();
    let mut changes: Vec<(&TablePlan, Vec<StorageColumn>)> = Vec::new();
    for plan in plans.iter().filter(|p| p.needs_describe()) {
        let remote = &described[&plan.object];
        let new_fields: Vec<&FieldDescriptor> = match &plan.missing {
            Some(missing) => missing
                .iter()
                .filter_map(|name| remote.iter().find(|f| &f.name == name))
                .collect(),
            None => remote
                .iter()
                .filter(|f| !plan.existing.contains_key(&f.name))
                .collect(),
        };

        let mut columns = Vec::with_capacity(new_fields.len());
        for field in new_fields {
            validate_identifier(&field.name)
                .with_context(|| format!("Remote field of {} cannot be stored", plan.object))?;
            columns.push(StorageColumn::new(
                field.name.clone(),
                map_field_type(field, dialect)?,
            ));
        }
        changes.push((plan, columns));
    }

    for (plan, columns) in changes {
        if columns.is_empty() {
            continue;
        }
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        if plan.table_exists {
            info!("Adding column(s) to {}: {}", plan.object, names.join(", "));
            store.add_columns(&plan.object, &columns).await?;
        } else {
            info!("Creating table {} ({})", plan.object, names.join(", "));
            store.create_table(&plan.object, &columns).await?;
        }
    }

    Ok(objects
        .iter()
        .map(|object| ResolvedObject {
            name: object.name.clone(),
            fields: match &object.fields {
                FieldSelection::Explicit(fields) => fields.clone(),
                FieldSelection::AllFields => all_fields(&described[&object.name]),
            },
            batch_size: object.batch_size,
        })
        .collect())
}

fn validate_names(object: &ObjectConfig) -> Result<()> {
    validate_identifier(&object.name)
        .map_err(|e| ReplicationError::config(format!("Invalid object name: {}", e)))?;
    for field in object.explicit_fields().unwrap_or_default() {
        validate_identifier(field).map_err(|e| {
            ReplicationError::config(format!("Invalid field name in {}: {}", object.name, e))
        })?;
    }
    Ok(())
}

/// Every configured field, plus the implicit ones for all-fields objects,
/// must exist remotely. Mismatches are collected across all objects.
fn validate_fields(
    objects: &[ObjectConfig],
    described: &HashMap<String, Vec<FieldDescriptor>>,
) -> Result<()> {
    let mut invalid = Vec::new();
    for object in objects {
        let remote = match described.get(&object.name) {
            Some(remote) => remote,
            None => continue,
        };
        let required: Vec<&str> = match &object.fields {
            FieldSelection::Explicit(fields) => fields.iter().map(String::as_str).collect(),
            FieldSelection::AllFields => IMPLICIT_FIELDS.to_vec(),
        };
        for field in required {
            if !remote.iter().any(|f| f.name == field) {
                invalid.push(format!("{}.{}", object.name, field));
            }
        }
    }

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(ReplicationError::FieldMismatch { fields: invalid }.into())
    }
}

fn all_fields(remote: &[FieldDescriptor]) -> Vec<String> {
    let mut fields: Vec<String> = IMPLICIT_FIELDS.iter().map(|f| f.to_string()).collect();
    for field in remote {
        if !fields.contains(&field.name) {
            fields.push(field.name.clone());
        }
    }
    fields
}
