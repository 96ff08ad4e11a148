// ABOUTME: Schema model shared by the type mapper and the schema synchronizer
// ABOUTME: Field descriptors come from the remote describe call, columns from the store

pub mod synchronizer;
pub mod typemap;

pub use synchronizer::{ResolvedObject, SchemaSynchronizer};
pub use typemap::map_field_type;

use serde::Deserialize;

/// A remote field as reported by the describe call.
///
/// The name is lowercased when the descriptor is ingested.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub length: u32,
    #[serde(default)]
    pub precision: u32,
    #[serde(default)]
    pub scale: u32,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: &str, length: u32, precision: u32, scale: u32) -> Self {
        Self {
            name: name.to_lowercase(),
            field_type: field_type.to_lowercase(),
            length,
            precision,
            scale,
        }
    }

    /// Lowercase the name and type tag in place.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.to_lowercase();
        self.field_type = self.field_type.to_lowercase();
        self
    }
}

/// A column in the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageColumn {
    pub name: String,
    pub storage_type: String,
}

impl StorageColumn {
    pub fn new(name: impl Into<String>, storage_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_type: storage_type.into(),
        }
    }
}
