// ABOUTME: Configuration loading and validation for the replicator
// ABOUTME: Reads JSON or TOML documents and normalizes object/field names once

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ReplicationError;
use crate::store::Dialect;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Wildcard entry in a field list meaning "every remote field".
pub const WILDCARD_FIELD: &str = "*";

/// Fields every replicated object carries, in this order.
pub const IMPLICIT_FIELDS: [&str; 2] = ["id", "lastmodifieddate"];

pub const DEFAULT_API_VERSION: &str = "58.0";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 4;
pub const DEFAULT_MAX_POLL_INTERVAL_SECS: u64 = 60;
/// Upper bound for either poll interval setting.
pub const POLL_INTERVAL_CEILING_SECS: u64 = 3600;

/// Which fields of an object are replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Every field the remote describe call reports.
    AllFields,
    /// An explicit list, always starting with `id`, `lastmodifieddate`.
    Explicit(Vec<String>),
}

/// Per-object replication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectConfig {
    /// Lowercase object name, also the local table name
    pub name: String,
    pub fields: FieldSelection,
    /// Overrides the store-wide batch size for this object
    pub batch_size: Option<usize>,
}

impl ObjectConfig {
    /// Build an object config from raw configured names.
    ///
    /// Names are lowercased here and nowhere else. A `"*"` anywhere in the list
    /// selects every remote field; the remaining entries are then redundant.
    pub fn new(name: &str, fields: &[String], batch_size: Option<usize>) -> Self {
        let name = name.trim().to_lowercase();

        let selection = if fields.iter().any(|f| f.trim() == WILDCARD_FIELD) {
            if fields.len() > 1 {
                tracing::warn!(
                    "Object '{}' lists '*' alongside explicit fields; replicating all fields",
                    name
                );
            }
            FieldSelection::AllFields
        } else {
            let configured = fields.iter().map(|f| f.trim().to_lowercase());
            let mut normalized: Vec<String> = Vec::with_capacity(fields.len() + 2);
            for field in IMPLICIT_FIELDS.iter().map(|f| f.to_string()).chain(configured) {
                if !field.is_empty() && !normalized.contains(&field) {
                    normalized.push(field);
                }
            }
            FieldSelection::Explicit(normalized)
        };

        Self {
            name,
            fields: selection,
            batch_size,
        }
    }

    /// The explicit field list, or `None` for `AllFields`.
    pub fn explicit_fields(&self) -> Option<&[String]> {
        match &self.fields {
            FieldSelection::Explicit(fields) => Some(fields),
            FieldSelection::AllFields => None,
        }
    }
}

/// Connection settings for the remote service.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub user: String,
    /// `None` means prompt interactively
    pub pass: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: String,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl SourceConfig {
    /// SOAP login endpoint, defaulting to the production login host.
    pub fn login_endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://login.salesforce.com/services/Soap/u/{}",
                self.api_version
            ),
        }
    }
}

/// Connection settings for the local relational store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dialect: Dialect,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub pass: String,
    pub database: String,
    pub batch_size: usize,
    pub tls: bool,
}

/// Fully validated replicator configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub objects: Vec<ObjectConfig>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    source: Option<RawSource>,
    store: Option<RawStore>,
    #[serde(default)]
    objects: BTreeMap<String, RawObject>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    user: Option<String>,
    pass: Option<String>,
    endpoint: Option<String>,
    api_version: Option<String>,
    poll_interval_secs: Option<u64>,
    max_poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    #[serde(rename = "type")]
    kind: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    pass: Option<String>,
    database: Option<String>,
    batch_size: Option<usize>,
    #[serde(default)]
    tls: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawObject {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    options: RawObjectOptions,
}

#[derive(Debug, Default, Deserialize)]
struct RawObjectOptions {
    #[serde(rename = "batchSize", alias = "batch_size")]
    batch_size: Option<usize>,
}

impl ReplicatorConfig {
    /// Load configuration from a file. `.toml` files are parsed as TOML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Self::from_toml_str(&contents)
                .with_context(|| format!("Invalid configuration in {:?}", path))
        } else {
            Self::from_json_str(&contents)
                .with_context(|| format!("Invalid configuration in {:?}", path))
        }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| ReplicationError::config(format!("error reading JSON: {}", e)))?;
        Ok(Self::validate(raw)?)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents)
            .map_err(|e| ReplicationError::config(format!("error reading TOML: {}", e)))?;
        Ok(Self::validate(raw)?)
    }

    fn validate(raw: RawConfig) -> std::result::Result<Self, ReplicationError> {
        let source = raw
            .source
            .ok_or_else(|| ReplicationError::config("missing required 'source' section"))?;
        let user = required(source.user, "source.user")?;

        let poll_interval =
            Duration::from_secs(source.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));
        let max_poll_interval = Duration::from_secs(
            source
                .max_poll_interval_secs
                .unwrap_or(DEFAULT_MAX_POLL_INTERVAL_SECS),
        );
        if poll_interval.is_zero() {
            return Err(ReplicationError::config(
                "source.poll_interval_secs must be greater than zero",
            ));
        }
        if max_poll_interval > Duration::from_secs(POLL_INTERVAL_CEILING_SECS) {
            return Err(ReplicationError::config(format!(
                "source.poll_interval_secs and source.max_poll_interval_secs must not exceed {}",
                POLL_INTERVAL_CEILING_SECS
            )));
        }
        if max_poll_interval < poll_interval {
            return Err(ReplicationError::config(
                "source.max_poll_interval_secs must not be less than source.poll_interval_secs",
            ));
        }

        let source = SourceConfig {
            user,
            pass: source.pass.filter(|p| !p.is_empty()),
            endpoint: source.endpoint.filter(|e| !e.is_empty()),
            api_version: source
                .api_version
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            poll_interval,
            max_poll_interval,
        };

        let store = raw
            .store
            .ok_or_else(|| ReplicationError::config("missing required 'store' section"))?;
        let dialect: Dialect = required(store.kind, "store.type")?.parse()?;
        let batch_size = store.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ReplicationError::config("store.batch_size must be greater than zero"));
        }
        let store = StoreConfig {
            dialect,
            host: required(store.host, "store.host")?,
            port: store.port,
            user: required(store.user, "store.user")?,
            pass: required(store.pass, "store.pass")?,
            database: required(store.database, "store.database")?,
            batch_size,
            tls: store.tls,
        };

        if raw.objects.is_empty() {
            return Err(ReplicationError::config("no objects configured"));
        }

        let mut objects: Vec<ObjectConfig> = Vec::with_capacity(raw.objects.len());
        for (name, entry) in raw.objects {
            if entry.options.batch_size == Some(0) {
                return Err(ReplicationError::config(format!(
                    "objects.{}.options.batchSize must be greater than zero",
                    name
                )));
            }
            let object = ObjectConfig::new(&name, &entry.fields, entry.options.batch_size);
            if objects.iter().any(|o| o.name == object.name) {
                return Err(ReplicationError::config(format!(
                    "object '{}' is configured more than once",
                    object.name
                )));
            }
            objects.push(object);
        }

        Ok(Self {
            source,
            store,
            objects,
        })
    }
}

fn required(value: Option<String>, key: &str) -> std::result::Result<String, ReplicationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ReplicationError::config(format!(
            "missing required parameter '{}'",
            key
        ))),
    }
}
