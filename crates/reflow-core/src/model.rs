//! Model, source and relation types
//!
//! A `Model` is created once its template is parsed and is immutable after
//! that. Configuration arrives as `ConfigOverrides` layers (project file,
//! in-template `config()` call) that are folded into a concrete `ModelConfig`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use crate::config::ConfigError;

/// Physical strategy used to persist a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// `create or replace view ... as`
    #[default]
    View,

    /// Full table rebuild on every run
    Table,
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Concrete configuration of a model after all override layers are applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub materialized: Materialization,
    pub enabled: bool,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub alias: Option<String>,
    pub post_hook: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            materialized: Materialization::View,
            enabled: true,
            database: None,
            schema: None,
            alias: None,
            post_hook: None,
        }
    }
}

/// Keys accepted in a model config block
pub const RECOGNIZED_KEYS: [&str; 6] = [
    "materialized",
    "enabled",
    "database",
    "schema",
    "alias",
    "post_hook",
];

/// One layer of model configuration; absent keys leave the lower layer intact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub materialized: Option<Materialization>,

    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub post_hook: Option<String>,
}

impl ConfigOverrides {
    /// Build overrides from loosely-typed key/value pairs (e.g. `config()` kwargs)
    ///
    /// Unknown keys are rejected rather than ignored; a close match among the
    /// recognized keys is offered as a suggestion.
    pub fn from_entries<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut map = serde_json::Map::new();
        for (key, value) in entries {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownKey {
                    suggestion: suggest_key(&key).map(str::to_string),
                    key,
                    model: None,
                });
            }
            map.insert(key, value);
        }

        let overrides: ConfigOverrides = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| ConfigError::InvalidValue {
                key: "config".to_string(),
                message: e.to_string(),
            })?;

        overrides.validate()?;
        Ok(overrides)
    }

    /// Layer `other` on top of `self`; keys set in `other` win
    pub fn merge(&self, other: &ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            materialized: other.materialized.or(self.materialized),
            enabled: other.enabled.or(self.enabled),
            database: other.database.clone().or_else(|| self.database.clone()),
            schema: other.schema.clone().or_else(|| self.schema.clone()),
            alias: other.alias.clone().or_else(|| self.alias.clone()),
            post_hook: other.post_hook.clone().or_else(|| self.post_hook.clone()),
        }
    }

    /// Fold onto the defaults
    pub fn resolve(&self) -> ModelConfig {
        let defaults = ModelConfig::default();
        ModelConfig {
            materialized: self.materialized.unwrap_or(defaults.materialized),
            enabled: self.enabled.unwrap_or(defaults.enabled),
            database: self.database.clone(),
            schema: self.schema.clone(),
            alias: self.alias.clone(),
            post_hook: self.post_hook.clone().filter(|hook| !hook.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(database) = &self.database {
            validate_identifier("database", database)?;
        }
        if let Some(schema) = &self.schema {
            validate_identifier("schema", schema)?;
        }
        if let Some(alias) = &self.alias {
            validate_identifier("alias", alias)?;
        }
        Ok(())
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
    })
}

/// Reject anything that is not a plain unquoted SQL identifier
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// Closest recognized key within edit distance 2
///
/// Adjacent transpositions count as one edit, so `alais` suggests `alias`.
fn suggest_key(key: &str) -> Option<&'static str> {
    RECOGNIZED_KEYS
        .iter()
        .map(|candidate| (strsim::osa_distance(key, candidate), *candidate))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate)
}

/// Identity of an external source table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub group: String,
    pub table: String,
}

impl SourceKey {
    pub fn new(group: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.table)
    }
}

/// Fully-qualified warehouse object name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Database name; omitted when the warehouse has a single database
    pub database: Option<String>,

    /// Schema name
    pub schema: String,

    /// Table or view name
    pub identifier: String,
}

impl Relation {
    pub fn new(database: Option<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Parse a dotted `schema.table` or `database.schema.table` location
    pub fn parse(location: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = location.split('.').map(str::trim).collect();
        for part in &parts {
            validate_identifier("location", part).map_err(|_| ConfigError::InvalidValue {
                key: "location".to_string(),
                message: format!("'{}' is not a valid relation name", location),
            })?;
        }

        match parts.as_slice() {
            [schema, table] => Ok(Self::new(None, *schema, *table)),
            [database, schema, table] => Ok(Self::new(Some(database.to_string()), *schema, *table)),
            _ => Err(ConfigError::InvalidValue {
                key: "location".to_string(),
                message: format!(
                    "'{}' must be schema.table or database.schema.table",
                    location
                ),
            }),
        }
    }

    /// Get fully qualified name
    pub fn fqn(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(database) => write!(f, "{}.{}.{}", database, self.schema, self.identifier),
            None => write!(f, "{}.{}", self.schema, self.identifier),
        }
    }
}

/// A single named transformation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Unique model name
    pub name: String,

    /// Template file, if the model was loaded from disk
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Raw templated body
    pub raw_body: String,

    /// Resolved configuration
    pub config: ModelConfig,

    /// Models referenced through `ref()`, in first-seen order
    pub refs: Vec<String>,

    /// Sources referenced through `source()`, in first-seen order
    pub sources: Vec<SourceKey>,
}

impl Model {
    pub fn new(name: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            raw_body: raw_body.into(),
            config: ModelConfig::default(),
            refs: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_refs<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refs = refs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sources(mut self, sources: Vec<SourceKey>) -> Self {
        self.sources = sources;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Display path for diagnostics
    pub fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("<{}>", self.name))
    }
}

/// SHA-256 hex digest of rendered SQL
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}
