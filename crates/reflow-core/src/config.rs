//! Project configuration schema (reflow.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use crate::diagnostic::{Diagnostic, DiagnosticCode};
use crate::model::ConfigOverrides;

/// Run-level target defaults used when a model does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Target name (dev, prod, ...), exposed to templates as `target.name`
    #[serde(default = "default_target_name")]
    pub name: String,

    /// Default database; omitted from relation names when absent
    #[serde(default)]
    pub database: Option<String>,

    /// Default schema
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_target_name() -> String {
    "dev".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            database: None,
            schema: default_schema(),
        }
    }
}

/// Scheduler options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Maximum number of models materialized concurrently within a layer
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Also skip descendants whose every model parent was skipped
    #[serde(default)]
    pub skip_disabled_descendants: bool,
}

fn default_threads() -> usize {
    4
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            skip_disabled_descendants: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project name
    #[serde(default)]
    pub name: Option<String>,

    /// Directory holding model templates, relative to the project root
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    /// Source manifest file, relative to the project root
    #[serde(default = "default_sources_file")]
    pub sources_file: String,

    /// Run-level target defaults
    #[serde(default)]
    pub target: TargetConfig,

    /// Scheduler options
    #[serde(default)]
    pub run: RunConfig,

    /// Project variables available to templates through `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Per-model config blocks keyed by model name
    #[serde(default)]
    pub models: BTreeMap<String, ConfigOverrides>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_sources_file() -> String {
    "sources.toml".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: None,
            models_dir: default_models_dir(),
            sources_file: default_sources_file(),
            target: TargetConfig::default(),
            run: RunConfig::default(),
            vars: BTreeMap::new(),
            models: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl ProjectConfig {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.display().to_string(), e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: ProjectConfig = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.threads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.threads".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        crate::model::validate_identifier("target.schema", &self.target.schema)?;
        if let Some(database) = &self.target.database {
            crate::model::validate_identifier("target.database", database)?;
        }

        for (name, overrides) in &self.models {
            overrides
                .validate()
                .map_err(|e| e.for_model(name))?;
        }

        Ok(())
    }

    /// Absolute path of the models directory
    pub fn models_path(&self) -> PathBuf {
        self.project_root.join(&self.models_dir)
    }

    /// Absolute path of the source manifest
    pub fn sources_path(&self) -> PathBuf {
        self.project_root.join(&self.sources_file)
    }
}

/// Config error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    IoError(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown config key `{key}`{}{}", in_model(.model), did_you_mean(.suggestion))]
    UnknownKey {
        key: String,
        suggestion: Option<String>,
        model: Option<String>,
    },

    #[error("Invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid identifier for `{field}`: '{value}'")]
    InvalidIdentifier { field: String, value: String },
}

fn in_model(model: &Option<String>) -> String {
    model
        .as_ref()
        .map(|m| format!(" in model '{}'", m))
        .unwrap_or_default()
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean `{}`?)", s))
        .unwrap_or_default()
}

impl ConfigError {
    /// Attach the model name to errors raised while validating its config
    pub fn for_model(self, name: &str) -> Self {
        match self {
            ConfigError::UnknownKey { key, suggestion, .. } => ConfigError::UnknownKey {
                key,
                suggestion,
                model: Some(name.to_string()),
            },
            ConfigError::InvalidValue { key, message } => ConfigError::InvalidValue {
                key: format!("models.{}.{}", name, key),
                message,
            },
            ConfigError::InvalidIdentifier { field, value } => ConfigError::InvalidIdentifier {
                field: format!("models.{}.{}", name, field),
                value,
            },
            other => other,
        }
    }

    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            ConfigError::IoError(..) => DiagnosticCode::ProjectIoError,
            _ => DiagnosticCode::ConfigInvalid,
        };
        let diag = Diagnostic::error(code, self.to_string());
        match self {
            ConfigError::UnknownKey { model: Some(model), .. } => diag.with_model(model.clone()),
            _ => diag,
        }
    }
}
