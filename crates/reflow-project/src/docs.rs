//! Model documentation files
//!
//! Every `*.yml` / `*.yaml` file under the models directory may document
//! models and their columns:
//!
//! ```yaml
//! models:
//!   - name: dim_customers
//!     description: One row per customer
//!     tags: [marts]
//!     columns:
//!       - name: customer_id
//!         description: Primary key
//!         tests: [unique, not_null]
//! ```
//!
//! A file that fails to parse is kept as an error next to the files that
//! did parse, so one broken file never hides the rest.

use reflow_core::{Diagnostic, DiagnosticCode, Location};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Contents of one documentation file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub models: Vec<ModelDoc>,
}

impl SchemaFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        // An empty file parses as null
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }
}

/// Documentation for one model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDoc {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub config: Option<ModelDocConfig>,

    #[serde(default)]
    pub columns: Vec<ColumnDoc>,
}

impl ModelDoc {
    /// Trimmed description; empty when absent
    pub fn description(&self) -> &str {
        self.description.as_deref().map(str::trim).unwrap_or_default()
    }

    /// Tags from the model entry and its `config` block
    pub fn all_tags(&self) -> Vec<&str> {
        let config_tags = self.config.iter().flat_map(|c| c.tags.iter());
        self.tags.iter().chain(config_tags).map(String::as_str).collect()
    }

    /// Documented column names, in file order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDocConfig {
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Documentation for one column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDoc {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Column tests; `data_tests` is accepted as an alias
    #[serde(default, alias = "data_tests")]
    pub tests: Vec<ColumnTest>,
}

impl ColumnDoc {
    pub fn description(&self) -> &str {
        self.description.as_deref().map(str::trim).unwrap_or_default()
    }

    /// Names of the tests declared on this column
    pub fn test_names(&self) -> Vec<&str> {
        self.tests
            .iter()
            .flat_map(|test| match test {
                ColumnTest::Name(name) => vec![name.as_str()],
                ColumnTest::Configured(map) => map.keys().map(String::as_str).collect(),
            })
            .collect()
    }

    pub fn has_test(&self, name: &str) -> bool {
        self.test_names().contains(&name)
    }
}

/// A column test, either bare (`unique`) or with arguments
/// (`accepted_values: {values: [...]}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnTest {
    Name(String),
    Configured(BTreeMap<String, serde_yaml::Value>),
}

/// Documentation loaded from every file under a models directory
#[derive(Debug, Clone, Default)]
pub struct SchemaDocs {
    files: Vec<(PathBuf, SchemaFile)>,
    errors: Vec<DocsError>,
}

impl SchemaDocs {
    /// Load every documentation file below `models_dir`
    ///
    /// Paths are stored relative to `project_root` when possible. A missing
    /// directory yields empty docs.
    pub fn load(models_dir: &Path, project_root: &Path) -> Result<Self, DocsError> {
        let mut docs = Self::default();
        if !models_dir.exists() {
            tracing::debug!(dir = %models_dir.display(), "no models directory, no docs");
            return Ok(docs);
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(models_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| DocsError::Discovery {
                path: models_dir.display().to_string(),
                message: e.to_string(),
            })?;
            let is_yaml = entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "yml" || ext == "yaml");
            if entry.file_type().is_file() && is_yaml {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        for path in paths {
            let relative = path
                .strip_prefix(project_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());

            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|yaml| SchemaFile::from_yaml(&yaml).map_err(|e| e.to_string()));

            match parsed {
                Ok(file) => docs.files.push((relative, file)),
                Err(message) => {
                    tracing::warn!(file = %relative.display(), error = %message, "unreadable documentation file");
                    docs.errors.push(DocsError::Parse {
                        path: relative.display().to_string(),
                        message,
                    });
                }
            }
        }

        tracing::debug!(files = docs.files.len(), errors = docs.errors.len(), "loaded model docs");
        Ok(docs)
    }

    /// Build from already parsed files, in the given order
    pub fn from_files<I>(files: I) -> Self
    where
        I: IntoIterator<Item = (PathBuf, SchemaFile)>,
    {
        Self {
            files: files.into_iter().collect(),
            errors: Vec::new(),
        }
    }

    pub fn files(&self) -> &[(PathBuf, SchemaFile)] {
        &self.files
    }

    pub fn errors(&self) -> &[DocsError] {
        &self.errors
    }

    /// Every model entry with the file that documents it
    pub fn entries(&self) -> impl Iterator<Item = (&Path, &ModelDoc)> {
        self.files
            .iter()
            .flat_map(|(path, file)| file.models.iter().map(move |doc| (path.as_path(), doc)))
    }

    /// First documentation entry for `model`
    pub fn model(&self, model: &str) -> Option<(&Path, &ModelDoc)> {
        self.entries().find(|(_, doc)| doc.name == model)
    }

    /// Documented models by name; the first entry wins
    pub fn models(&self) -> BTreeMap<&str, &ModelDoc> {
        let mut models = BTreeMap::new();
        for (_, doc) in self.entries() {
            models.entry(doc.name.as_str()).or_insert(doc);
        }
        models
    }
}

#[derive(Debug, Clone, Error)]
pub enum DocsError {
    #[error("Failed to read {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Failed to walk {path}: {message}")]
    Discovery { path: String, message: String },
}

impl DocsError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            DocsError::Parse { path, .. } => Diagnostic::error(DiagnosticCode::SchemaDocInvalid, self.to_string())
                .with_location(Location::new(path.clone())),
            DocsError::Discovery { .. } => Diagnostic::error(DiagnosticCode::ProjectIoError, self.to_string()),
        }
    }
}
