//! Project loading
//!
//! Reads `reflow.toml`, the source manifest and every model template under
//! the models directory, parses each template (phase one) and registers the
//! resulting models in a catalog.

use reflow_core::{ConfigOverrides, Model, ProjectConfig};
use reflow_jinja::{RenderContext, TemplateParser};
use reflow_project::{Catalog, CatalogError, SchemaDocs, SourceManifest};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use crate::error::EngineError;

/// Name of the project configuration file
pub const PROJECT_FILE: &str = "reflow.toml";

/// A loaded project: configuration plus a populated catalog
#[derive(Debug, Clone)]
pub struct Project {
    pub config: ProjectConfig,
    pub catalog: Catalog,
}

impl Project {
    /// Load the project rooted at `root`
    ///
    /// A missing `reflow.toml` or source manifest falls back to defaults;
    /// everything else that fails to load is an error.
    pub fn load(root: &Path) -> Result<Self, EngineError> {
        let config_path = root.join(PROJECT_FILE);
        let config = if config_path.exists() {
            ProjectConfig::from_file(&config_path)?
        } else {
            tracing::debug!(root = %root.display(), "no {} found, using defaults", PROJECT_FILE);
            ProjectConfig {
                project_root: root.to_path_buf(),
                ..ProjectConfig::default()
            }
        };

        let sources_path = config.sources_path();
        let sources = if sources_path.exists() {
            SourceManifest::from_file(&sources_path)?
        } else {
            SourceManifest::new()
        };

        let files = discover_models(&config.models_path())?;
        let mut templates = Vec::with_capacity(files.len());
        for path in files {
            let body = std::fs::read_to_string(&path)
                .map_err(|e| CatalogError::IoError(path.display().to_string(), e.to_string()))?;
            let relative = path
                .strip_prefix(&config.project_root)
                .map(Path::to_path_buf)
                .unwrap_or(path);
            templates.push((relative, body));
        }

        let project = Self::from_templates(config, sources, templates)?;
        tracing::info!(
            root = %root.display(),
            models = project.catalog.len(),
            sources = project.catalog.sources().len(),
            "loaded project"
        );
        Ok(project)
    }

    /// Build a project from in-memory templates, in declaration order
    ///
    /// Each template is named after its file stem.
    pub fn from_templates<I>(
        config: ProjectConfig,
        sources: SourceManifest,
        templates: I,
    ) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (PathBuf, String)>,
    {
        let parser = TemplateParser::new(RenderContext::from_project(&config));
        let mut catalog = Catalog::new(config.target.clone(), sources);

        for (path, body) in templates {
            let name = model_name(&path)?;
            let parsed = parser.parse(&name, &body, Some(&path))?;

            let project_overrides = config.models.get(&name).cloned().unwrap_or_default();
            let overrides: ConfigOverrides = project_overrides.merge(&parsed.config);

            let model = Model::new(name, body)
                .with_path(path)
                .with_refs(parsed.refs())
                .with_sources(parsed.sources())
                .with_config(overrides.resolve());

            catalog.register(model)?;
        }

        for name in config.models.keys() {
            if !catalog.contains_model(name) {
                tracing::warn!(model = %name, "config block in {} matches no model", PROJECT_FILE);
            }
        }

        Ok(Self { config, catalog })
    }

    /// Render context for this project's templates and hooks
    pub fn render_context(&self) -> RenderContext {
        RenderContext::from_project(&self.config)
    }

    /// Documentation files under the models directory
    pub fn docs(&self) -> Result<SchemaDocs, EngineError> {
        Ok(SchemaDocs::load(&self.config.models_path(), &self.config.project_root)?)
    }
}

/// Find `*.sql` files below `dir`, sorted by path
fn discover_models(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "models directory does not exist");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| EngineError::Discovery {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "sql") {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn model_name(path: &Path) -> Result<String, EngineError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| EngineError::Discovery {
            path: path.display().to_string(),
            message: "model file name is not valid UTF-8".to_string(),
        })
}
