//! Template parsing (phase one)
//!
//! Renders a model template once with capturing functions to learn which
//! models and sources it references and which config it declares. Nothing
//! is substituted into SQL here.

use minijinja::{context, Environment, Error as JinjaError, Value};
use reflow_core::{ConfigError, ConfigOverrides, Diagnostic, DiagnosticCode, Location, SourceKey};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use crate::context::RenderContext;
use crate::functions::{self, Captured, TemplateReference};
use crate::resolver::ResolveError;

/// Output of phase one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTemplate {
    /// References in first-seen order, deduplicated
    pub references: Vec<TemplateReference>,

    /// Config declared with `{{ config(...) }}`
    pub config: ConfigOverrides,
}

impl ParsedTemplate {
    /// Names of referenced models
    pub fn refs(&self) -> Vec<String> {
        self.references
            .iter()
            .filter_map(|r| match r {
                TemplateReference::Ref { model } => Some(model.clone()),
                TemplateReference::Source { .. } => None,
            })
            .collect()
    }

    /// Referenced sources
    pub fn sources(&self) -> Vec<SourceKey> {
        self.references
            .iter()
            .filter_map(|r| match r {
                TemplateReference::Source { group, table } => Some(SourceKey::new(group, table)),
                TemplateReference::Ref { .. } => None,
            })
            .collect()
    }
}

/// Error during template parsing, resolution or rendering
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template error in model '{model}': {message}")]
    Render {
        model: String,
        message: String,
        file_path: Option<PathBuf>,
        line: Option<usize>,
    },

    #[error("Invalid config in model '{model}': {source}")]
    Config {
        model: String,
        file_path: Option<PathBuf>,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl TemplateError {
    pub(crate) fn from_jinja(model: &str, file_path: Option<&Path>, error: JinjaError) -> Self {
        TemplateError::Render {
            model: model.to_string(),
            message: error.to_string(),
            file_path: file_path.map(Path::to_path_buf),
            line: error.line(),
        }
    }

    /// Convert to Reflow diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            TemplateError::Render { model, message, file_path, line } => {
                let mut diag = Diagnostic::error(DiagnosticCode::TemplateRenderError, message.clone())
                    .with_model(model.clone());

                if let Some(path) = file_path {
                    let file = path.display().to_string();
                    let location = match line {
                        Some(l) => Location::with_line(file, *l),
                        None => Location::new(file),
                    };
                    diag = diag.with_location(location);
                }

                diag
            }
            TemplateError::Config { model, file_path, source } => {
                let mut diag = source.clone().for_model(model).to_diagnostic();
                if let Some(path) = file_path {
                    diag = diag.with_location(Location::new(path.display().to_string()));
                }
                diag
            }
            TemplateError::Resolve(e) => e.to_diagnostic(),
        }
    }
}

/// Phase-one parser
pub struct TemplateParser {
    context: RenderContext,
}

impl TemplateParser {
    pub fn new(context: RenderContext) -> Self {
        Self { context }
    }

    /// Check if SQL contains Jinja templates
    pub fn has_jinja(sql: &str) -> bool {
        sql.contains("{{") || sql.contains("{%") || sql.contains("{#")
    }

    /// Extract references and config from a model body
    pub fn parse(&self, model: &str, body: &str, file_path: Option<&Path>) -> Result<ParsedTemplate, TemplateError> {
        // If no Jinja detected, there is nothing to capture
        if !Self::has_jinja(body) {
            return Ok(ParsedTemplate::default());
        }

        let capture = Arc::new(Mutex::new(Captured::default()));

        let mut env = Environment::new();
        env.add_function("ref", functions::capture_ref(capture.clone()));
        env.add_function("source", functions::capture_source(capture.clone()));
        env.add_function("config", functions::capture_config(capture.clone()));
        env.add_function("var", functions::var_lookup(self.context.vars.clone()));

        env.render_str(body, context! {
            target => Value::from_serialize(&self.context.target),
        })
        .map_err(|e| TemplateError::from_jinja(model, file_path, e))?;

        let captured = std::mem::take(&mut *capture.lock().unwrap_or_else(|p| p.into_inner()));

        let config = ConfigOverrides::from_entries(captured.config).map_err(|source| {
            TemplateError::Config {
                model: model.to_string(),
                file_path: file_path.map(Path::to_path_buf),
                source,
            }
        })?;

        tracing::trace!(model, references = captured.references.len(), "parsed template");

        Ok(ParsedTemplate {
            references: captured.references,
            config,
        })
    }
}

impl Default for TemplateParser {
    fn default() -> Self {
        Self::new(RenderContext::default())
    }
}
