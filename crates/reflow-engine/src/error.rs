//! Engine errors

use reflow_core::{ConfigError, Diagnostic, DiagnosticCode};
use reflow_jinja::TemplateError;
use reflow_project::{CatalogError, DocsError, GraphError};
use crate::state::StateError;

/// Errors raised while loading, planning or running a project
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Docs(#[from] DocsError),

    #[error("Failed to discover models in {path}: {message}")]
    Discovery { path: String, message: String },

    #[error("Selected model '{0}' does not exist")]
    UnknownSelection(String),

    /// One or more models failed validation; nothing was executed
    #[error("Validation failed with {} error(s)", .0.len())]
    Validation(Vec<Diagnostic>),

    #[error(transparent)]
    State(#[from] StateError),
}

impl EngineError {
    /// Diagnostics describing this error
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            EngineError::Config(e) => vec![e.to_diagnostic()],
            EngineError::Catalog(e) => vec![e.to_diagnostic()],
            EngineError::Template(e) => vec![e.to_diagnostic()],
            EngineError::Graph(e) => vec![e.to_diagnostic()],
            EngineError::Docs(e) => vec![e.to_diagnostic()],
            EngineError::Discovery { .. } => {
                vec![Diagnostic::error(DiagnosticCode::ProjectIoError, self.to_string())]
            }
            EngineError::UnknownSelection(model) => {
                vec![Diagnostic::error(DiagnosticCode::ConfigInvalid, self.to_string()).with_model(model.clone())]
            }
            EngineError::Validation(diagnostics) => diagnostics.clone(),
            EngineError::State(e) => {
                vec![Diagnostic::error(DiagnosticCode::ExecutionFailed, e.to_string()).with_model(e.model.clone())]
            }
        }
    }
}
