//! Structured diagnostics for loading, validation and execution
//!
//! Codes are serialized into run reports, so they never change once
//! released. New conditions get new codes.

use serde::{Deserialize, Serialize};

/// Every condition Reflow reports, grouped by phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Configuration (1xxx)
    /// A config block is malformed, misspelled or holds an invalid value
    ConfigInvalid,

    /// A project file could not be read
    ProjectIoError,

    // Template resolution (2xxx)
    /// A `ref()` names a model that is not in the catalog
    UnresolvedReference,

    /// A `source()` names a group/table that is not in the source manifest
    UnresolvedSource,

    /// Template failed to render
    TemplateRenderError,

    // Dependency graph (3xxx)
    /// The model graph contains a cycle
    CyclicDependency,

    /// A dependency has no corresponding model or source
    MissingDependency,

    // Execution (4xxx)
    /// The warehouse rejected a materialization statement
    ExecutionFailed,

    /// A post-hook failed after a successful materialization
    HookFailed,

    /// A model depends on a disabled upstream model
    DisabledUpstream,

    // Documentation (5xxx)
    /// A documentation file could not be parsed
    SchemaDocInvalid,

    /// A model has no documentation entry
    ModelUndocumented,

    /// A model or column description is empty
    DescriptionMissing,

    /// A description is shorter than the recommended minimum
    DescriptionShort,

    /// A documented model lists no columns
    ColumnsUndocumented,

    /// An ID column lacks a `unique` or `not_null` test
    IdColumnUntested,

    TagsMissing,

    // Schema changes (6xxx)
    /// A documented model or column disappeared
    BreakingSchemaChange,

    /// A documented model or column was added
    SchemaChange,

    // Catch-all (9xxx)
    Info,
    Warning,
}

impl DiagnosticCode {
    /// Wire name used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ProjectIoError => "PROJECT_IO_ERROR",
            Self::UnresolvedReference => "UNRESOLVED_REFERENCE",
            Self::UnresolvedSource => "UNRESOLVED_SOURCE",
            Self::TemplateRenderError => "TEMPLATE_RENDER_ERROR",
            Self::CyclicDependency => "CYCLIC_DEPENDENCY",
            Self::MissingDependency => "MISSING_DEPENDENCY",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::HookFailed => "HOOK_FAILED",
            Self::DisabledUpstream => "DISABLED_UPSTREAM",
            Self::SchemaDocInvalid => "SCHEMA_DOC_INVALID",
            Self::ModelUndocumented => "MODEL_UNDOCUMENTED",
            Self::DescriptionMissing => "DESCRIPTION_MISSING",
            Self::DescriptionShort => "DESCRIPTION_SHORT",
            Self::ColumnsUndocumented => "COLUMNS_UNDOCUMENTED",
            Self::IdColumnUntested => "ID_COLUMN_UNTESTED",
            Self::TagsMissing => "TAGS_MISSING",
            Self::BreakingSchemaChange => "BREAKING_SCHEMA_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,

    /// Reported, never fails a run on its own
    Warn,

    /// Stops the model (or, during validation, the run)
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Where in a project file a diagnostic points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the project root
    pub file: String,

    /// 1-based line, when the template engine reports one
    pub line: Option<usize>,
}

impl Location {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
        }
    }

    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
        }
    }
}

/// One reported condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,

    /// Model the diagnostic is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Template file, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Models downstream of the failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impact: Vec<String>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            model: None,
            location: None,
            impact: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    /// Shorthand for a warn-level diagnostic
    pub fn warn(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warn, message)
    }

    /// Attach the model this diagnostic is about
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_impact(mut self, impact: Vec<String>) -> Self {
        self.impact = impact;
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(location) = &self.location {
            match location.line {
                Some(line) => write!(f, " ({}:{})", location.file, line)?,
                None => write!(f, " ({})", location.file)?,
            }
        }
        Ok(())
    }
}
