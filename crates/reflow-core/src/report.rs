//! Run report (`run_results.json`)
//!
//! The JSON layout is versioned; fields are only ever added within a major
//! version.

use serde::{Deserialize, Serialize};
use crate::diagnostic::{Diagnostic, Severity};
use crate::model::Materialization;

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Bumped when a field is removed or changes meaning
    pub major: u32,

    /// Bumped when a field is added
    pub minor: u32,
}

impl ReportVersion {
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Lifecycle of a single model within a run
///
/// `pending -> resolving -> rendering -> executing -> terminal`. Disabled
/// models go from `pending` straight to `skipped`; models that never get
/// dispatched become `blocked`, `skipped` or `cancelled` from `rendering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Pending,
    Resolving,
    Rendering,
    Executing,
    Succeeded,
    SucceededWithWarning,
    Failed,
    Skipped,
    Blocked,
    Cancelled,
}

impl ModelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::SucceededWithWarning
                | Self::Failed
                | Self::Skipped
                | Self::Blocked
                | Self::Cancelled
        )
    }

    /// The model's relation exists after the run
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithWarning)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Pending, Skipped)
                | (Resolving, Rendering)
                | (Rendering, Executing)
                | (Rendering, Skipped)
                | (Rendering, Blocked)
                | (Rendering, Cancelled)
                | (Executing, Succeeded)
                | (Executing, SucceededWithWarning)
                | (Executing, Failed)
                | (Succeeded, SucceededWithWarning)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Rendering => "rendering",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::SucceededWithWarning => "succeeded_with_warning",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every dispatched model succeeded (warnings allowed)
    Success,

    /// At least one model failed, was blocked or was cancelled
    PartialFailure,

    /// Loading, resolution or graph validation failed; nothing was executed
    FailedValidation,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial_failure"),
            Self::FailedValidation => write!(f, "failed_validation"),
        }
    }
}

/// Outcome of a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    /// Model name
    pub model: String,

    /// Terminal status
    pub status: ModelStatus,

    /// Resolved fully-qualified relation
    pub relation: String,

    /// Materialization kind
    pub materialization: Materialization,

    /// Layer the model was scheduled in
    pub layer: usize,

    /// Wall-clock time spent executing (zero when never dispatched)
    pub duration_secs: f64,

    /// SHA-256 of the rendered SQL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Rows affected, when the warehouse reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Error message for failed or blocked models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Non-fatal warnings (hook failures, disabled upstream models)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Summary statistics for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub warned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl RunSummary {
    fn from_results(results: &[ModelResult]) -> Self {
        let count = |status: ModelStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            total: results.len(),
            succeeded: count(ModelStatus::Succeeded),
            warned: count(ModelStatus::SucceededWithWarning),
            failed: count(ModelStatus::Failed),
            skipped: count(ModelStatus::Skipped),
            blocked: count(ModelStatus::Blocked),
            cancelled: count(ModelStatus::Cancelled),
        }
    }
}

/// Run report (run_results.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Aggregate status
    pub status: RunStatus,

    /// Summary statistics
    pub summary: RunSummary,

    /// Per-model results in plan order
    pub results: Vec<ModelResult>,

    /// Validation errors and execution warnings
    pub diagnostics: Vec<Diagnostic>,

    /// Total elapsed time
    pub elapsed_secs: f64,
}

impl RunReport {
    /// Report for a run that reached the execution phase
    pub fn from_results(results: Vec<ModelResult>, diagnostics: Vec<Diagnostic>, elapsed_secs: f64) -> Self {
        let summary = RunSummary::from_results(&results);
        let status = if summary.failed + summary.blocked + summary.cancelled > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };

        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            status,
            summary,
            results,
            diagnostics,
            elapsed_secs,
        }
    }

    /// Report for a run aborted before any execution
    pub fn failed_validation(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            status: RunStatus::FailedValidation,
            summary: RunSummary::default(),
            results: Vec::new(),
            diagnostics,
            elapsed_secs: 0.0,
        }
    }

    /// Look up a model's result
    pub fn result(&self, model: &str) -> Option<&ModelResult> {
        self.results.iter().find(|r| r.model == model)
    }

    /// Status of a model, if it was part of the run
    pub fn status_of(&self, model: &str) -> Option<ModelStatus> {
        self.result(model).map(|r| r.status)
    }

    /// Check if the report has any error diagnostics
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}
