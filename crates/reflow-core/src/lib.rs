//! Reflow Core
//!
//! Core domain model with stable, versioned types.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod model;
pub mod report;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use model::{Materialization, Model, ModelConfig, ConfigOverrides, SourceKey, Relation, checksum, validate_identifier};
pub use report::{RunReport, ReportVersion, RunSummary, RunStatus, ModelResult, ModelStatus};
pub use config::{ProjectConfig, TargetConfig, RunConfig, ConfigError};
