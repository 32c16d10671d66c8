//! Reflow engine - loading, planning and executing a project
//!
//! This crate implements the run pipeline:
//! - Project loading (reflow.toml, sources.toml, model templates)
//! - Validation and planning (resolve, graph, render, layers)
//! - Layered execution against a warehouse with failure isolation
//! - Post-hooks and the per-model state machine
//! - Documentation checks and schema changes against a baseline

pub mod error;
pub mod loader;
pub mod compiler;
pub mod state;
pub mod hooks;
pub mod scheduler;
pub mod metadata;
pub mod schema_diff;

pub use error::EngineError;
pub use loader::Project;
pub use compiler::{Compiler, ExecutionPlan, PlannedModel, Selection};
pub use state::{ModelStates, StateError};
pub use hooks::{HookRunner, HookError};
pub use scheduler::{Scheduler, CancellationHandle, run_project, run_project_at};
pub use metadata::{MetadataReport, MetadataValidator};
pub use schema_diff::{SchemaChange, SchemaDiff};
