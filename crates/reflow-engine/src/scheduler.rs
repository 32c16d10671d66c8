//! Layered execution
//!
//! The plan's layers are dispatched one at a time. Every model of a layer
//! is spawned as a tokio task (bounded by a semaphore of `threads` permits)
//! and the scheduler waits for the whole layer before moving on, so a model
//! never starts before all of its parents reached a terminal state.
//!
//! A failed model blocks its transitive dependents; independent branches keep
//! running. Disabled models are skipped and their dependents carry a warning.

use reflow_core::{
    Diagnostic, DiagnosticCode, Materialization, ModelResult, ModelStatus, Relation, RunConfig,
    RunReport,
};
use reflow_jinja::RenderContext;
use reflow_warehouse::{Statement, WarehouseAdapter};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use crate::compiler::{Compiler, ExecutionPlan, PlannedModel, Selection};
use crate::error::EngineError;
use crate::hooks::HookRunner;
use crate::loader::Project;
use crate::state::{ModelStates, StateError};

/// Cooperative cancellation flag shared between the caller and a run
///
/// Once raised, models that have not started yet are marked `cancelled`;
/// models already executing are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("cancellation requested; no further models will be dispatched");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of one model plus the diagnostics it produced
#[derive(Debug)]
struct Outcome {
    result: ModelResult,
    diagnostics: Vec<Diagnostic>,
}

impl Outcome {
    fn new(model: &PlannedModel, status: ModelStatus) -> Self {
        Self {
            result: ModelResult {
                model: model.name.clone(),
                status,
                relation: model.relation.to_string(),
                materialization: model.materialization,
                layer: model.layer,
                duration_secs: 0.0,
                checksum: model.checksum.clone(),
                rows_affected: None,
                error: None,
                warnings: Vec::new(),
            },
            diagnostics: Vec::new(),
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.result.error = Some(error.into());
        self
    }
}

/// Everything a spawned task needs to materialize one model
struct ModelTask {
    name: String,
    relation: Relation,
    materialization: Materialization,
    sql: String,
    post_hook: Option<String>,
    outcome: Outcome,
}

impl ModelTask {
    fn cancelled(mut self, states: &ModelStates) -> Result<Outcome, StateError> {
        states.transition(&self.name, ModelStatus::Cancelled)?;
        tracing::info!(model = %self.name, "cancelled before dispatch");
        self.outcome.result.status = ModelStatus::Cancelled;
        Ok(self.outcome)
    }

    async fn execute(
        mut self,
        warehouse: Arc<dyn WarehouseAdapter>,
        hooks: HookRunner,
        states: ModelStates,
    ) -> Result<Outcome, StateError> {
        states.transition(&self.name, ModelStatus::Executing)?;
        tracing::info!(
            model = %self.name,
            relation = %self.relation,
            materialization = %self.materialization,
            "materializing"
        );

        let statement = match self.materialization {
            Materialization::View => Statement::create_view(self.relation.clone(), self.sql.clone()),
            Materialization::Table => {
                Statement::create_or_replace_table(self.relation.clone(), self.sql.clone())
            }
        };

        let started = Instant::now();
        let executed = warehouse.execute(&statement).await;

        let status = match executed {
            Ok(metadata) => {
                states.transition(&self.name, ModelStatus::Succeeded)?;
                self.outcome.result.rows_affected = metadata.rows_affected;

                if let Some(hook) = &self.post_hook {
                    if let Err(e) = hooks.run(&self.name, hook, &self.relation).await {
                        tracing::warn!(model = %self.name, error = %e, "post-hook failed");
                        self.outcome.result.warnings.push(e.to_string());
                        self.outcome.diagnostics.push(e.to_diagnostic());
                    }
                }

                if self.outcome.result.warnings.is_empty() {
                    ModelStatus::Succeeded
                } else {
                    states.transition(&self.name, ModelStatus::SucceededWithWarning)?;
                    ModelStatus::SucceededWithWarning
                }
            }
            Err(e) => {
                states.transition(&self.name, ModelStatus::Failed)?;
                tracing::error!(model = %self.name, error = %e, "materialization failed");

                let message = format!("Model '{}' failed: {}", self.name, e);
                self.outcome.diagnostics.push(
                    Diagnostic::error(DiagnosticCode::ExecutionFailed, message).with_model(self.name.clone()),
                );
                self.outcome.result.error = Some(e.to_string());
                ModelStatus::Failed
            }
        };

        let elapsed = started.elapsed();
        tracing::info!(model = %self.name, status = %status, elapsed_ms = elapsed.as_millis() as u64, "finished");

        self.outcome.result.status = status;
        self.outcome.result.duration_secs = elapsed.as_secs_f64();
        Ok(self.outcome)
    }
}

/// Executes a plan against a warehouse
pub struct Scheduler {
    warehouse: Arc<dyn WarehouseAdapter>,
    hooks: HookRunner,
    threads: usize,
    skip_disabled_descendants: bool,
    cancel: CancellationHandle,
}

impl Scheduler {
    pub fn new(warehouse: Arc<dyn WarehouseAdapter>, context: RenderContext, run: &RunConfig) -> Self {
        Self {
            hooks: HookRunner::new(Arc::clone(&warehouse), context),
            warehouse,
            threads: run.threads.max(1),
            skip_disabled_descendants: run.skip_disabled_descendants,
            cancel: CancellationHandle::new(),
        }
    }

    /// Override the concurrency limit
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Share an existing cancellation handle
    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    /// Run every model of `plan`, layer by layer
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let states = ModelStates::new(plan.order().iter().cloned());
        let semaphore = Arc::new(Semaphore::new(self.threads));

        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        // Failed model each blocked model traces back to
        let mut root_failure: HashMap<String, String> = HashMap::new();

        // References were resolved and rendered while compiling the plan
        for model in plan.models() {
            if model.enabled {
                states.advance(&model.name, &[ModelStatus::Resolving, ModelStatus::Rendering])?;
            } else {
                states.transition(&model.name, ModelStatus::Skipped)?;
                tracing::info!(model = %model.name, "skipped (disabled)");
                outcomes.insert(model.name.clone(), Outcome::new(model, ModelStatus::Skipped));
            }
        }

        tracing::info!(
            models = plan.len(),
            layers = plan.layers().len(),
            threads = self.threads,
            warehouse = self.warehouse.name(),
            "starting run"
        );

        for (index, layer) in plan.layers().iter().enumerate() {
            let mut handles = Vec::with_capacity(layer.len());

            for name in layer {
                let Some(model) = plan.model(name) else {
                    continue;
                };
                if !model.enabled {
                    continue;
                }

                let parents: Vec<(&str, ModelStatus)> = model
                    .parents
                    .iter()
                    .filter_map(|p| states.get(p).map(|status| (p.as_str(), status)))
                    .collect();

                if let Some((parent, _)) = parents
                    .iter()
                    .find(|(_, s)| matches!(s, ModelStatus::Failed | ModelStatus::Blocked))
                {
                    let root = root_failure
                        .get(*parent)
                        .cloned()
                        .unwrap_or_else(|| parent.to_string());
                    states.transition(name, ModelStatus::Blocked)?;
                    tracing::info!(model = %name, upstream = %root, "blocked by upstream failure");

                    let message = if root == *parent {
                        format!("upstream model '{}' failed", root)
                    } else {
                        format!("upstream model '{}' failed (via '{}')", root, parent)
                    };
                    root_failure.insert(name.clone(), root);
                    outcomes.insert(name.clone(), Outcome::new(model, ModelStatus::Blocked).with_error(message));
                    continue;
                }

                // Disabled parents count even when the selection left them out
                let mut skipped: Vec<&str> = parents
                    .iter()
                    .filter(|(_, s)| *s == ModelStatus::Skipped)
                    .map(|(p, _)| *p)
                    .collect();
                for parent in &model.disabled_parents {
                    if !skipped.contains(&parent.as_str()) {
                        skipped.push(parent.as_str());
                    }
                }

                if self.skip_disabled_descendants
                    && model.upstream_count > 0
                    && skipped.len() == model.upstream_count
                {
                    states.transition(name, ModelStatus::Skipped)?;
                    tracing::info!(model = %name, "skipped (every upstream model was skipped)");

                    let mut outcome = Outcome::new(model, ModelStatus::Skipped);
                    outcome
                        .result
                        .warnings
                        .push(format!("every upstream model was skipped: {}", skipped.join(", ")));
                    outcomes.insert(name.clone(), outcome);
                    continue;
                }

                let mut outcome = Outcome::new(model, ModelStatus::Rendering);

                let cancelled_parent = parents.iter().any(|(_, s)| *s == ModelStatus::Cancelled);
                if self.cancel.is_cancelled() || cancelled_parent {
                    states.transition(name, ModelStatus::Cancelled)?;
                    outcome.result.status = ModelStatus::Cancelled;
                    outcomes.insert(name.clone(), outcome);
                    continue;
                }

                for parent in &skipped {
                    let warning = format!("upstream model '{}' is disabled", parent);
                    tracing::warn!(model = %name, upstream = %parent, "depends on a disabled model");
                    outcome.diagnostics.push(
                        Diagnostic::warn(DiagnosticCode::DisabledUpstream, format!("Model '{}': {}", name, warning))
                            .with_model(name.clone()),
                    );
                    outcome.result.warnings.push(warning);
                }

                let task = ModelTask {
                    name: name.clone(),
                    relation: model.relation.clone(),
                    materialization: model.materialization,
                    sql: model.sql.clone().unwrap_or_default(),
                    post_hook: model.post_hook.clone(),
                    outcome,
                };

                let warehouse = Arc::clone(&self.warehouse);
                let hooks = self.hooks.clone();
                let states = states.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = self.cancel.clone();

                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return task.cancelled(&states);
                    };
                    if cancel.is_cancelled() {
                        return task.cancelled(&states);
                    }
                    task.execute(warehouse, hooks, states).await
                });
                handles.push((name.clone(), handle));
            }

            tracing::debug!(layer = index, dispatched = handles.len(), "waiting for layer");

            // Wait for all models in this layer to complete
            for (name, handle) in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome?,
                    Err(e) => {
                        tracing::error!(model = %name, error = %e, "execution task aborted");
                        let _ = states.transition(&name, ModelStatus::Failed);
                        let Some(model) = plan.model(&name) else {
                            continue;
                        };
                        let mut outcome = Outcome::new(model, ModelStatus::Failed)
                            .with_error(format!("execution task aborted: {}", e));
                        outcome.diagnostics.push(
                            Diagnostic::error(DiagnosticCode::ExecutionFailed, format!("Model '{}' aborted: {}", name, e))
                                .with_model(name.clone()),
                        );
                        outcome
                    }
                };

                let mut outcome = outcome;
                if outcome.result.status == ModelStatus::Failed {
                    let impact = plan.graph().downstream(&name);
                    for diag in &mut outcome.diagnostics {
                        if diag.code == DiagnosticCode::ExecutionFailed {
                            diag.impact = impact.clone();
                        }
                    }
                }
                outcomes.insert(name, outcome);
            }
        }

        let unfinished = states.unfinished();
        if !unfinished.is_empty() {
            tracing::warn!(models = ?unfinished, "models left without a terminal status");
        }

        let mut results = Vec::with_capacity(plan.len());
        let mut diagnostics = Vec::new();
        for name in plan.order() {
            if let Some(outcome) = outcomes.remove(name) {
                results.push(outcome.result);
                diagnostics.extend(outcome.diagnostics);
            }
        }

        let report = RunReport::from_results(results, diagnostics, started.elapsed().as_secs_f64());
        tracing::info!(
            status = %report.status,
            succeeded = report.summary.succeeded + report.summary.warned,
            failed = report.summary.failed,
            blocked = report.summary.blocked,
            skipped = report.summary.skipped,
            cancelled = report.summary.cancelled,
            "run finished"
        );
        Ok(report)
    }
}

/// Compile and execute a project
///
/// Validation failures are reported as a `failed_validation` report rather
/// than an error; nothing is executed in that case.
pub async fn run_project(
    project: &Project,
    warehouse: Arc<dyn WarehouseAdapter>,
    selection: &Selection,
    cancel: CancellationHandle,
) -> Result<RunReport, EngineError> {
    let plan = match Compiler::new(project).compile_selection(selection) {
        Ok(plan) => plan,
        Err(e @ (EngineError::Validation(_) | EngineError::UnknownSelection(_))) => {
            tracing::error!(error = %e, "validation failed; nothing was executed");
            return Ok(RunReport::failed_validation(e.diagnostics()));
        }
        Err(e) => return Err(e),
    };

    Scheduler::new(warehouse, project.render_context(), &project.config.run)
        .with_cancellation(cancel)
        .execute(&plan)
        .await
}

/// Load a project from disk, then compile and execute it
///
/// Load errors (bad reflow.toml or sources.toml, unknown config keys,
/// template syntax errors, duplicate model names) end the run the same way
/// validation errors do: a `failed_validation` report with nothing executed.
pub async fn run_project_at(
    root: &Path,
    warehouse: Arc<dyn WarehouseAdapter>,
    selection: &Selection,
    cancel: CancellationHandle,
    threads: Option<usize>,
) -> Result<RunReport, EngineError> {
    let mut project = match Project::load(root) {
        Ok(project) => project,
        Err(e) => {
            tracing::error!(error = %e, root = %root.display(), "project failed to load; nothing was executed");
            return Ok(RunReport::failed_validation(e.diagnostics()));
        }
    };
    if let Some(threads) = threads {
        project.config.run.threads = threads.max(1);
    }

    run_project(&project, warehouse, selection, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflow_core::{ProjectConfig, RunStatus};
    use reflow_project::SourceManifest;
    use reflow_warehouse::MockWarehouse;
    use std::path::PathBuf;

    fn project(config: ProjectConfig, files: &[(&str, &str)]) -> Project {
        Project::from_templates(
            config,
            SourceManifest::new(),
            files
                .iter()
                .map(|(name, body)| (PathBuf::from(format!("models/{}.sql", name)), body.to_string())),
        )
        .unwrap()
    }

    async fn run(project: &Project, warehouse: &MockWarehouse) -> RunReport {
        run_project(project, Arc::new(warehouse.clone()), &Selection::all(), CancellationHandle::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failure_blocks_only_its_subgraph() {
        let project = project(
            ProjectConfig::default(),
            &[
                ("a", "select 1"),
                ("b", "select * from {{ ref('a') }}"),
                ("c", "select * from {{ ref('b') }}"),
                ("x", "select 2"),
                ("y", "select * from {{ ref('x') }}"),
            ],
        );
        let warehouse = MockWarehouse::new();
        warehouse.fail_relation("public.a", "boom").await;

        let report = run(&project, &warehouse).await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.status_of("a"), Some(ModelStatus::Failed));
        assert_eq!(report.status_of("b"), Some(ModelStatus::Blocked));
        assert_eq!(report.status_of("c"), Some(ModelStatus::Blocked));
        assert_eq!(report.status_of("x"), Some(ModelStatus::Succeeded));
        assert_eq!(report.status_of("y"), Some(ModelStatus::Succeeded));
        assert_eq!(
            report.result("c").unwrap().error.as_deref(),
            Some("upstream model 'a' failed (via 'b')")
        );

        let failure = report
            .diagnostics
            .iter()
            .find(|d| d.code == DiagnosticCode::ExecutionFailed)
            .unwrap();
        assert_eq!(failure.impact, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn disabled_upstream_warns_dependents() {
        let project = project(
            ProjectConfig::default(),
            &[
                ("legacy", "{{ config(enabled=false) }}select 1"),
                ("report", "select * from {{ ref('legacy') }}"),
            ],
        );
        let warehouse = MockWarehouse::new();

        let report = run(&project, &warehouse).await;

        assert_eq!(report.status_of("legacy"), Some(ModelStatus::Skipped));
        let result = report.result("report").unwrap();
        assert_eq!(result.status, ModelStatus::SucceededWithWarning);
        assert_eq!(result.warnings, vec!["upstream model 'legacy' is disabled"]);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::DisabledUpstream));
        assert_eq!(warehouse.materialized_relations().await, vec!["public.report"]);
    }

    #[tokio::test]
    async fn skip_disabled_descendants() {
        let mut config = ProjectConfig::default();
        config.run.skip_disabled_descendants = true;
        let project = project(
            config,
            &[
                ("legacy", "{{ config(enabled=false) }}select 1"),
                ("base", "select 1"),
                ("report", "select * from {{ ref('legacy') }}"),
                ("summary", "select * from {{ ref('report') }}"),
                ("mixed", "select * from {{ ref('legacy') }} join {{ ref('base') }} using (id)"),
            ],
        );
        let warehouse = MockWarehouse::new();

        let report = run(&project, &warehouse).await;

        assert_eq!(report.status_of("report"), Some(ModelStatus::Skipped));
        assert_eq!(report.status_of("summary"), Some(ModelStatus::Skipped));
        assert_eq!(report.status_of("mixed"), Some(ModelStatus::SucceededWithWarning));
        assert_eq!(
            warehouse.materialized_relations().await,
            vec!["public.base", "public.mixed"]
        );
        assert_eq!(report.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn unselected_disabled_upstream_still_warns() {
        let project = project(
            ProjectConfig::default(),
            &[
                ("legacy", "{{ config(enabled=false) }}select 1"),
                ("report", "select * from {{ ref('legacy') }}"),
            ],
        );
        let warehouse = MockWarehouse::new();

        let report = run_project(
            &project,
            Arc::new(warehouse.clone()),
            &Selection::parse(["report"]),
            CancellationHandle::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status_of("legacy"), None);
        let result = report.result("report").unwrap();
        assert_eq!(result.status, ModelStatus::SucceededWithWarning);
        assert_eq!(result.warnings, vec!["upstream model 'legacy' is disabled"]);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::DisabledUpstream && d.model.as_deref() == Some("report")));
    }

    #[tokio::test]
    async fn unselected_disabled_upstream_skips_descendant() {
        let mut config = ProjectConfig::default();
        config.run.skip_disabled_descendants = true;
        let project = project(
            config,
            &[
                ("legacy", "{{ config(enabled=false) }}select 1"),
                ("base", "select 1"),
                ("report", "select * from {{ ref('legacy') }}"),
                ("mixed", "select * from {{ ref('legacy') }} join {{ ref('base') }} using (id)"),
            ],
        );
        let warehouse = MockWarehouse::new();

        let report = run_project(
            &project,
            Arc::new(warehouse.clone()),
            &Selection::parse(["report", "mixed"]),
            CancellationHandle::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status_of("report"), Some(ModelStatus::Skipped));
        assert_eq!(report.status_of("mixed"), Some(ModelStatus::SucceededWithWarning));
        assert_eq!(warehouse.materialized_relations().await, vec!["public.mixed"]);
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let project = project(
            ProjectConfig::default(),
            &[("a", "select 1"), ("b", "select * from {{ ref('a') }}")],
        );
        let warehouse = MockWarehouse::new();
        let cancel = CancellationHandle::new();
        cancel.cancel();

        let report = run_project(&project, Arc::new(warehouse.clone()), &Selection::all(), cancel)
            .await
            .unwrap();

        assert_eq!(report.summary.cancelled, 2);
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert!(warehouse.executed().await.is_empty());
    }

    #[tokio::test]
    async fn layer_members_run_concurrently() {
        let project = project(
            ProjectConfig::default(),
            &[("a", "select 1"), ("b", "select 2"), ("c", "select 3")],
        );
        let warehouse = MockWarehouse::new().with_latency(50);

        let report = run(&project, &warehouse).await;

        assert_eq!(report.summary.succeeded, 3);
        assert!(warehouse.peak_concurrency() > 1);
    }

    #[tokio::test]
    async fn single_thread_runs_sequentially() {
        let project = project(
            ProjectConfig::default(),
            &[("a", "select 1"), ("b", "select 2"), ("c", "select 3")],
        );
        let warehouse = MockWarehouse::new().with_latency(10);
        let plan = Compiler::new(&project).compile().unwrap();

        let report = Scheduler::new(Arc::new(warehouse.clone()), RenderContext::default(), &RunConfig::default())
            .with_threads(1)
            .execute(&plan)
            .await
            .unwrap();

        assert_eq!(report.summary.succeeded, 3);
        assert_eq!(warehouse.peak_concurrency(), 1);
    }
}
