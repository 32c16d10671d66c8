//! Post-hook execution
//!
//! A hook runs after its model materializes successfully. Hooks are
//! best-effort: a failing hook never rolls back the materialization, it only
//! downgrades the model to `succeeded_with_warning`.

use reflow_core::{Diagnostic, DiagnosticCode, Relation};
use reflow_jinja::resolver::render_hook;
use reflow_jinja::{RenderContext, TemplateError};
use reflow_warehouse::{ExecutionError, Statement, WarehouseAdapter};
use std::sync::Arc;

/// Hook failures
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Post-hook for '{model}' failed to render: {source}")]
    Render {
        model: String,
        #[source]
        source: TemplateError,
    },

    #[error("Post-hook for '{model}' failed: {source}")]
    Execution {
        model: String,
        #[source]
        source: ExecutionError,
    },
}

impl HookError {
    pub fn model(&self) -> &str {
        match self {
            HookError::Render { model, .. } | HookError::Execution { model, .. } => model,
        }
    }

    /// Hook failures are always warnings
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::warn(DiagnosticCode::HookFailed, self.to_string()).with_model(self.model().to_string())
    }
}

/// Renders and executes post-hooks
#[derive(Clone)]
pub struct HookRunner {
    warehouse: Arc<dyn WarehouseAdapter>,
    context: RenderContext,
}

impl HookRunner {
    pub fn new(warehouse: Arc<dyn WarehouseAdapter>, context: RenderContext) -> Self {
        Self { warehouse, context }
    }

    /// Render `hook` with `this` bound to the model's relation and execute it
    ///
    /// Returns the SQL that was executed.
    pub async fn run(&self, model: &str, hook: &str, this: &Relation) -> Result<String, HookError> {
        let sql = render_hook(&self.context, model, hook, this).map_err(|source| HookError::Render {
            model: model.to_string(),
            source,
        })?;

        tracing::debug!(model, %sql, "running post-hook");

        self.warehouse
            .execute(&Statement::raw(sql.clone()))
            .await
            .map_err(|source| HookError::Execution {
                model: model.to_string(),
                source,
            })?;

        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_core::Severity;
    use reflow_warehouse::MockWarehouse;

    fn this() -> Relation {
        Relation::new(Some("analytics".to_string()), "marts", "dim_customer")
    }

    #[tokio::test]
    async fn runs_rendered_hook() {
        let warehouse = MockWarehouse::new();
        let runner = HookRunner::new(Arc::new(warehouse.clone()), RenderContext::default());

        let sql = runner
            .run("dim_customers", "grant select on {{ this }} to role reporter", &this())
            .await
            .unwrap();

        assert_eq!(sql, "grant select on analytics.marts.dim_customer to role reporter");
        assert_eq!(warehouse.raw_statements().await, vec![sql]);
    }

    #[tokio::test]
    async fn execution_failure_is_a_warning() {
        let warehouse = MockWarehouse::new();
        warehouse.fail_statements_containing("grant", "role reporter does not exist").await;
        let runner = HookRunner::new(Arc::new(warehouse), RenderContext::default());

        let err = runner
            .run("dim_customers", "grant select on {{ this }} to role reporter", &this())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Execution { .. }));
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::HookFailed);
        assert_eq!(diag.severity, Severity::Warn);
        assert_eq!(diag.model.as_deref(), Some("dim_customers"));
    }

    #[tokio::test]
    async fn render_failure_executes_nothing() {
        let warehouse = MockWarehouse::new();
        let runner = HookRunner::new(Arc::new(warehouse.clone()), RenderContext::default());

        let err = runner
            .run("dim_customers", "grant select on {{ that }} to role reporter", &this())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Render { .. }));
        assert!(warehouse.executed().await.is_empty());
    }
}
