//! Render context for Jinja templates
//!
//! Provides variables accessible in model and hook templates.

use reflow_core::{ProjectConfig, TargetConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Render context shared by every model in a run
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Project variables, looked up through `var()`
    pub vars: Arc<BTreeMap<String, serde_json::Value>>,

    /// Target configuration, exposed as `target`
    pub target: TargetContext,
}

/// Target context (run-level naming defaults)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetContext {
    pub name: String,
    pub schema: String,
    pub database: Option<String>,
}

impl RenderContext {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            vars: Arc::new(BTreeMap::new()),
            target: TargetContext::from(target),
        }
    }

    /// Context for a loaded project
    pub fn from_project(config: &ProjectConfig) -> Self {
        Self {
            vars: Arc::new(config.vars.clone()),
            target: TargetContext::from(&config.target),
        }
    }

    /// Add a project variable
    pub fn with_var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.vars).insert(key.into(), value);
        self
    }
}

impl From<&TargetConfig> for TargetContext {
    fn from(target: &TargetConfig) -> Self {
        Self {
            name: target.name.clone(),
            schema: target.schema.clone(),
            database: target.database.clone(),
        }
    }
}

impl Default for TargetContext {
    fn default() -> Self {
        TargetContext::from(&TargetConfig::default())
    }
}
