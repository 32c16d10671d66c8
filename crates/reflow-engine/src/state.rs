//! Per-model state machine
//!
//! Every model in a run moves through
//! `pending -> resolving -> rendering -> executing -> terminal`; the legal
//! edges live on `ModelStatus::can_transition_to`. The tracker is shared by
//! the scheduler and its execution tasks.

use reflow_core::ModelStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An illegal transition was requested
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Model '{model}' cannot move from {from} to {to}")]
pub struct StateError {
    pub model: String,
    pub from: ModelStatus,
    pub to: ModelStatus,
}

/// Shared, thread-safe view of every model's current status
#[derive(Debug, Clone, Default)]
pub struct ModelStates {
    inner: Arc<Mutex<HashMap<String, ModelStatus>>>,
}

impl ModelStates {
    /// Track `models`, all starting in `pending`
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = models
            .into_iter()
            .map(|m| (m.into(), ModelStatus::Pending))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(states)),
        }
    }

    /// Current status of a model
    pub fn get(&self, model: &str) -> Option<ModelStatus> {
        self.lock().get(model).copied()
    }

    /// Move `model` to `next`, rejecting edges the state machine forbids
    pub fn transition(&self, model: &str, next: ModelStatus) -> Result<(), StateError> {
        let mut states = self.lock();
        let current = states.get(model).copied().unwrap_or(ModelStatus::Pending);

        if !current.can_transition_to(next) {
            return Err(StateError {
                model: model.to_string(),
                from: current,
                to: next,
            });
        }

        tracing::debug!(model, from = %current, to = %next, "state transition");
        states.insert(model.to_string(), next);
        Ok(())
    }

    /// Apply several transitions in order
    pub fn advance(&self, model: &str, path: &[ModelStatus]) -> Result<(), StateError> {
        path.iter().try_for_each(|next| self.transition(model, *next))
    }

    /// Models not yet in a terminal state
    pub fn unfinished(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ModelStatus>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ModelStatus::*;

    #[test]
    fn happy_path() {
        let states = ModelStates::new(["stg_orders"]);
        states
            .advance("stg_orders", &[Resolving, Rendering, Executing, Succeeded])
            .unwrap();
        assert_eq!(states.get("stg_orders"), Some(Succeeded));
        assert!(states.unfinished().is_empty());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let states = ModelStates::new(["fact_sales"]);
        let err = states.transition("fact_sales", Executing).unwrap_err();

        assert_eq!(err.from, Pending);
        assert_eq!(err.to, Executing);
        assert_eq!(states.get("fact_sales"), Some(Pending));
    }

    #[test]
    fn terminal_states_are_final() {
        let states = ModelStates::new(["legacy"]);
        states.transition("legacy", Skipped).unwrap();
        assert!(states.transition("legacy", Resolving).is_err());
    }

    #[test]
    fn warning_after_success() {
        let states = ModelStates::new(["dim_customers"]);
        states
            .advance(
                "dim_customers",
                &[Resolving, Rendering, Executing, Succeeded, SucceededWithWarning],
            )
            .unwrap();
        assert_eq!(states.get("dim_customers"), Some(SucceededWithWarning));
    }

    #[test]
    fn clones_share_state() {
        let states = ModelStates::new(["a", "b"]);
        let handle = states.clone();
        handle.transition("a", Skipped).unwrap();

        assert_eq!(states.get("a"), Some(Skipped));
        assert_eq!(states.unfinished(), vec!["b"]);
    }
}
