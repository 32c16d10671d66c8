//! Documented schema changes against a baseline project
//!
//! Compares the documented models and columns of the current project with
//! those of a baseline checkout (for example the main branch). Removing a
//! model or a column is breaking; adding one is not. Breaking changes carry
//! the downstream models of the current graph as their impact. Nothing here
//! fails a build: breaking changes are warnings.

use reflow_core::{Diagnostic, DiagnosticCode, Severity};
use reflow_project::{DependencyGraph, SchemaDocs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One documented change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaChange {
    ModelAdded { model: String },
    ModelRemoved { model: String },
    ColumnsAdded { model: String, columns: Vec<String> },
    ColumnsRemoved { model: String, columns: Vec<String> },
}

impl SchemaChange {
    pub fn model(&self) -> &str {
        match self {
            Self::ModelAdded { model }
            | Self::ModelRemoved { model }
            | Self::ColumnsAdded { model, .. }
            | Self::ColumnsRemoved { model, .. } => model,
        }
    }

    /// Removals break downstream consumers
    pub fn is_breaking(&self) -> bool {
        matches!(self, Self::ModelRemoved { .. } | Self::ColumnsRemoved { .. })
    }
}

impl std::fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelAdded { model } => write!(f, "Model '{}' was added", model),
            Self::ModelRemoved { model } => write!(f, "Model '{}' was removed", model),
            Self::ColumnsAdded { model, columns } => {
                write!(f, "Model '{}' added columns: {}", model, columns.join(", "))
            }
            Self::ColumnsRemoved { model, columns } => {
                write!(f, "Model '{}' removed columns: {}", model, columns.join(", "))
            }
        }
    }
}

/// Every change between a baseline and the current docs, ordered by model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
}

impl SchemaDiff {
    pub fn compare(baseline: &SchemaDocs, current: &SchemaDocs) -> Self {
        let before = baseline.models();
        let after = current.models();
        let names: BTreeSet<&str> = before.keys().chain(after.keys()).copied().collect();

        let mut changes = Vec::new();
        for name in names {
            let (old, new) = match (before.get(name), after.get(name)) {
                (None, Some(_)) => {
                    changes.push(SchemaChange::ModelAdded { model: name.to_string() });
                    continue;
                }
                (Some(_), None) => {
                    changes.push(SchemaChange::ModelRemoved { model: name.to_string() });
                    continue;
                }
                (Some(old), Some(new)) => (old, new),
                (None, None) => continue,
            };

            let old_columns = old.column_names();
            let new_columns = new.column_names();

            let removed: Vec<String> = old_columns
                .iter()
                .filter(|c| !new_columns.contains(c))
                .map(|c| c.to_string())
                .collect();
            if !removed.is_empty() {
                changes.push(SchemaChange::ColumnsRemoved {
                    model: name.to_string(),
                    columns: removed,
                });
            }

            let added: Vec<String> = new_columns
                .iter()
                .filter(|c| !old_columns.contains(c))
                .map(|c| c.to_string())
                .collect();
            if !added.is_empty() {
                changes.push(SchemaChange::ColumnsAdded {
                    model: name.to_string(),
                    columns: added,
                });
            }
        }

        tracing::debug!(changes = changes.len(), "compared documented schemas");
        Self { changes }
    }

    pub fn breaking(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| c.is_breaking())
    }

    pub fn non_breaking(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| !c.is_breaking())
    }

    pub fn has_breaking_changes(&self) -> bool {
        self.breaking().next().is_some()
    }

    /// Breaking changes as warnings, with downstream impact from `graph`
    pub fn to_diagnostics(&self, graph: &DependencyGraph) -> Vec<Diagnostic> {
        self.changes
            .iter()
            .map(|change| {
                let model = change.model();
                if change.is_breaking() {
                    let impact = if graph.contains(model) {
                        graph.downstream(model)
                    } else {
                        Vec::new()
                    };
                    Diagnostic::warn(DiagnosticCode::BreakingSchemaChange, format!("BREAKING: {}", change))
                        .with_model(model)
                        .with_impact(impact)
                } else {
                    Diagnostic::new(DiagnosticCode::SchemaChange, Severity::Info, change.to_string())
                        .with_model(model)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflow_core::Model;
    use reflow_project::{SchemaFile, SourceManifest};
    use std::path::PathBuf;

    fn docs(yaml: &str) -> SchemaDocs {
        SchemaDocs::from_files([(PathBuf::from("models/schema.yml"), SchemaFile::from_yaml(yaml).unwrap())])
    }

    const BASELINE: &str = r#"
models:
  - name: orders
    columns:
      - name: order_id
      - name: status
      - name: total
  - name: legacy_orders
    columns:
      - name: order_id
"#;

    #[test]
    fn removals_are_breaking_and_additions_are_not() {
        let current = docs(
            r#"
models:
  - name: orders
    columns:
      - name: order_id
      - name: total
      - name: currency
  - name: customers
    columns:
      - name: customer_id
"#,
        );

        let diff = SchemaDiff::compare(&docs(BASELINE), &current);

        assert_eq!(
            diff.changes,
            vec![
                SchemaChange::ModelAdded { model: "customers".to_string() },
                SchemaChange::ModelRemoved { model: "legacy_orders".to_string() },
                SchemaChange::ColumnsRemoved {
                    model: "orders".to_string(),
                    columns: vec!["status".to_string()],
                },
                SchemaChange::ColumnsAdded {
                    model: "orders".to_string(),
                    columns: vec!["currency".to_string()],
                },
            ]
        );
        assert!(diff.has_breaking_changes());
        assert_eq!(diff.breaking().count(), 2);
        assert_eq!(diff.non_breaking().count(), 2);
    }

    #[test]
    fn unchanged_docs_have_no_changes() {
        let diff = SchemaDiff::compare(&docs(BASELINE), &docs(BASELINE));
        assert!(diff.changes.is_empty());
        assert!(!diff.has_breaking_changes());
    }

    #[test]
    fn breaking_changes_carry_downstream_impact() {
        let models = vec![
            Model::new("orders", "select 1"),
            Model::new("fact_sales", "select 1").with_refs(["orders"]),
        ];
        let graph = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();

        let diff = SchemaDiff {
            changes: vec![
                SchemaChange::ColumnsRemoved {
                    model: "orders".to_string(),
                    columns: vec!["status".to_string()],
                },
                SchemaChange::ModelAdded { model: "customers".to_string() },
            ],
        };

        let diagnostics = diff.to_diagnostics(&graph);
        assert_eq!(diagnostics[0].code, DiagnosticCode::BreakingSchemaChange);
        assert_eq!(diagnostics[0].severity, Severity::Warn);
        assert_eq!(diagnostics[0].message, "BREAKING: Model 'orders' removed columns: status");
        assert_eq!(diagnostics[0].impact, vec!["fact_sales"]);
        assert_eq!(diagnostics[1].severity, Severity::Info);
        assert!(diagnostics[1].impact.is_empty());
    }
}
