//! Documentation completeness checks
//!
//! Every model file should have a documentation entry with a real
//! description, documented columns, tests on its ID columns and at least one
//! tag. Missing documentation and empty descriptions are errors; everything
//! else is a warning.

use reflow_core::{Diagnostic, DiagnosticCode, Location, Severity};
use reflow_project::SchemaDocs;
use std::fmt::Write as _;
use std::path::Path;
use crate::loader::Project;

/// Model descriptions shorter than this draw a warning
pub const MIN_MODEL_DESCRIPTION: usize = 10;

/// Column descriptions shorter than this draw a warning
pub const MIN_COLUMN_DESCRIPTION: usize = 5;

/// Tests every ID column should carry
const ID_COLUMN_TESTS: [&str; 2] = ["unique", "not_null"];

/// Outcome of a documentation check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl MetadataReport {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Warn)
    }

    /// Warnings never fail the check
    pub fn is_success(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Markdown summary, suitable for a pull request comment
    pub fn to_markdown(&self) -> String {
        let errors: Vec<&Diagnostic> = self.errors().collect();
        let warnings: Vec<&Diagnostic> = self.warnings().collect();
        let mut out = String::new();

        if !errors.is_empty() {
            let _ = writeln!(out, "### Errors ({})\n", errors.len());
            for diag in &errors {
                let _ = writeln!(out, "- {}", diag);
            }
            out.push('\n');
        }

        if !warnings.is_empty() {
            let _ = writeln!(out, "### Warnings ({})\n", warnings.len());
            for diag in &warnings {
                let _ = writeln!(out, "- {}", diag);
            }
            out.push('\n');
        }

        if errors.is_empty() && warnings.is_empty() {
            out.push_str("### All validation checks passed!\n");
        }

        out
    }
}

/// Check a project's documentation against its model files
pub struct MetadataValidator<'a> {
    models: Vec<&'a str>,
    docs: &'a SchemaDocs,
}

impl<'a> MetadataValidator<'a> {
    pub fn new(project: &'a Project, docs: &'a SchemaDocs) -> Self {
        Self {
            models: project.catalog.models().iter().map(|m| m.name.as_str()).collect(),
            docs,
        }
    }

    pub fn validate(&self) -> MetadataReport {
        let mut diagnostics: Vec<Diagnostic> = self.docs.errors().iter().map(|e| e.to_diagnostic()).collect();

        self.check_model_descriptions(&mut diagnostics);
        self.check_columns(&mut diagnostics);
        self.check_id_tests(&mut diagnostics);
        self.check_tags(&mut diagnostics);

        tracing::info!(
            models = self.models.len(),
            documented = self.docs.models().len(),
            diagnostics = diagnostics.len(),
            "checked model documentation"
        );
        MetadataReport { diagnostics }
    }

    fn check_model_descriptions(&self, diagnostics: &mut Vec<Diagnostic>) {
        for &model in &self.models {
            let Some((file, doc)) = self.docs.model(model) else {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticCode::ModelUndocumented,
                        format!("Model '{}' has no schema documentation", model),
                    )
                    .with_model(model),
                );
                continue;
            };

            let description = doc.description();
            if description.is_empty() {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticCode::DescriptionMissing,
                        format!("Model '{}' has an empty description", model),
                    )
                    .with_model(model)
                    .with_location(location(file)),
                );
            } else if description.chars().count() < MIN_MODEL_DESCRIPTION {
                diagnostics.push(
                    Diagnostic::warn(
                        DiagnosticCode::DescriptionShort,
                        format!(
                            "Model '{}' has a very short description (< {} chars)",
                            model, MIN_MODEL_DESCRIPTION
                        ),
                    )
                    .with_model(model)
                    .with_location(location(file)),
                );
            }
        }
    }

    fn check_columns(&self, diagnostics: &mut Vec<Diagnostic>) {
        for (file, doc) in self.docs.entries() {
            if doc.columns.is_empty() {
                diagnostics.push(
                    Diagnostic::warn(
                        DiagnosticCode::ColumnsUndocumented,
                        format!("Model '{}' has no columns documented", doc.name),
                    )
                    .with_model(doc.name.clone())
                    .with_location(location(file)),
                );
                continue;
            }

            for column in &doc.columns {
                let description = column.description();
                let diag = if description.is_empty() {
                    Diagnostic::error(
                        DiagnosticCode::DescriptionMissing,
                        format!("Column '{}.{}' has no description", doc.name, column.name),
                    )
                } else if description.chars().count() < MIN_COLUMN_DESCRIPTION {
                    Diagnostic::warn(
                        DiagnosticCode::DescriptionShort,
                        format!(
                            "Column '{}.{}' has a very short description (< {} chars)",
                            doc.name, column.name, MIN_COLUMN_DESCRIPTION
                        ),
                    )
                } else {
                    continue;
                };
                diagnostics.push(diag.with_model(doc.name.clone()).with_location(location(file)));
            }
        }
    }

    fn check_id_tests(&self, diagnostics: &mut Vec<Diagnostic>) {
        for (file, doc) in self.docs.entries() {
            for column in doc.columns.iter().filter(|c| is_id_column(&c.name)) {
                for test in ID_COLUMN_TESTS {
                    if !column.has_test(test) {
                        diagnostics.push(
                            Diagnostic::warn(
                                DiagnosticCode::IdColumnUntested,
                                format!(
                                    "ID column '{}.{}' should have a '{}' test",
                                    doc.name, column.name, test
                                ),
                            )
                            .with_model(doc.name.clone())
                            .with_location(location(file)),
                        );
                    }
                }
            }
        }
    }

    fn check_tags(&self, diagnostics: &mut Vec<Diagnostic>) {
        for (file, doc) in self.docs.entries() {
            if doc.all_tags().is_empty() {
                diagnostics.push(
                    Diagnostic::warn(
                        DiagnosticCode::TagsMissing,
                        format!("Model '{}' has no tags defined", doc.name),
                    )
                    .with_model(doc.name.clone())
                    .with_location(location(file)),
                );
            }
        }
    }
}

/// Any column whose name contains `id`, case-insensitively
fn is_id_column(name: &str) -> bool {
    name.to_ascii_lowercase().contains("id")
}

fn location(file: &Path) -> Location {
    Location::new(file.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflow_core::ProjectConfig;
    use reflow_project::{SchemaFile, SourceManifest};
    use std::path::PathBuf;

    fn project(models: &[&str]) -> Project {
        Project::from_templates(
            ProjectConfig::default(),
            SourceManifest::new(),
            models
                .iter()
                .map(|name| (PathBuf::from(format!("models/{}.sql", name)), "select 1".to_string())),
        )
        .unwrap()
    }

    fn docs(yaml: &str) -> SchemaDocs {
        SchemaDocs::from_files([(PathBuf::from("models/schema.yml"), SchemaFile::from_yaml(yaml).unwrap())])
    }

    fn codes(report: &MetadataReport) -> Vec<(DiagnosticCode, Option<&str>)> {
        report
            .diagnostics
            .iter()
            .map(|d| (d.code, d.model.as_deref()))
            .collect()
    }

    #[test]
    fn complete_docs_pass() {
        let project = project(&["orders"]);
        let docs = docs(
            r#"
models:
  - name: orders
    description: One row per order
    tags: [staging]
    columns:
      - name: order_id
        description: Order key
        tests: [unique, not_null]
"#,
        );

        let report = MetadataValidator::new(&project, &docs).validate();
        assert!(report.diagnostics.is_empty());
        assert!(report.is_success());
        assert_eq!(report.to_markdown(), "### All validation checks passed!\n");
    }

    #[test]
    fn missing_docs_and_empty_descriptions_are_errors() {
        let project = project(&["orders", "customers"]);
        let docs = docs(
            r#"
models:
  - name: orders
    description: ""
    tags: [staging]
    columns:
      - name: status
"#,
        );

        let report = MetadataValidator::new(&project, &docs).validate();
        assert_eq!(
            codes(&report),
            vec![
                (DiagnosticCode::DescriptionMissing, Some("orders")),
                (DiagnosticCode::ModelUndocumented, Some("customers")),
                (DiagnosticCode::DescriptionMissing, Some("orders")),
            ]
        );
        assert!(!report.is_success());
    }

    #[test]
    fn short_descriptions_and_untested_ids_only_warn() {
        let project = project(&["orders"]);
        let docs = docs(
            r#"
models:
  - name: orders
    description: Orders
    columns:
      - name: CustomerID
        description: Key
        tests:
          - not_null
          - relationships:
              to: ref('customers')
              field: customer_id
"#,
        );

        let report = MetadataValidator::new(&project, &docs).validate();
        assert_eq!(
            codes(&report),
            vec![
                (DiagnosticCode::DescriptionShort, Some("orders")),
                (DiagnosticCode::DescriptionShort, Some("orders")),
                (DiagnosticCode::IdColumnUntested, Some("orders")),
                (DiagnosticCode::TagsMissing, Some("orders")),
            ]
        );
        assert!(report.diagnostics[2].message.contains("'unique'"));
        assert!(report.is_success());
    }

    #[test]
    fn model_without_columns_warns() {
        let project = project(&["orders"]);
        let docs = docs("models:\n  - name: orders\n    description: One row per order\n    tags: [a]\n");

        let report = MetadataValidator::new(&project, &docs).validate();
        assert_eq!(codes(&report), vec![(DiagnosticCode::ColumnsUndocumented, Some("orders"))]);
        assert_eq!(
            report.diagnostics[0].location.as_ref().unwrap().file,
            "models/schema.yml"
        );
    }

    #[test]
    fn markdown_lists_errors_before_warnings() {
        let report = MetadataReport {
            diagnostics: vec![
                Diagnostic::warn(DiagnosticCode::TagsMissing, "Model 'a' has no tags defined"),
                Diagnostic::error(DiagnosticCode::ModelUndocumented, "Model 'b' has no schema documentation"),
            ],
        };

        assert_eq!(
            report.to_markdown(),
            "### Errors (1)\n\n\
             - [MODEL_UNDOCUMENTED] Model 'b' has no schema documentation\n\n\
             ### Warnings (1)\n\n\
             - [TAGS_MISSING] Model 'a' has no tags defined\n\n"
        );
    }
}
