//! Validation and planning
//!
//! Compiling a project resolves every enabled model's references, builds the
//! dependency graph and renders every enabled model. Errors are collected
//! across all models so one run reports every broken reference at once. A
//! project that compiles yields an `ExecutionPlan`; nothing touches the
//! warehouse until then.

use reflow_core::{Diagnostic, Materialization, Relation};
use reflow_jinja::{RenderContext, TemplateResolver};
use reflow_project::{DependencyGraph, NodeId};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use crate::error::EngineError;
use crate::loader::Project;

/// Which models to run
///
/// `name` selects a single model; `+name` selects a model together with
/// everything it depends on. An empty selection means the whole project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    items: Vec<SelectionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectionItem {
    model: String,
    with_upstream: bool,
}

impl Selection {
    /// Select everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse selectors such as `fact_sales` or `+fact_sales`
    pub fn parse<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items = selectors
            .into_iter()
            .map(|s| {
                let s = s.as_ref().trim();
                match s.strip_prefix('+') {
                    Some(model) => SelectionItem {
                        model: model.to_string(),
                        with_upstream: true,
                    },
                    None => SelectionItem {
                        model: s.to_string(),
                        with_upstream: false,
                    },
                }
            })
            .filter(|item| !item.model.is_empty())
            .collect();
        Self { items }
    }

    pub fn is_all(&self) -> bool {
        self.items.is_empty()
    }

    /// Expand against a graph; `None` means every node
    fn expand(&self, graph: &DependencyGraph) -> Result<Option<BTreeSet<NodeId>>, EngineError> {
        if self.is_all() {
            return Ok(None);
        }

        let mut selected = BTreeSet::new();
        for item in &self.items {
            if !graph.contains(&item.model) {
                return Err(EngineError::UnknownSelection(item.model.clone()));
            }
            selected.insert(item.model.clone());
            if item.with_upstream {
                selected.extend(graph.upstream(&item.model));
            }
        }
        Ok(Some(selected))
    }
}

/// A model as scheduled by the plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedModel {
    pub name: String,
    pub relation: Relation,
    pub materialization: Materialization,
    pub enabled: bool,

    /// Layer index within the plan
    pub layer: usize,

    /// Rendered SQL; absent for disabled models
    pub sql: Option<String>,
    pub checksum: Option<String>,

    /// Unrendered post-hook template
    pub post_hook: Option<String>,

    /// Model parents that are part of the plan
    pub parents: Vec<NodeId>,

    /// Every disabled model parent, selected or not
    pub disabled_parents: Vec<NodeId>,

    /// Number of model parents in the whole project graph
    pub upstream_count: usize,

    pub path: Option<PathBuf>,
}

/// Ordered, layered plan for a validated project
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<NodeId>,
    layers: Vec<Vec<NodeId>>,
    models: HashMap<NodeId, PlannedModel>,
    graph: DependencyGraph,
}

impl ExecutionPlan {
    /// Model names in execution order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Batches of mutually independent models
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    pub fn model(&self, name: &str) -> Option<&PlannedModel> {
        self.models.get(name)
    }

    /// Planned models in execution order
    pub fn models(&self) -> impl Iterator<Item = &PlannedModel> {
        self.order.iter().filter_map(|name| self.models.get(name))
    }

    /// The full project graph, including unselected models
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Write each enabled model's rendered SQL to `dir/<model>.sql`
    pub fn write_compiled(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        for model in self.models() {
            if let Some(sql) = &model.sql {
                let path = dir.join(format!("{}.sql", model.name));
                std::fs::write(&path, format!("{}\n", sql))?;
                written.push(path);
            }
        }
        Ok(written)
    }
}

/// Turns a loaded project into an execution plan
pub struct Compiler<'a> {
    project: &'a Project,
    context: RenderContext,
}

impl<'a> Compiler<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self {
            project,
            context: project.render_context(),
        }
    }

    /// Validate and plan the whole project
    pub fn compile(&self) -> Result<ExecutionPlan, EngineError> {
        self.compile_selection(&Selection::all())
    }

    /// Validate the project and plan only the selected models
    ///
    /// Validation always covers the whole project so that a broken model
    /// outside the selection is still reported.
    pub fn compile_selection(&self, selection: &Selection) -> Result<ExecutionPlan, EngineError> {
        let catalog = &self.project.catalog;
        let resolver = TemplateResolver::new(catalog, self.context.clone());
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        // Resolve
        let mut resolved = HashMap::new();
        for model in catalog.models().iter().filter(|m| m.is_enabled()) {
            match resolver.resolve(model) {
                Ok(refs) => {
                    resolved.insert(model.name.clone(), refs);
                }
                Err(e) => diagnostics.push(e.to_diagnostic()),
            }
        }
        if !diagnostics.is_empty() {
            return Err(EngineError::Validation(diagnostics));
        }

        // Graph
        let graph = DependencyGraph::from_catalog(catalog)
            .map_err(|e| EngineError::Validation(vec![e.to_diagnostic()]))?;

        // Render
        let mut rendered = HashMap::new();
        for model in catalog.models().iter().filter(|m| m.is_enabled()) {
            let Some(refs) = resolved.get(&model.name) else {
                continue;
            };
            match resolver.render(model, refs) {
                Ok(r) => {
                    rendered.insert(model.name.clone(), r);
                }
                Err(e) => diagnostics.push(e.to_diagnostic()),
            }
        }
        if !diagnostics.is_empty() {
            return Err(EngineError::Validation(diagnostics));
        }

        // Plan
        let selected = selection.expand(&graph)?;
        let in_plan = |name: &str| selected.as_ref().map_or(true, |s| s.contains(name));

        let order: Vec<NodeId> = graph
            .topological_sort()
            .into_iter()
            .filter(|n| in_plan(n))
            .collect();

        let layers: Vec<Vec<NodeId>> = graph
            .layers()
            .into_iter()
            .map(|layer| layer.into_iter().filter(|n| in_plan(n)).collect::<Vec<_>>())
            .filter(|layer| !layer.is_empty())
            .collect();

        let mut models = HashMap::with_capacity(order.len());
        for (index, layer) in layers.iter().enumerate() {
            for name in layer {
                let Some(model) = catalog.model(name) else {
                    continue;
                };
                let output = rendered.remove(name);

                models.insert(
                    name.clone(),
                    PlannedModel {
                        name: name.clone(),
                        relation: catalog.relation_for(model),
                        materialization: model.config.materialized,
                        enabled: model.is_enabled(),
                        layer: index,
                        checksum: output.as_ref().map(|r| r.checksum.clone()),
                        sql: output.map(|r| r.sql),
                        post_hook: model.config.post_hook.clone(),
                        parents: graph
                            .parents(name)
                            .iter()
                            .filter(|p| in_plan(p))
                            .cloned()
                            .collect(),
                        disabled_parents: graph
                            .parents(name)
                            .iter()
                            .filter(|p| catalog.model(p).is_some_and(|m| !m.is_enabled()))
                            .cloned()
                            .collect(),
                        upstream_count: graph.parents(name).len(),
                        path: model.path.clone(),
                    },
                );
            }
        }

        tracing::info!(models = order.len(), layers = layers.len(), "planned execution");

        Ok(ExecutionPlan {
            order,
            layers,
            models,
            graph,
        })
    }
}
