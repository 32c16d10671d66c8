//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency graphs over models, validates them
//! (dangling references, cycles) and derives the execution order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use reflow_core::{Diagnostic, DiagnosticCode, Model, SourceKey};
use crate::catalog::{Catalog, SourceManifest};

/// Node identifier (model name)
pub type NodeId = String;

/// Validated dependency graph with forward and reverse edges
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes in declaration order
    nodes: Vec<NodeId>,

    /// Node -> declaration index, used to break ties deterministically
    position: HashMap<NodeId, usize>,

    /// Forward edges: node -> list of models it depends on (parents)
    parents: HashMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> list of models that depend on it (children)
    children: HashMap<NodeId, Vec<NodeId>>,

    /// Node -> external sources it reads
    sources: HashMap<NodeId, Vec<SourceKey>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnStack,
    Done,
}

impl DependencyGraph {
    /// Build and validate the graph of every model in the catalog
    pub fn from_catalog(catalog: &Catalog) -> Result<Self, GraphError> {
        Self::build(catalog.models(), catalog.sources())
    }

    /// Build and validate a graph from models and their reference lists
    ///
    /// Fails on the first dangling reference (in declaration order) or on a
    /// cycle. No partially-built graph is returned on failure.
    pub fn build(models: &[Model], known_sources: &SourceManifest) -> Result<Self, GraphError> {
        let position: HashMap<NodeId, usize> = models
            .iter()
            .enumerate()
            .map(|(i, model)| (model.name.clone(), i))
            .collect();

        let mut parents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut sources: HashMap<NodeId, Vec<SourceKey>> = HashMap::new();

        for model in models {
            let mut deps: Vec<NodeId> = Vec::new();
            for dep in &model.refs {
                if !position.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        model: model.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }

            for source in &model.sources {
                if !known_sources.contains(source) {
                    return Err(GraphError::MissingDependency {
                        model: model.name.clone(),
                        dependency: format!("source {}", source),
                    });
                }
            }

            // Build reverse edges
            for dep in &deps {
                children
                    .entry(dep.clone())
                    .or_insert_with(Vec::new)
                    .push(model.name.clone());
            }

            parents.insert(model.name.clone(), deps);
            sources.insert(model.name.clone(), model.sources.clone());
        }

        let graph = Self {
            nodes: models.iter().map(|m| m.name.clone()).collect(),
            position,
            parents,
            children,
            sources,
        };

        if let Some(members) = graph.find_cycle() {
            return Err(GraphError::CyclicDependency { members });
        }

        Ok(graph)
    }

    /// Depth-first search over depends-on edges with recursion-stack tracking
    ///
    /// Returns the members of the first cycle found, in dependency order
    /// starting from the node first reached.
    fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut state: HashMap<&str, Visit> =
            self.nodes.iter().map(|n| (n.as_str(), Visit::New)).collect();
        let mut stack: Vec<&str> = Vec::new();

        for node in &self.nodes {
            if state[node.as_str()] == Visit::New {
                if let Some(cycle) = self.visit(node, &mut state, &mut stack) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        state: &mut HashMap<&'a str, Visit>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<NodeId>> {
        state.insert(node, Visit::OnStack);
        stack.push(node);

        for parent in self.parents(node) {
            match state.get(parent.as_str()).copied().unwrap_or(Visit::Done) {
                Visit::OnStack => {
                    let start = stack.iter().position(|n| *n == parent.as_str()).unwrap_or(0);
                    return Some(stack[start..].iter().map(|n| n.to_string()).collect());
                }
                Visit::New => {
                    if let Some(cycle) = self.visit(parent, state, stack) {
                        return Some(cycle);
                    }
                }
                Visit::Done => {}
            }
        }

        stack.pop();
        state.insert(node, Visit::Done);
        None
    }

    /// Get all nodes in declaration order
    pub fn all_nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.position.contains_key(node_id)
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> &[NodeId] {
        self.parents
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> &[NodeId] {
        self.children
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// External sources read by a node
    pub fn sources(&self, node_id: &str) -> &[SourceKey] {
        self.sources
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Get all downstream nodes (transitive closure of children)
    ///
    /// This is the "blast radius" - every model blocked if this node fails.
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        self.closure(node_id, |n| self.children(n))
    }

    /// Get all upstream nodes (transitive closure of parents)
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        self.closure(node_id, |n| self.parents(n))
    }

    /// BFS from the immediate neighbours of `node_id`
    fn closure<'a, F>(&'a self, node_id: &str, next: F) -> Vec<NodeId>
    where
        F: Fn(&str) -> &'a [NodeId],
    {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = next(node_id).iter().map(String::as_str).collect();
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current.to_string());

            for neighbour in next(current) {
                if !visited.contains(neighbour.as_str()) {
                    queue.push_back(neighbour.as_str());
                }
            }
        }

        result
    }

    /// Check if there's a path from source to target along depends-on edges
    /// reversed (i.e. `target` is downstream of `source`)
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.downstream(source).iter().any(|n| n == target)
    }

    /// Stable topological sort (Kahn's algorithm)
    ///
    /// Among nodes whose dependencies are all satisfied, the one declared
    /// first is emitted first, so the order only depends on the graph and the
    /// declaration order.
    pub fn topological_sort(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.parents(n).len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| in_degree[n.as_str()] == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            let node = &self.nodes[i];
            result.push(node.clone());

            for child in self.children(node) {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.position[child]));
                    }
                }
            }
        }

        result
    }

    /// Partition nodes into layers by longest distance from a root
    ///
    /// Every node's parents sit in strictly earlier layers, so the members of
    /// one layer never depend on each other. Each layer keeps declaration
    /// order.
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<NodeId, usize> = HashMap::new();
        let mut layers: Vec<Vec<NodeId>> = Vec::new();

        for node in self.topological_sort() {
            let level = self
                .parents(&node)
                .iter()
                .filter_map(|p| depth.get(p))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);

            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(node.clone());
            depth.insert(node, level);
        }

        for layer in &mut layers {
            layer.sort_by_key(|n| self.position[n]);
        }

        layers
    }
}

/// Graph validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Cyclic dependency detected: {}", format_cycle(.members))]
    CyclicDependency { members: Vec<NodeId> },

    #[error("Model '{model}' depends on '{dependency}', which is not a model or source")]
    MissingDependency { model: NodeId, dependency: String },
}

fn format_cycle(members: &[NodeId]) -> String {
    let mut path = members.join(" -> ");
    if let Some(first) = members.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

impl GraphError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            GraphError::CyclicDependency { members } => {
                Diagnostic::error(DiagnosticCode::CyclicDependency, self.to_string())
                    .with_impact(members.clone())
            }
            GraphError::MissingDependency { model, .. } => {
                Diagnostic::error(DiagnosticCode::MissingDependency, self.to_string())
                    .with_model(model.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflow_core::Relation;

    fn model(name: &str, refs: &[&str]) -> Model {
        Model::new(name, "select 1").with_refs(refs.iter().copied())
    }

    fn tpch_sources() -> SourceManifest {
        let mut sources = SourceManifest::new();
        for table in ["customer", "nation", "region", "orders"] {
            sources.insert(
                SourceKey::new("tpch", table),
                Relation::new(None, "tpch_sf1", table),
            );
        }
        sources
    }

    fn position(order: &[NodeId], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn tpch_plan_orders_dependencies_first() {
        let models = vec![
            model("fact_sales", &["stg_orders", "dim_customers"]),
            model("stg_orders", &[]).with_sources(vec![SourceKey::new("tpch", "orders")]),
            model("dim_customers", &[]).with_sources(vec![
                SourceKey::new("tpch", "customer"),
                SourceKey::new("tpch", "nation"),
                SourceKey::new("tpch", "region"),
            ]),
        ];
        let dag = DependencyGraph::build(&models, &tpch_sources()).unwrap();

        let order = dag.topological_sort();
        assert_eq!(order, vec!["stg_orders", "dim_customers", "fact_sales"]);
        assert_eq!(dag.sources("dim_customers").len(), 3);

        let layers = dag.layers();
        assert_eq!(layers, vec![
            vec!["stg_orders".to_string(), "dim_customers".to_string()],
            vec!["fact_sales".to_string()],
        ]);
    }

    #[test]
    fn every_edge_respects_order() {
        let models = vec![
            model("e", &["d", "b"]),
            model("d", &["c"]),
            model("c", &["a"]),
            model("b", &["a"]),
            model("a", &[]),
            model("f", &[]),
        ];
        let dag = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();
        let order = dag.topological_sort();
        assert_eq!(order.len(), models.len());

        for m in &models {
            for dep in &m.refs {
                assert!(position(&order, dep) < position(&order, &m.name));
            }
        }

        let layers = dag.layers();
        let layer_of = |name: &str| layers.iter().position(|l| l.iter().any(|n| n == name)).unwrap();
        for m in &models {
            for dep in &m.refs {
                assert!(layer_of(dep) < layer_of(&m.name));
            }
        }
        assert_eq!(layer_of("e"), 3);
        assert_eq!(layer_of("f"), 0);
    }

    #[test]
    fn planning_is_deterministic() {
        let models = vec![
            model("z", &[]),
            model("y", &["z"]),
            model("x", &[]),
            model("w", &["x", "y"]),
        ];
        let first = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();
        let second = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();

        assert_eq!(first.topological_sort(), second.topological_sort());
        assert_eq!(first.layers(), second.layers());
        assert_eq!(first.topological_sort(), vec!["z", "y", "x", "w"]);
    }

    #[test]
    fn two_node_cycle_names_both_members() {
        let models = vec![model("a", &["b"]), model("b", &["a"])];
        let err = DependencyGraph::build(&models, &SourceManifest::new()).unwrap_err();

        match err {
            GraphError::CyclicDependency { members } => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let models = vec![model("a", &["a"])];
        let err = DependencyGraph::build(&models, &SourceManifest::new()).unwrap_err();
        assert_eq!(err, GraphError::CyclicDependency { members: vec!["a".to_string()] });
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> a");
    }

    #[test]
    fn cycle_behind_acyclic_prefix_reports_only_members() {
        let models = vec![
            model("root", &["x"]),
            model("x", &["y"]),
            model("y", &["z"]),
            model("z", &["x"]),
        ];
        let err = DependencyGraph::build(&models, &SourceManifest::new()).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                members: vec!["x".to_string(), "y".to_string(), "z".to_string()],
            }
        );
    }

    #[test]
    fn dangling_ref_is_missing_dependency() {
        let models = vec![model("fact_sales", &["stg_orders"])];
        let err = DependencyGraph::build(&models, &SourceManifest::new()).unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingDependency {
                model: "fact_sales".to_string(),
                dependency: "stg_orders".to_string(),
            }
        );
    }

    #[test]
    fn dangling_source_is_missing_dependency() {
        let models = vec![model("stg_lineitem", &[])
            .with_sources(vec![SourceKey::new("tpch", "lineitem")])];
        let err = DependencyGraph::build(&models, &tpch_sources()).unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));
        assert!(err.to_string().contains("source tpch.lineitem"));
    }

    #[test]
    fn downstream_and_upstream_impact() {
        let models = vec![
            model("stg_orders", &[]),
            model("int_orders", &["stg_orders"]),
            model("fact_sales", &["int_orders"]),
            model("dim_customers", &[]),
        ];
        let dag = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();

        assert_eq!(dag.downstream("stg_orders"), vec!["int_orders", "fact_sales"]);
        assert_eq!(dag.upstream("fact_sales"), vec!["int_orders", "stg_orders"]);
        assert!(dag.has_path("stg_orders", "fact_sales"));
        assert!(!dag.has_path("dim_customers", "fact_sales"));
        assert_eq!(dag.children("stg_orders"), ["int_orders".to_string()]);
    }

    #[test]
    fn duplicate_refs_collapse_to_one_edge() {
        let models = vec![model("a", &[]), model("b", &["a", "a"])];
        let dag = DependencyGraph::build(&models, &SourceManifest::new()).unwrap();
        assert_eq!(dag.parents("b").len(), 1);
        assert_eq!(dag.children("a").len(), 1);
    }
}
