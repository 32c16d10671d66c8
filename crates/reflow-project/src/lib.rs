//! Catalog store and DAG construction
//!
//! This crate handles:
//! - Holding registered models and the source manifest (the catalog)
//! - Naming relations from model overrides and run-level defaults
//! - Building and validating the dependency graph (DAG)
//! - Ordering (stable topological sort, layers) and impact analysis
//! - Model documentation files (`*.yml` under the models directory)

pub mod catalog;
pub mod dag;
pub mod docs;

pub use catalog::{Catalog, CatalogError, SourceManifest};
pub use dag::{DependencyGraph, GraphError, NodeId};
pub use docs::{ColumnDoc, ColumnTest, DocsError, ModelDoc, SchemaDocs, SchemaFile};
