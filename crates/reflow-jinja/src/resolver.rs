//! Reference resolution and rendering (phase two)
//!
//! Every reference of a parsed model is looked up in the catalog first;
//! only then is the body rendered with the resolved relation names.

use minijinja::{context, Environment, UndefinedBehavior, Value};
use reflow_core::{checksum, Diagnostic, DiagnosticCode, Location, Materialization, Model, Relation, SourceKey};
use reflow_project::Catalog;
use std::collections::BTreeMap;
use std::sync::Arc;
use crate::context::RenderContext;
use crate::functions;
use crate::parser::TemplateError;

/// Reference resolution errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("Model '{model}' references unknown model '{reference}'")]
    UnresolvedReference {
        model: String,
        reference: String,
        file: Option<String>,
    },

    #[error("Model '{model}' references unknown source '{source_key}'")]
    UnresolvedSource {
        model: String,
        source_key: SourceKey,
        file: Option<String>,
    },
}

impl ResolveError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let (code, model, file) = match self {
            ResolveError::UnresolvedReference { model, file, .. } => {
                (DiagnosticCode::UnresolvedReference, model, file)
            }
            ResolveError::UnresolvedSource { model, file, .. } => {
                (DiagnosticCode::UnresolvedSource, model, file)
            }
        };

        let diag = Diagnostic::error(code, self.to_string()).with_model(model.clone());
        match file {
            Some(file) => diag.with_location(Location::new(file.clone())),
            None => diag,
        }
    }
}

/// Resolved identifiers for one model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedReferences {
    /// ref name -> relation
    pub refs: BTreeMap<String, Relation>,

    /// source -> physical location
    pub sources: BTreeMap<SourceKey, Relation>,

    /// Referenced model names in first-seen order; edge candidates for the DAG
    pub edges: Vec<String>,
}

/// A model ready to be materialized
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedModel {
    pub name: String,
    pub relation: Relation,
    pub materialization: Materialization,
    pub sql: String,
    pub checksum: String,
}

/// Phase-two resolver and renderer
pub struct TemplateResolver<'a> {
    catalog: &'a Catalog,
    context: RenderContext,
}

impl<'a> TemplateResolver<'a> {
    pub fn new(catalog: &'a Catalog, context: RenderContext) -> Self {
        Self { catalog, context }
    }

    /// Look up every reference of `model` in the catalog
    pub fn resolve(&self, model: &Model) -> Result<ResolvedReferences, ResolveError> {
        let file = model.path.as_ref().map(|p| p.display().to_string());
        let mut resolved = ResolvedReferences::default();

        for name in &model.refs {
            let relation = self.catalog.model_relation(name).ok_or_else(|| {
                ResolveError::UnresolvedReference {
                    model: model.name.clone(),
                    reference: name.clone(),
                    file: file.clone(),
                }
            })?;

            if !resolved.edges.contains(name) {
                resolved.edges.push(name.clone());
            }
            resolved.refs.insert(name.clone(), relation);
        }

        for key in &model.sources {
            let relation = self.catalog.source(key).ok_or_else(|| ResolveError::UnresolvedSource {
                model: model.name.clone(),
                source_key: key.clone(),
                file: file.clone(),
            })?;
            resolved.sources.insert(key.clone(), relation.clone());
        }

        Ok(resolved)
    }

    /// Render a model body with its resolved references substituted
    pub fn render(&self, model: &Model, resolved: &ResolvedReferences) -> Result<RenderedModel, TemplateError> {
        let relation = self.catalog.relation_for(model);

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_function("ref", functions::resolved_ref(Arc::new(resolved.refs.clone())));
        env.add_function("source", functions::resolved_source(Arc::new(resolved.sources.clone())));
        env.add_function("config", functions::config_noop);
        env.add_function("var", functions::var_lookup(self.context.vars.clone()));

        let sql = env
            .render_str(&model.raw_body, context! {
                this => relation.to_string(),
                target => Value::from_serialize(&self.context.target),
            })
            .map_err(|e| TemplateError::from_jinja(&model.name, model.path.as_deref(), e))?;

        let sql = sql.trim().to_string();

        Ok(RenderedModel {
            name: model.name.clone(),
            checksum: checksum(&sql),
            materialization: model.config.materialized,
            relation,
            sql,
        })
    }

    /// Resolve then render
    pub fn resolve_and_render(&self, model: &Model) -> Result<RenderedModel, TemplateError> {
        let resolved = self.resolve(model)?;
        self.render(model, &resolved)
    }

    /// Render a post-hook with `this` bound to the model's relation
    pub fn render_hook(&self, model: &Model, hook: &str) -> Result<String, TemplateError> {
        render_hook(&self.context, &model.name, hook, &self.catalog.relation_for(model))
    }
}

/// Render a hook template for `model`, substituting `{{ this }}`
pub fn render_hook(
    context: &RenderContext,
    model: &str,
    hook: &str,
    this: &Relation,
) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_function("var", functions::var_lookup(context.vars.clone()));

    env.render_str(hook, context! {
        this => this.to_string(),
        target => Value::from_serialize(&context.target),
    })
    .map(|sql| sql.trim().to_string())
    .map_err(|e| TemplateError::from_jinja(model, None, e))
}
