//! Jinja functions
//!
//! `ref()`, `source()`, `config()` and `var()` come in two flavours: capturing
//! functions used while parsing (they record what the template asks for) and
//! resolving functions used while rendering (they return relation names).

use minijinja::value::Kwargs;
use minijinja::{Error, ErrorKind, Value};
use reflow_core::{Relation, SourceKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A reference found in a model template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateReference {
    /// ref('model_name')
    Ref { model: String },

    /// source('group', 'table')
    Source { group: String, table: String },
}

impl std::fmt::Display for TemplateReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ref { model } => write!(f, "ref('{}')", model),
            Self::Source { group, table } => write!(f, "source('{}', '{}')", group, table),
        }
    }
}

/// What a template asked for while being parsed
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub references: Vec<TemplateReference>,
    pub config: Vec<(String, serde_json::Value)>,
}

impl Captured {
    fn record(&mut self, reference: TemplateReference) {
        if !self.references.contains(&reference) {
            self.references.push(reference);
        }
    }
}

pub(crate) type SharedCapture = Arc<Mutex<Captured>>;

fn with_capture<R>(capture: &SharedCapture, f: impl FnOnce(&mut Captured) -> R) -> R {
    let mut guard = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

/// Two-argument `ref('package', 'model')` keeps only the model name
fn ref_target(model_or_package: String, model_name: Option<String>) -> String {
    model_name.unwrap_or(model_or_package)
}

/// Capturing ref(): records the model name and echoes it back
pub(crate) fn capture_ref(
    capture: SharedCapture,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |model_or_package, model_name| {
        let model = ref_target(model_or_package, model_name);
        with_capture(&capture, |c| c.record(TemplateReference::Ref { model: model.clone() }));
        Ok(Value::from(model))
    }
}

/// Capturing source(): records the (group, table) pair
pub(crate) fn capture_source(
    capture: SharedCapture,
) -> impl Fn(String, String) -> Result<Value, Error> + Send + Sync + 'static {
    move |group, table| {
        let placeholder = format!("{}.{}", group, table);
        with_capture(&capture, |c| c.record(TemplateReference::Source { group, table }));
        Ok(Value::from(placeholder))
    }
}

/// Capturing config(): records every keyword argument
///
/// Validation of the keys happens after parsing so the error can name the
/// model; here every argument is taken as-is.
pub(crate) fn capture_config(
    capture: SharedCapture,
) -> impl Fn(Kwargs) -> Result<Value, Error> + Send + Sync + 'static {
    move |kwargs: Kwargs| {
        let keys: Vec<String> = kwargs.args().map(str::to_string).collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Value = kwargs.get(&key)?;
            let json = serde_json::to_value(&value).map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("config() argument `{}` is not a plain value: {}", key, e),
                )
            })?;
            entries.push((key, json));
        }

        with_capture(&capture, |c| c.config.extend(entries));
        Ok(Value::from(""))
    }
}

/// Resolving ref(): returns the relation of a model resolved before rendering
pub(crate) fn resolved_ref(
    refs: Arc<BTreeMap<String, Relation>>,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |model_or_package, model_name| {
        let model = ref_target(model_or_package, model_name);
        refs.get(&model)
            .map(|relation| Value::from(relation.to_string()))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("ref('{}') was not resolved before rendering", model),
                )
            })
    }
}

/// Resolving source(): returns the physical location of a source
pub(crate) fn resolved_source(
    sources: Arc<BTreeMap<SourceKey, Relation>>,
) -> impl Fn(String, String) -> Result<Value, Error> + Send + Sync + 'static {
    move |group, table| {
        let key = SourceKey::new(group, table);
        sources
            .get(&key)
            .map(|relation| Value::from(relation.to_string()))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("source('{}', '{}') was not resolved before rendering", key.group, key.table),
                )
            })
    }
}

/// config() while rendering: metadata only, emits nothing
pub(crate) fn config_noop(_kwargs: Kwargs) -> Result<Value, Error> {
    Ok(Value::from(""))
}

/// var() - looks up a project variable, falling back to the default
pub(crate) fn var_lookup(
    vars: Arc<BTreeMap<String, serde_json::Value>>,
) -> impl Fn(String, Option<Value>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name, default| {
        if let Some(value) = vars.get(&name) {
            return Ok(Value::from_serialize(value));
        }

        default.ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                format!("Variable '{}' is not defined", name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_ref_records_once() {
        let capture = SharedCapture::default();
        let f = capture_ref(capture.clone());

        assert_eq!(f("stg_orders".to_string(), None).unwrap().as_str(), Some("stg_orders"));
        f("stg_orders".to_string(), None).unwrap();
        f("tpch".to_string(), Some("dim_customers".to_string())).unwrap();

        let captured = capture.lock().unwrap();
        assert_eq!(
            captured.references,
            vec![
                TemplateReference::Ref { model: "stg_orders".to_string() },
                TemplateReference::Ref { model: "dim_customers".to_string() },
            ]
        );
    }

    #[test]
    fn capture_source_records_pair() {
        let capture = SharedCapture::default();
        let f = capture_source(capture.clone());

        let placeholder = f("tpch".to_string(), "customer".to_string()).unwrap();
        assert_eq!(placeholder.as_str(), Some("tpch.customer"));
        assert_eq!(
            capture.lock().unwrap().references,
            vec![TemplateReference::Source {
                group: "tpch".to_string(),
                table: "customer".to_string(),
            }]
        );
    }

    #[test]
    fn resolved_ref_returns_relation() {
        let mut refs = BTreeMap::new();
        refs.insert(
            "dim_customers".to_string(),
            Relation::new(None, "marts", "dim_customer"),
        );
        let f = resolved_ref(Arc::new(refs));

        assert_eq!(
            f("dim_customers".to_string(), None).unwrap().as_str(),
            Some("marts.dim_customer")
        );
        assert!(f("missing".to_string(), None).is_err());
    }

    #[test]
    fn var_with_default() {
        let mut vars = BTreeMap::new();
        vars.insert("start_date".to_string(), serde_json::json!("1995-01-01"));
        let f = var_lookup(Arc::new(vars));

        assert_eq!(f("start_date".to_string(), None).unwrap().as_str(), Some("1995-01-01"));
        assert_eq!(
            f("missing".to_string(), Some(Value::from("fallback"))).unwrap().as_str(),
            Some("fallback")
        );
        assert!(f("missing".to_string(), None).is_err());
    }

    #[test]
    fn reference_display() {
        let reference = TemplateReference::Source {
            group: "tpch".to_string(),
            table: "nation".to_string(),
        };
        assert_eq!(reference.to_string(), "source('tpch', 'nation')");
    }
}
