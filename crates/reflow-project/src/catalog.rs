//! Catalog store
//!
//! Holds the registered models (in declaration order) and the source
//! manifest, and names the relation each model materializes into.

use reflow_core::{
    validate_identifier, ConfigError, Diagnostic, DiagnosticCode, Location, Model, Relation, SourceKey,
    TargetConfig,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Source manifest: group -> table -> physical location
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceManifest {
    locations: BTreeMap<SourceKey, Relation>,
}

impl SourceManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the manifest from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Parse a manifest of the form:
    ///
    /// ```toml
    /// [tpch]
    /// customer = "snowflake_sample_data.tpch_sf1.customer"
    /// ```
    pub fn from_toml(toml: &str) -> Result<Self, CatalogError> {
        let groups: BTreeMap<String, BTreeMap<String, String>> = toml::from_str(toml)
            .map_err(|e| CatalogError::Config(ConfigError::ParseError(e.to_string())))?;

        let mut manifest = Self::new();
        for (group, tables) in groups {
            for (table, location) in tables {
                let relation = Relation::parse(&location).map_err(|e| {
                    CatalogError::Config(ConfigError::InvalidValue {
                        key: format!("{}.{}", group, table),
                        message: e.to_string(),
                    })
                })?;
                manifest.insert(SourceKey::new(group.clone(), table), relation);
            }
        }

        Ok(manifest)
    }

    pub fn insert(&mut self, key: SourceKey, relation: Relation) {
        self.locations.insert(key, relation);
    }

    pub fn get(&self, key: &SourceKey) -> Option<&Relation> {
        self.locations.get(key)
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.locations.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SourceKey> {
        self.locations.keys()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Registered models plus source locations for one run
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Models in declaration order
    models: Vec<Model>,

    /// Model name -> position in `models`
    index: HashMap<String, usize>,

    /// External source locations
    sources: SourceManifest,

    /// Run-level defaults for relation naming
    target: TargetConfig,
}

impl Catalog {
    pub fn new(target: TargetConfig, sources: SourceManifest) -> Self {
        Self {
            models: Vec::new(),
            index: HashMap::new(),
            sources,
            target,
        }
    }

    /// Register a parsed model
    ///
    /// Names must be plain identifiers and unique, and no two enabled models
    /// may materialize into the same relation.
    pub fn register(&mut self, model: Model) -> Result<(), CatalogError> {
        validate_identifier("model name", &model.name).map_err(|e| CatalogError::InvalidModelName {
            path: model.display_path(),
            source: e,
        })?;

        if let Some(&existing) = self.index.get(&model.name) {
            return Err(CatalogError::DuplicateModel {
                name: model.name.clone(),
                first: self.models[existing].display_path(),
                second: model.display_path(),
            });
        }

        if model.is_enabled() {
            let relation = self.relation_for(&model).to_string();
            let clash = self.models.iter().find(|other| {
                other.is_enabled() && self.relation_for(other).to_string().eq_ignore_ascii_case(&relation)
            });
            if let Some(other) = clash {
                return Err(CatalogError::DuplicateRelation {
                    relation,
                    first: other.name.clone(),
                    second: model.name.clone(),
                });
            }
        }

        tracing::debug!(model = %model.name, refs = model.refs.len(), sources = model.sources.len(), "registered model");
        self.index.insert(model.name.clone(), self.models.len());
        self.models.push(model);
        Ok(())
    }

    /// All models in declaration order
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    pub fn contains_model(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn sources(&self) -> &SourceManifest {
        &self.sources
    }

    pub fn source(&self, key: &SourceKey) -> Option<&Relation> {
        self.sources.get(key)
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Relation a model materializes into: overrides first, then target defaults
    pub fn relation_for(&self, model: &Model) -> Relation {
        Relation::new(
            model
                .config
                .database
                .clone()
                .or_else(|| self.target.database.clone()),
            model
                .config
                .schema
                .clone()
                .unwrap_or_else(|| self.target.schema.clone()),
            model
                .config
                .alias
                .clone()
                .unwrap_or_else(|| model.name.clone()),
        )
    }

    /// Relation of a model by name
    pub fn model_relation(&self, name: &str) -> Option<Relation> {
        self.model(name).map(|model| self.relation_for(model))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read {0}: {1}")]
    IoError(String, String),

    #[error("Model '{name}' is defined twice ({first} and {second})")]
    DuplicateModel {
        name: String,
        first: String,
        second: String,
    },

    #[error("Model '{second}' materializes into {relation}, already claimed by '{first}'")]
    DuplicateRelation {
        relation: String,
        first: String,
        second: String,
    },

    #[error("Invalid model file name {path}: {source}")]
    InvalidModelName {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CatalogError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            CatalogError::IoError(..) => {
                Diagnostic::error(DiagnosticCode::ProjectIoError, self.to_string())
            }
            CatalogError::DuplicateModel { name, .. } => {
                Diagnostic::error(DiagnosticCode::ConfigInvalid, self.to_string()).with_model(name.clone())
            }
            CatalogError::DuplicateRelation { second, .. } => {
                Diagnostic::error(DiagnosticCode::ConfigInvalid, self.to_string()).with_model(second.clone())
            }
            CatalogError::InvalidModelName { path, .. } => {
                Diagnostic::error(DiagnosticCode::ConfigInvalid, self.to_string())
                    .with_location(Location::new(path.clone()))
            }
            CatalogError::Config(e) => e.to_diagnostic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflow_core::{ConfigOverrides, Materialization};

    fn target() -> TargetConfig {
        TargetConfig {
            name: "dev".to_string(),
            database: Some("analytics".to_string()),
            schema: "public".to_string(),
        }
    }

    #[test]
    fn parse_source_manifest() {
        let manifest = SourceManifest::from_toml(
            r#"
            [tpch]
            customer = "snowflake_sample_data.tpch_sf1.customer"
            nation = "tpch_sf1.nation"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 2);
        let customer = manifest.get(&SourceKey::new("tpch", "customer")).unwrap();
        assert_eq!(customer.to_string(), "snowflake_sample_data.tpch_sf1.customer");
        assert!(manifest.contains(&SourceKey::new("tpch", "nation")));
        assert!(!manifest.contains(&SourceKey::new("tpch", "region")));
    }

    #[test]
    fn bad_source_location_is_rejected() {
        let err = SourceManifest::from_toml("[tpch]\ncustomer = \"customer\"\n").unwrap_err();
        assert!(matches!(err, CatalogError::Config(ConfigError::InvalidValue { .. })));
        assert!(err.to_string().contains("tpch.customer"));
    }

    #[test]
    fn relation_uses_overrides_then_defaults() {
        let mut catalog = Catalog::new(target(), SourceManifest::new());
        let config = ConfigOverrides {
            materialized: Some(Materialization::Table),
            schema: Some("marts".to_string()),
            alias: Some("dim_customer".to_string()),
            ..Default::default()
        }
        .resolve();

        catalog
            .register(Model::new("dim_customers", "select 1").with_config(config))
            .unwrap();
        catalog.register(Model::new("stg_orders", "select 2")).unwrap();

        assert_eq!(
            catalog.model_relation("dim_customers").unwrap().to_string(),
            "analytics.marts.dim_customer"
        );
        assert_eq!(
            catalog.model_relation("stg_orders").unwrap().to_string(),
            "analytics.public.stg_orders"
        );
        assert_eq!(catalog.model_relation("missing"), None);
    }

    #[test]
    fn duplicate_model_is_rejected() {
        let mut catalog = Catalog::new(target(), SourceManifest::new());
        catalog
            .register(Model::new("stg_orders", "select 1").with_path("models/a/stg_orders.sql"))
            .unwrap();

        let err = catalog
            .register(Model::new("stg_orders", "select 1").with_path("models/b/stg_orders.sql"))
            .unwrap_err();

        assert!(matches!(err, CatalogError::DuplicateModel { .. }));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn model_name_must_be_identifier() {
        let mut catalog = Catalog::new(target(), SourceManifest::new());
        let err = catalog
            .register(Model::new("my-model", "select 1").with_path("models/my-model.sql"))
            .unwrap_err();

        assert!(matches!(err, CatalogError::InvalidModelName { .. }));
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::ConfigInvalid);
        assert_eq!(diag.location.unwrap().file, "models/my-model.sql");
        assert!(catalog.is_empty());
    }

    #[test]
    fn aliases_colliding_on_one_relation_are_rejected() {
        let mut catalog = Catalog::new(target(), SourceManifest::new());
        let aliased = ConfigOverrides {
            alias: Some("dim_customer".to_string()),
            ..Default::default()
        };

        catalog
            .register(Model::new("dim_customers", "select 1").with_config(aliased.resolve()))
            .unwrap();
        let err = catalog
            .register(Model::new("dim_customer", "select 2"))
            .unwrap_err();

        match &err {
            CatalogError::DuplicateRelation { relation, first, second } => {
                assert_eq!(relation, "analytics.public.dim_customer");
                assert_eq!(first, "dim_customers");
                assert_eq!(second, "dim_customer");
            }
            other => panic!("expected relation clash, got {:?}", other),
        }
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn disabled_model_does_not_claim_its_relation() {
        let mut catalog = Catalog::new(target(), SourceManifest::new());
        let disabled = ConfigOverrides {
            enabled: Some(false),
            alias: Some("orders".to_string()),
            ..Default::default()
        };

        catalog
            .register(Model::new("legacy_orders", "select 1").with_config(disabled.resolve()))
            .unwrap();
        catalog.register(Model::new("orders", "select 2")).unwrap();
        assert_eq!(catalog.len(), 2);
    }
}
