//! Warehouse adapter trait for executing materializations

use reflow_core::Relation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the warehouse should do with a statement's SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// `create or replace view <relation> as <sql>`
    CreateView,

    /// Drop and rebuild `<relation>` from `<sql>`
    CreateOrReplaceTable,

    /// Run `<sql>` verbatim (hooks)
    ExecuteRaw,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateView => write!(f, "create-view-as"),
            Self::CreateOrReplaceTable => write!(f, "create-or-replace-table-as"),
            Self::ExecuteRaw => write!(f, "execute-raw"),
        }
    }
}

/// A single request to the warehouse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub directive: Directive,

    /// Target object; absent for raw statements
    pub relation: Option<Relation>,

    /// Rendered SQL (a select for materializations)
    pub sql: String,
}

impl Statement {
    pub fn create_view(relation: Relation, sql: impl Into<String>) -> Self {
        Self {
            directive: Directive::CreateView,
            relation: Some(relation),
            sql: sql.into(),
        }
    }

    pub fn create_or_replace_table(relation: Relation, sql: impl Into<String>) -> Self {
        Self {
            directive: Directive::CreateOrReplaceTable,
            relation: Some(relation),
            sql: sql.into(),
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            directive: Directive::ExecuteRaw,
            relation: None,
            sql: sql.into(),
        }
    }
}

/// Metadata returned by the warehouse on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Rows written, when the warehouse reports it
    pub rows_affected: Option<u64>,

    /// Name of the object created or replaced
    pub object: Option<String>,
}

/// Errors that can occur when executing statements
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Statement rejected: {0}")]
    QueryError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Statement is missing a target relation for {0}")]
    MissingRelation(Directive),
}

/// Trait for warehouses that can materialize models
#[async_trait::async_trait]
pub trait WarehouseAdapter: Send + Sync {
    /// Get the adapter name (e.g., "Postgres", "Mock")
    fn name(&self) -> &'static str;

    /// Execute one statement
    ///
    /// Each call is an independent request; no transaction spans calls.
    async fn execute(&self, statement: &Statement) -> Result<ExecutionMetadata, ExecutionError>;

    /// Test the connection to the warehouse
    async fn test_connection(&self) -> Result<(), ExecutionError>;

    /// SQL sent for a statement; adapters override this for dialect quirks
    fn ddl(&self, statement: &Statement) -> Result<String, ExecutionError> {
        ansi_ddl(statement)
    }
}

/// ANSI-flavoured DDL wrapping for a statement
pub fn ansi_ddl(statement: &Statement) -> Result<String, ExecutionError> {
    let relation = || {
        statement
            .relation
            .as_ref()
            .ok_or(ExecutionError::MissingRelation(statement.directive))
    };

    Ok(match statement.directive {
        Directive::CreateView => {
            format!("create or replace view {} as (\n{}\n)", relation()?, statement.sql)
        }
        Directive::CreateOrReplaceTable => {
            format!("create or replace table {} as (\n{}\n)", relation()?, statement.sql)
        }
        Directive::ExecuteRaw => statement.sql.clone(),
    })
}
