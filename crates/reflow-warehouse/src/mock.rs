//! In-memory warehouse
//!
//! Records every statement instead of sending it anywhere. Backs the
//! scheduler and hook tests as well as `reflow run --dry-run`.
//!
//! ## Injecting failures
//!
//! ```rust,ignore
//! // Reject the materialization of one relation
//! let warehouse = MockWarehouse::new();
//! warehouse.fail_relation("analytics.public.stg_orders", "syntax error").await;
//!
//! // Reject any raw statement containing "grant"
//! warehouse.fail_statements_containing("grant", "permission denied").await;
//!
//! // Every statement takes 100ms
//! let warehouse = MockWarehouse::new().with_latency(100);
//! ```

use crate::adapter::{Directive, ExecutionError, ExecutionMetadata, Statement, WarehouseAdapter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A statement as the mock received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub directive: Directive,

    /// Fully-qualified target, if any
    pub relation: Option<String>,

    /// SQL as it would have been sent
    pub sql: String,
}

/// Recording warehouse
///
/// Statements are appended to an in-memory log in the order they are
/// received. The adapter is cheap to clone; clones share the log and the
/// configured failures.
pub struct MockWarehouse {
    /// Every statement received, in order
    log: Arc<RwLock<Vec<ExecutedStatement>>>,

    /// Errors to return for specific relations (by FQN)
    relation_errors: Arc<RwLock<HashMap<String, ExecutionError>>>,

    /// Errors to return for statements containing a substring
    statement_errors: Arc<RwLock<Vec<(String, ExecutionError)>>>,

    /// Statements currently executing
    in_flight: Arc<AtomicUsize>,

    /// Highest number of concurrently executing statements seen
    peak_in_flight: Arc<AtomicUsize>,

    /// `test_connection` fails when set
    fail_connection: bool,

    /// Delay applied to every statement, in milliseconds
    latency_ms: u64,
}

impl MockWarehouse {
    /// Create a new mock warehouse that accepts everything
    pub fn new() -> Self {
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            relation_errors: Arc::new(RwLock::new(HashMap::new())),
            statement_errors: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            fail_connection: false,
            latency_ms: 0,
        }
    }

    /// Reject any materialization targeting `relation`
    pub async fn fail_relation(&self, relation: &str, message: &str) {
        self.relation_errors
            .write()
            .await
            .insert(relation.to_string(), ExecutionError::QueryError(message.to_string()));
    }

    /// Reject any statement whose SQL contains `needle`
    pub async fn fail_statements_containing(&self, needle: &str, message: &str) {
        self.statement_errors
            .write()
            .await
            .push((needle.to_string(), ExecutionError::QueryError(message.to_string())));
    }

    /// Make `test_connection` fail
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Delay every statement by `latency_ms`
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Snapshot of the statement log
    pub async fn executed(&self) -> Vec<ExecutedStatement> {
        self.log.read().await.clone()
    }

    /// Relations materialized successfully, in order
    pub async fn materialized_relations(&self) -> Vec<String> {
        self.log
            .read()
            .await
            .iter()
            .filter(|s| s.directive != Directive::ExecuteRaw)
            .filter_map(|s| s.relation.clone())
            .collect()
    }

    /// Raw statements executed successfully, in order
    pub async fn raw_statements(&self) -> Vec<String> {
        self.log
            .read()
            .await
            .iter()
            .filter(|s| s.directive == Directive::ExecuteRaw)
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Highest concurrency observed
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Sleep for the configured latency
    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    async fn configured_error(&self, statement: &Statement) -> Option<ExecutionError> {
        if statement.directive != Directive::ExecuteRaw {
            if let Some(relation) = &statement.relation {
                if let Some(error) = self.relation_errors.read().await.get(&relation.fqn()) {
                    return Some(error.clone());
                }
            }
        }

        self.statement_errors
            .read()
            .await
            .iter()
            .find(|(needle, _)| statement.sql.contains(needle.as_str()))
            .map(|(_, error)| error.clone())
    }
}

impl Default for MockWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockWarehouse {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            relation_errors: Arc::clone(&self.relation_errors),
            statement_errors: Arc::clone(&self.statement_errors),
            in_flight: Arc::clone(&self.in_flight),
            peak_in_flight: Arc::clone(&self.peak_in_flight),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
        }
    }
}

#[async_trait::async_trait]
impl WarehouseAdapter for MockWarehouse {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecutionMetadata, ExecutionError> {
        let sql = self.ddl(statement)?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        self.simulate_latency().await;
        let outcome = self.configured_error(statement).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = outcome {
            return Err(error);
        }

        let relation = statement.relation.as_ref().map(|r| r.fqn());
        self.log.write().await.push(ExecutedStatement {
            directive: statement.directive,
            relation: relation.clone(),
            sql,
        });

        Ok(ExecutionMetadata {
            rows_affected: None,
            object: relation,
        })
    }

    async fn test_connection(&self) -> Result<(), ExecutionError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(ExecutionError::NetworkError(
                "mock warehouse configured to refuse connections".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Builder for creating a MockWarehouse with predefined failures
///
/// # Example
///
/// ```rust,ignore
/// let warehouse = MockWarehouseBuilder::new()
///     .with_relation_error("analytics.public.stg_orders", "table is locked")
///     .with_latency(50)
///     .build();
/// ```
pub struct MockWarehouseBuilder {
    relation_errors: HashMap<String, ExecutionError>,
    statement_errors: Vec<(String, ExecutionError)>,
    fail_connection: bool,
    latency_ms: u64,
}

impl MockWarehouseBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            relation_errors: HashMap::new(),
            statement_errors: Vec::new(),
            fail_connection: false,
            latency_ms: 0,
        }
    }

    /// Reject materializations of a relation
    pub fn with_relation_error(mut self, relation: &str, message: &str) -> Self {
        self.relation_errors
            .insert(relation.to_string(), ExecutionError::QueryError(message.to_string()));
        self
    }

    /// Reject statements containing a substring
    pub fn with_statement_error(mut self, needle: &str, message: &str) -> Self {
        self.statement_errors
            .push((needle.to_string(), ExecutionError::QueryError(message.to_string())));
        self
    }

    /// Configure connection failure
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure latency
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Build the MockWarehouse
    pub fn build(self) -> MockWarehouse {
        MockWarehouse {
            relation_errors: Arc::new(RwLock::new(self.relation_errors)),
            statement_errors: Arc::new(RwLock::new(self.statement_errors)),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            ..MockWarehouse::new()
        }
    }
}

impl Default for MockWarehouseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_core::Relation;

    fn stg_orders() -> Relation {
        Relation::new(Some("analytics".to_string()), "public", "stg_orders")
    }

    #[tokio::test]
    async fn test_records_statements_in_order() {
        let warehouse = MockWarehouse::new();

        warehouse
            .execute(&Statement::create_view(stg_orders(), "select 1"))
            .await
            .unwrap();
        warehouse
            .execute(&Statement::raw("grant select on analytics.public.stg_orders to role r"))
            .await
            .unwrap();

        let executed = warehouse.executed().await;
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].directive, Directive::CreateView);
        assert!(executed[0].sql.starts_with("create or replace view analytics.public.stg_orders"));
        assert_eq!(warehouse.materialized_relations().await, vec!["analytics.public.stg_orders"]);
        assert_eq!(warehouse.raw_statements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_relation_failure() {
        let warehouse = MockWarehouse::new();
        warehouse.fail_relation("analytics.public.stg_orders", "syntax error").await;

        let err = warehouse
            .execute(&Statement::create_or_replace_table(stg_orders(), "select"))
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::QueryError("syntax error".to_string()));
        assert!(warehouse.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_statement_failure_only_matches_substring() {
        let warehouse = MockWarehouseBuilder::new()
            .with_statement_error("grant", "permission denied")
            .build();

        assert!(warehouse.execute(&Statement::raw("grant all on x to y")).await.is_err());
        assert!(warehouse.execute(&Statement::raw("analyze x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_log() {
        let warehouse = MockWarehouse::new();
        let clone = warehouse.clone();

        clone.execute(&Statement::raw("select 1")).await.unwrap();
        assert_eq!(warehouse.executed().await.len(), 1);
        assert_eq!(warehouse.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let warehouse = MockWarehouse::new().with_connection_failure();
        assert!(warehouse.test_connection().await.is_err());
        assert!(MockWarehouse::new().test_connection().await.is_ok());
    }
}
