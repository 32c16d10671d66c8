//! Integration tests for warehouse adapters
//!
//! Tests requiring a live PostgreSQL server are marked with `#[ignore]` and
//! can be run with `cargo test -- --ignored`.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all non-ignored tests (no credentials required)
//! cargo test -p reflow-warehouse --test integration_tests
//!
//! # Run PostgreSQL integration tests
//! REFLOW_WAREHOUSE_URL="host=localhost port=5432 dbname=analytics user=reflow password=secret" \
//! cargo test -p reflow-warehouse --features postgres --test integration_tests -- --ignored
//! ```

use reflow_core::Relation;
use reflow_warehouse::{
    Directive, ExecutionError, MockWarehouse, MockWarehouseBuilder, PostgresWarehouse, Statement,
    WarehouseAdapter,
};
use std::sync::Arc;

// =============================================================================
// Helper Functions
// =============================================================================

#[cfg(feature = "postgres")]
fn has_postgres_credentials() -> bool {
    std::env::var("REFLOW_WAREHOUSE_URL").is_ok()
}

fn relation(schema: &str, identifier: &str) -> Relation {
    Relation::new(Some("analytics".to_string()), schema, identifier)
}

// =============================================================================
// Mock Adapter Tests
// =============================================================================

#[tokio::test]
async fn test_mock_through_trait_object() {
    let warehouse: Arc<dyn WarehouseAdapter> = Arc::new(MockWarehouse::new());

    assert_eq!(warehouse.name(), "Mock");
    assert!(warehouse.test_connection().await.is_ok());

    let meta = warehouse
        .execute(&Statement::create_view(relation("staging", "stg_orders"), "select 1"))
        .await
        .unwrap();
    assert_eq!(meta.object.as_deref(), Some("analytics.staging.stg_orders"));
}

#[tokio::test]
async fn test_mock_tpch_materializations() {
    let warehouse = MockWarehouse::new();

    let statements = vec![
        Statement::create_view(relation("staging", "stg_orders"), "select * from raw.tpch.orders"),
        Statement::create_or_replace_table(
            relation("marts", "dim_customer"),
            "select * from raw.tpch.customer",
        ),
        Statement::raw("grant select on analytics.marts.dim_customer to role reporter"),
        Statement::create_or_replace_table(
            relation("marts", "fact_sales"),
            "select * from analytics.staging.stg_orders",
        ),
    ];

    for statement in &statements {
        warehouse.execute(statement).await.unwrap();
    }

    assert_eq!(
        warehouse.materialized_relations().await,
        vec![
            "analytics.staging.stg_orders",
            "analytics.marts.dim_customer",
            "analytics.marts.fact_sales",
        ]
    );

    let executed = warehouse.executed().await;
    assert_eq!(executed[1].directive, Directive::CreateOrReplaceTable);
    assert!(executed[1].sql.starts_with("create or replace table analytics.marts.dim_customer"));
    assert_eq!(
        warehouse.raw_statements().await,
        vec!["grant select on analytics.marts.dim_customer to role reporter"]
    );
}

#[tokio::test]
async fn test_mock_failure_does_not_record() {
    let warehouse = MockWarehouseBuilder::new()
        .with_relation_error("analytics.marts.dim_customer", "relation is locked")
        .build();

    let err = warehouse
        .execute(&Statement::create_or_replace_table(relation("marts", "dim_customer"), "select 1"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("relation is locked"));

    warehouse
        .execute(&Statement::create_view(relation("staging", "stg_orders"), "select 1"))
        .await
        .unwrap();
    assert_eq!(
        warehouse.materialized_relations().await,
        vec!["analytics.staging.stg_orders"]
    );
}

#[tokio::test]
async fn test_mock_concurrent_execution() {
    let warehouse = MockWarehouse::new().with_latency(30);

    let mut handles = Vec::new();
    for i in 0..4 {
        let warehouse = warehouse.clone();
        handles.push(tokio::spawn(async move {
            warehouse
                .execute(&Statement::create_view(relation("staging", &format!("m{}", i)), "select 1"))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(warehouse.executed().await.len(), 4);
    assert!(warehouse.peak_concurrency() > 1);
}

// =============================================================================
// PostgreSQL Tests
// =============================================================================

#[cfg(not(feature = "postgres"))]
#[tokio::test]
async fn test_postgres_requires_feature() {
    let result = PostgresWarehouse::from_connection_string_with_tls("host=localhost").await;
    match result {
        Err(ExecutionError::ConfigError(message)) => assert!(message.contains("--features postgres")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("connection should not succeed without the postgres feature"),
    }
}

#[cfg(feature = "postgres")]
#[tokio::test]
#[ignore]
async fn test_postgres_materializes_view() {
    if !has_postgres_credentials() {
        eprintln!("Skipping: REFLOW_WAREHOUSE_URL not set");
        return;
    }

    let url = std::env::var("REFLOW_WAREHOUSE_URL").unwrap();
    let warehouse = PostgresWarehouse::from_connection_string(&url).await.unwrap();
    warehouse.test_connection().await.unwrap();

    let statement = Statement::create_view(
        Relation::new(None, "public", "reflow_integration_view"),
        "select 1 as one",
    );
    warehouse.execute(&statement).await.unwrap();
    warehouse
        .execute(&Statement::raw("drop view if exists public.reflow_integration_view"))
        .await
        .unwrap();
}
