//! PostgreSQL warehouse adapter
//!
//! Executes materializations against PostgreSQL and compatible warehouses
//! (Amazon Redshift, CockroachDB). Views use `create or replace view`;
//! tables are rebuilt with `drop table if exists ... cascade` followed by
//! `create table ... as`, since PostgreSQL has no `create or replace table`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let warehouse = PostgresWarehouse::from_connection_string(
//!     "host=localhost port=5432 dbname=analytics user=reflow password=secret"
//! ).await?;
//!
//! // With TLS
//! let warehouse = PostgresWarehouse::from_connection_string_with_tls(
//!     "host=db.example.com port=5432 dbname=analytics user=reflow password=secret"
//! ).await?;
//! ```

use crate::adapter::{Directive, ExecutionError, ExecutionMetadata, Statement, WarehouseAdapter};

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Config as PgConfig, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(not(feature = "postgres"))]
const NOT_COMPILED: &str =
    "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres";

/// Materializes models in PostgreSQL (or Redshift)
pub struct PostgresWarehouse {
    /// Present only when built with the `postgres` feature
    #[cfg(feature = "postgres")]
    client: Client,

    /// Connection host
    host: String,

    /// Connection port
    port: u16,

    /// Database name
    database: String,

    /// Keeps the struct non-empty without the feature
    #[cfg(not(feature = "postgres"))]
    _phantom: std::marker::PhantomData<()>,
}

#[cfg(feature = "postgres")]
fn describe(conn_str: &str) -> Result<(String, u16, String), ExecutionError> {
    let config: PgConfig = conn_str
        .parse()
        .map_err(|e| ExecutionError::ConfigError(format!("Invalid connection string: {}", e)))?;

    let host = config
        .get_hosts()
        .first()
        .map(|h| format!("{:?}", h))
        .unwrap_or_else(|| "localhost".to_string());
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let database = config.get_dbname().unwrap_or("postgres").to_string();

    Ok((host, port, database))
}

impl PostgresWarehouse {
    /// Connect using a PostgreSQL connection string
    ///
    /// `host=db.internal port=5432 dbname=analytics user=reflow password=secret`
    /// or a `postgres://` URL.
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string(conn_str: &str) -> Result<Self, ExecutionError> {
        let (host, port, database) = describe(conn_str)?;

        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| ExecutionError::AuthenticationError(format!("Failed to connect: {}", e)))?;

        let (log_host, log_port) = (host.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(host = %log_host, port = log_port, error = %e, "PostgreSQL connection error");
            }
        });

        tracing::info!(%host, port, %database, "connected to PostgreSQL");

        Ok(Self {
            client,
            host,
            port,
            database,
        })
    }

    /// Always fails: built without the `postgres` feature
    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string(_conn_str: &str) -> Result<Self, ExecutionError> {
        Err(ExecutionError::ConfigError(NOT_COMPILED.to_string()))
    }

    /// Connect using a connection string over TLS
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string_with_tls(conn_str: &str) -> Result<Self, ExecutionError> {
        let (host, port, database) = describe(conn_str)?;

        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| ExecutionError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(conn_str, tls)
            .await
            .map_err(|e| {
                ExecutionError::AuthenticationError(format!("Failed to connect with TLS: {}", e))
            })?;

        let (log_host, log_port) = (host.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(host = %log_host, port = log_port, error = %e, "PostgreSQL TLS connection error");
            }
        });

        tracing::info!(%host, port, %database, "connected to PostgreSQL (TLS)");

        Ok(Self {
            client,
            host,
            port,
            database,
        })
    }

    /// Always fails: built without the `postgres` feature
    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string_with_tls(_conn_str: &str) -> Result<Self, ExecutionError> {
        Err(ExecutionError::ConfigError(NOT_COMPILED.to_string()))
    }

    /// Get connection info
    pub fn connection_info(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// DDL in PostgreSQL's dialect
pub(crate) fn postgres_ddl(statement: &Statement) -> Result<String, ExecutionError> {
    match (statement.directive, &statement.relation) {
        (Directive::CreateOrReplaceTable, Some(relation)) => Ok(format!(
            "drop table if exists {rel} cascade;\ncreate table {rel} as (\n{sql}\n)",
            rel = relation,
            sql = statement.sql
        )),
        _ => crate::adapter::ansi_ddl(statement),
    }
}

#[cfg(feature = "postgres")]
fn classify(error: tokio_postgres::Error) -> ExecutionError {
    use tokio_postgres::error::SqlState;

    match error.code() {
        Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => {
            ExecutionError::PermissionDenied(error.to_string())
        }
        Some(code) if *code == SqlState::INVALID_PASSWORD => {
            ExecutionError::AuthenticationError(error.to_string())
        }
        Some(_) => ExecutionError::QueryError(error.to_string()),
        None if error.is_closed() => ExecutionError::NetworkError(error.to_string()),
        None => ExecutionError::QueryError(error.to_string()),
    }
}

#[async_trait::async_trait]
impl WarehouseAdapter for PostgresWarehouse {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn ddl(&self, statement: &Statement) -> Result<String, ExecutionError> {
        postgres_ddl(statement)
    }

    #[cfg(feature = "postgres")]
    async fn execute(&self, statement: &Statement) -> Result<ExecutionMetadata, ExecutionError> {
        let sql = self.ddl(statement)?;
        tracing::debug!(directive = %statement.directive, %sql, "executing statement");

        self.client.batch_execute(&sql).await.map_err(classify)?;

        Ok(ExecutionMetadata {
            rows_affected: None,
            object: statement.relation.as_ref().map(|r| r.fqn()),
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute(&self, _statement: &Statement) -> Result<ExecutionMetadata, ExecutionError> {
        Err(ExecutionError::ConfigError(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn test_connection(&self) -> Result<(), ExecutionError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ExecutionError::NetworkError(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    #[cfg(not(feature = "postgres"))]
    async fn test_connection(&self) -> Result<(), ExecutionError> {
        Err(ExecutionError::ConfigError(NOT_COMPILED.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflow_core::Relation;

    #[test]
    fn table_is_dropped_then_created() {
        let statement = Statement::create_or_replace_table(
            Relation::new(None, "marts", "dim_customer"),
            "select 1",
        );
        assert_eq!(
            postgres_ddl(&statement).unwrap(),
            "drop table if exists marts.dim_customer cascade;\ncreate table marts.dim_customer as (\nselect 1\n)"
        );
    }

    #[test]
    fn views_use_ansi_ddl() {
        let statement = Statement::create_view(Relation::new(None, "staging", "stg_orders"), "select 1");
        assert_eq!(
            postgres_ddl(&statement).unwrap(),
            "create or replace view staging.stg_orders as (\nselect 1\n)"
        );
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn connect_without_feature_fails() {
        let result = PostgresWarehouse::from_connection_string("host=localhost").await;
        assert!(matches!(result, Err(ExecutionError::ConfigError(_))));
    }
}
