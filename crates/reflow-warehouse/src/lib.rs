//! Warehouse execution adapters
//!
//! The engine never talks to a warehouse directly; it hands each
//! materialization to a `WarehouseAdapter` as a `Statement` (directive,
//! target relation, rendered SQL).
//!
//! ## Features
//!
//! Enable warehouse support via Cargo features:
//! - `postgres` - PostgreSQL/Redshift support
//!
//! ## Example
//!
//! ```rust,ignore
//! use reflow_warehouse::{MockWarehouse, Statement, WarehouseAdapter};
//!
//! let warehouse = MockWarehouse::new();
//! let statement = Statement::create_view(relation, "select 1");
//! warehouse.execute(&statement).await?;
//! ```

pub mod adapter;
pub mod mock;
pub mod postgres;

pub use adapter::{WarehouseAdapter, Statement, Directive, ExecutionMetadata, ExecutionError};
pub use mock::{MockWarehouse, MockWarehouseBuilder, ExecutedStatement};
pub use postgres::PostgresWarehouse;
