//! Driver seam
//!
//! The client core never talks TDS itself. It asks a [`Driver`] for a
//! [`DriverConnection`] and funnels every statement and bulk copy through it.
//! The tiberius-backed implementation lives in `sqlserver`; tests plug in an
//! in-memory driver.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SqlConfig;
use crate::error::DriverError;
use crate::types::{Column, ResultSet, Value};
use crate::wire::Param;

/// Result type for driver calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Factory for physical connections
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Open and authenticate one connection
    async fn connect(&self, config: &SqlConfig) -> DriverResult<Arc<dyn DriverConnection>>;

    /// Driver name for logs
    fn name(&self) -> &'static str;
}

/// One open physical connection
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Run a statement with bound parameters and return its first result set
    async fn query(&self, sql: &str, params: &[Param]) -> DriverResult<ResultSet>;

    /// Bulk-copy a rectangular table in one round trip
    async fn bulk_copy(&self, table: &BulkTable) -> DriverResult<BulkCopyResult>;

    /// Close the connection. Errors are reported but the connection is gone either way.
    async fn close(&self) -> DriverResult<()>;
}

/// Rectangular data for a bulk copy: every row has exactly one value per column
#[derive(Debug, Clone, PartialEq)]
pub struct BulkTable {
    /// Target table, as given by the caller
    pub table: String,
    /// Column descriptors from the zero-row probe
    pub columns: Vec<Column>,
    /// Rows in column order
    pub rows: Vec<Vec<Value>>,
}

impl BulkTable {
    /// Create an empty descriptor
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Column names in order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// What the driver reports after a bulk copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCopyResult {
    /// Rows written
    pub rows_affected: u64,
}
