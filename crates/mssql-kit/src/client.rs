//! Query executor
//!
//! `SqlClient` is the caller-owned handle every operation hangs off. It is
//! cheap to clone; clones share one [`ConnectionManager`] and therefore one
//! physical connection.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SqlConfig;
use crate::driver::{Driver, DriverConnection};
use crate::error::{DriverError, Error, Result};
use crate::lifecycle::{ConnectionManager, ConnectionState, LifecycleStats};
use crate::types::{ResultSet, Row, Value};
use crate::wire::{bind_params, describe_values};

/// Handle to a lazily connected SQL Server connection
#[derive(Clone)]
pub struct SqlClient {
    manager: Arc<ConnectionManager>,
}

impl SqlClient {
    /// Create an uninitialized client over `driver`
    pub fn new(driver: impl Driver) -> Self {
        Self::from_driver(Arc::new(driver))
    }

    /// Create an uninitialized client over a shared driver
    pub fn from_driver(driver: Arc<dyn Driver>) -> Self {
        Self {
            manager: ConnectionManager::new(driver),
        }
    }

    /// Create a client and install `config` right away
    pub fn with_config(driver: impl Driver, config: SqlConfig) -> Result<Self> {
        config.validate_config()?;
        let client = Self::new(driver);
        client.manager.set_config(config);
        Ok(client)
    }

    /// Process-wide client backed by the tiberius driver. Every call returns the same instance.
    #[cfg(feature = "sqlserver")]
    pub fn global() -> &'static SqlClient {
        static GLOBAL: std::sync::OnceLock<SqlClient> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(|| SqlClient::new(crate::sqlserver::SqlServerDriver::new()))
    }

    /// Install the configuration. An open connection made with a previous
    /// configuration is closed; the next query reconnects.
    pub async fn init(&self, config: SqlConfig) -> Result<()> {
        config.validate_config()?;
        info!(server = %config.address(), "Initializing SQL client");
        let had_config = self.manager.config().is_some();
        self.manager.set_config(config);
        if had_config {
            self.manager.close().await?;
        }
        Ok(())
    }

    /// Connect if needed and reset the idle timer
    pub async fn ensure_ready(&self) -> Result<()> {
        self.manager.acquire().await.map(|_| ())
    }

    /// Close the connection. A later query reconnects.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Connection lifecycle counters
    pub fn stats(&self) -> LifecycleStats {
        self.manager.stats()
    }

    /// Whether an idle-close timer is armed
    pub fn idle_timer_armed(&self) -> bool {
        self.manager.idle_timer_armed()
    }

    /// Run a statement and return its first result set with column metadata.
    ///
    /// Parameters are bound positionally as `@P1`, `@P2`, ... with wire types
    /// inferred from the values.
    pub async fn query_result(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let conn = self.manager.acquire().await?;
        let bound = bind_params(params);

        debug!(sql, params = bound.len(), "Executing statement");
        let result = conn
            .query(sql, &bound)
            .await
            .map_err(|e| driver_error("Query failed", sql, e))?;

        self.manager.touch(&conn);
        Ok(result)
    }

    /// Run a statement and return its rows in result order
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.query_result(sql, params).await?.rows)
    }

    /// First row, or `None` for an empty result
    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// First column of the first row. Fails with [`Error::NoResult`] when there is none.
    pub async fn query_value(&self, sql: &str, params: &[Value]) -> Result<Value> {
        self.query_one(sql, params)
            .await?
            .and_then(|row| row.get(0).cloned())
            .ok_or_else(|| Error::NoResult {
                sql: sql.to_string(),
                params: describe_values(params),
            })
    }

    /// Run an INSERT and return the identity value it generated.
    ///
    /// Returns `None` when the statement produced no identity (e.g. the table
    /// has no identity column).
    pub async fn insert_return_identity(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<i64>> {
        let statement = format!(
            "{}; SELECT SCOPE_IDENTITY()",
            sql.trim_end().trim_end_matches(';')
        );
        let rows = self.query(&statement, params).await?;

        let [row] = rows.as_slice() else {
            return Ok(None);
        };
        match (row.columns(), row.values()) {
            ([column], [value]) if column.is_empty() => Ok(value.as_i64()),
            _ => Ok(None),
        }
    }

    pub(crate) async fn connection(&self) -> Result<Arc<dyn DriverConnection>> {
        self.manager.acquire().await
    }

    pub(crate) fn touch(&self, conn: &Arc<dyn DriverConnection>) {
        self.manager.touch(conn);
    }
}

impl std::fmt::Debug for SqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClient")
            .field("manager", &self.manager)
            .finish()
    }
}

/// Map a driver failure onto [`Error::Execution`]. Errors the driver raised
/// as crate errors (type conversions, bad arguments) pass through unchanged.
pub(crate) fn driver_error(context: &str, sql: &str, err: DriverError) -> Error {
    match err.downcast::<Error>() {
        Ok(inner) => *inner,
        Err(err) => {
            let message = format!("{}: {}", context, err);
            Error::execution_with_source(message, sql, err)
        }
    }
}
