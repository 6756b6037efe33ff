//! Bulk loader
//!
//! Records in a batch may be ragged. The loader squares them up against the
//! sorted union of their keys, asks the server for the matching column
//! descriptors with a zero-row probe, and ships everything in one bulk copy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::debug;

use crate::client::{driver_error, SqlClient};
use crate::driver::BulkTable;
use crate::error::{Error, Result};
use crate::statement::{probe_sql, TableName};
use crate::types::{Record, Value};

/// Outcome of a bulk insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkInsertResult {
    /// Rows written, as reported by the driver
    pub rows_affected: u64,
    /// Wall-clock time from the schema probe to the end of the copy
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
}

/// Sorted union of the keys of every record
pub fn column_set(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Reindex each record onto `columns`; absent keys become NULL
pub fn rectangularize(records: &[Record], columns: &[String]) -> Vec<Vec<Value>> {
    records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}

impl SqlClient {
    /// Load `data` into `table` with a single bulk copy.
    ///
    /// Any failure after validation comes back as [`Error::BulkInsert`]
    /// naming the table.
    pub async fn bulk_insert(&self, table: &str, data: &[Record]) -> Result<BulkInsertResult> {
        let table = TableName::parse(table)?;
        if data.is_empty() {
            return Err(Error::invalid_argument(format!(
                "Bulk insert into {} needs at least one record",
                table
            )));
        }

        let columns = column_set(data);
        let probe = probe_sql(&table, Some(columns.as_slice()))?;

        let started = Instant::now();
        let rows_affected = self
            .copy_rows(&table, &probe, &columns, data)
            .await
            .map_err(|e| Error::bulk_insert(table.to_string(), e))?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        debug!(
            table = %table,
            rows = rows_affected,
            execution_time_ms,
            "Bulk insert finished"
        );
        Ok(BulkInsertResult {
            rows_affected,
            execution_time_ms,
        })
    }

    async fn copy_rows(
        &self,
        table: &TableName,
        probe: &str,
        columns: &[String],
        data: &[Record],
    ) -> Result<u64> {
        let descriptor = self.query_result(probe, &[]).await?;
        if descriptor.columns.len() != columns.len() {
            return Err(Error::execution(format!(
                "Schema probe for {} returned {} columns, expected {}",
                table,
                descriptor.columns.len(),
                columns.len()
            )));
        }

        let mut bulk = BulkTable::new(table.to_string(), descriptor.columns);
        bulk.rows = rectangularize(data, columns);

        let conn = self.connection().await?;
        let result = conn
            .bulk_copy(&bulk)
            .await
            .map_err(|e| driver_error("Bulk copy failed", probe, e))?;
        self.touch(&conn);

        Ok(result.rows_affected)
    }
}
