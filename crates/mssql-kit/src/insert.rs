//! Record insert helper

use tracing::debug;

use crate::client::SqlClient;
use crate::error::{Error, Result};
use crate::statement::{insert_sql, TableName};
use crate::types::{Records, Value};

impl SqlClient {
    /// Insert one record or a batch of records, one `INSERT` per record.
    ///
    /// Each statement names the record's own keys, in the record's order, so
    /// records in a batch may have different shapes. Records are inserted
    /// sequentially without a transaction: if one fails, the ones before it
    /// stay committed.
    pub async fn insert_object(&self, table: &str, data: impl Into<Records>) -> Result<()> {
        let table = TableName::parse(table)?;
        let records = data.into().into_vec();

        for (idx, record) in records.iter().enumerate() {
            if record.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "Record {} for {} has no fields",
                    idx, table
                )));
            }
            let columns: Vec<&str> = record.keys().map(String::as_str).collect();
            let sql = insert_sql(&table, &columns)?;
            let values: Vec<Value> = record.values().cloned().collect();
            self.query_result(&sql, &values).await?;
        }

        debug!(table = %table, records = records.len(), "Inserted records");
        Ok(())
    }
}
