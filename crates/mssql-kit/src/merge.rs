//! Table merge engine and value merge orchestration
//!
//! `merge_tables` reconciles an existing source table into a target with one
//! `MERGE ... WITH (SERIALIZABLE)` statement and tallies the per-row actions
//! it reports. `merge_values` stages plain records in `tmp_merge_<target>`
//! first; `merge_values_inline` binds them as a `VALUES` source instead.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use crate::bulk::{column_set, rectangularize};
use crate::client::SqlClient;
use crate::error::{Error, Result};
use crate::statement::{
    clone_empty_table_sql, drop_if_exists_sql, probe_sql, MergeSource, MergeStatement, TableName,
    GENERATED_COLUMNS_SQL,
};
use crate::types::{Record, Row, Value};

/// Upper bound on parameters in one request
pub const MAX_PARAMETERS: usize = 2100;

/// Which columns a merge matches on, updates and inserts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSpec {
    /// Columns compared for equality; must exist in source and target
    pub match_fields: Vec<String>,
    /// Columns inserted for new rows; defaults to every source column
    #[serde(default)]
    pub insert_fields: Option<Vec<String>>,
    /// Columns updated on matched rows; defaults to every non-match source column
    #[serde(default)]
    pub update_fields: Option<Vec<String>>,
    /// Delete target rows that have no source row
    #[serde(default)]
    pub delete_not_matching: bool,
    /// Leave the staging table in place after `merge_values`
    #[serde(default, alias = "keepTmpTable")]
    pub keep_temp_table: bool,
}

impl MergeSpec {
    /// Spec matching on `fields`, with default insert and update lists
    pub fn new<I, S>(match_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            match_fields: match_fields.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Insert only these columns
    pub fn with_insert_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Update only these columns
    pub fn with_update_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Delete target rows missing from the source
    pub fn delete_not_matching(mut self, delete: bool) -> Self {
        self.delete_not_matching = delete;
        self
    }

    /// Keep the staging table after `merge_values`
    pub fn keep_temp_table(mut self, keep: bool) -> Self {
        self.keep_temp_table = keep;
        self
    }

    fn check(&self) -> Result<()> {
        if self.match_fields.is_empty() {
            return Err(Error::invalid_argument(
                "match_fields must name at least one column",
            ));
        }
        Ok(())
    }
}

/// Per-action row counts of one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Rows inserted
    #[serde(rename = "INSERT")]
    pub inserted: u64,
    /// Rows updated
    #[serde(rename = "UPDATE")]
    pub updated: u64,
    /// Rows deleted
    #[serde(rename = "DELETE")]
    pub deleted: u64,
    /// Time spent in the MERGE statement itself
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
}

impl MergeOutcome {
    /// Count the `Action` column of the rows a MERGE reported
    pub fn tally(rows: &[Row], execution_time_ms: u64) -> Self {
        let mut outcome = Self {
            execution_time_ms,
            ..Default::default()
        };
        for row in rows {
            match row.get_by_name("Action").and_then(Value::as_str) {
                Some("INSERT") => outcome.inserted += 1,
                Some("UPDATE") => outcome.updated += 1,
                Some("DELETE") => outcome.deleted += 1,
                other => debug!(action = ?other, "Ignoring unexpected MERGE action"),
            }
        }
        outcome
    }

    /// Rows touched in any way
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Outcome of `merge_values`: the merge tally plus staging timings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeValuesOutcome {
    /// Rows inserted
    #[serde(rename = "INSERT")]
    pub inserted: u64,
    /// Rows updated
    #[serde(rename = "UPDATE")]
    pub updated: u64,
    /// Rows deleted
    #[serde(rename = "DELETE")]
    pub deleted: u64,
    /// Bulk load plus merge
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    /// Bulk load into the staging table
    #[serde(rename = "insertExecutionTime")]
    pub insert_execution_time_ms: u64,
    /// The whole `merge_tables` step: the column and catalog lookups plus the
    /// MERGE statement, so it is at least the MERGE time `merge_tables` reports
    #[serde(rename = "mergeExecutionTime")]
    pub merge_execution_time_ms: u64,
}

/// Resolved column lists for one merge
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergePlan {
    match_fields: Vec<String>,
    update_fields: Vec<String>,
    insert_fields: Vec<String>,
}

fn contains(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// Resolve the insert and update lists against what source and target really have.
fn plan_merge(
    spec: &MergeSpec,
    source_columns: &[String],
    target_columns: &[String],
    generated: &[String],
) -> Result<MergePlan> {
    for field in &spec.match_fields {
        if !contains(source_columns, field) || !contains(target_columns, field) {
            return Err(Error::invalid_argument(format!(
                "match field '{}' must exist in both source and target",
                field
            )));
        }
    }

    let is_match = |c: &str| contains(&spec.match_fields, c);
    let writable = |c: &str| contains(target_columns, c) && !contains(generated, c);

    let update_fields = match &spec.update_fields {
        Some(fields) => {
            let (kept, dropped): (Vec<String>, Vec<String>) =
                fields.iter().cloned().partition(|f| !is_match(f.as_str()));
            if !dropped.is_empty() {
                warn!(fields = ?dropped, "Match fields cannot be updated; leaving them out");
            }
            kept
        }
        None => source_columns
            .iter()
            .filter(|c| !is_match(c.as_str()) && writable(c.as_str()))
            .cloned()
            .collect(),
    };

    let insert_fields = match &spec.insert_fields {
        Some(fields) => fields.clone(),
        None => source_columns
            .iter()
            .filter(|c| writable(c.as_str()))
            .cloned()
            .collect(),
    };

    let skipped: Vec<&String> = source_columns
        .iter()
        .filter(|c| !contains(target_columns, c))
        .collect();
    if !skipped.is_empty() && (spec.update_fields.is_none() || spec.insert_fields.is_none()) {
        warn!(columns = ?skipped, "Source columns missing from target are not merged");
    }

    Ok(MergePlan {
        match_fields: spec.match_fields.clone(),
        update_fields,
        insert_fields,
    })
}

impl SqlClient {
    /// Merge `source` into `target`.
    ///
    /// Matched rows are updated, source-only rows inserted and, with
    /// `delete_not_matching`, target-only rows deleted, all in one statement.
    /// Identity and computed target columns are left out of the default
    /// insert and update lists.
    pub async fn merge_tables(
        &self,
        source: &str,
        target: &str,
        spec: &MergeSpec,
    ) -> Result<MergeOutcome> {
        spec.check()?;
        let source = TableName::parse(source)?;
        let target = TableName::parse(target)?;

        self.merge_from_table(&source, &target, spec)
            .await
            .map_err(|e| Error::merge(target.to_string(), e))
    }

    async fn merge_from_table(
        &self,
        source: &TableName,
        target: &TableName,
        spec: &MergeSpec,
    ) -> Result<MergeOutcome> {
        let source_columns = self.probe_columns(source).await?;
        let plan = self.resolve_plan(spec, &source_columns, target).await?;

        let statement = MergeStatement {
            target,
            source: MergeSource::Table(source),
            match_fields: &plan.match_fields,
            update_fields: &plan.update_fields,
            insert_fields: &plan.insert_fields,
            delete_not_matching: spec.delete_not_matching,
        }
        .to_sql()?;

        self.run_merge(&statement, &[]).await
    }

    /// Merge plain records into `target` through a staging table.
    ///
    /// The staging table `tmp_merge_<target>` is recreated empty from the
    /// target's columns, bulk-loaded, merged from and dropped again unless
    /// `keep_temp_table` is set. A failure while loading or merging still drops it.
    pub async fn merge_values(
        &self,
        data: &[Record],
        target: &str,
        spec: &MergeSpec,
    ) -> Result<MergeValuesOutcome> {
        spec.check()?;
        if data.is_empty() {
            return Err(Error::invalid_argument("merge_values needs at least one record"));
        }
        let target = TableName::parse(target)?;
        let staging = target.temp_merge_table()?;
        let drop_staging = drop_if_exists_sql(&staging);
        let staging_param = [Value::String(staging.to_string())];

        let recreate = async {
            self.query_result(&drop_staging, &staging_param).await?;
            self.query_result(&clone_empty_table_sql(&target, &staging), &[])
                .await
        };
        recreate
            .await
            .map_err(|e| Error::merge(target.to_string(), e))?;
        debug!(staging = %staging, "Created staging table");

        let staged = async {
            let loaded = self.bulk_insert(&staging.to_string(), data).await?;
            let started = Instant::now();
            let merged = self
                .merge_tables(&staging.to_string(), &target.to_string(), spec)
                .await?;
            Ok::<_, Error>((loaded, merged, started.elapsed().as_millis() as u64))
        }
        .await;

        let (loaded, merged, merge_ms) = match staged {
            Ok(parts) => parts,
            Err(e) => {
                if !spec.keep_temp_table {
                    if let Err(cleanup) = self.query_result(&drop_staging, &staging_param).await {
                        warn!(staging = %staging, "Failed to drop staging table: {}", cleanup);
                    }
                }
                return Err(e);
            }
        };

        if !spec.keep_temp_table {
            self.query_result(&drop_staging, &staging_param)
                .await
                .map_err(|e| Error::merge(target.to_string(), e))?;
        }

        Ok(MergeValuesOutcome {
            inserted: merged.inserted,
            updated: merged.updated,
            deleted: merged.deleted,
            execution_time_ms: loaded.execution_time_ms + merge_ms,
            insert_execution_time_ms: loaded.execution_time_ms,
            merge_execution_time_ms: merge_ms,
        })
    }

    /// Merge plain records into `target` using a bound `VALUES` list as the source.
    ///
    /// No staging table is involved. Every value is a parameter, so the batch
    /// is limited to 2100 values (columns x rows).
    pub async fn merge_values_inline(
        &self,
        data: &[Record],
        target: &str,
        spec: &MergeSpec,
    ) -> Result<MergeOutcome> {
        spec.check()?;
        if data.is_empty() {
            return Err(Error::invalid_argument(
                "merge_values_inline needs at least one record",
            ));
        }
        let target = TableName::parse(target)?;
        let columns = column_set(data);
        let params = columns.len() * data.len();
        if params > MAX_PARAMETERS {
            return Err(Error::invalid_argument(format!(
                "{} values exceed the {} parameter limit; use merge_values for large batches",
                params, MAX_PARAMETERS
            )));
        }

        let values: Vec<Value> = rectangularize(data, &columns)
            .into_iter()
            .flatten()
            .collect();

        let result = async {
            let plan = self.resolve_plan(spec, &columns, &target).await?;
            let statement = MergeStatement {
                target: &target,
                source: MergeSource::Values {
                    columns: &columns,
                    rows: data.len(),
                },
                match_fields: &plan.match_fields,
                update_fields: &plan.update_fields,
                insert_fields: &plan.insert_fields,
                delete_not_matching: spec.delete_not_matching,
            }
            .to_sql()?;
            self.run_merge(&statement, &values).await
        }
        .await;

        result.map_err(|e| Error::merge(target.to_string(), e))
    }

    async fn probe_columns(&self, table: &TableName) -> Result<Vec<String>> {
        let probe = probe_sql::<&str>(table, None)?;
        Ok(self
            .query_result(&probe, &[])
            .await?
            .columns
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn resolve_plan(
        &self,
        spec: &MergeSpec,
        source_columns: &[String],
        target: &TableName,
    ) -> Result<MergePlan> {
        let target_columns = self.probe_columns(target).await?;
        let generated: Vec<String> = self
            .query(GENERATED_COLUMNS_SQL, &[Value::String(target.to_string())])
            .await?
            .into_iter()
            .filter_map(|row| row.get(0).and_then(Value::as_str).map(str::to_string))
            .collect();

        plan_merge(spec, source_columns, &target_columns, &generated)
    }

    async fn run_merge(&self, statement: &str, params: &[Value]) -> Result<MergeOutcome> {
        let started = Instant::now();
        let rows = self.query(statement, params).await?;
        let outcome = MergeOutcome::tally(&rows, started.elapsed().as_millis() as u64);
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            execution_time_ms = outcome.execution_time_ms,
            "Merge finished"
        );
        Ok(outcome)
    }
}
