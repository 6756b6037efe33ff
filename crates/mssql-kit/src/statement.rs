//! SQL text synthesis for the insert, bulk and merge helpers.
//!
//! Every identifier is validated and bracket-quoted before it is written into
//! statement text. Values never are: they are referenced as `@P<n>`
//! placeholders and bound separately.

use std::fmt;

use crate::error::{Error, Result};
use crate::security::{quote_identifier, split_qualified_name, validate_sql_identifier};

/// Prefix of the staging table used by `merge_values`
pub const TEMP_TABLE_PREFIX: &str = "tmp_merge_";

/// A validated, possibly schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    parts: Vec<String>,
}

impl TableName {
    /// Parse and validate `table`, `schema.table` or `db.schema.table`
    pub fn parse(name: &str) -> Result<Self> {
        Ok(Self {
            parts: split_qualified_name(name)?,
        })
    }

    /// Unqualified table name
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// Bracket-quoted form for statement text, e.g. `[dbo].[people]`
    pub fn quoted(&self) -> String {
        self.parts
            .iter()
            .map(|p| quote_identifier(p))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Staging table for this target: `tmp_merge_<name>` with the same qualifiers
    pub fn temp_merge_table(&self) -> Result<Self> {
        let mut parts = self.parts.clone();
        let staged = format!("{}{}", TEMP_TABLE_PREFIX, self.name());
        validate_sql_identifier(&staged)?;
        if let Some(last) = parts.last_mut() {
            *last = staged;
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join("."))
    }
}

/// Validate and quote a list of column names
pub fn quote_columns<S: AsRef<str>>(columns: &[S]) -> Result<Vec<String>> {
    columns
        .iter()
        .map(|c| {
            validate_sql_identifier(c.as_ref())?;
            Ok(quote_identifier(c.as_ref()))
        })
        .collect()
}

/// `@P1, @P2, ...` starting at `first`
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("@P{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT INTO <table> (<columns>) VALUES (@P1, ...)`
pub fn insert_sql<S: AsRef<str>>(table: &TableName, columns: &[S]) -> Result<String> {
    if columns.is_empty() {
        return Err(Error::invalid_argument(format!(
            "Cannot insert into {}: record has no fields",
            table
        )));
    }
    let cols = quote_columns(columns)?;
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        cols.join(", "),
        placeholders(1, cols.len())
    ))
}

/// Zero-row probe. `None` selects every column.
pub fn probe_sql<S: AsRef<str>>(table: &TableName, columns: Option<&[S]>) -> Result<String> {
    let projection = match columns {
        Some(cols) => quote_columns(cols)?.join(", "),
        None => "*".to_string(),
    };
    Ok(format!("SELECT TOP(0) {} FROM {}", projection, table.quoted()))
}

/// Columns the server fills in itself; bound parameter `@P1` is the table name
pub const GENERATED_COLUMNS_SQL: &str = "SELECT c.name FROM sys.columns c \
     WHERE c.object_id = OBJECT_ID(@P1) AND (c.is_identity = 1 OR c.is_computed = 1) \
     ORDER BY c.column_id";

/// Drop `table` if it exists; bound parameter `@P1` is the table name
pub fn drop_if_exists_sql(table: &TableName) -> String {
    format!(
        "IF OBJECT_ID(@P1, N'U') IS NOT NULL DROP TABLE {}",
        table.quoted()
    )
}

/// Create an empty copy of `source` named `dest`.
///
/// Selecting through an outer join leaves every copied column nullable and
/// without the identity property, so rows that omit a key or a NOT NULL
/// column can still be staged, and rows that carry explicit key values load as-is.
pub fn clone_empty_table_sql(source: &TableName, dest: &TableName) -> String {
    format!(
        "SELECT S.* INTO {} FROM (VALUES (0)) AS D ([x]) LEFT JOIN {} AS S ON 1 = 0 WHERE 1 = 0",
        dest.quoted(),
        source.quoted()
    )
}

/// What a MERGE reads from
#[derive(Debug, Clone)]
pub enum MergeSource<'a> {
    /// An existing table
    Table(&'a TableName),
    /// Parameterized rows: `(VALUES (@P1, ...), ...) AS S (<columns>)`
    Values {
        /// Column names of the derived table
        columns: &'a [String],
        /// Number of rows; `columns.len() * rows` parameters are referenced
        rows: usize,
    },
}

/// A composed MERGE statement. Field lists are already resolved by the caller.
#[derive(Debug, Clone)]
pub struct MergeStatement<'a> {
    /// Target table
    pub target: &'a TableName,
    /// Source rows
    pub source: MergeSource<'a>,
    /// Columns compared for equality
    pub match_fields: &'a [String],
    /// Columns assigned on match; empty drops the `WHEN MATCHED` clause
    pub update_fields: &'a [String],
    /// Columns inserted on no match; empty drops the `WHEN NOT MATCHED BY TARGET` clause
    pub insert_fields: &'a [String],
    /// Delete target rows missing from the source
    pub delete_not_matching: bool,
}

impl MergeStatement<'_> {
    /// Render the statement. Every affected row is reported in an `Action` column.
    pub fn to_sql(&self) -> Result<String> {
        if self.match_fields.is_empty() {
            return Err(Error::invalid_argument(
                "MERGE requires at least one match field",
            ));
        }
        if self.update_fields.is_empty() && self.insert_fields.is_empty() && !self.delete_not_matching
        {
            return Err(Error::invalid_argument(format!(
                "MERGE into {} has nothing to do: no update, insert or delete clause",
                self.target
            )));
        }

        let source = match &self.source {
            MergeSource::Table(table) => format!("{} AS S", table.quoted()),
            MergeSource::Values { columns, rows } => {
                if *rows == 0 || columns.is_empty() {
                    return Err(Error::invalid_argument("MERGE source has no values"));
                }
                let width = columns.len();
                let tuples = (0..*rows)
                    .map(|r| format!("({})", placeholders(r * width + 1, width)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "(VALUES {}) AS S ({})",
                    tuples,
                    quote_columns(columns)?.join(", ")
                )
            }
        };

        let on = quote_columns(self.match_fields)?
            .iter()
            .map(|c| format!("T.{c} = S.{c}"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut sql = format!(
            "MERGE {} WITH (SERIALIZABLE) AS T\nUSING {}\n    ON {}",
            self.target.quoted(),
            source,
            on
        );

        if !self.update_fields.is_empty() {
            let set = quote_columns(self.update_fields)?
                .iter()
                .map(|c| format!("T.{c} = S.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!("\nWHEN MATCHED THEN\n    UPDATE SET {}", set));
        }

        if !self.insert_fields.is_empty() {
            let cols = quote_columns(self.insert_fields)?;
            let values = cols
                .iter()
                .map(|c| format!("S.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(
                "\nWHEN NOT MATCHED BY TARGET THEN\n    INSERT ({}) VALUES ({})",
                cols.join(", "),
                values
            ));
        }

        if self.delete_not_matching {
            sql.push_str("\nWHEN NOT MATCHED BY SOURCE THEN\n    DELETE");
        }

        sql.push_str("\nOUTPUT $action AS [Action];");
        Ok(sql)
    }
}
