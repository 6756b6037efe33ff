//! Value types for mssql-kit
//!
//! - `Value`: a single parameter or column value
//! - `Record`: ordered column → value mapping supplied by callers
//! - `Row` / `ResultSet`: what comes back from the driver
//! - `Column` / `SqlType`: column metadata from zero-row probes

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// SQL value type that can hold any parameter or column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value (BIT)
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Exact decimal (NUMERIC, DECIMAL, MONEY)
    Decimal(Decimal),
    /// Text string
    String(String),
    /// Date without time
    Date(NaiveDate),
    /// Date and time (UTC)
    DateTime(NaiveDateTime),
    /// Binary data
    Bytes(Vec<u8>),
    /// Any other structured value, bound as JSON text
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Float(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Try to get a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to get a date/time
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Render the value as text, for text columns and JSON fallbacks
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Self::Int(n) => Some(n.to_string()),
            Self::Float(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
            Self::Bytes(b) => Some(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
            Self::Json(j) => Some(j.to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v.naive_utc())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            other => Self::Json(other),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Ordered column → value mapping used by insert, bulk and merge operations
pub type Record = IndexMap<String, Value>;

/// Build a [`Record`] from `"column" => value` pairs, keeping their order.
///
/// ```
/// use mssql_kit::{record, Value};
///
/// let person = record! { "name" => "Johnny", "childrenCount" => 2 };
/// assert_eq!(person.get("childrenCount"), Some(&Value::Int(2)));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::types::Record::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::types::Record::new();
        $( record.insert(::std::string::String::from($key), $crate::types::Value::from($value)); )+
        record
    }};
}

/// One record or many, as accepted by `insert_object`
#[derive(Debug, Clone)]
pub struct Records(Vec<Record>);

impl Records {
    /// The records in submission order
    pub fn into_vec(self) -> Vec<Record> {
        self.0
    }
}

impl From<Record> for Records {
    fn from(record: Record) -> Self {
        Self(vec![record])
    }
}

impl From<Vec<Record>> for Records {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}

impl From<&[Record]> for Records {
    fn from(records: &[Record]) -> Self {
        Self(records.to_vec())
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive, like SQL Server's default collation)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Convert row to an ordered record
    pub fn into_record(self) -> Record {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// SQL Server column type as reported by result metadata
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Money,
    SmallMoney,
    Decimal,
    Char,
    VarChar,
    NChar,
    NVarChar,
    Text,
    NText,
    Date,
    Time,
    DateTime,
    SmallDateTime,
    DateTime2,
    DateTimeOffset,
    UniqueIdentifier,
    Binary,
    VarBinary,
    Xml,
    /// Anything else, by driver type name
    Other(String),
}

impl SqlType {
    /// Look up a type by its catalog name (`TYPE_NAME(system_type_id)`), case-insensitively
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "bit" => Self::Bit,
            "tinyint" => Self::TinyInt,
            "smallint" => Self::SmallInt,
            "int" => Self::Int,
            "bigint" => Self::BigInt,
            "real" => Self::Real,
            "float" => Self::Float,
            "money" => Self::Money,
            "smallmoney" => Self::SmallMoney,
            "decimal" | "numeric" => Self::Decimal,
            "char" => Self::Char,
            "varchar" => Self::VarChar,
            "nchar" => Self::NChar,
            "nvarchar" | "sysname" => Self::NVarChar,
            "text" => Self::Text,
            "ntext" => Self::NText,
            "date" => Self::Date,
            "time" => Self::Time,
            "datetime" => Self::DateTime,
            "smalldatetime" => Self::SmallDateTime,
            "datetime2" => Self::DateTime2,
            "datetimeoffset" => Self::DateTimeOffset,
            "uniqueidentifier" => Self::UniqueIdentifier,
            "binary" => Self::Binary,
            "varbinary" => Self::VarBinary,
            "xml" => Self::Xml,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Whether values for this column are transferred as text
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Self::Char | Self::VarChar | Self::NChar | Self::NVarChar | Self::Text | Self::NText
        )
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name (empty for anonymous expressions like `SCOPE_IDENTITY()`)
    pub name: String,
    /// Column type
    pub sql_type: SqlType,
}

impl Column {
    /// Create column metadata
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// Rows plus the column metadata of the first result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Columns, present even when no rows came back
    pub columns: Vec<Column>,
    /// Rows in result order
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Create a result set
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Column names in result order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
