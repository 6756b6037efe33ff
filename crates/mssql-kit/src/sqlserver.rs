//! SQL Server driver backed by tiberius
//!
//! One [`SqlServerConnection`] wraps one TDS client. Statement parameters are
//! encoded from their inferred [`WireType`]; bulk copies are encoded from the
//! target table's own column types, which the driver reads from `sys.columns`
//! before streaming rows.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::borrow::Cow;
use std::sync::Arc;
use tiberius::numeric::Numeric;
use tiberius::time::{Date, DateTime, DateTime2, DateTimeOffset, SmallDateTime, Time};
use tiberius::xml::XmlData;
use tiberius::{
    AuthMethod, Client, ColumnData, ColumnType, Config, EncryptionLevel, FromSql, SqlBrowser,
    ToSql, TokenRow,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::SqlConfig;
use crate::driver::{BulkCopyResult, BulkTable, Driver, DriverConnection, DriverResult};
use crate::error::{Error, Result};
use crate::security::quote_identifier;
use crate::statement::TableName;
use crate::types::{Column, ResultSet, Row, SqlType, Value};
use crate::wire::{Param, WireType};

type TdsClient = Client<Compat<TcpStream>>;

/// Day number of 1900-01-01 counted from 0001-01-01 = 1, the epoch of `DATETIME`
const DAYS_FROM_CE_1900: i32 = 693_596;

/// Scale used for parameters; `DATETIME2(7)` keeps every chrono fraction
const PARAM_TIME_SCALE: u8 = 7;

const MONEY_SCALE: u32 = 4;

/// Writable columns in table order: what `INSERT BULK` expects a row to contain
const BULK_COLUMNS_SQL: &str = "SELECT c.name, TYPE_NAME(c.system_type_id) AS type_name, c.scale \
     FROM sys.columns c \
     WHERE c.object_id = OBJECT_ID(@P1) \
       AND c.is_identity = 0 AND c.is_computed = 0 AND c.system_type_id <> 189 \
     ORDER BY c.column_id";

/// Driver that opens tiberius connections over tokio TCP streams
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerDriver;

impl SqlServerDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SqlServerDriver {
    async fn connect(&self, config: &SqlConfig) -> DriverResult<Arc<dyn DriverConnection>> {
        let conn = SqlServerConnection::connect(config).await?;
        Ok(Arc::new(conn))
    }

    fn name(&self) -> &'static str {
        "tiberius"
    }
}

/// One authenticated TDS connection
pub struct SqlServerConnection {
    client: Mutex<Option<TdsClient>>,
    server: String,
}

impl std::fmt::Debug for SqlServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerConnection")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SqlServerConnection {
    /// Connect, log in and apply session options
    pub async fn connect(config: &SqlConfig) -> Result<Self> {
        let server = config.address();
        debug!(server = %server, "Connecting to SQL Server");

        let mut tib = tiberius_config(config)?;
        let named = config.instance_name.is_some();

        let mut client = match handshake(tib.clone(), named).await {
            Ok(client) => client,
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!(host = %host, port, "Server redirected the login");
                tib.host(&host);
                tib.port(port);
                handshake(tib, false).await.map_err(connect_error)?
            }
            Err(e) => return Err(connect_error(e)),
        };

        if config.driver_options.enable_arith_abort {
            client
                .execute("SET ARITHABORT ON", &[])
                .await
                .map_err(connect_error)?;
        }

        let ignored: Vec<&str> = config
            .driver_options
            .properties
            .keys()
            .map(String::as_str)
            .collect();
        if !ignored.is_empty() {
            warn!(properties = ?ignored, "Driver properties not understood by tiberius were ignored");
        }

        info!(server = %server, "Connected to SQL Server");
        Ok(Self {
            client: Mutex::new(Some(client)),
            server,
        })
    }
}

fn tiberius_config(config: &SqlConfig) -> Result<Config> {
    let mut tib = Config::new();
    tib.host(&config.server);
    tib.port(config.port);
    if let Some(database) = &config.database {
        tib.database(database);
    }
    if let Some(instance) = &config.instance_name {
        tib.instance_name(instance);
    }
    if let Some(app) = &config.driver_options.application_name {
        tib.application_name(app);
    }

    let user = config
        .user
        .as_deref()
        .ok_or_else(|| Error::config("A SQL login user is required"))?;
    let password = config
        .password
        .as_ref()
        .map(|p| p.expose_secret())
        .unwrap_or_default();
    tib.authentication(AuthMethod::sql_server(user, password));

    if config.driver_options.encrypt {
        tib.encryption(EncryptionLevel::Required);
    } else {
        tib.encryption(EncryptionLevel::NotSupported);
    }
    if config.driver_options.trust_server_certificate {
        tib.trust_cert();
    }
    Ok(tib)
}

async fn handshake(tib: Config, named: bool) -> tiberius::Result<TdsClient> {
    let tcp = if named {
        TcpStream::connect_named(&tib).await?
    } else {
        TcpStream::connect(tib.get_addr()).await?
    };
    tcp.set_nodelay(true)?;
    Client::connect(tib, tcp.compat_write()).await
}

fn connect_error(e: tiberius::error::Error) -> Error {
    Error::connection_with_source(format!("Failed to connect: {}", e), Box::new(e))
}

#[async_trait]
impl DriverConnection for SqlServerConnection {
    async fn query(&self, sql: &str, params: &[Param]) -> DriverResult<ResultSet> {
        let encoded: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
        let refs: Vec<&dyn ToSql> = encoded.iter().map(|p| p as &dyn ToSql).collect();

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;

        let mut stream = client.query(sql, &refs).await?;
        let columns: Vec<Column> = stream
            .columns()
            .await?
            .map(|cols| {
                cols.iter()
                    .map(|c| Column::new(c.name(), sql_type_of(c.column_type())))
                    .collect()
            })
            .unwrap_or_default();
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        let rows = stream
            .into_first_result()
            .await?
            .into_iter()
            .map(|row| Row::new(names.clone(), row.into_iter().map(decode).collect()))
            .collect();
        Ok(ResultSet::new(columns, rows))
    }

    async fn bulk_copy(&self, table: &BulkTable) -> DriverResult<BulkCopyResult> {
        let target = TableName::parse(&table.table)?;

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(closed)?;

        let columns = writable_columns(client, &table.table).await?;
        let layout = bulk_layout(table, &columns)?;

        let total = if needs_staging(&columns) {
            load_through_staging(client, &target, table, &columns, &layout).await?
        } else {
            load_rows(client, &target.quoted(), &columns, &layout, &table.rows).await?
        };

        debug!(table = %table.table, rows = total, "Bulk copy finalized");
        Ok(BulkCopyResult {
            rows_affected: total,
        })
    }

    async fn close(&self) -> DriverResult<()> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.close().await?;
            debug!(server = %self.server, "Closed SQL Server connection");
        }
        Ok(())
    }
}

fn closed() -> Error {
    Error::connection("Connection is closed")
}

// ---------------------------------------------------------------------------
// Statement parameters
// ---------------------------------------------------------------------------

/// A bound parameter, encoded by its inferred wire type
struct SqlParam<'a>(&'a Param);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        let value = &self.0.value;
        match self.0.wire_type {
            WireType::NVarChar => match value {
                Value::Null => ColumnData::String(None),
                Value::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
                other => ColumnData::String(other.to_text().map(Cow::Owned)),
            },
            WireType::Bit => ColumnData::Bit(value.as_bool()),
            WireType::Int => match value.as_i64() {
                Some(n) => match i32::try_from(n) {
                    Ok(small) => ColumnData::I32(Some(small)),
                    Err(_) => ColumnData::I64(Some(n)),
                },
                None => ColumnData::Numeric(to_decimal(value).and_then(|d| numeric(d, 0))),
            },
            WireType::Money => {
                ColumnData::Numeric(to_decimal(value).and_then(|d| numeric(d, MONEY_SCALE)))
            }
            WireType::DateTime => ColumnData::DateTime2(
                value
                    .as_datetime()
                    .and_then(|dt| datetime2(dt, PARAM_TIME_SCALE).ok()),
            ),
            WireType::VarBinary => match value {
                Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
                _ => ColumnData::Binary(None),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Result decoding
// ---------------------------------------------------------------------------

fn sql_type_of(ty: ColumnType) -> SqlType {
    match ty {
        ColumnType::Bit | ColumnType::Bitn => SqlType::Bit,
        ColumnType::Int1 => SqlType::TinyInt,
        ColumnType::Int2 => SqlType::SmallInt,
        ColumnType::Int4 | ColumnType::Intn => SqlType::Int,
        ColumnType::Int8 => SqlType::BigInt,
        ColumnType::Float4 => SqlType::Real,
        ColumnType::Float8 | ColumnType::Floatn => SqlType::Float,
        ColumnType::Money => SqlType::Money,
        ColumnType::Money4 => SqlType::SmallMoney,
        ColumnType::Decimaln | ColumnType::Numericn => SqlType::Decimal,
        ColumnType::BigChar => SqlType::Char,
        ColumnType::BigVarChar => SqlType::VarChar,
        ColumnType::NChar => SqlType::NChar,
        ColumnType::NVarchar => SqlType::NVarChar,
        ColumnType::Text => SqlType::Text,
        ColumnType::NText => SqlType::NText,
        ColumnType::Daten => SqlType::Date,
        ColumnType::Timen => SqlType::Time,
        ColumnType::Datetime | ColumnType::Datetimen => SqlType::DateTime,
        ColumnType::Datetime4 => SqlType::SmallDateTime,
        ColumnType::Datetime2 => SqlType::DateTime2,
        ColumnType::DatetimeOffsetn => SqlType::DateTimeOffset,
        ColumnType::Guid => SqlType::UniqueIdentifier,
        ColumnType::BigBinary => SqlType::Binary,
        ColumnType::BigVarBin | ColumnType::Image => SqlType::VarBinary,
        ColumnType::Xml => SqlType::Xml,
        other => SqlType::Other(format!("{:?}", other)),
    }
}

fn decode(data: ColumnData<'static>) -> Value {
    match &data {
        ColumnData::U8(v) => v.map_or(Value::Null, |n| Value::Int(i64::from(n))),
        ColumnData::I16(v) => v.map_or(Value::Null, |n| Value::Int(i64::from(n))),
        ColumnData::I32(v) => v.map_or(Value::Null, |n| Value::Int(i64::from(n))),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::Int),
        ColumnData::F32(v) => v.map_or(Value::Null, |n| Value::Float(f64::from(n))),
        ColumnData::F64(v) => v.map_or(Value::Null, Value::Float),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::Bool),
        ColumnData::String(v) => v
            .as_deref()
            .map_or(Value::Null, |s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v
            .as_deref()
            .map_or(Value::Null, |b| Value::Bytes(b.to_vec())),
        ColumnData::Numeric(None) => Value::Null,
        ColumnData::Numeric(Some(n)) => match Decimal::from_sql(&data) {
            Ok(Some(d)) => Value::Decimal(d),
            // wider than 96 bits
            _ => Value::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale()))),
        },
        ColumnData::Xml(_) => <&str>::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Value::Null, |s| Value::String(s.to_string())),
        ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| {
                Value::String(t.format("%H:%M:%S%.f").to_string())
            }),
        ColumnData::DateTimeOffset(_) => chrono::DateTime::<Utc>::from_sql(&data)
            .ok()
            .flatten()
            .map_or(Value::Null, |dt| Value::DateTime(dt.naive_utc())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::DateTime)
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Bulk copy
// ---------------------------------------------------------------------------

/// A writable column of the bulk target
#[derive(Debug, Clone, PartialEq)]
struct TargetColumn {
    name: String,
    sql_type: SqlType,
    scale: u8,
}

async fn writable_columns(client: &mut TdsClient, table: &str) -> Result<Vec<TargetColumn>> {
    let rows = client
        .query(BULK_COLUMNS_SQL, &[&table])
        .await
        .map_err(|e| bulk_meta_error(table, e))?
        .into_first_result()
        .await
        .map_err(|e| bulk_meta_error(table, e))?;

    let columns: Vec<TargetColumn> = rows
        .iter()
        .filter_map(|row| {
            let name = row.get::<&str, _>(0)?;
            let type_name = row.get::<&str, _>(1)?;
            Some(TargetColumn {
                name: name.to_string(),
                sql_type: SqlType::from_type_name(type_name),
                scale: row.get::<u8, _>(2).unwrap_or(0),
            })
        })
        .collect();

    if columns.is_empty() {
        return Err(Error::execution(format!(
            "Table {} does not exist or has no writable columns",
            table
        )));
    }
    Ok(columns)
}

fn bulk_meta_error(table: &str, e: tiberius::error::Error) -> Error {
    Error::execution_with_source(
        format!("Failed to read column metadata for {}: {}", table, e),
        BULK_COLUMNS_SQL,
        Box::new(e),
    )
}

/// For each target column, the index of the caller's column feeding it
fn bulk_layout(table: &BulkTable, targets: &[TargetColumn]) -> Result<Vec<Option<usize>>> {
    for name in table.column_names() {
        if !targets.iter().any(|t| t.name.eq_ignore_ascii_case(name)) {
            return Err(Error::invalid_argument(format!(
                "Column '{}' of {} cannot be bulk loaded: it is missing, an identity, or computed",
                name, table.table
            )));
        }
    }
    Ok(targets
        .iter()
        .map(|t| {
            table
                .column_names()
                .position(|name| name.eq_ignore_ascii_case(&t.name))
        })
        .collect())
}

/// Stream `rows` into `target`, one token row per record in target column order
async fn load_rows(
    client: &mut TdsClient,
    target: &str,
    columns: &[TargetColumn],
    layout: &[Option<usize>],
    rows: &[Vec<Value>],
) -> DriverResult<u64> {
    let mut request = client.bulk_insert(target).await?;
    for row in rows {
        let mut token_row = TokenRow::new();
        for (column, idx) in columns.iter().zip(layout) {
            let value = idx.and_then(|i| row.get(i)).unwrap_or(&Value::Null);
            token_row.push(bulk_data(value, column)?);
        }
        request.send(token_row).await?;
    }
    Ok(request.finalize().await?.total())
}

/// Server type a column is staged as when tiberius has no bulk encoding for its own type
fn staging_cast(sql_type: &SqlType) -> Option<&'static str> {
    match sql_type {
        SqlType::Money | SqlType::SmallMoney => Some("DECIMAL(19, 4)"),
        SqlType::Text => Some("VARCHAR(MAX)"),
        SqlType::NText => Some("NVARCHAR(MAX)"),
        SqlType::Other(name) if name.eq_ignore_ascii_case("image") => Some("VARBINARY(MAX)"),
        SqlType::Other(_) => Some("NVARCHAR(MAX)"),
        _ => None,
    }
}

fn needs_staging(columns: &[TargetColumn]) -> bool {
    columns.iter().any(|c| staging_cast(&c.sql_type).is_some())
}

/// The column as it exists in the staging table
fn load_column(column: &TargetColumn) -> TargetColumn {
    let (sql_type, scale) = match &column.sql_type {
        SqlType::Money | SqlType::SmallMoney => (SqlType::Decimal, MONEY_SCALE as u8),
        SqlType::Text => (SqlType::VarChar, 0),
        SqlType::NText => (SqlType::NVarChar, 0),
        SqlType::Other(name) if name.eq_ignore_ascii_case("image") => (SqlType::VarBinary, 0),
        SqlType::Other(_) => (SqlType::NVarChar, 0),
        other => (other.clone(), column.scale),
    };
    TargetColumn {
        name: column.name.clone(),
        sql_type,
        scale,
    }
}

/// `#bulk_<table>` holding only the supplied columns, retyped where needed
fn staging_sql(staging: &str, target: &TableName, columns: &[&TargetColumn]) -> String {
    let projection = columns
        .iter()
        .map(|c| {
            let name = quote_identifier(&c.name);
            match staging_cast(&c.sql_type) {
                Some(cast) => format!("CAST(NULL AS {}) AS {}", cast, name),
                None => name,
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "IF OBJECT_ID(N'tempdb..{staging}') IS NOT NULL DROP TABLE {staging};\n\
         SELECT TOP(0) {projection} INTO {staging} FROM {target}",
        staging = staging,
        projection = projection,
        target = target.quoted()
    )
}

/// Bulk-load into a session temp table, then move the supplied columns into
/// the target with one `INSERT ... SELECT`. The server converts the staged
/// types back to the target's on that insert.
async fn load_through_staging(
    client: &mut TdsClient,
    target: &TableName,
    table: &BulkTable,
    columns: &[TargetColumn],
    layout: &[Option<usize>],
) -> DriverResult<u64> {
    let staging = format!("#bulk_{}", target.name());
    let (supplied, staged_layout): (Vec<&TargetColumn>, Vec<Option<usize>>) = columns
        .iter()
        .zip(layout)
        .filter_map(|(c, idx)| idx.map(|i| (c, Some(i))))
        .unzip();
    let load_columns: Vec<TargetColumn> = supplied.iter().map(|c| load_column(c)).collect();

    debug!(table = %table.table, staging = %staging, "Target has columns without a bulk encoding; staging");
    client
        .execute(staging_sql(&staging, target, &supplied), &[])
        .await?;

    let total = load_rows(client, &staging, &load_columns, &staged_layout, &table.rows).await?;

    let names = supplied
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    client
        .execute(
            format!(
                "INSERT INTO {target} ({names}) SELECT {names} FROM {staging};\nDROP TABLE {staging}",
                target = target.quoted(),
                names = names,
                staging = staging
            ),
            &[],
        )
        .await?;
    Ok(total)
}

fn bulk_data(value: &Value, column: &TargetColumn) -> Result<ColumnData<'static>> {
    if value.is_null() {
        return Ok(typed_null(&column.sql_type));
    }
    let mismatch = || {
        Error::type_conversion(format!(
            "Cannot convert {} to {:?} for column '{}'",
            value, column.sql_type, column.name
        ))
    };

    let data = match &column.sql_type {
        SqlType::Bit => ColumnData::Bit(Some(to_bool(value).ok_or_else(mismatch)?)),
        SqlType::TinyInt => ColumnData::U8(Some(
            to_i64(value)
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(mismatch)?,
        )),
        SqlType::SmallInt => ColumnData::I16(Some(
            to_i64(value)
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(mismatch)?,
        )),
        SqlType::Int => ColumnData::I32(Some(
            to_i64(value)
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(mismatch)?,
        )),
        SqlType::BigInt => ColumnData::I64(Some(to_i64(value).ok_or_else(mismatch)?)),
        SqlType::Real => ColumnData::F32(Some(to_f64(value).ok_or_else(mismatch)? as f32)),
        SqlType::Float => ColumnData::F64(Some(to_f64(value).ok_or_else(mismatch)?)),
        // staged as DECIMAL(19, 4)
        SqlType::Money | SqlType::SmallMoney => ColumnData::Numeric(Some(
            to_decimal(value)
                .and_then(|d| numeric(d, MONEY_SCALE))
                .ok_or_else(mismatch)?,
        )),
        SqlType::Decimal => ColumnData::Numeric(Some(
            to_decimal(value)
                .and_then(|d| numeric(d, u32::from(column.scale)))
                .ok_or_else(mismatch)?,
        )),
        SqlType::Date => {
            let dt = to_datetime(value).ok_or_else(mismatch)?;
            ColumnData::Date(Some(date(dt.date())?))
        }
        SqlType::Time => {
            let t = to_time(value).ok_or_else(mismatch)?;
            ColumnData::Time(Some(time(t, column.scale)))
        }
        SqlType::DateTime => ColumnData::DateTime(Some(legacy_datetime(
            to_datetime(value).ok_or_else(mismatch)?,
        )?)),
        SqlType::SmallDateTime => ColumnData::SmallDateTime(Some(small_datetime(
            to_datetime(value).ok_or_else(mismatch)?,
        )?)),
        SqlType::DateTime2 => ColumnData::DateTime2(Some(datetime2(
            to_datetime(value).ok_or_else(mismatch)?,
            column.scale,
        )?)),
        SqlType::DateTimeOffset => ColumnData::DateTimeOffset(Some(DateTimeOffset::new(
            datetime2(to_datetime(value).ok_or_else(mismatch)?, column.scale)?,
            0,
        ))),
        SqlType::UniqueIdentifier => {
            let text = value.as_str().ok_or_else(mismatch)?;
            let guid = tiberius::Uuid::parse_str(text.trim()).map_err(|_| mismatch())?;
            ColumnData::Guid(Some(guid))
        }
        SqlType::Binary | SqlType::VarBinary => match value {
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
            Value::String(s) => ColumnData::Binary(Some(Cow::Owned(s.clone().into_bytes()))),
            _ => return Err(mismatch()),
        },
        SqlType::Xml => ColumnData::Xml(
            value
                .to_text()
                .map(|text| Cow::Owned(XmlData::new(text))),
        ),
        SqlType::Char
        | SqlType::VarChar
        | SqlType::NChar
        | SqlType::NVarChar
        | SqlType::Text
        | SqlType::NText
        | SqlType::Other(_) => ColumnData::String(value.to_text().map(Cow::Owned)),
    };
    Ok(data)
}

fn typed_null(sql_type: &SqlType) -> ColumnData<'static> {
    match sql_type {
        SqlType::Bit => ColumnData::Bit(None),
        SqlType::TinyInt => ColumnData::U8(None),
        SqlType::SmallInt => ColumnData::I16(None),
        SqlType::Int => ColumnData::I32(None),
        SqlType::BigInt => ColumnData::I64(None),
        SqlType::Real => ColumnData::F32(None),
        SqlType::Float => ColumnData::F64(None),
        SqlType::Money | SqlType::SmallMoney | SqlType::Decimal => ColumnData::Numeric(None),
        SqlType::Date => ColumnData::Date(None),
        SqlType::Time => ColumnData::Time(None),
        SqlType::DateTime => ColumnData::DateTime(None),
        SqlType::SmallDateTime => ColumnData::SmallDateTime(None),
        SqlType::DateTime2 => ColumnData::DateTime2(None),
        SqlType::DateTimeOffset => ColumnData::DateTimeOffset(None),
        SqlType::UniqueIdentifier => ColumnData::Guid(None),
        SqlType::Binary | SqlType::VarBinary => ColumnData::Binary(None),
        SqlType::Xml => ColumnData::Xml(None),
        _ => ColumnData::String(None),
    }
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

fn to_bool(value: &Value) -> Option<bool> {
    value.as_bool().or_else(|| match value.as_str()?.trim() {
        s if s.eq_ignore_ascii_case("true") || s == "1" => Some(true),
        s if s.eq_ignore_ascii_case("false") || s == "0" => Some(false),
        _ => None,
    })
}

fn to_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

fn to_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .filter(|n| n.is_finite())
        .or_else(|| value.as_str()?.trim().parse().ok())
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Int(n) => Some(Decimal::from(*n)),
        Value::Float(n) => Decimal::from_f64(*n),
        Value::Bool(b) => Some(Decimal::from(u8::from(*b))),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_datetime(value: &Value) -> Option<NaiveDateTime> {
    value
        .as_datetime()
        .or_else(|| parse_datetime(value.as_str()?.trim()))
}

fn to_time(value: &Value) -> Option<NaiveTime> {
    match value {
        Value::DateTime(dt) => Some(dt.time()),
        Value::String(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok(),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Round `d` to `scale` places and encode it. `None` if it does not fit.
fn numeric(mut d: Decimal, scale: u32) -> Option<Numeric> {
    d = d.round_dp(scale);
    d.rescale(scale);
    if d.scale() != scale {
        return None;
    }
    let scale = u8::try_from(scale).ok()?;
    Some(Numeric::new_with_scale(d.mantissa(), scale))
}

// ---------------------------------------------------------------------------
// Temporal encoding
// ---------------------------------------------------------------------------

fn nanos_since_midnight(t: NaiveTime) -> u64 {
    // leap seconds report nanosecond() >= 1e9
    let frac = u64::from(t.nanosecond().min(999_999_999));
    u64::from(t.num_seconds_from_midnight()) * 1_000_000_000 + frac
}

fn time(t: NaiveTime, scale: u8) -> Time {
    let scale = scale.min(7);
    let divisor = 10u64.pow(9 - u32::from(scale));
    Time::new(nanos_since_midnight(t) / divisor, scale)
}

fn date(d: NaiveDate) -> Result<Date> {
    let days = u32::try_from(d.num_days_from_ce() - 1)
        .map_err(|_| Error::type_conversion(format!("Date {} is before 0001-01-01", d)))?;
    Ok(Date::new(days))
}

fn datetime2(dt: NaiveDateTime, scale: u8) -> Result<DateTime2> {
    Ok(DateTime2::new(date(dt.date())?, time(dt.time(), scale)))
}

fn legacy_datetime(dt: NaiveDateTime) -> Result<DateTime> {
    let days = dt.date().num_days_from_ce() - DAYS_FROM_CE_1900;
    // DATETIME starts at 1753-01-01
    if days < -53_690 {
        return Err(Error::type_conversion(format!(
            "{} is out of range for DATETIME",
            dt
        )));
    }
    // 1/300 s ticks, rounded
    let ticks = (nanos_since_midnight(dt.time()) * 3 + 5_000_000) / 10_000_000;
    let ticks = u32::try_from(ticks.min(25_919_999)).unwrap_or(25_919_999);
    Ok(DateTime::new(days, ticks))
}

fn small_datetime(dt: NaiveDateTime) -> Result<SmallDateTime> {
    let days = u16::try_from(dt.date().num_days_from_ce() - DAYS_FROM_CE_1900).map_err(|_| {
        Error::type_conversion(format!("{} is out of range for SMALLDATETIME", dt))
    })?;
    let minutes = ((dt.time().num_seconds_from_midnight() + 30) / 60).min(1439);
    Ok(SmallDateTime::new(days, minutes as u16))
}
