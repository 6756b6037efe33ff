//! Error types for mssql-kit
//!
//! Every failure is surfaced to the immediate caller; nothing in the crate
//! retries. Categories tell callers which failures are worth retrying:
//! - Retriable: connection failures, connect timeouts
//! - Non-retriable: statement failures, missing results, invalid arguments

use std::fmt;
use thiserror::Error;

/// Result type for mssql-kit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by a driver implementation
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No configuration supplied yet
    NotInitialized,
    /// Connection-related errors (retriable)
    Connection,
    /// Timeout waiting for a connect attempt (retriable)
    Timeout,
    /// Statement bind/submit errors
    Execution,
    /// A scalar lookup found nothing
    NoResult,
    /// Bulk copy or merge failures carrying table context
    Table,
    /// Invalid caller input (identifiers, empty batches, missing match fields)
    InvalidArgument,
    /// Configuration error
    Configuration,
    /// Value could not be converted for the target column
    TypeConversion,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for mssql-kit
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// No configuration has been supplied
    #[error("sql client not initialized: call init(config) first")]
    NotInitialized,

    /// A concurrent connect attempt did not finish in time
    #[error("timed out after {waited_ms}ms waiting for the database connection")]
    ConnectTimeout { waited_ms: u64 },

    /// The underlying connect failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<DriverError>,
    },

    /// Statement bind or submit failed
    #[error("execution error: {message}")]
    Execution {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<DriverError>,
    },

    /// A scalar query returned no row or no column
    #[error("no value returned for query \"{sql}\" with params [{params}]")]
    NoResult { sql: String, params: String },

    /// Bulk copy into a table failed
    #[error("bulk insert into {table} failed: {source}")]
    BulkInsert {
        table: String,
        #[source]
        source: Box<Error>,
    },

    /// Merge into a table failed
    #[error("merge into {target} failed: {source}")]
    Merge {
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// Caller supplied an unusable argument
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotInitialized => ErrorCategory::NotInitialized,
            Self::ConnectTimeout { .. } => ErrorCategory::Timeout,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Execution { .. } => ErrorCategory::Execution,
            Self::NoResult { .. } => ErrorCategory::NoResult,
            Self::BulkInsert { .. } | Self::Merge { .. } => ErrorCategory::Table,
            Self::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Innermost error of a table-context wrapper
    pub fn root(&self) -> &Error {
        match self {
            Self::BulkInsert { source, .. } | Self::Merge { source, .. } => source.root(),
            other => other,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping the driver error
    pub fn connection_with_source(message: impl Into<String>, source: DriverError) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create an execution error carrying the statement and driver error
    pub fn execution_with_source(
        message: impl Into<String>,
        sql: impl Into<String>,
        source: DriverError,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql: Some(sql.into()),
            source: Some(source),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Wrap an error with the bulk target table
    pub fn bulk_insert(table: impl Into<String>, source: Error) -> Self {
        Self::BulkInsert {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error with the merge target table
    pub fn merge(target: impl Into<String>, source: Error) -> Self {
        Self::Merge {
            target: target.into(),
            source: Box::new(source),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "not_initialized"),
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Execution => write!(f, "execution"),
            Self::NoResult => write!(f, "no_result"),
            Self::Table => write!(f, "table"),
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::Configuration => write!(f, "configuration"),
            Self::TypeConversion => write!(f, "type_conversion"),
        }
    }
}
