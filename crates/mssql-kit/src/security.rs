//! Identifier validation for dynamically composed SQL.
//!
//! Values always travel as bound parameters; table and column names cannot,
//! so every name that ends up in statement text goes through
//! [`validate_sql_identifier`] first and is then bracket-quoted.

use crate::error::Error;

/// Maximum identifier length accepted by SQL Server (`sysname`)
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate a single SQL identifier (table, schema or column name).
///
/// Enforces an allow-pattern:
/// - Must not be empty
/// - At most 128 characters
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters, underscores, `$` and `#`
///   after the first character
///
/// # Examples
///
/// ```
/// use mssql_kit::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("people").is_ok());
/// assert!(validate_sql_identifier("childrenCount").is_ok());
///
/// assert!(validate_sql_identifier("x]; DROP TABLE people--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1st").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::invalid_argument(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::invalid_argument(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '$' && c != '#' {
            return Err(Error::invalid_argument(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Bracket-quote an identifier that already passed validation.
#[inline]
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Split a possibly qualified name (`table`, `schema.table`, `db.schema.table`)
/// into validated parts. Surrounding brackets on a part are accepted and stripped.
pub fn split_qualified_name(name: &str) -> crate::Result<Vec<String>> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 3 {
        return Err(Error::invalid_argument(format!(
            "Invalid table name '{}': at most three name parts allowed",
            name
        )));
    }

    parts
        .into_iter()
        .map(|part| {
            let bare = part
                .strip_prefix('[')
                .and_then(|p| p.strip_suffix(']'))
                .unwrap_or(part);
            validate_sql_identifier(bare)?;
            Ok(bare.to_string())
        })
        .collect()
}
