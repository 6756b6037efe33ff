//! Wire type inference for bound parameters
//!
//! Every parameter is sent as a typed TDS parameter named `P1`, `P2`, ...
//! and its wire type is chosen from the runtime value alone:
//!
//! | Value                         | Wire type   |
//! |-------------------------------|-------------|
//! | `String`                      | `NVarChar`  |
//! | `Bool`                        | `Bit`       |
//! | `Int`, integral `Float`/`Decimal` | `Int`   |
//! | other `Float`/`Decimal`       | `Money`     |
//! | `Date`, `DateTime`            | `DateTime`  |
//! | `Bytes`                       | `VarBinary` |
//! | `Null`, `Json`                | `NVarChar`  |

use crate::types::Value;
use serde::{Deserialize, Serialize};

/// Parameter wire type sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    /// Unicode text; also the fallback for nulls and structured values
    NVarChar,
    /// Boolean bit
    Bit,
    /// Integer (32-bit when it fits, 64-bit otherwise)
    Int,
    /// Fixed-point with four decimal places
    Money,
    /// Date and time
    DateTime,
    /// Raw bytes
    VarBinary,
}

impl WireType {
    /// SQL Server type name
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::NVarChar => "NVARCHAR",
            Self::Bit => "BIT",
            Self::Int => "INT",
            Self::Money => "MONEY",
            Self::DateTime => "DATETIME",
            Self::VarBinary => "VARBINARY",
        }
    }
}

impl std::fmt::Display for WireType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Choose the wire type for a value. Total: never fails, never panics.
pub fn infer_wire_type(value: &Value) -> WireType {
    match value {
        Value::String(_) => WireType::NVarChar,
        Value::Bool(_) => WireType::Bit,
        Value::Int(_) => WireType::Int,
        Value::Float(n) => {
            if n.is_finite() && n.fract() == 0.0 {
                WireType::Int
            } else {
                WireType::Money
            }
        }
        Value::Decimal(d) => {
            if d.fract().is_zero() {
                WireType::Int
            } else {
                WireType::Money
            }
        }
        Value::Date(_) | Value::DateTime(_) => WireType::DateTime,
        Value::Bytes(_) => WireType::VarBinary,
        Value::Null | Value::Json(_) => WireType::NVarChar,
    }
}

/// A named, typed statement parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Name without the `@` sigil (`P1`, `P2`, ...)
    pub name: String,
    /// Inferred wire type
    pub wire_type: WireType,
    /// The value to bind
    pub value: Value,
}

impl Param {
    /// Placeholder text for this parameter, e.g. `@P3`
    pub fn placeholder(&self) -> String {
        format!("@{}", self.name)
    }
}

/// Name and type every value positionally: the value at index `i` becomes `P{i+1}`.
pub fn bind_params(values: &[Value]) -> Vec<Param> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| Param {
            name: format!("P{}", i + 1),
            wire_type: infer_wire_type(value),
            value: value.clone(),
        })
        .collect()
}

/// Short human-readable rendering of parameter values, for error messages
pub(crate) fn describe_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
