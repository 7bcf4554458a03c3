//! Target column schema
//!
//! Each column names its target, the header it is read from, its declared type and the
//! text standardisation applied before coercion. Columns not listed are dropped.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{EtlError, Result};
use crate::types::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Declared type of a target column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    #[serde(alias = "str", alias = "string")]
    Text,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "number", alias = "numeric")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Date,
    #[serde(alias = "timestamp")]
    DateTime,
}

impl ColumnType {
    /// Best-effort conversion of a non-empty field
    pub fn coerce(self, text: &str) -> std::result::Result<Value, String> {
        match self {
            ColumnType::Text => Ok(Value::Text(text.to_string())),
            ColumnType::Integer => text
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("'{text}' is not an integer")),
            ColumnType::Float => match text.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err(format!("'{text}' is not a number")),
            },
            ColumnType::Boolean => match text.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Boolean(false)),
                _ => Err(format!("'{text}' is not a boolean")),
            },
            ColumnType::Date => NaiveDate::parse_from_str(text, DATE_FORMAT)
                .map(Value::Date)
                .map_err(|_| format!("'{text}' is not a date (YYYY-MM-DD)")),
            ColumnType::DateTime => parse_datetime(text)
                .map(Value::DateTime)
                .ok_or_else(|| format!("'{text}' is not a datetime")),
        }
    }

    /// Whether range bounds can be applied to values of this type
    pub fn is_comparable(self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Float | ColumnType::Date | ColumnType::DateTime
        )
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
        };
        f.write_str(name)
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            // date-only values land at midnight
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn default_true() -> bool {
    true
}

/// One target column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,

    /// Header the value is read from; defaults to `name`
    #[serde(default)]
    pub source: Option<String>,

    #[serde(rename = "type", default)]
    pub column_type: ColumnType,

    /// Substituted for empty fields
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default = "default_true")]
    pub trim: bool,

    #[serde(default)]
    pub lowercase: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            source: None,
            column_type,
            default: None,
            trim: true,
            lowercase: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    /// Standardise a raw field; `None` means null
    pub fn prepare(&self, raw: &str) -> Option<String> {
        let text = if self.trim { raw.trim() } else { raw };
        let text = if text.is_empty() {
            self.default.as_deref()?
        } else {
            text
        };
        if self.lowercase {
            Some(text.to_lowercase())
        } else {
            Some(text.to_string())
        }
    }
}

/// Ordered target columns of one table
///
/// Columns read from the file come first; columns derived by transformations follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSchema {
    columns: Vec<ColumnSpec>,
    read: usize,
}

impl TargetSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        if columns.is_empty() {
            return Err(EtlError::config("target schema has no columns"));
        }
        check_names(&columns)?;
        let read = columns.len();
        Ok(Self { columns, read })
    }

    /// Append columns filled by transformations rather than read from the file
    pub fn with_derived(mut self, derived: Vec<ColumnSpec>) -> Result<Self> {
        self.columns.extend(derived);
        check_names(&self.columns)?;
        Ok(self)
    }

    /// Every column, in load order
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Columns read from the file
    pub fn read_columns(&self) -> &[ColumnSpec] {
        &self.columns[..self.read]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolve where each column's field sits in a record
    ///
    /// With headers, columns are located by source header name and a missing header is a
    /// schema error for the file. Without headers, columns map positionally.
    pub fn bind(&self, headers: Option<&[String]>) -> Result<FieldBinding> {
        let positions = match headers {
            Some(headers) => {
                let mut positions = Vec::with_capacity(self.read);
                let mut missing = Vec::new();
                for column in self.read_columns() {
                    match headers.iter().position(|h| h == column.source_name()) {
                        Some(pos) => positions.push(pos),
                        None => missing.push(column.source_name().to_string()),
                    }
                }
                if !missing.is_empty() {
                    return Err(EtlError::Schema(format!(
                        "missing required columns: {}",
                        missing.join(", ")
                    )));
                }
                positions
            },
            None => (0..self.read).collect(),
        };
        Ok(FieldBinding { positions })
    }
}

fn check_names(columns: &[ColumnSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for column in columns {
        if column.name.trim().is_empty() {
            return Err(EtlError::config("column name must not be empty"));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(EtlError::config(format!("duplicate column '{}'", column.name)));
        }
    }
    Ok(())
}

/// Field position of every read column, in column order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    positions: Vec<usize>,
}

impl FieldBinding {
    /// Raw field of column `column`; absent fields read as empty
    pub fn field<'a>(&self, fields: &'a [String], column: usize) -> &'a str {
        self.positions
            .get(column)
            .and_then(|&pos| fields.get(pos))
            .map(String::as_str)
            .unwrap_or("")
    }
}
