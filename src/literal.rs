//! Literal rendering for ordered-column and watermark values
//!
//! A value read from a source database keeps its raw rendering together with
//! the semantic type of the column it came from. The type decides how the
//! value is re-embedded: single-quoted in SQL predicates for temporal and
//! textual columns, `#...#` wrapped in datasource descriptors for temporal
//! columns. Timestamps keep their time of day in the descriptor.

use crate::error::{RefreshError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Semantic type of a result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Date,
    Time,
    Timestamp,
    Text,
    Numeric,
}

/// How a value is embedded into a SQL predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// Dates, times, timestamps and text: `'value'`
    Quoted,
    /// Numbers: `value`
    Unquoted,
}

impl ColumnType {
    pub fn quoting(self) -> Quoting {
        match self {
            ColumnType::Numeric => Quoting::Unquoted,
            _ => Quoting::Quoted,
        }
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Time | ColumnType::Timestamp)
    }

    /// Classify a database type name such as `DATE`, `TIMESTAMPTZ`, `VARCHAR(20)` or `INT8`.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();

        match base {
            "DATE" => Some(ColumnType::Date),
            "TIME" | "TIMETZ" | "TIME WITHOUT TIME ZONE" | "TIME WITH TIME ZONE" => Some(ColumnType::Time),
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE"
            | "TIMESTAMP WITH TIME ZONE" => Some(ColumnType::Timestamp),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CHARACTER VARYING" | "CHARACTER"
            | "STRING" | "CLOB" | "NVARCHAR" | "NCHAR" => Some(ColumnType::Text),
            "INT" | "INT2" | "INT4" | "INT8" | "INTEGER" | "SMALLINT" | "BIGINT" | "FLOAT4"
            | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "NUMERIC" | "DECIMAL" | "FLOAT" => {
                Some(ColumnType::Numeric)
            }
            _ => None,
        }
    }

    /// Classify a value that only arrived as text (SQLite keeps dates as TEXT).
    pub fn infer_from_text(value: &str) -> Self {
        if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
            ColumnType::Date
        } else if parse_datetime(value).is_some() {
            ColumnType::Timestamp
        } else if NaiveTime::parse_from_str(value, "%H:%M:%S%.f").is_ok() {
            ColumnType::Time
        } else {
            ColumnType::Text
        }
    }
}

/// A scalar read from a source, tagged with its column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarValue {
    raw: String,
    column_type: ColumnType,
}

impl ScalarValue {
    pub fn new(raw: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            raw: raw.into(),
            column_type,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn quoting(&self) -> Quoting {
        self.column_type.quoting()
    }

    /// Query-ready literal: `'2021-01-15'` for quoted types, `42` otherwise.
    pub fn sql_literal(&self) -> String {
        match self.quoting() {
            Quoting::Quoted => format!("'{}'", self.raw.replace('\'', "''")),
            Quoting::Unquoted => self.raw.clone(),
        }
    }

    /// Literal in the descriptor's encoding: `#2021-01-15#`, `#2021-01-15 08:30:00#` or `#08:30:00#`.
    pub fn descriptor_literal(&self) -> Result<String> {
        match self.column_type {
            ColumnType::Date => descriptor_date_literal(&self.raw),
            ColumnType::Timestamp => descriptor_timestamp_literal(&self.raw),
            ColumnType::Time => {
                let value = unquote(&self.raw);
                let time = NaiveTime::parse_from_str(value, "%H:%M:%S%.f").map_err(|e| {
                    RefreshError::Descriptor(format!("Cannot read '{}' as a time: {}", value, e))
                })?;
                Ok(format!("#{}#", time.format("%H:%M:%S")))
            }
            ColumnType::Text | ColumnType::Numeric => Ok(self.raw.clone()),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_literal())
    }
}

/// Render a date or timestamp (optionally already SQL-quoted) as a descriptor date literal.
pub fn descriptor_date_literal(value: &str) -> Result<String> {
    let value = unquote(value);
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(value).map(|dt| dt.date()))
        .ok_or_else(|| RefreshError::Descriptor(format!("Cannot read '{}' as a date", value)))?;

    Ok(format!("#{}#", date.format("%Y-%m-%d")))
}

/// Render a timestamp (optionally already SQL-quoted) with its time of day; sub-second digits are kept.
pub fn descriptor_timestamp_literal(value: &str) -> Result<String> {
    let value = unquote(value);
    let timestamp = parse_datetime(value)
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| RefreshError::Descriptor(format!("Cannot read '{}' as a timestamp", value)))?;

    Ok(format!("#{}#", timestamp.format("%Y-%m-%d %H:%M:%S%.f")))
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.naive_local()))
        .or_else(|| {
            DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|dt| dt.naive_local())
        })
}
