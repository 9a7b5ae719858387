//! PostgreSQL reference sources through sqlx

use super::{QueryResult, ResultColumn, SourceDatabase};
use crate::config::DatabaseConfig;
use crate::error::{RefreshError, Result};
use crate::literal::ColumnType;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, ConnectOptions, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

pub struct PostgresDatabase {
    conn: PgConnection,
}

impl PostgresDatabase {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut options = PgConnectOptions::from_str(config.native_url())
            .map_err(|e| RefreshError::Database(format!("Invalid PostgreSQL URL: {}", e)))?;
        if let Some(user) = config.user() {
            options = options.username(user);
        }
        if let Some(password) = config.password() {
            options = options.password(password);
        }

        let conn = options
            .connect()
            .await
            .map_err(|e| RefreshError::Database(format!("Failed to connect to PostgreSQL: {}", e)))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SourceDatabase for PostgresDatabase {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!("postgres query: {}", sql);
        let pg_rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;

        let mut result = QueryResult::default();
        if let Some(first) = pg_rows.first() {
            result.columns = first
                .columns()
                .iter()
                .map(|c| ResultColumn {
                    name: c.name().to_string(),
                    column_type: ColumnType::from_type_name(c.type_info().name()),
                })
                .collect();
        }

        for row in &pg_rows {
            let mut cells = Vec::with_capacity(row.len());
            for (index, column) in row.columns().iter().enumerate() {
                cells.push(decode_cell(row, index, column.type_info().name())?);
            }
            result.rows.push(cells);
        }

        Ok(result)
    }
}

/// Rust-side decoding for a PostgreSQL type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Date,
    Timestamp,
    TimestampTz,
    Time,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
}

impl CellKind {
    fn for_type_name(type_name: &str) -> Option<Self> {
        let kind = match type_name {
            "DATE" => CellKind::Date,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::TimestampTz,
            "TIME" => CellKind::Time,
            "INT2" => CellKind::Int2,
            "INT4" => CellKind::Int4,
            "INT8" => CellKind::Int8,
            "FLOAT4" => CellKind::Float4,
            "FLOAT8" => CellKind::Float8,
            "NUMERIC" => CellKind::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => CellKind::Text,
            _ => return None,
        };
        Some(kind)
    }
}

fn decode_cell(row: &PgRow, index: usize, type_name: &str) -> Result<Option<String>> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(None);
    }

    let kind = CellKind::for_type_name(type_name).ok_or_else(|| {
        RefreshError::Database(format!(
            "Unsupported column type {}; cast the column in the reference table view",
            type_name
        ))
    })?;

    let text = match kind {
        CellKind::Date => row.try_get::<NaiveDate, _>(index)?.format("%Y-%m-%d").to_string(),
        CellKind::Timestamp => row
            .try_get::<NaiveDateTime, _>(index)?
            .format("%Y-%m-%d %H:%M:%S%.f")
            .to_string(),
        CellKind::TimestampTz => row
            .try_get::<DateTime<Utc>, _>(index)?
            .format("%Y-%m-%d %H:%M:%S%.f%:z")
            .to_string(),
        CellKind::Time => row.try_get::<NaiveTime, _>(index)?.format("%H:%M:%S%.f").to_string(),
        CellKind::Int2 => row.try_get::<i16, _>(index)?.to_string(),
        CellKind::Int4 => row.try_get::<i32, _>(index)?.to_string(),
        CellKind::Int8 => row.try_get::<i64, _>(index)?.to_string(),
        CellKind::Float4 => row.try_get::<f32, _>(index)?.to_string(),
        CellKind::Float8 => row.try_get::<f64, _>(index)?.to_string(),
        // plain notation so the value is a valid SQL literal when re-embedded
        CellKind::Numeric => row.try_get::<BigDecimal, _>(index)?.to_plain_string(),
        CellKind::Text => row.try_get::<String, _>(index)?,
    };

    Ok(Some(text))
}
