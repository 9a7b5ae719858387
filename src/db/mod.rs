//! Database gateway for reference tables
//!
//! Opens a connection from a named [`DatabaseConfig`] entry and runs read
//! queries, reporting the semantic type of each result column.

pub mod postgres;
pub mod sqlite;

use crate::config::{DatabaseConfig, DriverKind};
use crate::error::Result;
use crate::literal::{ColumnType, ScalarValue};
use async_trait::async_trait;
use tracing::debug;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    /// `None` until a non-null value or a known type name was seen
    pub column_type: Option<ColumnType>,
}

/// Rows rendered as text, alongside the column types
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// First column of the first row; `None` for no rows or SQL NULL.
    pub fn scalar(&self) -> Option<ScalarValue> {
        let raw = self.rows.first()?.first()?.as_ref()?;
        let column_type = self
            .columns
            .first()
            .and_then(|c| c.column_type)
            .unwrap_or_else(|| ColumnType::infer_from_text(raw));
        Some(ScalarValue::new(raw.clone(), column_type))
    }
}

#[async_trait]
pub trait SourceDatabase: Send {
    /// Run a read query. Identifiers and literals are already rendered into `sql`.
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;
}

/// Open a connection for a configured database entry.
pub async fn connect(name: &str, config: &DatabaseConfig) -> Result<Box<dyn SourceDatabase>> {
    if !config.jars.is_empty() {
        debug!(database = name, jars = ?config.jars, "driver artifacts are not needed by native drivers");
    }

    match config.driver()? {
        DriverKind::Sqlite => Ok(Box::new(SqliteDatabase::open(config)?)),
        DriverKind::Postgres => Ok(Box::new(PostgresDatabase::connect(config).await?)),
    }
}
