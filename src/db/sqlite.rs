//! SQLite reference sources through rusqlite

use super::{QueryResult, ResultColumn, SourceDatabase};
use crate::config::DatabaseConfig;
use crate::error::{RefreshError, Result};
use crate::literal::ColumnType;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Self::open_path(sqlite_path(config.native_url()))
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
            RefreshError::Database(format!("Failed to open {}: {}", path.display(), e))
        })?;
        debug!("opened SQLite source {}", path.display());
        Ok(Self { conn })
    }

    fn run(&self, sql: &str) -> Result<QueryResult> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| RefreshError::Database(format!("Failed to prepare query: {}", e)))?;

        let mut columns: Vec<ResultColumn> = stmt
            .column_names()
            .into_iter()
            .map(|name| ResultColumn {
                name: name.to_string(),
                column_type: None,
            })
            .collect();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for (index, column) in columns.iter_mut().enumerate() {
                let rendered = render_value(row.get_ref(index)?).map_err(|e| {
                    RefreshError::Database(format!("Column '{}': {}", column.name, e))
                })?;
                let (cell, column_type) = match rendered {
                    Some((text, column_type)) => (Some(text), Some(column_type)),
                    None => (None, None),
                };
                if column.column_type.is_none() {
                    column.column_type = column_type;
                }
                cells.push(cell);
            }
            rows.push(cells);
        }

        Ok(QueryResult { columns, rows })
    }
}

#[async_trait]
impl SourceDatabase for SqliteDatabase {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!("sqlite query: {}", sql);
        self.run(sql)
    }
}

/// Text rendering and semantic type of a stored value; `None` for NULL.
pub(crate) fn render_value(value: ValueRef<'_>) -> Result<Option<(String, ColumnType)>> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some((i.to_string(), ColumnType::Numeric))),
        ValueRef::Real(f) => Ok(Some((f.to_string(), ColumnType::Numeric))),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t).into_owned();
            let column_type = ColumnType::infer_from_text(&text);
            Ok(Some((text, column_type)))
        }
        ValueRef::Blob(_) => Err(RefreshError::Database(
            "BLOB values cannot order an incremental window".to_string(),
        )),
    }
}

/// `sqlite:/abs.db`, `sqlite:///abs.db`, `sqlite://rel.db` or a bare path
fn sqlite_path(url: &str) -> PathBuf {
    let rest = url.strip_prefix("sqlite:").unwrap_or(url);
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    PathBuf::from(rest)
}
