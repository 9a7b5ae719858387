//! Extract pruning
//!
//! Deletes the window `ordered_column >= boundary` from the extract's fact
//! table and reads back the largest remaining value, all on one connection
//! inside one exclusive transaction.

use crate::config::DatasourceConfig;
use crate::db::sqlite::render_value;
use crate::error::{RefreshError, Result};
use crate::literal::ScalarValue;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info};

/// Qualified name of the single fact table inside an extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactTable {
    pub schema: String,
    pub table: String,
}

impl FactTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn for_datasource(datasource: &DatasourceConfig) -> Self {
        Self::new(&datasource.extract_schema, &datasource.extract_table)
    }

    /// `"Extract"."Extract"`
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    pub rows_before: usize,
    pub rows_deleted: usize,
    /// `None` when the prune emptied the fact table
    pub remaining_max: Option<ScalarValue>,
}

impl PruneOutcome {
    pub fn rows_remaining(&self) -> usize {
        self.rows_before - self.rows_deleted
    }
}

pub trait ExtractEngine: Send + Sync {
    fn prune(
        &self,
        extract_path: &Path,
        fact_table: &FactTable,
        ordered_column: &str,
        boundary: &ScalarValue,
    ) -> Result<PruneOutcome>;
}

/// Extract files readable as embedded SQL databases
#[derive(Debug, Clone, Default)]
pub struct SqliteExtractEngine;

impl SqliteExtractEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ExtractEngine for SqliteExtractEngine {
    fn prune(
        &self,
        extract_path: &Path,
        fact_table: &FactTable,
        ordered_column: &str,
        boundary: &ScalarValue,
    ) -> Result<PruneOutcome> {
        // ATTACH would silently create an empty database
        if !extract_path.is_file() {
            return Err(RefreshError::Extract(format!(
                "Extract file not found: {}",
                extract_path.display()
            )));
        }
        info!("pruning extract {}", extract_path.display());

        let mut conn = Connection::open_in_memory()?;
        let path_text = extract_path.to_string_lossy().into_owned();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(&fact_table.schema)),
            [path_text],
        )?;
        conn.execute_batch(&format!(
            "PRAGMA {}.locking_mode = EXCLUSIVE",
            quote_ident(&fact_table.schema)
        ))?;

        let outcome = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

            let exists: i64 = tx.query_row(
                &format!(
                    "SELECT count(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
                    quote_ident(&fact_table.schema)
                ),
                [&fact_table.table],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(RefreshError::Extract(format!(
                    "Fact table {} not found in {}",
                    fact_table.qualified(),
                    extract_path.display()
                )));
            }

            let qualified = fact_table.qualified();
            let column = quote_ident(ordered_column);

            let rows_before: i64 =
                tx.query_row(&format!("SELECT count(*) FROM {}", qualified), [], |row| row.get(0))?;

            let delete_sql = format!(
                "DELETE FROM {} WHERE {} >= {}",
                qualified,
                column,
                boundary.sql_literal()
            );
            debug!("{}", delete_sql);
            let rows_deleted = tx.execute(&delete_sql, [])?;

            let remaining = tx.query_row(
                &format!("SELECT max({}) FROM {}", column, qualified),
                [],
                |row| Ok(render_value(row.get_ref(0)?)),
            )??;

            tx.commit()?;

            PruneOutcome {
                rows_before: rows_before as usize,
                rows_deleted,
                remaining_max: remaining
                    .map(|(raw, _)| ScalarValue::new(raw, boundary.column_type())),
            }
        };

        conn.close().map_err(|(_, e)| e)?;

        info!(
            rows_deleted = outcome.rows_deleted,
            rows_remaining = outcome.rows_remaining(),
            remaining_max = ?outcome.remaining_max.as_ref().map(ScalarValue::sql_literal),
            "extract pruned"
        );
        Ok(outcome)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
