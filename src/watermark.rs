//! Persisted watermark store
//!
//! `{"datasources": {"<name>": {"last_update_value": <literal or null>}}}`
//!
//! The store is read once at startup. Prior watermarks handed to the resolver
//! always come from that initial snapshot; commits mutate the in-memory copy
//! and are flushed to disk one datasource at a time.

use crate::error::{RefreshError, Result};
use crate::literal::{Quoting, ScalarValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A watermark in its query-ready form, kept exactly as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatermarkLiteral {
    Text(String),
    Number(Number),
}

impl WatermarkLiteral {
    /// Literal for a freshly resolved completion watermark.
    pub fn from_value(value: &ScalarValue) -> Self {
        match value.quoting() {
            Quoting::Quoted => WatermarkLiteral::Text(value.sql_literal()),
            Quoting::Unquoted => serde_json::from_str::<Number>(value.raw())
                .map(WatermarkLiteral::Number)
                .unwrap_or_else(|_| WatermarkLiteral::Text(value.raw().to_string())),
        }
    }

    /// Text embedded into a query predicate
    pub fn as_sql(&self) -> String {
        match self {
            WatermarkLiteral::Text(text) => text.clone(),
            WatermarkLiteral::Number(number) => number.to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, WatermarkLiteral::Text(text) if text.trim().is_empty())
    }
}

impl fmt::Display for WatermarkLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    #[serde(default)]
    pub last_update_value: Option<WatermarkLiteral>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    datasources: BTreeMap<String, WatermarkEntry>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

pub struct WatermarkStore {
    path: PathBuf,
    initial: BTreeMap<String, WatermarkEntry>,
    document: StoreDocument,
}

impl WatermarkStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RefreshError::Watermark(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let document: StoreDocument = serde_json::from_str(&content).map_err(|e| {
            RefreshError::Watermark(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path,
            initial: document.datasources.clone(),
            document,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Watermark as read at startup; empty values count as missing.
    pub fn prior(&self, datasource: &str) -> Option<&WatermarkLiteral> {
        self.initial
            .get(datasource)
            .and_then(|entry| entry.last_update_value.as_ref())
            .filter(|literal| !literal.is_blank())
    }

    /// Current in-memory value, including commits made during this run.
    pub fn current(&self, datasource: &str) -> Option<&WatermarkLiteral> {
        self.document
            .datasources
            .get(datasource)
            .and_then(|entry| entry.last_update_value.as_ref())
    }

    /// Record a new watermark and flush the whole store to disk.
    pub fn commit(&mut self, datasource: &str, literal: WatermarkLiteral) -> Result<()> {
        debug!(datasource, watermark = %literal, "committing watermark");
        self.document
            .datasources
            .entry(datasource.to_string())
            .or_default()
            .last_update_value = Some(literal);
        self.flush()
    }

    /// Write via a temporary file in the same directory, then rename over the store.
    pub fn flush(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        let content = serde_json::to_string_pretty(&self.document)?;
        file.write_all(content.as_bytes())?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| {
            RefreshError::Watermark(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::ColumnType;

    fn write_store(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("updates.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_quoted_literal_round_trips_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(
            dir.path(),
            r#"{"datasources": {"orders": {"last_update_value": "'2021-01-15'"}}}"#,
        );

        let store = WatermarkStore::load(&path).unwrap();
        let prior = store.prior("orders").unwrap();
        assert_eq!(prior, &WatermarkLiteral::Text("'2021-01-15'".to_string()));
        assert_eq!(prior.as_sql(), "'2021-01-15'");
    }

    #[test]
    fn test_blank_and_null_values_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(
            dir.path(),
            r#"{"datasources": {"a": {"last_update_value": ""}, "b": {"last_update_value": null}}}"#,
        );

        let store = WatermarkStore::load(&path).unwrap();
        assert!(store.prior("a").is_none());
        assert!(store.prior("b").is_none());
        assert!(store.prior("c").is_none());
    }

    #[test]
    fn test_commit_keeps_prior_snapshot_and_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_store(
            dir.path(),
            r#"{"comment": "kept", "datasources": {"orders": {"last_update_value": 100, "owner": "bi"}}}"#,
        );

        let mut store = WatermarkStore::load(&path).unwrap();
        let next = WatermarkLiteral::from_value(&ScalarValue::new("250", ColumnType::Numeric));
        store.commit("orders", next.clone()).unwrap();

        assert_eq!(store.prior("orders").unwrap().as_sql(), "100");
        assert_eq!(store.current("orders"), Some(&next));

        let reread: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread["comment"], "kept");
        assert_eq!(reread["datasources"]["orders"]["last_update_value"], 250);
        assert_eq!(reread["datasources"]["orders"]["owner"], "bi");
    }

    #[test]
    fn test_from_value_quotes_temporal_watermarks() {
        let literal =
            WatermarkLiteral::from_value(&ScalarValue::new("2021-02-01 08:00:00", ColumnType::Timestamp));
        assert_eq!(literal, WatermarkLiteral::Text("'2021-02-01 08:00:00'".to_string()));
    }
}
