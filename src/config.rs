//! Run configuration: database connections, datasource definitions and global parameters
//!
//! Loaded once at process start from a JSON file and treated as immutable afterwards.

use crate::error::{RefreshError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTRACT_SCHEMA: &str = "Extract";
pub const DEFAULT_EXTRACT_TABLE: &str = "Extract";

/// Which native driver serves a database entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Driver class, e.g. `org.sqlite.JDBC` or `org.postgresql.Driver`
    pub class: String,
    pub url: String,
    /// Driver arguments, any JSON value; `user` and `password` are also embedded on publish
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
    /// Driver artifact locations (unused by the native drivers)
    #[serde(default)]
    pub jars: Vec<String>,
}

impl DatabaseConfig {
    pub fn driver(&self) -> Result<DriverKind> {
        let class = self.class.to_lowercase();
        if class.contains("sqlite") {
            Ok(DriverKind::Sqlite)
        } else if class.contains("postgres") {
            Ok(DriverKind::Postgres)
        } else {
            Err(RefreshError::Config(format!("Unsupported driver class: {}", self.class)))
        }
    }

    /// Connection URL without a `jdbc:` prefix
    pub fn native_url(&self) -> &str {
        self.url.strip_prefix("jdbc:").unwrap_or(&self.url)
    }

    pub fn user(&self) -> Option<&str> {
        self.args.get("user").and_then(serde_json::Value::as_str)
    }

    pub fn password(&self) -> Option<&str> {
        self.args.get("password").and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub reference_table: String,
    pub functional_ordered_column: String,
    #[serde(default = "default_extract_schema")]
    pub extract_schema: String,
    #[serde(default = "default_extract_table")]
    pub extract_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalParameters {
    pub update_datetime_column: String,
    /// Path of the persisted watermark store
    #[serde(alias = "watermark_store")]
    pub update_values: PathBuf,
    /// Rendering of "no lower bound" for numeric ordered columns
    #[serde(default = "default_numeric_lower_bound")]
    pub numeric_lower_bound: i64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub databases: HashMap<String, DatabaseConfig>,
    pub datasources: HashMap<String, DatasourceConfig>,
    pub parameters: GlobalParameters,
}

impl AppConfig {
    /// Load the config file; relative store and work paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RefreshError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            RefreshError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        if let Some(base) = path.parent() {
            config.parameters.update_values = resolve_relative(base, &config.parameters.update_values);
            config.parameters.work_dir = resolve_relative(base, &config.parameters.work_dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parameters.update_datetime_column.trim().is_empty() {
            return Err(RefreshError::Config("parameters.update_datetime_column is empty".to_string()));
        }
        for (name, database) in &self.databases {
            database
                .driver()
                .map_err(|e| RefreshError::Config(format!("database '{}': {}", name, e)))?;
        }
        for (name, datasource) in &self.datasources {
            if datasource.reference_table.trim().is_empty()
                || datasource.functional_ordered_column.trim().is_empty()
            {
                return Err(RefreshError::Config(format!(
                    "datasource '{}' needs reference_table and functional_ordered_column",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Every requested datasource must be configured before anything is touched.
    pub fn require_datasources(&self, names: &[String]) -> Result<()> {
        let missing: Vec<&str> = names
            .iter()
            .filter(|name| !self.datasources.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RefreshError::Config(format!(
                "No configuration for datasource(s): {}",
                missing.join(", ")
            )))
        }
    }

    pub fn datasource(&self, name: &str) -> Result<&DatasourceConfig> {
        self.datasources
            .get(name)
            .ok_or_else(|| RefreshError::Config(format!("No configuration for datasource '{}'", name)))
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_extract_schema() -> String {
    DEFAULT_EXTRACT_SCHEMA.to_string()
}

fn default_extract_table() -> String {
    DEFAULT_EXTRACT_TABLE.to_string()
}

fn default_numeric_lower_bound() -> i64 {
    i64::MIN
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "databases": {
            "sales": {
                "class": "org.sqlite.JDBC",
                "url": "jdbc:sqlite:/data/sales.db",
                "args": {"user": "etl", "password": "secret"},
                "jars": ["/opt/drivers/sqlite-jdbc.jar"]
            }
        },
        "datasources": {
            "orders": {"reference_table": "orders", "functional_ordered_column": "order_date"}
        },
        "parameters": {"update_datetime_column": "updated_at", "update_values": "updates.json"}
    }"#;

    #[test]
    fn test_parse_config_with_defaults() {
        let config: AppConfig = serde_json::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        let sales = &config.databases["sales"];
        assert_eq!(sales.driver().unwrap(), DriverKind::Sqlite);
        assert_eq!(sales.native_url(), "sqlite:/data/sales.db");
        assert_eq!(sales.user(), Some("etl"));

        let orders = config.datasource("orders").unwrap();
        assert_eq!(orders.extract_schema, "Extract");
        assert_eq!(orders.extract_table, "Extract");
        assert_eq!(config.parameters.numeric_lower_bound, i64::MIN);
    }

    #[test]
    fn test_driver_args_accept_non_string_values() {
        let database: DatabaseConfig = serde_json::from_str(
            r#"{
                "class": "org.postgresql.Driver",
                "url": "jdbc:postgresql://db.example.com:5432/sales",
                "args": {"user": "etl", "password": "secret", "ssl": true, "loginTimeout": 30}
            }"#,
        )
        .unwrap();

        assert_eq!(database.driver().unwrap(), DriverKind::Postgres);
        assert_eq!(database.user(), Some("etl"));
        assert_eq!(database.password(), Some("secret"));
        assert_eq!(database.args["ssl"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_require_datasources_reports_missing_names() {
        let config: AppConfig = serde_json::from_str(CONFIG).unwrap();
        assert!(config.require_datasources(&["orders".to_string()]).is_ok());

        let err = config
            .require_datasources(&["orders".to_string(), "returns".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("returns"));
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let mut config: AppConfig = serde_json::from_str(CONFIG).unwrap();
        config.databases.get_mut("sales").unwrap().class = "com.ibm.db2.jcc.DB2Driver".to_string();
        assert!(matches!(config.validate(), Err(RefreshError::Config(_))));
    }

    #[test]
    fn test_load_resolves_store_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, CONFIG).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.parameters.update_values, dir.path().join("updates.json"));
        assert_eq!(config.parameters.work_dir, dir.path().join("work"));
    }
}
