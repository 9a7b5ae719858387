//! Shared fixtures: a SQLite reference database, an extract bundled in a
//! container, config and watermark files, and an in-memory server.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveTime;
use extract_refresh::config::AppConfig;
use extract_refresh::error::{RefreshError, Result};
use extract_refresh::extract::SqliteExtractEngine;
use extract_refresh::server::{
    ConnectionCredentials, DatasourceItem, JobItem, JobState, ProjectItem, ScheduleItem, ServerApi,
};
use extract_refresh::watermark::WatermarkStore;
use extract_refresh::{RefreshOrchestrator, RunContext, RunOptions};
use rusqlite::Connection;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const PROJECT: &str = "Sales";
pub const DESCRIPTOR_MEMBER: &str = "descriptor.tds";
pub const EXTRACT_MEMBER: &str = "extract.hyper";
pub const METADATA_MEMBER: &str = "metadata.xml";
pub const METADATA: &[u8] = b"<?xml version='1.0'?><metadata owner='etl' />\n";

pub const TDS: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<datasource formatted-name='orders' inline='true' version='18.1'>
  <connection class='federated'>
    <named-connections>
      <named-connection caption='sales' name='sqlite.0x1'>
        <connection class='sqlite' dbname='sales' />
      </named-connection>
    </named-connections>
  </connection>
  <extract count='-1' enabled='true' units='records'>
    <connection class='hyper' dbname='extract.hyper' schema='Extract' tablename='Extract' />
    <refresh increment-key='order_date' incremental-updates='true'>
      <refresh-event add-from-file-path='' increment-value='%null%' refresh-type='create' rows-inserted='3' />
      <refresh-event add-from-file-path='' increment-value='#2021-01-12#' refresh-type='increment' rows-inserted='1' />
    </refresh>
  </extract>
</datasource>
"#;

/// Reference rows: (order_date, updated_at)
pub const REFERENCE_ROWS: &[(&str, &str)] = &[
    ("2021-01-10", "2021-01-10 08:00:00"),
    ("2021-01-12", "2021-01-12 08:00:00"),
    ("2021-01-14", "2021-01-14 08:00:00"),
    ("2021-01-15", "2021-01-16 09:00:00"),
];

/// Extract rows before the refresh; 2021-01-15 is stale
pub const EXTRACT_ROWS: &[&str] = &["2021-01-10", "2021-01-12", "2021-01-14", "2021-01-15"];

pub const PRIOR_WATERMARK: &str = "'2021-01-14 08:00:00'";
pub const LATEST_WATERMARK: &str = "'2021-01-16 09:00:00'";

pub struct Fixture {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub watermark_path: PathBuf,
    pub container_path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(EXTRACT_ROWS, TDS, Some(PRIOR_WATERMARK))
    }

    pub fn with(extract_rows: &[&str], tds: &str, prior: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let source = root.join("sales.db");
        let conn = Connection::open(&source).unwrap();
        conn.execute_batch("CREATE TABLE orders (order_date TEXT, updated_at TEXT)")
            .unwrap();
        for (order_date, updated_at) in REFERENCE_ROWS {
            conn.execute(
                "INSERT INTO orders (order_date, updated_at) VALUES (?1, ?2)",
                [order_date, updated_at],
            )
            .unwrap();
        }
        drop(conn);

        let extract = root.join("seed.hyper");
        write_extract(&extract, extract_rows);
        let container_path = root.join("orders.tdsx");
        write_container(&container_path, tds, &extract);

        let watermark_path = root.join("watermarks.json");
        let entry = match prior {
            Some(value) => serde_json::json!({ "last_update_value": value }),
            None => serde_json::json!({ "last_update_value": null }),
        };
        let store = serde_json::json!({ "datasources": { "orders": entry } });
        std::fs::write(&watermark_path, serde_json::to_string_pretty(&store).unwrap()).unwrap();

        let config = serde_json::json!({
            "databases": {
                "sales": {
                    "class": "org.sqlite.JDBC",
                    "url": format!("jdbc:sqlite:{}", source.display()),
                    "args": { "user": "etl", "password": "secret" },
                    "jars": ["/opt/drivers/sqlite-jdbc.jar"]
                }
            },
            "datasources": {
                "orders": {
                    "reference_table": "orders",
                    "functional_ordered_column": "order_date"
                },
                "returns": {
                    "reference_table": "orders",
                    "functional_ordered_column": "order_date"
                }
            },
            "parameters": {
                "update_datetime_column": "updated_at",
                "update_values": "watermarks.json",
                "work_dir": "work"
            }
        });
        let config_path = root.join("config.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        Self {
            dir,
            config_path,
            watermark_path,
            container_path,
        }
    }

    /// Configure a second published datasource over the same reference table with its own prior.
    pub fn add_datasource(&self, name: &str, extract_rows: &[&str], prior: &str) -> PathBuf {
        let root = self.dir.path();
        let extract = root.join(format!("{}-seed.hyper", name));
        write_extract(&extract, extract_rows);
        let container_path = root.join(format!("{}.tdsx", name));
        write_container(&container_path, TDS, &extract);

        let mut store: serde_json::Value = serde_json::from_slice(&self.watermark_bytes()).unwrap();
        store["datasources"][name] = serde_json::json!({ "last_update_value": prior });
        std::fs::write(&self.watermark_path, serde_json::to_string_pretty(&store).unwrap()).unwrap();
        container_path
    }

    pub fn watermark_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.watermark_path).unwrap()
    }

    pub fn server(&self) -> Arc<FakeServer> {
        let server = FakeServer::new();
        server.add_datasource("ds-orders", "orders", &self.container_path);
        Arc::new(server)
    }

    pub async fn orchestrator(&self, server: Arc<FakeServer>, options: RunOptions) -> RefreshOrchestrator {
        let config = AppConfig::load(&self.config_path).unwrap();
        let watermarks = WatermarkStore::load(&config.parameters.update_values).unwrap();
        let options = RunOptions {
            project: PROJECT.to_string(),
            poll_interval: std::time::Duration::from_millis(1),
            ..options
        };
        let context = RunContext::prepare(config, watermarks, options, server.as_ref())
            .await
            .unwrap();
        RefreshOrchestrator::new(context, server, Box::new(SqliteExtractEngine::new()))
    }
}

pub fn write_extract(path: &Path, rows: &[&str]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(r#"CREATE TABLE "Extract" ("order_date" TEXT, "amount" REAL)"#)
        .unwrap();
    for row in rows {
        conn.execute(
            r#"INSERT INTO "Extract" ("order_date", "amount") VALUES (?1, 10.0)"#,
            [row],
        )
        .unwrap();
    }
}

pub fn write_container(path: &Path, tds: &str, extract: &Path) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);

    writer.start_file(DESCRIPTOR_MEMBER, deflated).unwrap();
    writer.write_all(tds.as_bytes()).unwrap();
    writer.start_file(EXTRACT_MEMBER, stored).unwrap();
    writer.write_all(&std::fs::read(extract).unwrap()).unwrap();
    writer.start_file(METADATA_MEMBER, deflated).unwrap();
    writer.write_all(METADATA).unwrap();
    writer.finish().unwrap();
}

/// Entry names, in archive order, of a zip held in memory
pub fn container_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

pub fn container_member(bytes: &[u8], name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut content = Vec::new();
    entry.read_to_end(&mut content).unwrap();
    content
}

/// Ordered-column values of an extract held in memory
pub fn extract_values(extract: &[u8]) -> Vec<String> {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), extract).unwrap();
    let conn = Connection::open(file.path()).unwrap();
    let mut stmt = conn
        .prepare(r#"SELECT "order_date" FROM "Extract" ORDER BY 1"#)
        .unwrap();
    let values = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
    values.map(|v| v.unwrap()).collect()
}

#[derive(Debug, Clone)]
pub struct PublishAttempt {
    pub name: String,
    pub project_id: String,
    pub bytes: Vec<u8>,
    pub credentials: Option<ConnectionCredentials>,
}

/// Server double: serves files from disk, records publishes and schedule moves.
pub struct FakeServer {
    project: ProjectItem,
    datasources: Mutex<Vec<DatasourceItem>>,
    files: Mutex<HashMap<String, PathBuf>>,
    reject_publish: Mutex<Option<String>>,
    pub publishes: Mutex<Vec<PublishAttempt>>,
    pub downloads: Mutex<Vec<(String, bool)>>,
    pub schedule_moves: Mutex<Vec<(String, NaiveTime)>>,
    pub refreshed: Mutex<Vec<String>>,
    job_result: Mutex<JobState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            project: ProjectItem {
                id: "p-1".to_string(),
                name: PROJECT.to_string(),
            },
            datasources: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            reject_publish: Mutex::new(None),
            publishes: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            schedule_moves: Mutex::new(Vec::new()),
            refreshed: Mutex::new(Vec::new()),
            job_result: Mutex::new(JobState::Done),
        }
    }

    pub fn add_datasource(&self, id: &str, name: &str, file: &Path) {
        self.datasources.lock().unwrap().push(DatasourceItem {
            id: id.to_string(),
            name: name.to_string(),
            project_id: self.project.id.clone(),
            project_name: self.project.name.clone(),
        });
        self.files
            .lock()
            .unwrap()
            .insert(id.to_string(), file.to_path_buf());
    }

    pub fn reject_publishes(&self, reason: &str) {
        *self.reject_publish.lock().unwrap() = Some(reason.to_string());
    }

    pub fn finish_jobs_with(&self, state: JobState) {
        *self.job_result.lock().unwrap() = state;
    }

    pub fn last_publish(&self) -> Option<PublishAttempt> {
        self.publishes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn projects(&self) -> Result<Vec<ProjectItem>> {
        Ok(vec![self.project.clone()])
    }

    async fn datasources(&self) -> Result<Vec<DatasourceItem>> {
        Ok(self.datasources.lock().unwrap().clone())
    }

    async fn download_datasource(
        &self,
        datasource: &DatasourceItem,
        dest_dir: &Path,
        include_extract: bool,
    ) -> Result<PathBuf> {
        self.downloads
            .lock()
            .unwrap()
            .push((datasource.name.clone(), include_extract));
        let source = self
            .files
            .lock()
            .unwrap()
            .get(&datasource.id)
            .cloned()
            .ok_or_else(|| RefreshError::Server(format!("no content for {}", datasource.id)))?;
        let target = dest_dir.join(source.file_name().unwrap());
        std::fs::copy(&source, &target)?;
        Ok(target)
    }

    async fn publish_datasource(
        &self,
        project: &ProjectItem,
        name: &str,
        file: &Path,
        credentials: Option<&ConnectionCredentials>,
    ) -> Result<DatasourceItem> {
        self.publishes.lock().unwrap().push(PublishAttempt {
            name: name.to_string(),
            project_id: project.id.clone(),
            bytes: std::fs::read(file)?,
            credentials: credentials.cloned(),
        });
        if let Some(reason) = self.reject_publish.lock().unwrap().clone() {
            return Err(RefreshError::Server(reason));
        }
        self.datasources
            .lock()
            .unwrap()
            .iter()
            .find(|ds| ds.name == name)
            .cloned()
            .ok_or_else(|| RefreshError::Server(format!("unknown datasource {}", name)))
    }

    async fn schedules(&self) -> Result<Vec<ScheduleItem>> {
        Ok(vec![ScheduleItem {
            id: "s-1".to_string(),
            name: "orders".to_string(),
        }])
    }

    async fn update_schedule_start(&self, schedule: &ScheduleItem, start: NaiveTime) -> Result<()> {
        self.schedule_moves
            .lock()
            .unwrap()
            .push((schedule.name.clone(), start));
        Ok(())
    }

    async fn refresh_datasource(&self, datasource: &DatasourceItem) -> Result<JobItem> {
        self.refreshed.lock().unwrap().push(datasource.name.clone());
        Ok(JobItem {
            id: format!("job-{}", datasource.id),
        })
    }

    async fn job_state(&self, _job: &JobItem) -> Result<JobState> {
        Ok(*self.job_result.lock().unwrap())
    }
}
