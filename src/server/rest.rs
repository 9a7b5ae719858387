//! REST client for the BI server
//!
//! Signs in once per run and carries the session token on every request.
//! All responses are requested as JSON.

use super::{
    ConnectionCredentials, DatasourceItem, JobItem, JobState, ProjectItem, ScheduleItem, ServerApi,
};
use crate::error::{RefreshError, Result};
use async_trait::async_trait;
use chrono::NaiveTime;
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const AUTH_HEADER: &str = "X-Tableau-Auth";
/// Oldest API version that exposes `serverinfo`
const PROBE_API_VERSION: &str = "2.4";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct Session {
    token: String,
    site_id: String,
}

pub struct RestServer {
    client: Client,
    server_url: String,
    api_version: String,
    session: Session,
}

impl RestServer {
    /// Negotiate the API version and sign in to `site` (empty for the default site).
    pub async fn sign_in(server_url: &str, site: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::new();
        let server_url = server_url.trim_end_matches('/').to_string();

        let api_version = negotiate_version(&client, &server_url).await?;
        info!("using REST API version {}", api_version);

        let body = json!({
            "credentials": {
                "name": username,
                "password": password,
                "site": { "contentUrl": site }
            }
        });
        let response = client
            .post(format!("{}/api/{}/auth/signin", server_url, api_version))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RefreshError::Server(format!("Sign in failed: {}", e)))?;
        let response_json = read_json(response).await?;

        let credentials = &response_json["credentials"];
        let token = required_str(credentials, &["token"])?;
        let site_id = required_str(credentials, &["site", "id"])?;
        info!("signed in to {} as {}", server_url, username);

        Ok(Self {
            client,
            server_url,
            api_version,
            session: Session { token, site_id },
        })
    }

    pub async fn sign_out(&self) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.api_url("auth/signout")))
            .send()
            .await?;
        ensure_success(response).await?;
        debug!("signed out");
        Ok(())
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}/{}", self.server_url, self.api_version, path)
    }

    fn site_url(&self, path: &str) -> String {
        self.api_url(&format!("sites/{}/{}", self.session.site_id, path))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTH_HEADER, &self.session.token)
            .header("Accept", "application/json")
    }

    /// Collect every page of a listing, e.g. `projects` -> `project` items.
    async fn paged(&self, url: &str, collection: &str, item: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1usize;

        loop {
            let response = self
                .authorized(self.client.get(url))
                .query(&[("pageSize", PAGE_SIZE), ("pageNumber", page)])
                .send()
                .await?;
            let response_json = read_json(response).await?;

            let batch = response_json[collection][item]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let batch_len = batch.len();
            items.extend(batch);

            let total = response_json["pagination"]["totalAvailable"]
                .as_str()
                .and_then(|t| t.parse::<usize>().ok())
                .unwrap_or(items.len());
            if batch_len == 0 || items.len() >= total {
                return Ok(items);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl ServerApi for RestServer {
    async fn projects(&self) -> Result<Vec<ProjectItem>> {
        let items = self.paged(&self.site_url("projects"), "projects", "project").await?;
        items
            .iter()
            .map(|item| {
                Ok(ProjectItem {
                    id: required_str(item, &["id"])?,
                    name: required_str(item, &["name"])?,
                })
            })
            .collect()
    }

    async fn datasources(&self) -> Result<Vec<DatasourceItem>> {
        let items = self
            .paged(&self.site_url("datasources"), "datasources", "datasource")
            .await?;
        items.iter().map(datasource_item).collect()
    }

    async fn download_datasource(
        &self,
        datasource: &DatasourceItem,
        dest_dir: &Path,
        include_extract: bool,
    ) -> Result<PathBuf> {
        let url = self.site_url(&format!("datasources/{}/content", datasource.id));
        let response = self
            .authorized(self.client.get(url))
            .query(&[("includeExtract", include_extract)])
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let file_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_file_name)
            .unwrap_or_else(|| format!("{}.tdsx", datasource.name));

        let bytes = response.bytes().await?;
        std::fs::create_dir_all(dest_dir)?;
        let target = dest_dir.join(&file_name);
        std::fs::write(&target, &bytes)?;
        info!(
            "downloaded '{}' to {} ({} bytes)",
            datasource.name,
            target.display(),
            bytes.len()
        );
        Ok(target)
    }

    async fn publish_datasource(
        &self,
        project: &ProjectItem,
        name: &str,
        file: &Path,
        credentials: Option<&ConnectionCredentials>,
    ) -> Result<DatasourceItem> {
        let file_name = file
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| RefreshError::Server(format!("Not a file: {}", file.display())))?;
        let datasource_type = file
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "tdsx".to_string());
        let content = std::fs::read(file)?;

        let payload = publish_payload(name, &project.id, credentials);
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let body = multipart_mixed(&boundary, &payload, &file_name, &content);

        let response = self
            .authorized(self.client.post(self.site_url("datasources")))
            .query(&[("overwrite", "true"), ("datasourceType", datasource_type.as_str())])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;
        let response_json = read_json(response).await?;

        let published = datasource_item(&response_json["datasource"])?;
        info!("published '{}' to project '{}'", published.name, project.name);
        Ok(published)
    }

    async fn schedules(&self) -> Result<Vec<ScheduleItem>> {
        let items = self.paged(&self.api_url("schedules"), "schedules", "schedule").await?;
        items
            .iter()
            .map(|item| {
                Ok(ScheduleItem {
                    id: required_str(item, &["id"])?,
                    name: required_str(item, &["name"])?,
                })
            })
            .collect()
    }

    async fn update_schedule_start(&self, schedule: &ScheduleItem, start: NaiveTime) -> Result<()> {
        let body = json!({
            "schedule": {
                "frequency": "Daily",
                "frequencyDetails": { "start": start.format("%H:%M:%S").to_string() }
            }
        });
        let response = self
            .authorized(self.client.put(self.api_url(&format!("schedules/{}", schedule.id))))
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn refresh_datasource(&self, datasource: &DatasourceItem) -> Result<JobItem> {
        let url = self.site_url(&format!("datasources/{}/refresh", datasource.id));
        let response = self
            .authorized(self.client.post(url))
            .json(&json!({}))
            .send()
            .await?;
        let response_json = read_json(response).await?;
        let id = required_str(&response_json["job"], &["id"])?;
        info!("refresh job {} queued for '{}'", id, datasource.name);
        Ok(JobItem { id })
    }

    async fn job_state(&self, job: &JobItem) -> Result<JobState> {
        let response = self
            .authorized(self.client.get(self.site_url(&format!("jobs/{}", job.id))))
            .send()
            .await?;
        let response_json = read_json(response).await?;
        Ok(job_state_from_json(&response_json["job"]))
    }
}

async fn negotiate_version(client: &Client, server_url: &str) -> Result<String> {
    let response = client
        .get(format!("{}/api/{}/serverinfo", server_url, PROBE_API_VERSION))
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| RefreshError::Server(format!("Server unreachable: {}", e)))?;

    match read_json(response).await {
        Ok(info) => required_str(&info["serverInfo"], &["restApiVersion"]),
        Err(e) => {
            warn!("server info unavailable ({}), falling back to {}", e, PROBE_API_VERSION);
            Ok(PROBE_API_VERSION.to_string())
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RefreshError::Server(format!("{}: {}", status, body)))
}

async fn read_json(response: Response) -> Result<Value> {
    let response = ensure_success(response).await?;
    response
        .json()
        .await
        .map_err(|e| RefreshError::Server(format!("Failed to parse server response: {}", e)))
}

fn required_str(value: &Value, path: &[&str]) -> Result<String> {
    let mut current = value;
    for key in path {
        current = &current[*key];
    }
    current
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RefreshError::Server(format!("Missing '{}' in server response", path.join("."))))
}

fn datasource_item(item: &Value) -> Result<DatasourceItem> {
    Ok(DatasourceItem {
        id: required_str(item, &["id"])?,
        name: required_str(item, &["name"])?,
        project_id: required_str(item, &["project", "id"])?,
        project_name: item["project"]["name"].as_str().unwrap_or_default().to_string(),
    })
}

fn job_state_from_json(job: &Value) -> JobState {
    let started = job["startedAt"].as_str().is_some();
    let finish_code = match &job["finishCode"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    // finishCode is only meaningful once the job completed
    let completed = job["completedAt"].as_str().is_some();
    JobState::from_fields(started, if completed { finish_code } else { None })
}

/// `filename` parameter of a Content-Disposition header.
fn attachment_file_name(header: &str) -> Option<String> {
    let re = Regex::new(r#"filename\*?="?([^";]+)"?"#).ok()?;
    re.captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .and_then(|name| {
            Path::new(&name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
        })
}

fn publish_payload(name: &str, project_id: &str, credentials: Option<&ConnectionCredentials>) -> String {
    use quick_xml::escape::escape;

    let credentials_xml = credentials
        .map(|c| {
            format!(
                r#"<connectionCredentials name="{}" password="{}" embed="{}"/>"#,
                escape(c.name.as_str()),
                escape(c.password.as_str()),
                c.embed
            )
        })
        .unwrap_or_default();

    format!(
        r#"<tsRequest><datasource name="{}">{}<project id="{}"/></datasource></tsRequest>"#,
        escape(name),
        credentials_xml,
        escape(project_id)
    )
}

fn multipart_mixed(boundary: &str, payload: &str, file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + payload.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: name=\"request_payload\"\r\nContent-Type: text/xml\r\n\r\n{p}\r\n\
             --{b}\r\nContent-Disposition: name=\"tableau_datasource\"; filename=\"{f}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = boundary,
            p = payload,
            f = file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
