//! BI server access
//!
//! `ServerApi` is the seam between the refresh cycle and the server; the
//! REST implementation lives in `rest`, job polling in `jobs` and the
//! incremental schedule shift in `schedule`.

pub mod jobs;
pub mod rest;
pub mod schedule;

use crate::error::Result;
use async_trait::async_trait;
use chrono::NaiveTime;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceItem {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobItem {
    pub id: String,
}

/// Server-side state of an asynchronous job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed { finish_code: i64 },
}

impl JobState {
    /// Map the server's job fields onto a state: finish code 0 is success,
    /// any other finish code is failure; without one the job is running once
    /// it has a start time.
    pub fn from_fields(started: bool, finish_code: Option<i64>) -> Self {
        match finish_code {
            Some(0) => JobState::Done,
            Some(code) => JobState::Failed { finish_code: code },
            None if started => JobState::Running,
            None => JobState::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed { .. })
    }
}

/// Credentials embedded in the published datasource's source connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    pub name: String,
    pub password: String,
    pub embed: bool,
}

#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn projects(&self) -> Result<Vec<ProjectItem>>;

    /// Every datasource on the site, all pages
    async fn datasources(&self) -> Result<Vec<DatasourceItem>>;

    /// Download into `dest_dir`, returning the written file.
    async fn download_datasource(
        &self,
        datasource: &DatasourceItem,
        dest_dir: &Path,
        include_extract: bool,
    ) -> Result<PathBuf>;

    /// Publish `file` as `name` in `project`, overwriting the existing datasource.
    async fn publish_datasource(
        &self,
        project: &ProjectItem,
        name: &str,
        file: &Path,
        credentials: Option<&ConnectionCredentials>,
    ) -> Result<DatasourceItem>;

    async fn schedules(&self) -> Result<Vec<ScheduleItem>>;

    /// Move a daily schedule's start time.
    async fn update_schedule_start(&self, schedule: &ScheduleItem, start: NaiveTime) -> Result<()>;

    /// Queue an extract refresh job for the datasource.
    async fn refresh_datasource(&self, datasource: &DatasourceItem) -> Result<JobItem>;

    async fn job_state(&self, job: &JobItem) -> Result<JobState>;
}

/// Locate a datasource by name within a project.
pub async fn find_datasource(
    api: &dyn ServerApi,
    project: &ProjectItem,
    name: &str,
) -> Result<Option<DatasourceItem>> {
    let datasources = api.datasources().await?;
    Ok(datasources
        .into_iter()
        .find(|ds| ds.name == name && ds.project_id == project.id))
}
