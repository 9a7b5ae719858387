//! Refresh orchestration
//!
//! One datasource at a time: download, check preconditions, resolve the
//! window, prune the extract, rewrite the continuation marker, republish,
//! and only then commit the new watermark. Follow-up work (schedule shift or
//! refresh job) runs after each published datasource; job waiting runs once
//! all datasources are done.

use crate::config::AppConfig;
use crate::container::{self, Container};
use crate::db;
use crate::descriptor::Descriptor;
use crate::error::{PreconditionViolation, RefreshError, Result};
use crate::extract::{ExtractEngine, FactTable};
use crate::resolver::WatermarkResolver;
use crate::server::jobs::{JobWaitError, JobWaiter, TrackedJob};
use crate::server::schedule::update_incremental_schedule;
use crate::server::{find_datasource, ConnectionCredentials, DatasourceItem, ProjectItem, ServerApi};
use crate::watermark::{WatermarkLiteral, WatermarkStore};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub project: String,
    /// Trigger refresh jobs and wait for them instead of shifting schedules
    pub wait: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Directory holding the live extracts when running on the server host
    pub local_extract_dir: Option<PathBuf>,
    /// Where extracts copied from `local_extract_dir` are prepared
    pub download_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            project: String::new(),
            wait: false,
            timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(10),
            local_extract_dir: None,
            download_dir: None,
        }
    }
}

/// Everything a run reads or writes, built once before the first datasource.
pub struct RunContext {
    pub config: AppConfig,
    pub watermarks: WatermarkStore,
    pub project: ProjectItem,
    pub options: RunOptions,
}

impl RunContext {
    /// Resolve the target project; an unknown project aborts the run.
    pub async fn prepare(
        config: AppConfig,
        watermarks: WatermarkStore,
        options: RunOptions,
        server: &dyn ServerApi,
    ) -> Result<Self> {
        let project = server
            .projects()
            .await?
            .into_iter()
            .find(|p| p.name == options.project)
            .ok_or_else(|| {
                RefreshError::Config(format!("Project '{}' not found on the server", options.project))
            })?;

        Ok(Self {
            config,
            watermarks,
            project,
            options,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoNewData,
    Precondition(PreconditionViolation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The prune emptied the fact table; a full refresh is required
    DataLossAnomaly,
    PublishRejected(String),
    /// Any other fault during the cycle
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Skipped(SkipReason),
    Completed,
    Failed(FailureKind),
}

impl RefreshOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RefreshOutcome::Failed(_))
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshOutcome::Completed => write!(f, "completed"),
            RefreshOutcome::Skipped(SkipReason::NoNewData) => write!(f, "skipped: no new data"),
            RefreshOutcome::Skipped(SkipReason::Precondition(v)) => write!(f, "skipped: {}", v),
            RefreshOutcome::Failed(FailureKind::DataLossAnomaly) => {
                write!(f, "failed: prune emptied the extract, run a full refresh")
            }
            RefreshOutcome::Failed(FailureKind::PublishRejected(msg)) => {
                write!(f, "failed: publish rejected: {}", msg)
            }
            RefreshOutcome::Failed(FailureKind::Cycle(msg)) => write!(f, "failed: {}", msg),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<(String, RefreshOutcome)>,
    pub job_error: Option<JobWaitError>,
}

impl RunSummary {
    /// True when every datasource completed or was skipped and no job failed.
    pub fn success(&self) -> bool {
        self.job_error.is_none() && self.outcomes.iter().all(|(_, o)| !o.is_fatal())
    }

    pub fn outcome(&self, datasource: &str) -> Option<&RefreshOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == datasource)
            .map(|(_, outcome)| outcome)
    }
}

/// How the cycle ended: either an outcome, or a publish that still needs follow-up
enum CycleEnd {
    Outcome(RefreshOutcome),
    Published(DatasourceItem),
}

impl From<SkipReason> for CycleEnd {
    fn from(reason: SkipReason) -> Self {
        CycleEnd::Outcome(RefreshOutcome::Skipped(reason))
    }
}

impl From<PreconditionViolation> for CycleEnd {
    fn from(violation: PreconditionViolation) -> Self {
        SkipReason::Precondition(violation).into()
    }
}

/// Where the descriptor of a downloaded datasource lives
struct Artifact {
    container: Option<Container>,
    descriptor_member: Option<String>,
    descriptor_path: PathBuf,
}

/// Extract file to prune; `member` is set when it came out of the container
struct LocatedExtract {
    path: PathBuf,
    member: Option<String>,
}

pub struct RefreshOrchestrator {
    context: RunContext,
    server: Arc<dyn ServerApi>,
    engine: Box<dyn ExtractEngine>,
}

impl RefreshOrchestrator {
    pub fn new(context: RunContext, server: Arc<dyn ServerApi>, engine: Box<dyn ExtractEngine>) -> Self {
        Self {
            context,
            server,
            engine,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn into_context(self) -> RunContext {
        self.context
    }

    /// Process every datasource in order, then wait on refresh jobs if asked to.
    pub async fn run_all(&mut self, datasources: &[String]) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut jobs = Vec::new();

        for name in datasources {
            let end = self.cycle_or_fail(name).await;
            let outcome = match end {
                CycleEnd::Outcome(outcome) => outcome,
                CycleEnd::Published(item) => {
                    if let Err(job_error) = self.follow_up(name, &item, &mut jobs).await {
                        summary.job_error.get_or_insert(job_error);
                    }
                    RefreshOutcome::Completed
                }
            };
            log_outcome(name, &outcome);
            summary.outcomes.push((name.clone(), outcome));
        }

        if self.context.options.wait && summary.job_error.is_none() && !jobs.is_empty() {
            let deadline = tokio::time::Instant::now() + self.context.options.timeout;
            let waiter = JobWaiter::new(self.server.as_ref(), self.context.options.poll_interval);
            if let Err(job_error) = waiter.wait_all(&jobs, deadline).await {
                error!("{}", job_error);
                summary.job_error = Some(job_error);
            }
        }

        summary
    }

    /// One full refresh cycle for a single datasource.
    pub async fn run(&mut self, datasource: &str) -> RefreshOutcome {
        match self.cycle_or_fail(datasource).await {
            CycleEnd::Outcome(outcome) => outcome,
            CycleEnd::Published(_) => RefreshOutcome::Completed,
        }
    }

    async fn cycle_or_fail(&mut self, datasource: &str) -> CycleEnd {
        match self.cycle(datasource).await {
            Ok(end) => end,
            Err(e) => CycleEnd::Outcome(RefreshOutcome::Failed(FailureKind::Cycle(e.to_string()))),
        }
    }

    #[tracing::instrument(level = "info", skip(self), fields(project = %self.context.project.name))]
    async fn cycle(&mut self, datasource: &str) -> Result<CycleEnd> {
        let config = self.context.config.datasource(datasource)?.clone();

        let Some(item) =
            find_datasource(self.server.as_ref(), &self.context.project, datasource).await?
        else {
            return Ok(PreconditionViolation::DatasourceNotFound.into());
        };

        let Some(prior) = self.context.watermarks.prior(datasource).cloned() else {
            return Ok(PreconditionViolation::MissingWatermark.into());
        };

        let work_dir = self.prepare_work_dir(datasource)?;
        let include_extract = self.context.options.local_extract_dir.is_none();
        let downloaded = self
            .server
            .download_datasource(&item, &work_dir, include_extract)
            .await?;
        let artifact = open_artifact(&downloaded, &work_dir)?;

        let descriptor = Descriptor::from_file(&artifact.descriptor_path)?;
        let extract_dbname = match descriptor.check_preconditions() {
            Ok(extract) => extract.dbname.clone().unwrap_or_default(),
            Err(violation) => return Ok(violation.into()),
        };
        let Some(source_dbname) = descriptor.source_dbname().map(str::to_string) else {
            return Ok(PreconditionViolation::NoSourceConnection.into());
        };
        let Some(database) = self.context.config.databases.get(&source_dbname).cloned() else {
            return Ok(PreconditionViolation::UnknownDatabase(source_dbname).into());
        };

        let resolver = WatermarkResolver::for_datasource(&config, &self.context.config.parameters);
        let boundary_result = {
            let mut connection = db::connect(&source_dbname, &database).await?;
            resolver.resolve(connection.as_mut(), &prior).await?
        };
        let Some(boundary) = boundary_result.new_boundary.clone() else {
            return Ok(SkipReason::NoNewData.into());
        };
        let completion = boundary_result.completion_watermark.clone().ok_or_else(|| {
            RefreshError::Database(format!(
                "No {} value in {}",
                self.context.config.parameters.update_datetime_column, config.reference_table
            ))
        })?;

        let (extract, descriptor) =
            self.locate_extract(&artifact, &work_dir, descriptor, &extract_dbname)?;

        let pruned = self.engine.prune(
            &extract.path,
            &FactTable::for_datasource(&config),
            &config.functional_ordered_column,
            &boundary,
        )?;
        let Some(remaining_max) = pruned.remaining_max.clone() else {
            error!(
                boundary = %boundary,
                rows_deleted = pruned.rows_deleted,
                "prune removed every row of the extract; run a full refresh instead"
            );
            return Ok(CycleEnd::Outcome(RefreshOutcome::Failed(FailureKind::DataLossAnomaly)));
        };
        if boundary_result.previous_boundary.value() != Some(&remaining_max) {
            warn!(
                remaining_max = %remaining_max,
                previous = ?resolver.previous_literal(&boundary_result),
                "extract continuation differs from the reference table; using the extract's value"
            );
        }

        let descriptor = descriptor.rewrite_continuation(Some(&remaining_max))?;
        descriptor.save(&artifact.descriptor_path)?;
        let publish_file = repackage(&artifact, &extract)?;

        let credentials = database.user().map(|user| ConnectionCredentials {
            name: user.to_string(),
            password: database.password().unwrap_or_default().to_string(),
            embed: true,
        });
        let published = match self
            .server
            .publish_datasource(&self.context.project, datasource, &publish_file, credentials.as_ref())
            .await
        {
            Ok(published) => published,
            Err(e) => {
                error!("publish of '{}' rejected: {}", datasource, e);
                return Ok(CycleEnd::Outcome(RefreshOutcome::Failed(
                    FailureKind::PublishRejected(e.to_string()),
                )));
            }
        };

        let watermark = WatermarkLiteral::from_value(&completion);
        self.context.watermarks.commit(datasource, watermark.clone())?;
        info!(watermark = %watermark, "watermark committed");

        Ok(CycleEnd::Published(published))
    }

    fn prepare_work_dir(&self, datasource: &str) -> Result<PathBuf> {
        let dir = self.context.config.parameters.work_dir.join(datasource);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// The extract to prune, and the descriptor pointing at it.
    fn locate_extract(
        &self,
        artifact: &Artifact,
        work_dir: &Path,
        descriptor: Descriptor,
        extract_dbname: &str,
    ) -> Result<(LocatedExtract, Descriptor)> {
        if let Some(local_dir) = &self.context.options.local_extract_dir {
            let download_dir = self.context.options.download_dir.as_ref().ok_or_else(|| {
                RefreshError::Config("a download directory is required with a local extract directory".to_string())
            })?;
            let source = local_dir.join(extract_dbname);
            let target = download_dir.join(extract_dbname);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target).map_err(|e| {
                RefreshError::Extract(format!("Failed to copy {}: {}", source.display(), e))
            })?;
            info!("extract copied to {}", target.display());

            let new_dbname = format!("{}/{}", download_dir.display(), extract_dbname);
            let extract = LocatedExtract {
                path: target,
                member: None,
            };
            return Ok((extract, descriptor.with_extract_dbname(&new_dbname)?));
        }

        let extract = match &artifact.container {
            Some(container) => LocatedExtract {
                path: container.unpack_member(extract_dbname, work_dir)?,
                member: Some(extract_dbname.to_string()),
            },
            None => LocatedExtract {
                path: artifact
                    .descriptor_path
                    .parent()
                    .unwrap_or(work_dir)
                    .join(extract_dbname),
                member: None,
            },
        };
        info!("extract located at {}", extract.path.display());
        Ok((extract, descriptor))
    }

    async fn follow_up(
        &self,
        datasource: &str,
        item: &DatasourceItem,
        jobs: &mut Vec<TrackedJob>,
    ) -> std::result::Result<(), JobWaitError> {
        if self.context.options.wait {
            let job = self.server.refresh_datasource(item).await.map_err(|e| {
                JobWaitError::Server {
                    datasource: datasource.to_string(),
                    message: e.to_string(),
                }
            })?;
            jobs.push(TrackedJob {
                datasource: datasource.to_string(),
                job,
            });
        } else {
            let now = chrono::Local::now().naive_local();
            if let Err(e) = update_incremental_schedule(self.server.as_ref(), datasource, now).await {
                warn!("schedule for '{}' not updated: {}", datasource, e);
            }
        }
        Ok(())
    }
}

fn open_artifact(downloaded: &Path, work_dir: &Path) -> Result<Artifact> {
    if !container::is_container(downloaded) {
        return Ok(Artifact {
            container: None,
            descriptor_member: None,
            descriptor_path: downloaded.to_path_buf(),
        });
    }

    let container = Container::open(downloaded)?;
    let member = container.descriptor_member()?.to_string();
    let descriptor_path = container.unpack_member(&member, &work_dir.join("unpacked"))?;
    Ok(Artifact {
        container: Some(container),
        descriptor_member: Some(member),
        descriptor_path,
    })
}

/// Fold the rewritten members back into the container; returns the file to publish.
fn repackage(artifact: &Artifact, extract: &LocatedExtract) -> Result<PathBuf> {
    let (Some(container), Some(member)) = (&artifact.container, &artifact.descriptor_member) else {
        return Ok(artifact.descriptor_path.clone());
    };

    let mut replacements = HashMap::from([(member.clone(), artifact.descriptor_path.clone())]);
    if let Some(extract_member) = &extract.member {
        replacements.insert(extract_member.clone(), extract.path.clone());
    }
    container.repackage(&replacements)?;
    Ok(container.path().to_path_buf())
}

fn log_outcome(datasource: &str, outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Completed => info!(datasource, "{}", outcome),
        RefreshOutcome::Skipped(SkipReason::NoNewData) => info!(datasource, "{}", outcome),
        RefreshOutcome::Skipped(SkipReason::Precondition(_)) => warn!(datasource, "{}", outcome),
        RefreshOutcome::Failed(_) => error!(datasource, "{}", outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_success() {
        let mut summary = RunSummary::default();
        summary.outcomes.push(("a".to_string(), RefreshOutcome::Completed));
        summary
            .outcomes
            .push(("b".to_string(), RefreshOutcome::Skipped(SkipReason::NoNewData)));
        summary.outcomes.push((
            "c".to_string(),
            RefreshOutcome::Skipped(SkipReason::Precondition(PreconditionViolation::NoExtract)),
        ));
        assert!(summary.success());

        summary.job_error = Some(JobWaitError::Timeout {
            pending: vec!["a".to_string()],
        });
        assert!(!summary.success());
    }

    #[test]
    fn test_summary_failure() {
        let mut summary = RunSummary::default();
        summary.outcomes.push(("a".to_string(), RefreshOutcome::Completed));
        summary.outcomes.push((
            "b".to_string(),
            RefreshOutcome::Failed(FailureKind::DataLossAnomaly),
        ));
        assert!(!summary.success());
        assert_eq!(
            summary.outcome("b"),
            Some(&RefreshOutcome::Failed(FailureKind::DataLossAnomaly))
        );
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            RefreshOutcome::Skipped(SkipReason::Precondition(
                PreconditionViolation::MissingWatermark
            ))
            .to_string(),
            "skipped: no last update value is stored, please provide one"
        );
        assert_eq!(
            RefreshOutcome::Failed(FailureKind::PublishRejected("403".to_string())).to_string(),
            "failed: publish rejected: 403"
        );
    }
}
