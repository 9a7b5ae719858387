//! Waiting on extract refresh jobs
//!
//! Jobs are polled every `poll_interval` until all finish, one fails, or
//! the deadline passes. The deadline is fixed by the caller before the
//! first poll.

use super::{JobItem, JobState, ServerApi};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub datasource: String,
    pub job: JobItem,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobWaitError {
    #[error("refresh job {job_id} for '{datasource}' failed with finish code {finish_code}")]
    JobFailed {
        datasource: String,
        job_id: String,
        finish_code: i64,
    },

    #[error("timed out waiting for refresh jobs of: {}", pending.join(", "))]
    Timeout { pending: Vec<String> },

    #[error("job status unavailable for '{datasource}': {message}")]
    Server { datasource: String, message: String },
}

pub struct JobWaiter<'a> {
    api: &'a dyn ServerApi,
    poll_interval: Duration,
}

impl<'a> JobWaiter<'a> {
    pub fn new(api: &'a dyn ServerApi, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    pub async fn wait_all(
        &self,
        jobs: &[TrackedJob],
        deadline: Instant,
    ) -> std::result::Result<(), JobWaitError> {
        let mut pending: Vec<&TrackedJob> = jobs.iter().collect();
        info!("waiting on {} refresh job(s)", pending.len());

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for tracked in pending {
                let state = self.api.job_state(&tracked.job).await.map_err(|e| {
                    JobWaitError::Server {
                        datasource: tracked.datasource.clone(),
                        message: e.to_string(),
                    }
                })?;
                debug!(datasource = %tracked.datasource, job = %tracked.job.id, ?state, "job polled");

                match state {
                    JobState::Done => info!("refresh job for '{}' finished", tracked.datasource),
                    JobState::Failed { finish_code } => {
                        return Err(JobWaitError::JobFailed {
                            datasource: tracked.datasource.clone(),
                            job_id: tracked.job.id.clone(),
                            finish_code,
                        })
                    }
                    JobState::Pending | JobState::Running => still_pending.push(tracked),
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(JobWaitError::Timeout {
                    pending: pending.iter().map(|t| t.datasource.clone()).collect(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
