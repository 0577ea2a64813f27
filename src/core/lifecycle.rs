//! Job state transitions owned by background bodies.
//!
//! A body calls `mark_running` once, does its work, and hands an `Outcome` to
//! `finish`. Both writes are guarded by the expected prior status, so a job
//! cancelled mid-flight keeps its `Cancelled` state.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::models::{Job, JobResult, JobStatus};
use super::notifications::{JobEvent, NotificationChannel};
use super::orchestrator::JobOrchestrator;
use crate::db::JobUpdate;

/// Floor of every duration estimate.
pub const BASE_ESTIMATE_MINUTES: u64 = 10;

/// Estimate used when a job has no source backup to size it by.
pub const DEFAULT_ESTIMATE_MINUTES: u64 = 30;

/// Progress reported while running never exceeds this.
pub const MAX_RUNNING_PROGRESS: u8 = 95;

/// Ten minutes plus one per started GiB.
pub fn estimate_minutes(data_size_mb: u64) -> u64 {
    BASE_ESTIMATE_MINUTES + data_size_mb.div_ceil(1024)
}

/// Percentage complete derived from status and elapsed time.
pub fn progress_percent(job: &Job, estimated_minutes: u64, now: DateTime<Utc>) -> u8 {
    match job.status {
        JobStatus::Pending => 0,
        status if status.is_terminal() => 100,
        _ => {
            let started = job.started_at.unwrap_or(job.created_at);
            let elapsed_minutes = (now - started).num_milliseconds().max(0) as f64 / 60_000.0;
            let pct = (elapsed_minutes / estimated_minutes.max(1) as f64 * 100.0).round();
            pct.min(f64::from(MAX_RUNNING_PROGRESS)) as u8
        }
    }
}

/// What a job body produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        result: JobResult,
        data_size: Option<u64>,
    },
    Partial {
        result: JobResult,
        message: String,
    },
    Failed {
        message: String,
        result: Option<JobResult>,
    },
}

impl Outcome {
    pub fn success(result: JobResult) -> Self {
        Self::Success {
            result,
            data_size: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            result: None,
        }
    }
}

fn notify(notifier: &Option<Arc<dyn NotificationChannel>>, event: JobEvent) {
    if let Some(notifier) = notifier.clone() {
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event).await {
                warn!(error = %e, "Failed to send notification");
            }
        });
    }
}

impl JobOrchestrator {
    /// Pending -> Running. Returns false if the job already left Pending.
    pub(crate) async fn mark_running(&self, job: &Job) -> bool {
        let update = JobUpdate::transition(JobStatus::Running).started(Utc::now());
        match self.jobs.update(&job.id, update).await {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    client_id = %job.client_id,
                    job_type = %job.job_type,
                    "Job running"
                );
                notify(
                    &self.notifier,
                    JobEvent::Started {
                        job_id: job.id.clone(),
                        client_id: job.client_id.clone(),
                        job_type: job.job_type,
                    },
                );
                true
            }
            Ok(false) => {
                debug!(job_id = %job.id, "Job left Pending before dispatch, skipping");
                self.progress.remove(&job.id).await;
                false
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to mark job running");
                self.progress.remove(&job.id).await;
                false
            }
        }
    }

    /// Record the terminal state. A write lost to a concurrent cancel is dropped.
    pub(crate) async fn finish(&self, job: &Job, outcome: Outcome) {
        let now = Utc::now();
        let (status, update, detail) = match outcome {
            Outcome::Success { result, data_size } => {
                let mut update = JobUpdate::transition(JobStatus::Success)
                    .completed(now)
                    .with_result(result);
                update.data_size = data_size;
                (JobStatus::Success, update, None)
            }
            Outcome::Partial { result, message } => (
                JobStatus::PartialSuccess,
                JobUpdate::transition(JobStatus::PartialSuccess)
                    .completed(now)
                    .with_result(result)
                    .with_error(message.clone()),
                Some(message),
            ),
            Outcome::Failed { message, result } => {
                let mut update = JobUpdate::transition(JobStatus::Failed)
                    .completed(now)
                    .with_error(message.clone());
                update.result = result;
                (JobStatus::Failed, update, Some(message))
            }
        };

        match self.jobs.update(&job.id, update).await {
            Ok(true) => {
                let started = self
                    .jobs
                    .get(&job.id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|j| j.started_at)
                    .unwrap_or(job.created_at);
                let duration_secs = (now - started).num_seconds();

                let event = if status == JobStatus::Failed {
                    error!(
                        job_id = %job.id,
                        client_id = %job.client_id,
                        job_type = %job.job_type,
                        error = detail.as_deref().unwrap_or_default(),
                        "Job failed"
                    );
                    JobEvent::Failed {
                        job_id: job.id.clone(),
                        client_id: job.client_id.clone(),
                        job_type: job.job_type,
                        error: detail.unwrap_or_default(),
                    }
                } else {
                    info!(
                        job_id = %job.id,
                        client_id = %job.client_id,
                        job_type = %job.job_type,
                        status = %status,
                        duration_secs,
                        "Job finished"
                    );
                    JobEvent::Completed {
                        job_id: job.id.clone(),
                        client_id: job.client_id.clone(),
                        job_type: job.job_type,
                        status,
                        duration_secs,
                        detail,
                    }
                };
                notify(&self.notifier, event);
            }
            Ok(false) => {
                info!(
                    job_id = %job.id,
                    outcome = %status,
                    "Job already terminal, outcome discarded"
                );
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job outcome");
            }
        }

        self.progress.remove(&job.id).await;
    }
}
