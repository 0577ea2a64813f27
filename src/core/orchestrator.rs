use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::Client;
use super::fanout::{FanOut, fan_out, join_failures};
use super::lifecycle::{DEFAULT_ESTIMATE_MINUTES, Outcome, estimate_minutes, progress_percent};
use super::models::{
    BackupResult, Job, JobMetadata, JobResult, JobStatus, JobType, Provider, RecoveryPoint, Trigger,
};
use super::notifications::NotificationChannel;
use super::progress::{JobPhase, ProgressTracker};
use super::provisioning::ProvisioningDriver;
use super::runner::JobRunner;
use crate::db::{ClientStore, JobFilter, JobSort, JobStore, JobUpdate, Page};
use crate::error::{OrchestratorError, Result};
use crate::gateway::ProviderGateway;

/// Id of a freshly created job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job: Job,
    pub progress: u8,
    pub estimated_minutes: u64,
    pub phase: Option<JobPhase>,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub total_pages: u32,
}

impl<T> Paged<T> {
    pub(crate) fn new(items: Vec<T>, total: u64, page: Page) -> Self {
        let total_pages = match page.limit {
            Some(limit) if limit > 0 => total.div_ceil(u64::from(limit)) as u32,
            _ => u32::from(total > 0),
        };
        Self {
            items,
            total,
            page: page.number,
            total_pages,
        }
    }
}

/// Validates requests, creates jobs and runs their bodies in the background.
///
/// Every public operation either fails synchronously before any job exists
/// or returns a job id immediately. Background failures are recorded on the
/// job, never returned.
#[derive(Clone)]
pub struct JobOrchestrator {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) clients: Arc<dyn ClientStore>,
    pub(crate) gateway: Arc<dyn ProviderGateway>,
    pub(crate) driver: Arc<ProvisioningDriver>,
    pub(crate) runner: JobRunner,
    pub(crate) progress: ProgressTracker,
    pub(crate) notifier: Option<Arc<dyn NotificationChannel>>,
    /// Serialises the in-flight check and job creation for single-flight job types.
    pub(crate) admission: Arc<Mutex<()>>,
}

impl JobOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        clients: Arc<dyn ClientStore>,
        gateway: Arc<dyn ProviderGateway>,
        driver: Arc<ProvisioningDriver>,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            jobs,
            clients,
            gateway,
            driver,
            runner: JobRunner::new(),
            progress,
            notifier: None,
            admission: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn clients(&self) -> &Arc<dyn ClientStore> {
        &self.clients
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn active_jobs(&self) -> usize {
        self.runner.active_count()
    }

    /// Wait for every background body to settle.
    pub async fn wait_idle(&self) {
        self.runner.wait_idle().await;
    }

    /// Interrupt running bodies and wait for them.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }

    /// Insert or replace a client. Its id names its provisioning workspace.
    pub async fn save_client(&self, client: &Client) -> Result<()> {
        if !client.has_valid_id() {
            return Err(OrchestratorError::validation(format!(
                "Client id {:?} must be a single path segment",
                client.id
            )));
        }
        self.clients.save(client).await?;
        info!(client_id = %client.id, name = %client.name, "Client saved");
        Ok(())
    }

    pub(crate) async fn load_client(&self, client_id: &str) -> Result<Client> {
        self.clients
            .get(client_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("Client {client_id} not found")))
    }

    /// The explicit backup, or the most recently completed successful one.
    pub(crate) async fn resolve_backup(
        &self,
        client_id: &str,
        backup_id: Option<&str>,
    ) -> Result<Job> {
        match backup_id {
            Some(id) => self
                .jobs
                .get(id)
                .await?
                .filter(|b| {
                    b.client_id == client_id
                        && b.job_type == JobType::Backup
                        && b.status == JobStatus::Success
                })
                .ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "Backup {id} is not a successful backup of client {client_id}"
                    ))
                }),
            None => self.latest_successful_backup(client_id).await?.ok_or_else(|| {
                OrchestratorError::validation(format!(
                    "No successful backups available for client {client_id}"
                ))
            }),
        }
    }

    pub(crate) async fn latest_successful_backup(&self, client_id: &str) -> Result<Option<Job>> {
        let filter = JobFilter::for_client(client_id)
            .of_type(JobType::Backup)
            .with_status(JobStatus::Success);
        Ok(self.jobs.find_one(&filter, JobSort::CompletedDesc).await?)
    }

    pub(crate) async fn has_in_flight(
        &self,
        client_id: &str,
        job_types: &[JobType],
    ) -> Result<bool> {
        let filter = JobFilter::for_client(client_id)
            .of_types(job_types)
            .with_statuses(&JobStatus::IN_FLIGHT);
        Ok(self.jobs.count(&filter).await? > 0)
    }

    /// Persist a Pending job and hand its body to the runner.
    pub(crate) async fn launch<F, Fut>(&self, job: Job, body: F) -> Result<()>
    where
        F: FnOnce(JobOrchestrator, Job, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        self.jobs.create(&job).await?;
        self.progress.update(&job.id, JobPhase::Queued).await;
        info!(
            job_id = %job.id,
            client_id = %job.client_id,
            job_type = %job.job_type,
            "Job created"
        );

        let this = self.clone();
        let job_id = job.id.clone();
        self.runner.dispatch(&job_id, move |cancel| async move {
            if !this.mark_running(&job).await {
                return;
            }
            let outcome = match body(this.clone(), job.clone(), cancel).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::failed(e.to_string()),
            };
            this.finish(&job, outcome).await;
        });
        Ok(())
    }

    /// Start a backup of every enabled provider.
    pub async fn start_backup(&self, client_id: &str) -> Result<JobHandle> {
        let client = self.load_client(client_id).await?;
        if !client.is_active() {
            return Err(OrchestratorError::validation(format!(
                "Client {} is {} and cannot be backed up",
                client.id, client.status
            )));
        }
        let providers = client.enabled_providers();
        if providers.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "Client {} has no enabled providers",
                client.id
            )));
        }

        let mut job = Job::new(
            &client.id,
            JobType::Backup,
            Trigger::Manual,
            JobMetadata::Backup {
                backup_type: client.backup_config.backup_type,
            },
        );
        if let [only] = providers.as_slice() {
            job.provider = Some(*only);
        }
        let handle = JobHandle {
            job_id: job.id.clone(),
        };

        let client = Arc::new(client);
        self.launch(job, move |this, job, _cancel| async move {
            this.run_backup(&job, client, providers).await
        })
        .await?;

        Ok(handle)
    }

    async fn run_backup(
        &self,
        job: &Job,
        client: Arc<Client>,
        providers: Vec<Provider>,
    ) -> Result<Outcome> {
        self.progress
            .update(
                &job.id,
                JobPhase::AwaitingProviders {
                    providers: providers.clone(),
                },
            )
            .await;

        let gateway = self.gateway.clone();
        let outcome = fan_out(&providers, |provider| {
            let gateway = gateway.clone();
            let client = client.clone();
            async move { gateway.start_backup(provider, &client).await }
        })
        .await;

        Ok(match outcome {
            FanOut::AllSucceeded(payloads) => {
                let recovery_points: Vec<RecoveryPoint> = payloads
                    .into_iter()
                    .map(|(provider, payload)| RecoveryPoint {
                        provider,
                        recovery_point_id: payload.recovery_point_id,
                        data_size_mb: payload.data_size_mb,
                    })
                    .collect();
                let data_size = recovery_points.iter().map(|p| p.data_size_mb).sum();
                Outcome::Success {
                    result: JobResult::Backup(BackupResult { recovery_points }),
                    data_size: Some(data_size),
                }
            }
            FanOut::Mixed { failures, .. } | FanOut::AllFailed(failures) => {
                Outcome::failed(format!("Backup failed: {}", join_failures(&failures)))
            }
        })
    }

    /// Current job snapshot with derived progress.
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusReport> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("Job {job_id} not found")))?;

        let estimated_minutes = match job.restore_metadata() {
            Some(meta) => meta.estimated_minutes,
            None => match &job.source_backup_id {
                Some(backup_id) => match self.jobs.get(backup_id).await? {
                    Some(backup) => estimate_minutes(backup.data_size),
                    None => DEFAULT_ESTIMATE_MINUTES,
                },
                None => DEFAULT_ESTIMATE_MINUTES,
            },
        };

        let progress = progress_percent(&job, estimated_minutes, Utc::now());
        let phase = if job.status.is_in_flight() {
            self.progress.get(&job.id).await
        } else {
            None
        };

        Ok(JobStatusReport {
            job,
            progress,
            estimated_minutes,
            phase,
        })
    }

    /// Cancel any in-flight job.
    pub async fn cancel_job(&self, job_id: &str, reason: Option<&str>) -> Result<Job> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("Job {job_id} not found")))?;

        if job.status.is_terminal() {
            return Err(cannot_cancel(job_id, job.status));
        }

        self.record_cancel(&job, reason.unwrap_or("Cancelled by user")).await
    }

    /// Write Cancelled, then interrupt the body. The write never waits on the body.
    pub(crate) async fn record_cancel(&self, job: &Job, reason: &str) -> Result<Job> {
        let update = JobUpdate::transition(JobStatus::Cancelled)
            .completed(Utc::now())
            .with_error(reason);

        if !self.jobs.update(&job.id, update).await? {
            let current = self
                .jobs
                .get(&job.id)
                .await?
                .map_or(job.status, |j| j.status);
            return Err(cannot_cancel(&job.id, current));
        }

        if self.runner.signal_cancel(&job.id) {
            info!(job_id = %job.id, "Signalled running job to stop");
        }
        self.progress.remove(&job.id).await;
        info!(job_id = %job.id, client_id = %job.client_id, reason, "Job cancelled");

        self.jobs
            .get(&job.id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("Job {} not found", job.id)))
    }

    /// Paginated job listing, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter, page: Page) -> Result<Paged<Job>> {
        let total = self.jobs.count(filter).await?;
        let items = self.jobs.find(filter, JobSort::CreatedDesc, page).await?;
        Ok(Paged::new(items, total, page))
    }

    pub async fn count_by_status(
        &self,
        client_id: Option<&str>,
    ) -> Result<HashMap<JobStatus, u64>> {
        Ok(self.jobs.count_by_status(client_id).await?)
    }

    /// Best-effort provider-side cancel. Failures are logged only.
    pub(crate) async fn cancel_at_providers(&self, job: &Job, providers: Vec<Provider>) {
        let gateway = self.gateway.clone();
        let job_arc = Arc::new(job.clone());
        let outcome = fan_out(&providers, |provider| {
            let gateway = gateway.clone();
            let job = job_arc.clone();
            async move { gateway.cancel_restore(provider, &job).await }
        })
        .await;

        if let FanOut::Mixed { failures, .. } | FanOut::AllFailed(failures) = outcome {
            warn!(
                job_id = %job.id,
                errors = %join_failures(&failures),
                "Provider-side cancel failed"
            );
        }
    }
}

pub(crate) fn cannot_cancel(job_id: &str, status: JobStatus) -> OrchestratorError {
    OrchestratorError::CannotCancel {
        job_id: job_id.to_string(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paged_counts_pages() {
        let paged = Paged::new(vec![1, 2], 45, Page::new(2, 20));
        assert_eq!(paged.total_pages, 3);
        assert_eq!(paged.page, 2);

        let empty: Paged<u8> = Paged::new(Vec::new(), 0, Page::new(1, 20));
        assert_eq!(empty.total_pages, 0);
        assert_eq!(Paged::new(vec![1], 1, Page::all()).total_pages, 1);
    }
}
