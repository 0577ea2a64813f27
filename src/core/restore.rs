//! Restores into isolated environments and into production.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::Client;
use super::fanout::{FanOut, fan_out, join_failures};
use super::lifecycle::{Outcome, estimate_minutes};
use super::models::{
    Job, JobMetadata, JobResult, JobStatus, JobType, ProviderRestore, RestoreMetadata,
    RestoreOptions, RestoreResult, Trigger,
};
use super::orchestrator::{JobOrchestrator, Paged, cannot_cancel};
use super::progress::JobPhase;
use super::provisioning::{CommandOptions, ProvisioningCommand, parse_restored_resources};
use super::safety;
use crate::db::{JobFilter, JobSort, Page};
use crate::error::{OrchestratorError, Result};

/// Returned by `start_restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreHandle {
    pub job_id: String,
    pub source_backup_id: String,
    pub estimated_minutes: u64,
    pub target_environment: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreHistoryEntry {
    pub id: String,
    pub date: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub source_backup_id: Option<String>,
    pub target_environment: Option<String>,
    pub isolated: Option<bool>,
    pub duration_minutes: Option<i64>,
    pub restored_resources: usize,
    pub error_message: Option<String>,
}

impl From<Job> for RestoreHistoryEntry {
    fn from(job: Job) -> Self {
        let meta = job.restore_metadata();
        Self {
            date: job.started_at.unwrap_or(job.created_at),
            completed_at: job.completed_at,
            status: job.status,
            target_environment: meta.map(|m| m.target_environment.clone()),
            isolated: meta.map(|m| m.isolated),
            duration_minutes: job.duration_minutes(),
            restored_resources: job
                .restore_result()
                .map_or(0, |r| r.restored_resources.len()),
            source_backup_id: job.source_backup_id,
            error_message: job.error_message,
            id: job.id,
        }
    }
}

impl JobOrchestrator {
    /// Restore a backup. Production targets go through the safety policy and
    /// fan out to every enabled provider; anything else is provisioned into
    /// an ephemeral workspace.
    pub async fn start_restore(
        &self,
        client_id: &str,
        backup_id: Option<&str>,
        options: RestoreOptions,
    ) -> Result<RestoreHandle> {
        let client = self.load_client(client_id).await?;

        let _admission = self.admission.lock().await;
        if self.has_in_flight(&client.id, &[JobType::Restore]).await? {
            return Err(OrchestratorError::validation(format!(
                "A restore is already in progress for client {}",
                client.id
            )));
        }
        let backup = self.resolve_backup(&client.id, backup_id).await?;

        let target_environment = options.environment().to_string();
        let isolated = options.is_isolated();
        let estimated_minutes = estimate_minutes(backup.data_size);

        let metadata = RestoreMetadata {
            target_environment: target_environment.clone(),
            isolated,
            resources: options.resources.clone().unwrap_or_default(),
            recovery_point: options.point_in_time_recovery,
            estimated_minutes,
            description: options
                .description
                .clone()
                .unwrap_or_else(|| format!("Restore of backup {}", backup.id)),
            priority: options.priority.clone().unwrap_or_else(|| "normal".to_string()),
            initiated_by: options.initiated_by.clone().unwrap_or_else(|| "system".to_string()),
        };
        let metadata = JobMetadata::Restore(metadata);
        let job = Job::new(&client.id, JobType::Restore, Trigger::Manual, metadata)
            .with_source_backup(&backup);

        let handle = RestoreHandle {
            job_id: job.id.clone(),
            source_backup_id: backup.id.clone(),
            estimated_minutes,
            target_environment,
        };

        let client = Arc::new(client);
        let backup = Arc::new(backup);
        let options = Arc::new(options);
        self.launch(job, move |this, job, cancel| async move {
            if isolated {
                this.run_isolated_restore(&job, &client, &backup, cancel).await
            } else {
                this.run_production_restore(&job, client, backup, options).await
            }
        })
        .await?;

        info!(
            job_id = %handle.job_id,
            client_id = %client_id,
            backup_id = %handle.source_backup_id,
            isolated,
            "Restore started"
        );
        Ok(handle)
    }

    async fn run_isolated_restore(
        &self,
        job: &Job,
        client: &Client,
        backup: &Job,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        let outcome = self.apply_isolated_restore(job, client, backup, cancel).await;

        if let Err(e) = self.driver.release_restore_workspace(&client.id, &job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to release restore workspace");
        }
        outcome
    }

    async fn apply_isolated_restore(
        &self,
        job: &Job,
        client: &Client,
        backup: &Job,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        self.progress
            .update(
                &job.id,
                JobPhase::Provisioning {
                    command: ProvisioningCommand::Init,
                },
            )
            .await;
        let workspace = self
            .driver
            .prepare_restore_workspace(client, backup, &job.id, cancel.clone())
            .await?;

        self.progress
            .update(
                &job.id,
                JobPhase::Provisioning {
                    command: ProvisioningCommand::Apply,
                },
            )
            .await;
        let applied = self
            .driver
            .run_in(
                &client.id,
                &workspace.path,
                ProvisioningCommand::Apply,
                CommandOptions {
                    auto_approve: true,
                    cancel,
                    ..Default::default()
                },
            )
            .await?;

        let restored_resources = parse_restored_resources(&applied.output);
        Ok(Outcome::success(JobResult::Restore(RestoreResult {
            isolated: true,
            terraform_output: Some(applied.output),
            restored_resources,
            ..Default::default()
        })))
    }

    async fn run_production_restore(
        &self,
        job: &Job,
        client: Arc<Client>,
        backup: Arc<Job>,
        options: Arc<RestoreOptions>,
    ) -> Result<Outcome> {
        let verified = JobFilter::for_client(&client.id)
            .of_type(JobType::DrTest)
            .with_status(JobStatus::Success)
            .from_backup(&backup.id);
        let has_successful_dr_test = self.jobs.count(&verified).await? > 0;

        safety::validate(Utc::now(), &backup, has_successful_dr_test, &options)?;

        let providers = client.enabled_providers();
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
            let backup = backup.clone();
            let options = options.clone();
            async move {
                gateway
                    .start_restore(provider, &client, &backup, &options)
                    .await
                    .map(|restored_resources| ProviderRestore {
                        provider,
                        restored_resources,
                    })
            }
        })
        .await;

        Ok(match outcome {
            FanOut::AllSucceeded(restores) => {
                let successes: Vec<ProviderRestore> =
                    restores.into_iter().map(|(_, r)| r).collect();
                let restored_resources = successes
                    .iter()
                    .flat_map(|r| r.restored_resources.iter().cloned())
                    .collect();
                Outcome::success(JobResult::Restore(RestoreResult {
                    isolated: false,
                    restored_resources,
                    successes,
                    ..Default::default()
                }))
            }
            FanOut::Mixed { successes, failures } => {
                let successes: Vec<ProviderRestore> =
                    successes.into_iter().map(|(_, r)| r).collect();
                let restored_resources = successes
                    .iter()
                    .flat_map(|r| r.restored_resources.iter().cloned())
                    .collect();
                Outcome::Partial {
                    message: format!("Partial restore: {} providers failed", failures.len()),
                    result: JobResult::Restore(RestoreResult {
                        isolated: false,
                        restored_resources,
                        successes,
                        failures: failures.iter().map(ToString::to_string).collect(),
                        ..Default::default()
                    }),
                }
            }
            FanOut::AllFailed(failures) => Outcome::Failed {
                message: join_failures(&failures),
                result: Some(JobResult::Restore(RestoreResult {
                    isolated: false,
                    failures: failures.iter().map(ToString::to_string).collect(),
                    ..Default::default()
                })),
            },
        })
    }

    /// Cancel a Pending or Running restore.
    pub async fn cancel_restore(&self, job_id: &str) -> Result<Job> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .filter(|j| j.job_type == JobType::Restore)
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("Restore job {job_id} not found"))
            })?;

        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            return Err(cannot_cancel(&job.id, job.status));
        }

        let providers = match job.provider {
            Some(provider) => vec![provider],
            None => match self.clients.get(&job.client_id).await? {
                Some(client) => client.enabled_providers(),
                None => Vec::new(),
            },
        };
        self.cancel_at_providers(&job, providers).await;

        self.record_cancel(&job, "Restore cancelled by user").await
    }

    /// Restores for a client, newest first.
    pub async fn restore_history(
        &self,
        client_id: &str,
        page: Page,
    ) -> Result<Paged<RestoreHistoryEntry>> {
        let filter = JobFilter::for_client(client_id).of_type(JobType::Restore);
        let total = self.jobs.count(&filter).await?;
        let jobs = self.jobs.find(&filter, JobSort::CreatedDesc, page).await?;
        Ok(Paged::new(jobs.into_iter().map(Into::into).collect(), total, page))
    }
}
