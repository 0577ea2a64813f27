//! Provisioning jobs: create, update, tear down and restore-provision a
//! client's backup infrastructure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::{Client, TerraformState};
use super::lifecycle::Outcome;
use super::models::{
    Job, JobMetadata, JobResult, JobStatus, JobType, ProvisionMetadata, ProvisionResult, Trigger,
};
use super::orchestrator::{JobHandle, JobOrchestrator};
use super::progress::JobPhase;
use super::provisioning::{CommandOptions, CommandOutcome, ProvisioningCommand, recovery_point_arn};
use crate::db::JobUpdate;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProvisionAction {
    Init,
    Update,
    Destroy,
    /// Provision from a backup's recovery point. Latest successful backup
    /// when `backup_id` is absent.
    Restore {
        #[serde(default)]
        backup_id: Option<String>,
    },
}

impl ProvisionAction {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Init => JobType::ProvisionInit,
            Self::Update => JobType::ProvisionUpdate,
            Self::Destroy => JobType::ProvisionDestroy,
            Self::Restore { .. } => JobType::ProvisionRestore,
        }
    }
}

/// Resolved work for a provisioning body.
enum Plan {
    Configure,
    Destroy,
    Restore(Arc<Job>),
}

fn plan_file(client_id: &str) -> String {
    format!("{client_id}-plan.tfplan")
}

impl JobOrchestrator {
    pub async fn start_provisioning(
        &self,
        client_id: &str,
        action: ProvisionAction,
    ) -> Result<JobHandle> {
        let client = self.load_client(client_id).await?;
        if action != ProvisionAction::Destroy && !client.is_active() {
            return Err(OrchestratorError::validation(format!(
                "Client {} is {} and cannot be provisioned",
                client.id, client.status
            )));
        }
        if action != ProvisionAction::Destroy && client.enabled_providers().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "Client {} has no enabled providers",
                client.id
            )));
        }

        let _admission = self.admission.lock().await;
        if self.has_in_flight(&client.id, &JobType::PROVISIONING).await? {
            return Err(OrchestratorError::validation(format!(
                "A provisioning job is already in progress for client {}",
                client.id
            )));
        }

        let (plan, restore_backup_id) = match &action {
            ProvisionAction::Init | ProvisionAction::Update => (Plan::Configure, None),
            ProvisionAction::Destroy => (Plan::Destroy, None),
            ProvisionAction::Restore { backup_id } => {
                let backup = self.resolve_backup(&client.id, backup_id.as_deref()).await?;
                let id = backup.id.clone();
                (Plan::Restore(Arc::new(backup)), Some(id))
            }
        };

        let job = Job::new(
            &client.id,
            action.job_type(),
            Trigger::Manual,
            JobMetadata::Provision(ProvisionMetadata {
                plan_changes: None,
                restore_backup_id,
            }),
        );
        let handle = JobHandle {
            job_id: job.id.clone(),
        };

        let client = Arc::new(client);
        self.launch(job, move |this, job, cancel| async move {
            this.run_provisioning(&job, &client, plan, cancel).await
        })
        .await?;

        info!(job_id = %handle.job_id, client_id = %client_id, ?action, "Provisioning started");
        Ok(handle)
    }

    async fn run_provisioning(
        &self,
        job: &Job,
        client: &Client,
        plan: Plan,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        match plan {
            Plan::Configure => {
                self.set_terraform_state(client, TerraformState::Initializing).await;
                let result = self.configure(job, client, cancel).await;
                let state = if result.is_ok() {
                    TerraformState::Initialized
                } else {
                    TerraformState::Failed
                };
                self.set_terraform_state(client, state).await;
                result
            }
            Plan::Destroy => {
                self.progress
                    .update(
                        &job.id,
                        JobPhase::Provisioning {
                            command: ProvisioningCommand::Destroy,
                        },
                    )
                    .await;
                let outcome = self
                    .driver
                    .run_command(
                        &client.id,
                        ProvisioningCommand::Destroy,
                        CommandOptions {
                            auto_approve: true,
                            cancel,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.set_terraform_state(client, TerraformState::NotInitialized).await;

                Ok(Outcome::success(JobResult::Provision(ProvisionResult {
                    changes: outcome.changes,
                    ..Default::default()
                })))
            }
            Plan::Restore(backup) => {
                let digest = if self.driver.has_workspace(&client.id) {
                    None
                } else {
                    let generated = self.driver.generate_config(client).await?;
                    let options = CommandOptions {
                        cancel: cancel.clone(),
                        ..Default::default()
                    };
                    self.run_step(job, client, ProvisioningCommand::Init, options)
                        .await?;
                    Some(generated.digest)
                };

                let vars = BTreeMap::from([
                    ("restore_mode".to_string(), "true".to_string()),
                    ("backup_id".to_string(), backup.id.clone()),
                    ("recovery_point_arn".to_string(), recovery_point_arn(&backup)),
                ]);
                let mut result = self
                    .plan_and_apply(job, client, vars, Some(backup.id.clone()), cancel)
                    .await?;
                result.config_digest = digest;
                Ok(Outcome::success(JobResult::Provision(result)))
            }
        }
    }

    /// Render, init, plan and apply the client's configuration.
    async fn configure(
        &self,
        job: &Job,
        client: &Client,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        let generated = self.driver.generate_config(client).await?;
        let options = CommandOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };
        self.run_step(job, client, ProvisioningCommand::Init, options)
            .await?;

        let mut result = self
            .plan_and_apply(job, client, BTreeMap::new(), None, cancel)
            .await?;
        result.config_digest = Some(generated.digest);
        Ok(Outcome::success(JobResult::Provision(result)))
    }

    async fn plan_and_apply(
        &self,
        job: &Job,
        client: &Client,
        vars: BTreeMap<String, String>,
        restore_backup_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ProvisionResult> {
        let plan_file = plan_file(&client.id);
        let options = CommandOptions {
            plan_out: Some(plan_file.clone()),
            vars,
            cancel: cancel.clone(),
            ..Default::default()
        };
        let plan = self
            .run_step(job, client, ProvisioningCommand::Plan, options)
            .await?;

        let mut changes = plan.changes;
        if plan.has_changes == Some(true) {
            let metadata = JobMetadata::Provision(ProvisionMetadata {
                plan_changes: plan.changes,
                restore_backup_id,
            });
            let moved = self
                .jobs
                .update(
                    &job.id,
                    JobUpdate::transition(JobStatus::PlanningCompleted).with_metadata(metadata),
                )
                .await?;
            if !moved {
                return Err(OrchestratorError::validation("Job left Running before apply"));
            }
            info!(job_id = %job.id, changes = ?plan.changes, "Plan has changes, applying");

            let options = CommandOptions {
                auto_approve: true,
                plan_file: Some(plan_file),
                cancel,
                ..Default::default()
            };
            let applied = self
                .run_step(job, client, ProvisioningCommand::Apply, options)
                .await?;
            changes = applied.changes.or(changes);
        } else {
            info!(job_id = %job.id, "Plan found no changes");
        }

        Ok(ProvisionResult {
            changes,
            has_changes: plan.has_changes,
            outputs: self.driver.parse_outputs(&client.id).await,
            config_digest: None,
        })
    }

    async fn run_step(
        &self,
        job: &Job,
        client: &Client,
        command: ProvisioningCommand,
        options: CommandOptions,
    ) -> Result<CommandOutcome> {
        self.progress.update(&job.id, JobPhase::Provisioning { command }).await;
        Ok(self.driver.run_command(&client.id, command, options).await?)
    }

    async fn set_terraform_state(&self, client: &Client, state: TerraformState) {
        if let Err(e) = self.clients.set_terraform_state(&client.id, state).await {
            warn!(client_id = %client.id, ?state, error = %e, "Failed to record terraform state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_map_to_job_types() {
        assert_eq!(ProvisionAction::Init.job_type(), JobType::ProvisionInit);
        assert_eq!(
            ProvisionAction::Restore { backup_id: None }.job_type(),
            JobType::ProvisionRestore
        );
    }

    #[test]
    fn actions_deserialize_from_tagged_json() {
        let action: ProvisionAction =
            serde_json::from_str(r#"{"action":"restore","backup_id":"b-1"}"#).unwrap();
        assert_eq!(
            action,
            ProvisionAction::Restore {
                backup_id: Some("b-1".into())
            }
        );
        let action: ProvisionAction = serde_json::from_str(r#"{"action":"destroy"}"#).unwrap();
        assert_eq!(action, ProvisionAction::Destroy);
    }
}
