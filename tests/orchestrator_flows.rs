use chrono::{Duration as ChronoDuration, Utc};
use drover::core::client::{BackupType, ClientStatus, TerraformState};
use drover::core::models::{
    DrTestParameters, JobMetadata, JobResult, JobStatus, JobType, Provider, ResourceSelector,
    RestoreMetadata, RestoreOptions, Trigger,
};
use drover::core::provisioning::SimulatedEngine;
use drover::core::{
    Client, Job, JobOrchestrator, ProgressTracker, ProvisionAction, ProvisioningDriver,
};
use drover::db::{Page, SqliteStore};
use drover::error::OrchestratorError;
use drover::gateway::{Operation, SimulatedGateway};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    gateway: Arc<SimulatedGateway>,
    driver: Arc<ProvisioningDriver>,
    orchestrator: JobOrchestrator,
}

impl Harness {
    async fn new(engine_delay: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let gateway = Arc::new(SimulatedGateway::new(Duration::from_millis(5)));
        let engine = Arc::new(SimulatedEngine { delay: engine_delay });
        let driver = Arc::new(ProvisioningDriver::new(dir.path(), engine, true));

        let orchestrator = JobOrchestrator::new(
            store.clone(),
            store,
            gateway.clone(),
            driver.clone(),
            ProgressTracker::new(),
        );

        Self {
            _dir: dir,
            gateway,
            driver,
            orchestrator,
        }
    }

    async fn client(&self, providers: Vec<Provider>) -> Client {
        let client = Client::new("Acme Corp", providers);
        self.orchestrator.clients().save(&client).await.unwrap();
        client
    }

    async fn job(&self, id: &str) -> Job {
        self.orchestrator.jobs().get(id).await.unwrap().unwrap()
    }

    /// A successful backup completed `age` ago, inserted directly.
    async fn backup_aged(&self, client: &Client, age: ChronoDuration) -> Job {
        let mut backup = Job::new(
            &client.id,
            JobType::Backup,
            Trigger::Automated,
            JobMetadata::Backup {
                backup_type: BackupType::Full,
            },
        );
        let completed = Utc::now() - age;
        backup.status = JobStatus::Success;
        backup.created_at = completed - ChronoDuration::minutes(20);
        backup.started_at = Some(completed - ChronoDuration::minutes(20));
        backup.completed_at = Some(completed);
        backup.data_size = 5 * 1024;
        self.orchestrator.jobs().create(&backup).await.unwrap();
        backup
    }

    async fn settled(&self, id: &str) -> Job {
        self.orchestrator.wait_idle().await;
        self.job(id).await
    }
}

fn skip_checks() -> RestoreOptions {
    RestoreOptions {
        skip_validation_check: true,
        ..RestoreOptions::production()
    }
}

#[tokio::test]
async fn backup_fans_out_and_sums_data_size() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(Provider::ALL.to_vec()).await;

    let handle = h.orchestrator.start_backup(&client.id).await.unwrap();
    let job = h.settled(&handle.job_id).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.data_size, 3 * 1024);
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert!(job.error_message.is_none());
    assert_eq!(job.backup_result().unwrap().recovery_points.len(), 3);
}

#[tokio::test]
async fn backup_with_a_failed_provider_fails() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws, Provider::Azure]).await;
    h.gateway.fail(Provider::Azure, Operation::Backup);

    let handle = h.orchestrator.start_backup(&client.id).await.unwrap();
    let job = h.settled(&handle.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("azure"));
}

#[tokio::test]
async fn backup_preconditions_fail_synchronously() {
    let h = Harness::new(Duration::ZERO).await;

    let err = h.orchestrator.start_backup("missing").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let mut client = Client::new("Dormant", vec![Provider::Aws]);
    client.status = ClientStatus::Inactive;
    h.orchestrator.clients().save(&client).await.unwrap();

    let err = h.orchestrator.start_backup(&client.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let page = h
        .orchestrator
        .list_jobs(&drover::db::JobFilter::for_client(&client.id), Page::all())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn production_restore_classifies_partial_success() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(Provider::ALL.to_vec()).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(1)).await;
    h.gateway.fail(Provider::Gcp, Operation::Restore);

    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), skip_checks())
        .await
        .unwrap();
    assert_eq!(handle.source_backup_id, backup.id);
    assert_eq!(handle.estimated_minutes, 15);

    let job = h.settled(&handle.job_id).await;
    assert_eq!(job.status, JobStatus::PartialSuccess);
    let result = job.restore_result().unwrap();
    assert_eq!(result.successes.len(), 2);
    assert_eq!(result.failures.len(), 1);
    assert!(job.error_message.unwrap().contains("1 providers failed"));
}

#[tokio::test]
async fn production_restore_all_success_and_all_failed() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(Provider::ALL.to_vec()).await;
    let backup = h.backup_aged(&client, ChronoDuration::hours(3)).await;

    let ok = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), skip_checks())
        .await
        .unwrap();
    let job = h.settled(&ok.job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.restore_result().unwrap().successes.len(), 3);

    for provider in Provider::ALL {
        h.gateway.fail(provider, Operation::Restore);
    }
    let failed = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), skip_checks())
        .await
        .unwrap();
    let job = h.settled(&failed.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("aws") && message.contains("azure") && message.contains("gcp"));
}

#[tokio::test]
async fn stale_backup_is_rejected_in_background() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(8)).await;

    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), skip_checks())
        .await
        .unwrap();
    let job = h.settled(&handle.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("8 days old"), "{message}");

    let forced = RestoreOptions {
        force_trust_old_backup: true,
        ..skip_checks()
    };
    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), forced)
        .await
        .unwrap();
    assert_eq!(h.settled(&handle.job_id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn unverified_backup_needs_dr_test_or_override() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws, Provider::Azure]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(2)).await;

    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), RestoreOptions::production())
        .await
        .unwrap();
    let job = h.settled(&handle.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("skipValidationCheck"));

    let dr = h
        .orchestrator
        .start_dr_test(&client.id, Some(&backup.id), DrTestParameters::default())
        .await
        .unwrap();
    assert_eq!(h.settled(&dr.job_id).await.status, JobStatus::Success);

    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), RestoreOptions::production())
        .await
        .unwrap();
    assert_eq!(h.settled(&handle.job_id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn isolated_restore_provisions_an_ephemeral_workspace() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(30)).await;

    // Old and unverified is fine outside production.
    let handle = h
        .orchestrator
        .start_restore(&client.id, None, RestoreOptions::isolated("staging"))
        .await
        .unwrap();
    assert_eq!(handle.source_backup_id, backup.id);
    assert_eq!(handle.target_environment, "staging");

    let job = h.settled(&handle.job_id).await;
    assert_eq!(job.status, JobStatus::Success);
    let result = job.restore_result().unwrap();
    assert!(result.isolated);
    assert_eq!(result.restored_resources.len(), 3);

    // Nothing was left in state, so the ephemeral workspace is gone.
    let workspace = h.driver.restore_workspace_path(&client.id, &job.id).unwrap();
    assert!(!workspace.exists());
}

#[tokio::test]
async fn restore_without_backups_is_a_validation_error() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;

    let err = h
        .orchestrator
        .start_restore(&client.id, None, skip_checks())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let err = h
        .orchestrator
        .start_restore(&client.id, Some("no-such-backup"), skip_checks())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn second_restore_is_rejected_while_one_is_in_flight() {
    let h = Harness::new(Duration::from_millis(300)).await;
    let client = h.client(vec![Provider::Aws]).await;
    h.backup_aged(&client, ChronoDuration::days(1)).await;

    let first = h
        .orchestrator
        .start_restore(&client.id, None, RestoreOptions::isolated("staging"))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .start_restore(&client.id, None, RestoreOptions::isolated("staging"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    assert_eq!(h.settled(&first.job_id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn cancelled_restore_stays_cancelled() {
    let h = Harness::new(Duration::from_millis(500)).await;
    let client = h.client(vec![Provider::Aws]).await;
    h.backup_aged(&client, ChronoDuration::days(1)).await;

    let handle = h
        .orchestrator
        .start_restore(&client.id, None, RestoreOptions::isolated("staging"))
        .await
        .unwrap();

    let cancelled = h.orchestrator.cancel_restore(&handle.job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let job = h.settled(&handle.job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("Restore cancelled by user"));

    let err = h.orchestrator.cancel_restore(&handle.job_id).await.unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(
        err,
        OrchestratorError::CannotCancel {
            status: JobStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn cancelling_a_pending_restore_never_starts_it() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(1)).await;

    let pending = Job::new(
        &client.id,
        JobType::Restore,
        Trigger::Manual,
        JobMetadata::Restore(RestoreMetadata {
            target_environment: "staging".into(),
            isolated: true,
            resources: ResourceSelector::All,
            recovery_point: None,
            estimated_minutes: 15,
            description: "Queued restore".into(),
            priority: "normal".into(),
            initiated_by: "ops".into(),
        }),
    )
    .with_source_backup(&backup);
    h.orchestrator.jobs().create(&pending).await.unwrap();

    let cancelled = h.orchestrator.cancel_restore(&pending.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.started_at.is_none());

    // The slot is free again.
    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), RestoreOptions::isolated("staging"))
        .await
        .unwrap();
    assert_eq!(h.settled(&handle.job_id).await.status, JobStatus::Success);
    assert_eq!(h.job(&pending.id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancel_rejects_terminal_jobs_and_non_restores() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;

    let handle = h.orchestrator.start_backup(&client.id).await.unwrap();
    h.settled(&handle.job_id).await;

    let err = h.orchestrator.cancel_job(&handle.job_id, None).await.unwrap_err();
    assert!(err.to_string().contains("Success"));
    assert!(matches!(
        err,
        OrchestratorError::CannotCancel {
            status: JobStatus::Success,
            ..
        }
    ));

    let err = h.orchestrator.cancel_restore(&handle.job_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let err = h.orchestrator.cancel_job("missing", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn status_reports_progress_by_state() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(1)).await;

    let handle = h
        .orchestrator
        .start_restore(&client.id, Some(&backup.id), skip_checks())
        .await
        .unwrap();
    h.settled(&handle.job_id).await;

    let report = h.orchestrator.get_status(&handle.job_id).await.unwrap();
    assert_eq!(report.progress, 100);
    assert_eq!(report.estimated_minutes, 15);
    assert!(report.phase.is_none());

    let err = h.orchestrator.get_status("missing").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn provisioning_init_plans_applies_and_tracks_state() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;

    let handle = h
        .orchestrator
        .start_provisioning(&client.id, ProvisionAction::Init)
        .await
        .unwrap();
    let job = h.settled(&handle.job_id).await;

    assert_eq!(job.status, JobStatus::Success);
    let JobMetadata::Provision(meta) = &job.metadata else {
        panic!("expected provisioning metadata");
    };
    assert_eq!(meta.plan_changes.map(|c| c.added), Some(3));

    let Some(JobResult::Provision(result)) = &job.result else {
        panic!("expected provisioning result");
    };
    assert_eq!(result.has_changes, Some(true));
    assert!(result.config_digest.is_some());
    assert!(result.outputs.contains_key("backup_vault_id"));

    let stored = h.orchestrator.clients().get(&client.id).await.unwrap().unwrap();
    assert_eq!(stored.terraform_state, TerraformState::Initialized);
}

#[tokio::test]
async fn provisioning_destroy_without_workspace_fails() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;

    let handle = h
        .orchestrator
        .start_provisioning(&client.id, ProvisionAction::Destroy)
        .await
        .unwrap();
    let job = h.settled(&handle.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("No provisioning workspace"));
}

#[tokio::test]
async fn restore_history_lists_newest_first() {
    let h = Harness::new(Duration::ZERO).await;
    let client = h.client(vec![Provider::Aws]).await;
    let backup = h.backup_aged(&client, ChronoDuration::days(1)).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let handle = h
            .orchestrator
            .start_restore(&client.id, Some(&backup.id), skip_checks())
            .await
            .unwrap();
        h.settled(&handle.job_id).await;
        ids.push(handle.job_id);
    }

    let page = h
        .orchestrator
        .restore_history(&client.id, Page::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, ids[2]);
    assert_eq!(page.items[0].source_backup_id.as_deref(), Some(backup.id.as_str()));
}

#[tokio::test]
async fn clients_with_path_like_ids_are_rejected() {
    let h = Harness::new(Duration::ZERO).await;

    for id in ["../../escaped", "a/../b", ""] {
        let mut client = Client::new("Escaping", vec![Provider::Aws]);
        client.id = id.to_string();
        let err = h.orchestrator.save_client(&client).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)), "{id:?}");
        assert!(h.orchestrator.clients().get(id).await.unwrap().is_none());
    }

    let client = Client::new("Plain", vec![Provider::Aws]);
    h.orchestrator.save_client(&client).await.unwrap();
    assert!(h.orchestrator.clients().get(&client.id).await.unwrap().is_some());
}
