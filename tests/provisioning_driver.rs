use drover::core::client::BackupType;
use drover::core::models::{JobMetadata, JobType, Provider, Trigger};
use drover::core::provisioning::{
    CommandOptions, ProvisioningCommand, ProvisioningDriver, ProvisioningError, SimulatedEngine,
    TerraformEngine, WorkspaceRelease,
};
use drover::core::{Client, Job};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Write a fake provisioning binary. Every invocation appends its arguments to `calls.log`.
fn fake_binary(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-terraform");
    let log = dir.join("calls.log");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"{}\"\ncase \"$1\" in\n{}\n*) echo \"ok\" ;;\nesac\n",
        log.display(),
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn driver_with(body: &str) -> (TempDir, ProvisioningDriver, Client) {
    let dir = TempDir::new().unwrap();
    let binary = fake_binary(dir.path(), body);
    let engine = Arc::new(TerraformEngine::new(binary.display().to_string()));
    let driver = ProvisioningDriver::new(dir.path().join("workspaces"), engine, true);

    let client = Client::new("Acme Corp", vec![Provider::Aws, Provider::Gcp]);
    driver.generate_config(&client).await.unwrap();
    (dir, driver, client)
}

#[tokio::test]
async fn plan_exit_code_two_reports_changes() {
    let (dir, driver, client) = driver_with(
        "plan) echo \"Plan: 2 to add, 1 to change, 0 to destroy.\"; exit 2 ;;",
    )
    .await;

    let outcome = driver
        .run_command(
            &client.id,
            ProvisioningCommand::Plan,
            CommandOptions {
                plan_out: Some("acme.tfplan".into()),
                vars: BTreeMap::from([("restore_mode".to_string(), "true".to_string())]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.has_changes, Some(true));
    let changes = outcome.changes.unwrap();
    assert_eq!((changes.added, changes.changed, changes.destroyed), (2, 1, 0));

    let calls = calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("plan -detailed-exitcode"));
    assert!(calls[0].contains("-out acme.tfplan"));
    assert!(calls[0].contains("-var restore_mode=true"));
}

#[tokio::test]
async fn plan_exit_code_zero_reports_no_changes() {
    let (_dir, driver, client) = driver_with("plan) echo \"No changes.\" ;;").await;

    let outcome = driver
        .run_command(&client.id, ProvisioningCommand::Plan, CommandOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.has_changes, Some(false));
    assert!(outcome.changes.is_none());
}

#[tokio::test]
async fn nonzero_exit_is_a_command_failure() {
    let (_dir, driver, client) = driver_with(
        "apply) echo \"Error: invalid credentials\" >&2; exit 1 ;;",
    )
    .await;

    let err = driver
        .run_command(
            &client.id,
            ProvisioningCommand::Apply,
            CommandOptions {
                auto_approve: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match err {
        ProvisioningError::CommandFailed { command, code, output } => {
            assert_eq!(command, ProvisioningCommand::Apply);
            assert_eq!(code, Some(1));
            assert!(output.contains("invalid credentials"));
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_workspace_is_rejected_before_spawning() {
    let (dir, driver, _client) = driver_with("").await;

    let err = driver
        .run_command("no-such-client", ProvisioningCommand::Init, CommandOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::UnknownWorkspace(id) if id == "no-such-client"));
    assert!(calls(dir.path()).is_empty());
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(TerraformEngine::new(
        dir.path().join("not-installed").display().to_string(),
    ));
    let driver = ProvisioningDriver::new(dir.path().join("workspaces"), engine, false);
    let client = Client::new("Acme Corp", vec![Provider::Aws]);
    driver.generate_config(&client).await.unwrap();

    let err = driver
        .run_command(&client.id, ProvisioningCommand::Init, CommandOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Spawn { command: ProvisioningCommand::Init, .. }));
}

#[tokio::test]
async fn outputs_are_parsed_from_json() {
    let (_dir, driver, client) = driver_with(
        "output) echo '{\"backup_vault_id\":{\"value\":\"vault-1\",\"type\":\"string\"}}' ;;",
    )
    .await;

    let outputs = driver.parse_outputs(&client.id).await;
    assert_eq!(outputs["backup_vault_id"]["value"], "vault-1");
}

#[tokio::test]
async fn failed_output_command_yields_empty_outputs() {
    let (_dir, driver, client) = driver_with("output) exit 1 ;;").await;

    assert!(driver.parse_outputs(&client.id).await.is_empty());
}

#[tokio::test]
async fn cancel_interrupts_running_command() {
    let (_dir, driver, client) = driver_with("apply) exec sleep 30 ;;").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = timeout(
        Duration::from_secs(10),
        driver.run_command(
            &client.id,
            ProvisioningCommand::Apply,
            CommandOptions {
                auto_approve: true,
                cancel,
                ..Default::default()
            },
        ),
    )
    .await
    .expect("command was not interrupted");

    assert!(matches!(
        result,
        Err(ProvisioningError::CommandFailed { code: None, .. })
    ));
}

#[tokio::test]
async fn generated_config_is_deterministic() {
    let (_dir, driver, client) = driver_with("").await;

    let first = driver.generate_config(&client).await.unwrap();
    let second = driver.generate_config(&client).await.unwrap();

    assert_eq!(first.digest, second.digest);
    assert_eq!(first.providers, vec![Provider::Aws, Provider::Gcp]);
    assert!(driver.has_workspace(&client.id));
}

#[tokio::test]
async fn client_ids_cannot_escape_the_workspace_root() {
    let (dir, driver, _client) = driver_with("").await;

    let mut escaping = Client::new("Escaping", vec![Provider::Aws]);
    escaping.id = "../../escaped".into();
    let err = driver.generate_config(&escaping).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::UnknownWorkspace(_)));
    assert!(!dir.path().join("escaped").exists());

    let err = driver
        .run_command("a/../b", ProvisioningCommand::Plan, CommandOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::UnknownWorkspace(id) if id == "a/../b"));
    assert!(!driver.has_workspace(".."));
    assert!(calls(dir.path()).is_empty());
}

fn restore_fixture(dir: &Path) -> (ProvisioningDriver, Client, Job) {
    let driver = ProvisioningDriver::new(
        dir.join("workspaces"),
        Arc::new(SimulatedEngine::default()),
        true,
    );
    let client = Client::new("Acme Corp", vec![Provider::Aws]);
    let backup = Job::new(
        &client.id,
        JobType::Backup,
        Trigger::Automated,
        JobMetadata::Backup {
            backup_type: BackupType::Full,
        },
    );
    (driver, client, backup)
}

#[tokio::test]
async fn restore_workspace_without_state_is_removed() {
    let dir = TempDir::new().unwrap();
    let (driver, client, backup) = restore_fixture(dir.path());

    let workspace = driver
        .prepare_restore_workspace(&client, &backup, "job-1", CancellationToken::new())
        .await
        .unwrap();
    assert!(workspace.path.is_dir());

    let released = driver.release_restore_workspace(&client.id, "job-1").await.unwrap();
    assert_eq!(released, WorkspaceRelease::Removed);
    assert!(!workspace.path.exists());

    let released = driver.release_restore_workspace(&client.id, "job-1").await.unwrap();
    assert_eq!(released, WorkspaceRelease::Missing);
}

#[tokio::test]
async fn restore_workspace_with_state_keeps_it_for_teardown() {
    let dir = TempDir::new().unwrap();
    let (driver, client, backup) = restore_fixture(dir.path());

    let workspace = driver
        .prepare_restore_workspace(&client, &backup, "job-2", CancellationToken::new())
        .await
        .unwrap();
    let state = workspace.path.join("state");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(state.join("restore.tfstate"), "{}").unwrap();
    std::fs::create_dir_all(workspace.path.join(".terraform/providers")).unwrap();

    let released = driver.release_restore_workspace(&client.id, "job-2").await.unwrap();
    assert_eq!(released, WorkspaceRelease::Pruned);
    assert!(state.join("restore.tfstate").is_file());
    assert!(workspace.path.join("main.tf").is_file());
    assert!(!workspace.path.join(".terraform").exists());
}
