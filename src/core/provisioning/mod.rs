//! Provisioning driver.
//!
//! Renders a client's infrastructure description into an isolated workspace
//! and drives the provisioning tool through a fixed command protocol:
//! `init | plan | apply | destroy | validate | output`.
//!
//! Engines only run a command and hand back its raw exit code and streams.
//! Exit-code semantics (`plan` exiting 2 means "changes present") and output
//! parsing live here so every engine gets them.

mod output;
mod simulated;
mod terraform;
pub mod workspace;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProvisioningConfig;
use crate::core::client::{Client, is_valid_id};
use crate::core::models::{Job, Provider};

pub use output::{
    ChangeSummary, parse_change_summary, parse_output_values, parse_restored_resources,
};
pub use simulated::SimulatedEngine;
pub use terraform::TerraformEngine;
pub use workspace::{RenderSettings, RestoreVars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningCommand {
    Init,
    Plan,
    Apply,
    Destroy,
    Validate,
    Output,
}

impl ProvisioningCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Validate => "validate",
            Self::Output => "output",
        }
    }

    fn accepts_vars(&self) -> bool {
        matches!(self, Self::Plan | Self::Apply | Self::Destroy)
    }
}

impl fmt::Display for ProvisioningCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("No provisioning workspace for client {0}")]
    UnknownWorkspace(String),
    #[error("Failed to prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn provisioning command `{command}`: {source}")]
    Spawn {
        command: ProvisioningCommand,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "Provisioning command `{command}` failed with exit code {}: {output}",
        exit_code(.code)
    )]
    CommandFailed {
        command: ProvisioningCommand,
        code: Option<i32>,
        output: String,
    },
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub auto_approve: bool,
    /// `plan -out <file>`
    pub plan_out: Option<String>,
    /// Saved plan for `apply`. Variables are baked into it, so `vars` is ignored.
    pub plan_file: Option<String>,
    pub vars: BTreeMap<String, String>,
    /// Interrupts the child process when cancelled.
    pub cancel: CancellationToken,
}

/// A fully resolved command ready for an engine.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub client_id: String,
    pub workdir: PathBuf,
    pub command: ProvisioningCommand,
    pub args: Vec<String>,
}

/// What an engine observed.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Interpreted result of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub command: ProvisioningCommand,
    pub output: String,
    pub changes: Option<ChangeSummary>,
    /// Only meaningful for `plan`.
    pub has_changes: Option<bool>,
}

pub trait ProvisioningEngine: Send + Sync {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<RawOutput, ProvisioningError>> + Send>>;
}

pub fn create_engine(config: &ProvisioningConfig, simulation: bool) -> Arc<dyn ProvisioningEngine> {
    if simulation {
        Arc::new(SimulatedEngine {
            delay: Duration::from_millis(config.simulated_delay_ms),
        })
    } else {
        Arc::new(TerraformEngine::new(config.binary.clone()))
    }
}

/// Build the argument vector for a command.
pub fn build_args(command: ProvisioningCommand, options: &CommandOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![command.as_str().to_string()];

    match command {
        ProvisioningCommand::Init => args.push("-input=false".into()),
        ProvisioningCommand::Plan => {
            args.extend(["-detailed-exitcode", "-input=false", "-no-color"].map(String::from));
            if let Some(out) = &options.plan_out {
                args.extend(["-out".to_string(), out.clone()]);
            }
        }
        ProvisioningCommand::Apply | ProvisioningCommand::Destroy => {
            args.extend(["-input=false", "-no-color"].map(String::from));
            if options.auto_approve {
                args.push("-auto-approve".into());
            }
        }
        ProvisioningCommand::Output => args.push("-json".into()),
        ProvisioningCommand::Validate => args.push("-no-color".into()),
    }

    let uses_saved_plan = command == ProvisioningCommand::Apply && options.plan_file.is_some();
    if command.accepts_vars() && !uses_saved_plan {
        for (key, value) in &options.vars {
            args.extend(["-var".to_string(), format!("{key}={value}")]);
        }
    }

    if command == ProvisioningCommand::Apply {
        if let Some(plan) = &options.plan_file {
            args.push(plan.clone());
        }
    }

    args
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Apply the command protocol's exit-code rules to a raw result.
pub fn interpret(
    command: ProvisioningCommand,
    raw: RawOutput,
) -> Result<CommandOutcome, ProvisioningError> {
    let parses_summary = matches!(command, ProvisioningCommand::Plan | ProvisioningCommand::Apply);

    if command == ProvisioningCommand::Plan && raw.exit_code == Some(2) {
        return Ok(CommandOutcome {
            command,
            changes: parse_change_summary(&raw.stdout),
            has_changes: Some(true),
            output: raw.stdout,
        });
    }

    if raw.exit_code != Some(0) {
        let output = if raw.stderr.trim().is_empty() {
            raw.stdout
        } else {
            raw.stderr
        };
        return Err(ProvisioningError::CommandFailed {
            command,
            code: raw.exit_code,
            output: output.trim().to_string(),
        });
    }

    Ok(CommandOutcome {
        command,
        changes: parses_summary
            .then(|| parse_change_summary(&raw.stdout))
            .flatten(),
        has_changes: (command == ProvisioningCommand::Plan).then_some(false),
        output: raw.stdout,
    })
}

/// Result of rendering a client workspace.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedWorkspace {
    pub path: PathBuf,
    pub providers: Vec<Provider>,
    pub digest: String,
}

/// Drives the provisioning tool for client workspaces.
///
/// Each client owns `<root>/clients/<client_id>`. Ephemeral restore
/// workspaces live under `<root>/clients/<client_id>/restores/<job_id>`.
pub struct ProvisioningDriver {
    root: PathBuf,
    engine: Arc<dyn ProvisioningEngine>,
    dev_credentials: bool,
}

impl ProvisioningDriver {
    pub fn new(
        root: impl Into<PathBuf>,
        engine: Arc<dyn ProvisioningEngine>,
        dev_credentials: bool,
    ) -> Self {
        Self {
            root: root.into(),
            engine,
            dev_credentials,
        }
    }

    /// Ids that would resolve outside `<root>/clients` have no workspace.
    pub fn workspace_path(&self, client_id: &str) -> Result<PathBuf, ProvisioningError> {
        if !is_valid_id(client_id) {
            return Err(ProvisioningError::UnknownWorkspace(client_id.to_string()));
        }
        Ok(self.root.join("clients").join(client_id))
    }

    pub fn restore_workspace_path(
        &self,
        client_id: &str,
        job_id: &str,
    ) -> Result<PathBuf, ProvisioningError> {
        let client_dir = self.workspace_path(client_id)?;
        if !is_valid_id(job_id) {
            return Err(ProvisioningError::UnknownWorkspace(format!("{client_id}/{job_id}")));
        }
        Ok(client_dir.join("restores").join(job_id))
    }

    pub fn has_workspace(&self, client_id: &str) -> bool {
        self.workspace_path(client_id).is_ok_and(|path| path.is_dir())
    }

    fn render_settings(&self, state_file: String) -> RenderSettings {
        RenderSettings {
            modules_dir: self.root.join("modules"),
            state_file,
            dev_credentials: self.dev_credentials,
        }
    }

    /// Render the client's configuration into its workspace.
    pub async fn generate_config(
        &self,
        client: &Client,
    ) -> Result<GeneratedWorkspace, ProvisioningError> {
        let path = self.workspace_path(&client.id)?;
        let settings = self.render_settings(format!("state/{}.tfstate", client.id));
        let rendered = workspace::render(client, &settings, None, Utc::now());

        rendered
            .write_to(&path)
            .await
            .map_err(|source| ProvisioningError::Workspace {
                path: path.clone(),
                source,
            })?;

        info!(client_id = %client.id, path = %path.display(), "Generated provisioning workspace");

        Ok(GeneratedWorkspace {
            path,
            providers: client.enabled_providers(),
            digest: rendered.digest(),
        })
    }

    /// Render and initialise an ephemeral workspace that provisions from the
    /// backup's recovery point.
    pub async fn prepare_restore_workspace(
        &self,
        client: &Client,
        backup: &Job,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Result<GeneratedWorkspace, ProvisioningError> {
        let path = self.restore_workspace_path(&client.id, job_id)?;
        let vars = RestoreVars {
            backup_id: backup.id.clone(),
            recovery_point_arn: recovery_point_arn(backup),
        };
        let settings = self.render_settings(format!("state/{}-restore.tfstate", client.id));
        let rendered = workspace::render(client, &settings, Some(&vars), Utc::now());

        rendered
            .write_to(&path)
            .await
            .map_err(|source| ProvisioningError::Workspace {
                path: path.clone(),
                source,
            })?;

        self.run_in(
            &client.id,
            &path,
            ProvisioningCommand::Init,
            CommandOptions {
                cancel,
                ..Default::default()
            },
        )
        .await?;

        Ok(GeneratedWorkspace {
            path,
            providers: client.enabled_providers(),
            digest: rendered.digest(),
        })
    }

    /// Drop what an isolated restore no longer needs once its job is terminal.
    ///
    /// A workspace that never produced state is removed outright. One that
    /// did keeps its configuration and state so the environment can still be
    /// destroyed, and only loses the `.terraform` plugin cache.
    pub async fn release_restore_workspace(
        &self,
        client_id: &str,
        job_id: &str,
    ) -> Result<WorkspaceRelease, ProvisioningError> {
        let path = self.restore_workspace_path(client_id, job_id)?;
        if !path.is_dir() {
            return Ok(WorkspaceRelease::Missing);
        }

        if has_state(&path.join("state")).await {
            let cache = path.join(".terraform");
            if cache.is_dir() {
                tokio::fs::remove_dir_all(&cache)
                    .await
                    .map_err(workspace_error(&cache))?;
            }
            info!(client_id, job_id, path = %path.display(), "Pruned restore workspace");
            Ok(WorkspaceRelease::Pruned)
        } else {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(workspace_error(&path))?;
            info!(client_id, job_id, path = %path.display(), "Removed restore workspace");
            Ok(WorkspaceRelease::Removed)
        }
    }

    /// Run a command in the client's workspace.
    pub async fn run_command(
        &self,
        client_id: &str,
        command: ProvisioningCommand,
        options: CommandOptions,
    ) -> Result<CommandOutcome, ProvisioningError> {
        let path = self.workspace_path(client_id)?;
        if !path.is_dir() {
            return Err(ProvisioningError::UnknownWorkspace(client_id.to_string()));
        }
        self.run_in(client_id, &path, command, options).await
    }

    /// Run a command in an explicit workspace directory.
    pub async fn run_in(
        &self,
        client_id: &str,
        workdir: &Path,
        command: ProvisioningCommand,
        options: CommandOptions,
    ) -> Result<CommandOutcome, ProvisioningError> {
        let invocation = Invocation {
            client_id: client_id.to_string(),
            workdir: workdir.to_path_buf(),
            command,
            args: build_args(command, &options),
        };

        info!(
            client_id = %client_id,
            command = %command,
            args = ?invocation.args,
            "Running provisioning command"
        );

        let raw = self.engine.execute(&invocation, options.cancel.clone()).await?;
        let exit_code = raw.exit_code;
        let outcome = interpret(command, raw);

        match &outcome {
            Ok(result) => info!(
                client_id = %client_id,
                command = %command,
                exit_code = ?exit_code,
                changes = ?result.changes,
                "Provisioning command finished"
            ),
            Err(e) => warn!(
                client_id = %client_id,
                command = %command,
                error = %e,
                "Provisioning command failed"
            ),
        }

        outcome
    }

    /// Read the workspace outputs. Never fails: outputs are telemetry.
    pub async fn parse_outputs(&self, client_id: &str) -> HashMap<String, Value> {
        match self
            .run_command(client_id, ProvisioningCommand::Output, CommandOptions::default())
            .await
        {
            Ok(outcome) => parse_output_values(&outcome.output),
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Could not read provisioning outputs");
                HashMap::new()
            }
        }
    }
}

/// What `release_restore_workspace` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceRelease {
    Missing,
    /// Nothing was provisioned; the directory is gone.
    Removed,
    /// State kept for a later destroy.
    Pruned,
}

fn workspace_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisioningError {
    let path = path.to_path_buf();
    move |source| ProvisioningError::Workspace { path, source }
}

async fn has_state(dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    matches!(entries.next_entry().await, Ok(Some(_)))
}

/// Recovery point a restore should provision from.
pub fn recovery_point_arn(backup: &Job) -> String {
    backup
        .backup_result()
        .and_then(|r| r.recovery_points.first())
        .map(|p| p.recovery_point_id.clone())
        .unwrap_or_else(|| format!("recovery-point-{}", backup.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(code: i32, stdout: &str, stderr: &str) -> RawOutput {
        RawOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn plan_exit_code_two_means_changes() {
        let outcome = interpret(
            ProvisioningCommand::Plan,
            raw(2, "Plan: 3 to add, 0 to change, 0 to destroy.", ""),
        )
        .unwrap();

        assert_eq!(outcome.has_changes, Some(true));
        assert_eq!(outcome.changes.unwrap().added, 3);
    }

    #[test]
    fn plan_exit_code_zero_means_no_changes() {
        let outcome = interpret(ProvisioningCommand::Plan, raw(0, "No changes.", "")).unwrap();
        assert_eq!(outcome.has_changes, Some(false));
        assert_eq!(outcome.changes, None);
    }

    #[test]
    fn exit_code_two_is_an_error_outside_plan() {
        let err = interpret(ProvisioningCommand::Apply, raw(2, "", "boom")).unwrap_err();
        assert!(matches!(err, ProvisioningError::CommandFailed { code: Some(2), .. }));
    }

    #[test]
    fn failure_prefers_stderr_then_stdout() {
        let first = raw(1, "stdout detail", "Error: bad");
        let err = interpret(ProvisioningCommand::Plan, first).unwrap_err();
        match err {
            ProvisioningError::CommandFailed { output, .. } => assert_eq!(output, "Error: bad"),
            other => panic!("unexpected error: {other}"),
        }

        let err = interpret(ProvisioningCommand::Init, raw(1, "stdout detail", "  ")).unwrap_err();
        match err {
            ProvisioningError::CommandFailed { output, .. } => assert_eq!(output, "stdout detail"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn killed_process_is_an_error() {
        let killed = RawOutput {
            exit_code: None,
            ..Default::default()
        };
        assert!(interpret(ProvisioningCommand::Validate, killed).is_err());
    }

    #[test]
    fn summary_only_parsed_for_plan_and_apply() {
        let out = "Plan: 1 to add, 0 to change, 0 to destroy.";
        let outcome = interpret(ProvisioningCommand::Destroy, raw(0, out, "")).unwrap();
        assert_eq!(outcome.changes, None);
        assert_eq!(outcome.has_changes, None);
    }

    #[test]
    fn args_for_plan_include_vars_and_plan_file() {
        let mut options = CommandOptions {
            plan_out: Some("c1-plan.tfplan".into()),
            ..Default::default()
        };
        options.vars.insert("backup_id".into(), "b-1".into());

        let args = build_args(ProvisioningCommand::Plan, &options);
        assert_eq!(args[0], "plan");
        assert!(args.contains(&"-detailed-exitcode".to_string()));
        assert!(args.windows(2).any(|w| w == ["-out", "c1-plan.tfplan"]));
        assert!(args.windows(2).any(|w| w == ["-var", "backup_id=b-1"]));
    }

    #[test]
    fn apply_with_saved_plan_drops_vars() {
        let mut options = CommandOptions {
            auto_approve: true,
            plan_file: Some("c1-plan.tfplan".into()),
            ..Default::default()
        };
        options.vars.insert("restore_mode".into(), "true".into());

        let args = build_args(ProvisioningCommand::Apply, &options);
        assert!(args.contains(&"-auto-approve".to_string()));
        assert!(!args.contains(&"-var".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("c1-plan.tfplan"));
    }

    #[test]
    fn output_requests_json() {
        let args = build_args(ProvisioningCommand::Output, &CommandOptions::default());
        assert_eq!(args, vec!["output", "-json"]);
    }
}
