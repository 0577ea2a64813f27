use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Invocation, ProvisioningEngine, ProvisioningError, RawOutput};
use crate::logging::CommandHeartbeat;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the real provisioning binary as a child process.
pub struct TerraformEngine {
    binary: String,
}

impl TerraformEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ProvisioningEngine for TerraformEngine {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<RawOutput, ProvisioningError>> + Send>> {
        let invocation = invocation.clone();
        let binary = self.binary.clone();

        Box::pin(async move {
            let command = invocation.command;

            let mut child = Command::new(&binary)
                .args(&invocation.args)
                .current_dir(&invocation.workdir)
                .env("TF_IN_AUTOMATION", "true")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ProvisioningError::Spawn { command, source })?;

            let heartbeat = Arc::new(CommandHeartbeat::new(
                &invocation.client_id,
                command.as_str(),
                HEARTBEAT_INTERVAL,
            ));
            let stdout = child
                .stdout
                .take()
                .map(|out| collect_lines(out, "stdout", heartbeat.clone()));
            let stderr = child
                .stderr
                .take()
                .map(|err| collect_lines(err, "stderr", heartbeat.clone()));

            let pid = child.id();
            let mut interrupted = false;

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = cancel.cancelled(), if !interrupted => {
                        interrupted = true;
                        // SIGINT lets the tool release its state lock before exiting.
                        match pid {
                            Some(pid) => {
                                info!(
                                    client_id = %invocation.client_id,
                                    command = %command,
                                    pid,
                                    "Interrupting provisioning command"
                                );
                                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                                    warn!(pid, error = %e, "Failed to signal provisioning command");
                                }
                            }
                            None => debug!("Provisioning command already exited"),
                        }
                    }
                }
            }
            .map_err(|source| ProvisioningError::Spawn { command, source })?;

            let stdout = join_output(stdout).await;
            let stderr = join_output(stderr).await;
            debug!(
                client_id = %invocation.client_id,
                command = %command,
                lines = heartbeat.lines(),
                elapsed_ms = heartbeat.elapsed().as_millis() as u64,
                interrupted,
                "Provisioning command exited"
            );

            Ok(RawOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            })
        })
    }
}

fn collect_lines<R>(
    reader: R,
    stream: &'static str,
    heartbeat: Arc<CommandHeartbeat>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = String::new();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(client_id = heartbeat.client_id(), stream, "{}", line);
                    heartbeat.record_line();
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        client_id = heartbeat.client_id(),
                        stream,
                        error = %e,
                        "Failed to read command output"
                    );
                    break;
                }
            }
        }

        collected
    })
}

async fn join_output(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
