use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{Invocation, ProvisioningCommand, ProvisioningEngine, ProvisioningError, RawOutput};

/// Fabricates plausible tool output without touching any cloud.
///
/// `plan` always reports three additions (exit code 2) so the full
/// plan-then-apply path runs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    pub delay: Duration,
}

impl ProvisioningEngine for SimulatedEngine {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<RawOutput, ProvisioningError>> + Send>> {
        let invocation = invocation.clone();
        let delay = self.delay;

        Box::pin(async move {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Ok(RawOutput {
                        exit_code: Some(130),
                        stdout: String::new(),
                        stderr: "Interrupt received. Gracefully shutting down...".to_string(),
                    });
                }
            }

            let id = &invocation.client_id;
            let stdout = match invocation.command {
                ProvisioningCommand::Init => {
                    "Terraform has been successfully initialized!".to_string()
                }
                ProvisioningCommand::Validate => "Success! The configuration is valid.".to_string(),
                ProvisioningCommand::Plan => {
                    "Plan: 3 to add, 0 to change, 0 to destroy.".to_string()
                }
                ProvisioningCommand::Apply => format!(
                    "aws_backup_vault.main: Creation complete after 2s [id={id}-vault]\n\
                     aws_backup_plan.main: Creation complete after 1s [id={id}-plan]\n\
                     aws_backup_selection.main: Creation complete after 1s [id={id}-selection]\n\
                     Apply complete! Resources: 3 added, 0 changed, 0 destroyed."
                ),
                ProvisioningCommand::Destroy => {
                    "Destroy complete! Resources: 3 destroyed.".to_string()
                }
                ProvisioningCommand::Output => json!({
                    "backup_vault_id": { "value": format!("vault-{id}"), "type": "string" },
                    "backup_plan_id": { "value": format!("plan-{id}"), "type": "string" },
                    "recovery_point_arn": {
                        "value": format!(
                            "arn:aws:backup:us-east-1:000000000000:recovery-point:{id}"
                        ),
                        "type": "string"
                    },
                })
                .to_string(),
            };

            let exit_code = match invocation.command {
                ProvisioningCommand::Plan => 2,
                _ => 0,
            };

            Ok(RawOutput {
                exit_code: Some(exit_code),
                stdout,
                stderr: String::new(),
            })
        })
    }
}
