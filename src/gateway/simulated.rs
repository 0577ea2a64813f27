use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::{BackupPayload, ProviderError, ProviderGateway};
use crate::core::client::Client;
use crate::core::models::{Job, Provider, RestoreOptions, RestoredResource, VerificationCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Backup,
    Restore,
    CancelRestore,
    DrTest,
}

/// In-process gateway returning deterministic payloads.
///
/// Failures can be injected per provider and operation, which is how the
/// partial-success paths are exercised without any cloud account.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    latency: Duration,
    failures: Mutex<HashSet<(Provider, Operation)>>,
}

impl SimulatedGateway {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail(&self, provider: Provider, operation: Operation) {
        self.failures().insert((provider, operation));
    }

    pub fn heal(&self, provider: Provider, operation: Operation) {
        self.failures().remove(&(provider, operation));
    }

    fn failures(&self) -> MutexGuard<'_, HashSet<(Provider, Operation)>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn call(&self, provider: Provider, operation: Operation) -> Result<(), ProviderError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.failures().contains(&(provider, operation)) {
            debug!(%provider, ?operation, "Injected provider failure");
            return Err(ProviderError::new(
                provider,
                format!("simulated {operation:?} failure"),
            ));
        }
        Ok(())
    }
}

fn restored_type(provider: Provider) -> &'static str {
    match provider {
        Provider::Aws => "aws_backup_restore_job",
        Provider::Azure => "azurerm_backup_protected_vm",
        Provider::Gcp => "google_compute_disk",
    }
}

#[async_trait]
impl ProviderGateway for SimulatedGateway {
    async fn start_backup(
        &self,
        provider: Provider,
        client: &Client,
    ) -> Result<BackupPayload, ProviderError> {
        self.call(provider, Operation::Backup).await?;
        Ok(BackupPayload {
            recovery_point_id: format!("rp-{}-{}", provider, client.slug()),
            data_size_mb: 1024,
        })
    }

    async fn start_restore(
        &self,
        provider: Provider,
        client: &Client,
        backup: &Job,
        _options: &RestoreOptions,
    ) -> Result<Vec<RestoredResource>, ProviderError> {
        self.call(provider, Operation::Restore).await?;
        let short = &backup.id[..8.min(backup.id.len())];
        Ok(vec![RestoredResource {
            id: format!("{}-{}-restore-{}", client.slug(), provider, short),
            resource_type: restored_type(provider).to_string(),
            provider: Some(provider),
            status: "created".to_string(),
        }])
    }

    async fn cancel_restore(&self, provider: Provider, _job: &Job) -> Result<(), ProviderError> {
        self.call(provider, Operation::CancelRestore).await
    }

    async fn run_dr_test(
        &self,
        provider: Provider,
        _client: &Client,
        backup: &Job,
        steps: &[String],
    ) -> Result<Vec<VerificationCheck>, ProviderError> {
        self.call(provider, Operation::DrTest).await?;
        Ok(steps
            .iter()
            .map(|step| VerificationCheck {
                provider,
                step: step.clone(),
                passed: true,
                detail: format!("{step} verified against backup {}", backup.id),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_are_per_provider_and_operation() {
        let gateway = SimulatedGateway::default();
        let client = Client::new("Acme", vec![Provider::Aws, Provider::Gcp]);
        gateway.fail(Provider::Gcp, Operation::Backup);

        assert!(gateway.start_backup(Provider::Aws, &client).await.is_ok());
        let err = gateway.start_backup(Provider::Gcp, &client).await.unwrap_err();
        assert_eq!(err.provider, Provider::Gcp);

        gateway.heal(Provider::Gcp, Operation::Backup);
        assert!(gateway.start_backup(Provider::Gcp, &client).await.is_ok());
    }
}
