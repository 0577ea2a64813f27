//! Per-provider backup, restore and verification calls.
//!
//! The orchestrator never talks to a cloud directly. Each operation is routed
//! through a `ProviderGateway`, one call per provider, so fan-out and failure
//! classification stay in one place.

mod simulated;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::client::Client;
use crate::core::models::{Job, Provider, RestoreOptions, RestoredResource, VerificationCheck};

pub use simulated::{Operation, SimulatedGateway};

/// A single provider call that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{provider}: {reason}")]
pub struct ProviderError {
    pub provider: Provider,
    pub reason: String,
}

impl ProviderError {
    pub fn new(provider: Provider, reason: impl Into<String>) -> Self {
        Self {
            provider,
            reason: reason.into(),
        }
    }
}

/// What a provider reports after taking a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPayload {
    pub recovery_point_id: String,
    pub data_size_mb: u64,
}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn start_backup(
        &self,
        provider: Provider,
        client: &Client,
    ) -> Result<BackupPayload, ProviderError>;

    async fn start_restore(
        &self,
        provider: Provider,
        client: &Client,
        backup: &Job,
        options: &RestoreOptions,
    ) -> Result<Vec<RestoredResource>, ProviderError>;

    /// Best-effort. Callers log failures and move on.
    async fn cancel_restore(&self, provider: Provider, job: &Job) -> Result<(), ProviderError>;

    async fn run_dr_test(
        &self,
        provider: Provider,
        client: &Client,
        backup: &Job,
        steps: &[String],
    ) -> Result<Vec<VerificationCheck>, ProviderError>;
}
