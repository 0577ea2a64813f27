//! Periodic sweep that schedules automated DR tests per client cadence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{Client, DrTestFrequency};
use super::models::JobType;
use super::orchestrator::JobOrchestrator;
use crate::db::{ClientStore, JobFilter, JobSort, JobStore};
use crate::error::Result;

/// Whether enough time has passed since the last automated test.
///
/// A client that never had one is always due.
pub fn is_dr_test_due(
    frequency: DrTestFrequency,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match last {
        None => true,
        Some(last) => now - last > frequency.threshold(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledDrTest {
    pub job_id: String,
    pub client_id: String,
    pub source_backup_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedClient {
    pub client_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scheduled: Vec<ScheduledDrTest>,
    pub count: usize,
    pub skipped: Vec<SkippedClient>,
}

pub struct DrCadenceScheduler {
    orchestrator: JobOrchestrator,
    clients: Arc<dyn ClientStore>,
    jobs: Arc<dyn JobStore>,
}

enum Decision {
    NotDue,
    Scheduled(ScheduledDrTest),
    Skipped(String),
}

impl DrCadenceScheduler {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        Self {
            clients: orchestrator.clients().clone(),
            jobs: orchestrator.jobs().clone(),
            orchestrator,
        }
    }

    pub async fn schedule_periodic_dr_tests(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over every active client with a cadence.
    ///
    /// Only a failure to list clients fails the sweep. Per-client errors are
    /// reported as skipped.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let clients = self.clients.list_active_with_dr_frequency().await?;
        let mut report = SweepReport::default();

        for client in clients {
            match self.consider(&client, now).await {
                Ok(Decision::NotDue) => debug!(client_id = %client.id, "DR test not due"),
                Ok(Decision::Scheduled(scheduled)) => report.scheduled.push(scheduled),
                Ok(Decision::Skipped(reason)) => {
                    info!(client_id = %client.id, reason = %reason, "Skipping DR test");
                    report.skipped.push(SkippedClient {
                        client_id: client.id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!(client_id = %client.id, error = %e, "Failed to schedule DR test");
                    report.skipped.push(SkippedClient {
                        client_id: client.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.count = report.scheduled.len();
        info!(
            scheduled = report.count,
            skipped = report.skipped.len(),
            "DR cadence sweep complete"
        );
        Ok(report)
    }

    async fn consider(&self, client: &Client, now: DateTime<Utc>) -> Result<Decision> {
        let frequency = client.backup_config.dr_test_frequency.unwrap_or_default();
        let filter = JobFilter::for_client(&client.id)
            .of_type(JobType::DrTest)
            .automated(true);
        let last = self.jobs.find_one(&filter, JobSort::CreatedDesc).await?;

        if !is_dr_test_due(frequency, last.map(|j| j.created_at), now) {
            return Ok(Decision::NotDue);
        }

        let Some(backup) = self.orchestrator.latest_successful_backup(&client.id).await? else {
            return Ok(Decision::Skipped("No successful backups available".to_string()));
        };

        let handle = self.orchestrator.schedule_client_dr_test(client, &backup).await?;
        Ok(Decision::Scheduled(ScheduledDrTest {
            job_id: handle.job_id,
            client_id: client.id.clone(),
            source_backup_id: handle.source_backup_id,
        }))
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep runs immediately.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DR cadence scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_periodic_dr_tests().await {
                        error!(error = %e, "DR cadence sweep failed");
                    }
                }
            }
        }
    }
}
