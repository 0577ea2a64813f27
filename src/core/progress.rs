//! In-memory progress tracking for active jobs.
//!
//! Phases are updated as a job body moves through its steps but are NOT
//! persisted. Only state transitions are written to the database.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::Provider;
use super::provisioning::ProvisioningCommand;

/// What an in-flight job is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Provisioning { command: ProvisioningCommand },
    AwaitingProviders { providers: Vec<Provider> },
    Verifying { providers: Vec<Provider> },
}

/// Thread-safe in-memory store for active job phases.
///
/// Shared across the application via `AppContext`.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, JobPhase>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn update(&self, job_id: &str, phase: JobPhase) {
        let mut map = self.inner.write().await;
        map.insert(job_id.to_string(), phase);
    }

    pub async fn get(&self, job_id: &str) -> Option<JobPhase> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// Remove a job from tracking (called when the job reaches a terminal state).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    pub async fn get_all(&self) -> HashMap<String, JobPhase> {
        let map = self.inner.read().await;
        map.clone()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_phase_changes() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get("job-1").await.is_none());

        tracker.update("job-1", JobPhase::Queued).await;
        tracker
            .update(
                "job-1",
                JobPhase::Provisioning {
                    command: ProvisioningCommand::Plan,
                },
            )
            .await;

        assert_eq!(tracker.active_count().await, 1);
        assert_eq!(
            tracker.get("job-1").await,
            Some(JobPhase::Provisioning {
                command: ProvisioningCommand::Plan
            })
        );

        tracker.remove("job-1").await;
        assert!(tracker.get("job-1").await.is_none());
    }

    #[tokio::test]
    async fn lists_multiple_jobs() {
        let tracker = ProgressTracker::new();
        tracker.update("job-1", JobPhase::Queued).await;
        tracker
            .update(
                "job-2",
                JobPhase::AwaitingProviders {
                    providers: vec![Provider::Aws, Provider::Gcp],
                },
            )
            .await;

        let all = tracker.get_all().await;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("job-2"));

        let json = serde_json::to_value(&all["job-2"]).unwrap();
        assert_eq!(json["phase"], "awaiting_providers");
    }
}
