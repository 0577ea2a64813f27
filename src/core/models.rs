use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::client::BackupType;
use super::provisioning::ChangeSummary;

/// Environment name that routes a restore onto the production path.
pub const PRODUCTION_ENVIRONMENT: &str = "production";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Gcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Some(Self::Aws),
            "azure" => Some(Self::Azure),
            "gcp" => Some(Self::Gcp),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Backup,
    Restore,
    DrTest,
    ProvisionInit,
    ProvisionUpdate,
    ProvisionDestroy,
    ProvisionRestore,
}

impl JobType {
    pub const PROVISIONING: [JobType; 4] = [
        JobType::ProvisionInit,
        JobType::ProvisionUpdate,
        JobType::ProvisionDestroy,
        JobType::ProvisionRestore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::DrTest => "dr_test",
            Self::ProvisionInit => "provision_init",
            Self::ProvisionUpdate => "provision_update",
            Self::ProvisionDestroy => "provision_destroy",
            Self::ProvisionRestore => "provision_restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            "dr_test" => Some(Self::DrTest),
            "provision_init" => Some(Self::ProvisionInit),
            "provision_update" => Some(Self::ProvisionUpdate),
            "provision_destroy" => Some(Self::ProvisionDestroy),
            "provision_restore" => Some(Self::ProvisionRestore),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Pending -> Running -> {Success | PartialSuccess | Failed | Cancelled}`.
/// Provisioning jobs may pass through `PlanningCompleted`, a sub-state of
/// `Running` reached after a plan that found changes and before apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    PlanningCompleted,
    Success,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::PlanningCompleted,
        JobStatus::Success,
        JobStatus::PartialSuccess,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const IN_FLIGHT: [JobStatus; 3] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::PlanningCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::PlanningCompleted => "PlanningCompleted",
            Self::Success => "Success",
            Self::PartialSuccess => "PartialSuccess",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "PlanningCompleted" => Some(Self::PlanningCompleted),
            "Success" => Some(Self::Success),
            "PartialSuccess" => Some(Self::PartialSuccess),
            "Failed" => Some(Self::Failed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::PartialSuccess | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::PlanningCompleted) => true,
            (Self::Running | Self::PlanningCompleted, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Every state from which `next` is reachable in one step.
    pub fn predecessors(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Automated,
}

/// Which resources a restore should bring back.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSelector {
    #[default]
    All,
    Only(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrTestKind {
    Automated,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreMetadata {
    pub target_environment: String,
    pub isolated: bool,
    pub resources: ResourceSelector,
    pub recovery_point: Option<DateTime<Utc>>,
    pub estimated_minutes: u64,
    pub description: String,
    pub priority: String,
    pub initiated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrTestMetadata {
    pub test_type: DrTestKind,
    pub verification_steps: Vec<String>,
    pub target_environment: String,
    pub recovery_point_objective: String,
    pub recovery_time_objective: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProvisionMetadata {
    #[serde(default)]
    pub plan_changes: Option<ChangeSummary>,
    #[serde(default)]
    pub restore_backup_id: Option<String>,
}

/// Type-specific parameters captured when a job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobMetadata {
    Backup { backup_type: BackupType },
    Restore(RestoreMetadata),
    DrTest(DrTestMetadata),
    Provision(ProvisionMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub provider: Provider,
    pub recovery_point_id: String,
    pub data_size_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub recovery_points: Vec<RecoveryPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredResource {
    pub id: String,
    #[serde(default, rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default = "default_resource_status")]
    pub status: String,
}

fn default_resource_status() -> String {
    "created".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRestore {
    pub provider: Provider,
    pub restored_resources: Vec<RestoredResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    pub isolated: bool,
    #[serde(default)]
    pub terraform_output: Option<String>,
    #[serde(default)]
    pub restored_resources: Vec<RestoredResource>,
    #[serde(default)]
    pub successes: Vec<ProviderRestore>,
    #[serde(default)]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub provider: Provider,
    pub step: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrTestResult {
    pub checks: Vec<VerificationCheck>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub changes: Option<ChangeSummary>,
    pub has_changes: Option<bool>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub config_digest: Option<String>,
}

/// Terminal payload recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Backup(BackupResult),
    Restore(RestoreResult),
    DrTest(DrTestResult),
    Provision(ProvisionResult),
}

/// A tracked unit of asynchronous work owned by one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub provider: Option<Provider>,
    /// Id of the Backup job this job exercises. Resolved through the store.
    pub source_backup_id: Option<String>,
    pub is_automated: bool,
    pub is_manual: bool,
    /// Megabytes.
    pub data_size: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub metadata: JobMetadata,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(
        client_id: impl Into<String>,
        job_type: JobType,
        trigger: Trigger,
        metadata: JobMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            client_id: client_id.into(),
            job_type,
            status: JobStatus::Pending,
            provider: None,
            source_backup_id: None,
            is_automated: trigger == Trigger::Automated,
            is_manual: trigger == Trigger::Manual,
            data_size: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            metadata,
            result: None,
            error_message: None,
        }
    }

    pub fn with_source_backup(mut self, backup: &Job) -> Self {
        self.source_backup_id = Some(backup.id.clone());
        self.provider = backup.provider;
        self
    }

    pub fn restore_metadata(&self) -> Option<&RestoreMetadata> {
        match &self.metadata {
            JobMetadata::Restore(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn dr_test_metadata(&self) -> Option<&DrTestMetadata> {
        match &self.metadata {
            JobMetadata::DrTest(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn backup_result(&self) -> Option<&BackupResult> {
        match &self.result {
            Some(JobResult::Backup(result)) => Some(result),
            _ => None,
        }
    }

    pub fn restore_result(&self) -> Option<&RestoreResult> {
        match &self.result {
            Some(JobResult::Restore(result)) => Some(result),
            _ => None,
        }
    }

    /// Whole minutes between start and completion, when both are known.
    pub fn duration_minutes(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some(((end - start).num_seconds() as f64 / 60.0).round() as i64)
            }
            _ => None,
        }
    }
}

/// Caller-supplied parameters for a restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub target_environment: Option<String>,
    pub resources: Option<ResourceSelector>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub initiated_by: Option<String>,
    pub force_trust_old_backup: bool,
    pub skip_validation_check: bool,
    pub target_resource_group: Option<String>,
    pub target_vpc: Option<String>,
    pub target_subnet: Option<String>,
    pub point_in_time_recovery: Option<DateTime<Utc>>,
}

impl RestoreOptions {
    pub fn production() -> Self {
        Self {
            target_environment: Some(PRODUCTION_ENVIRONMENT.to_string()),
            ..Default::default()
        }
    }

    pub fn isolated(environment: impl Into<String>) -> Self {
        Self {
            target_environment: Some(environment.into()),
            ..Default::default()
        }
    }

    pub fn environment(&self) -> &str {
        self.target_environment
            .as_deref()
            .unwrap_or(PRODUCTION_ENVIRONMENT)
    }

    pub fn is_isolated(&self) -> bool {
        self.environment() != PRODUCTION_ENVIRONMENT
    }
}

/// Caller-supplied parameters for a manual DR test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrTestParameters {
    pub verification_steps: Option<Vec<String>>,
    pub target_environment: Option<String>,
}

pub const DEFAULT_VERIFICATION_STEPS: [&str; 3] = ["integrity", "access", "restore"];
