//! Client entity as seen by the orchestrator.
//!
//! Clients are owned by an external system. The orchestrator reads them and
//! only ever writes back `terraform_state` after provisioning jobs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::models::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientStatus {
    #[default]
    Active,
    Paused,
    Suspended,
    Inactive,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Paused => "Paused",
            Self::Suspended => "Suspended",
            Self::Inactive => "Inactive",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TerraformState {
    #[default]
    NotInitialized,
    Initializing,
    Initialized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    #[default]
    Incremental,
    Differential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl BackupFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Monthly => "Monthly",
        }
    }
}

/// Cadence of automated disaster-recovery tests.
///
/// Unrecognised names deserialize as `Monthly`, the default cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DrTestFrequency {
    Weekly,
    Biweekly,
    #[default]
    Monthly,
    Quarterly,
}

impl DrTestFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }

    /// Minimum gap between two automated DR tests.
    pub fn threshold(&self) -> Duration {
        match self {
            Self::Weekly => Duration::days(7),
            Self::Biweekly => Duration::days(14),
            Self::Monthly => Duration::days(30),
            Self::Quarterly => Duration::days(90),
        }
    }
}

impl From<String> for DrTestFrequency {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "weekly" => Self::Weekly,
            "biweekly" | "fortnightly" | "quinzenal" => Self::Biweekly,
            "quarterly" => Self::Quarterly,
            _ => Self::Monthly,
        }
    }
}

impl From<DrTestFrequency> for String {
    fn from(value: DrTestFrequency) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub region: String,
    pub resources: Vec<String>,
    pub backup_vault_name: Option<String>,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            resources: Vec::new(),
            backup_vault_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureSettings {
    pub location: String,
    pub resource_group_name: Option<String>,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            location: "eastus".to_string(),
            resource_group_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpSettings {
    pub project_id: Option<String>,
    pub region: String,
    pub zone: String,
}

impl Default for GcpSettings {
    fn default() -> Self {
        Self {
            project_id: None,
            region: "us-central1".to_string(),
            zone: "us-central1-a".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub backup_type: BackupType,
    pub frequency: BackupFrequency,
    pub retention_days: u32,
    pub start_time: String,
    pub dr_test_frequency: Option<DrTestFrequency>,
    pub recovery_point_objective: String,
    pub recovery_time_objective: String,
    pub aws: AwsSettings,
    pub azure: AzureSettings,
    pub gcp: GcpSettings,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_type: BackupType::default(),
            frequency: BackupFrequency::default(),
            retention_days: 30,
            start_time: "01:00".to_string(),
            dr_test_frequency: Some(DrTestFrequency::Monthly),
            recovery_point_objective: "24h".to_string(),
            recovery_time_objective: "4h".to_string(),
            aws: AwsSettings::default(),
            azure: AzureSettings::default(),
            gcp: GcpSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub status: ClientStatus,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub backup_config: BackupConfig,
    #[serde(default)]
    pub terraform_state: TerraformState,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_environment() -> String {
    "prod".to_string()
}

impl Client {
    pub fn new(name: impl Into<String>, providers: Vec<Provider>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            environment: default_environment(),
            status: ClientStatus::Active,
            providers,
            backup_config: BackupConfig::default(),
            terraform_state: TerraformState::NotInitialized,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled providers in canonical order, without duplicates.
    pub fn enabled_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.providers.contains(p))
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == ClientStatus::Active
    }

    /// Client ids name workspace directories, so each must be one plain path segment.
    pub fn has_valid_id(&self) -> bool {
        is_valid_id(&self.id)
    }

    /// Client name lowercased with every non-alphanumeric character replaced by `-`.
    pub fn slug(&self) -> String {
        self.name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }
}

/// True when `id` can be joined onto a directory without leaving it.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}
