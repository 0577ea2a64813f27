//! Layered daemon configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, `DROVER_*`
//! environment variables (nested keys split on `__`), CLI overrides.

use anyhow::{Result, anyhow};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/drover/config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Provisioning tool executable.
    pub binary: String,
    /// Per-command delay of the simulated engine.
    pub simulated_delay_ms: u64,
    /// Render placeholder cloud credentials into generated workspaces.
    pub dev_credentials: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            simulated_delay_ms: 500,
            dev_credentials: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    /// Use the simulated provider gateway and provisioning engine.
    pub simulation: bool,
    pub rpc_bind: String,
    pub dr_sweep_interval_secs: u64,
    pub verbose: bool,
    pub log_json: bool,
    pub provisioning: ProvisioningConfig,
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/var/lib/drover/workspaces"),
            database_path: PathBuf::from("/var/lib/drover/drover.db"),
            simulation: false,
            rpc_bind: "127.0.0.1:9848".to_string(),
            dr_sweep_interval_secs: 3600,
            verbose: false,
            log_json: false,
            provisioning: ProvisioningConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default config path.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH), overrides)
    }

    /// Load from `path`. A missing file is not an error.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DROVER_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow!("Failed to render configuration: {}", e))
    }
}
