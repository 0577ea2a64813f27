use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::notifications::create_notifier;
use crate::core::provisioning::create_engine;
use crate::core::{DrCadenceScheduler, JobOrchestrator, ProgressTracker, ProvisioningDriver};
use crate::db::SqliteStore;
use crate::gateway::{ProviderGateway, SimulatedGateway};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub orchestrator: JobOrchestrator,
    pub scheduler: Arc<DrCadenceScheduler>,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig, store: SqliteStore, gateway: Arc<dyn ProviderGateway>) -> Self {
        let engine = create_engine(&config.provisioning, config.simulation);
        let driver = ProvisioningDriver::new(
            config.workspace_root.clone(),
            engine,
            config.provisioning.dev_credentials,
        );
        let store = Arc::new(store);
        let progress = ProgressTracker::new();

        let orchestrator = JobOrchestrator::new(
            store.clone(),
            store,
            gateway,
            Arc::new(driver),
            progress.clone(),
        )
        .with_notifier(create_notifier(&config.notifications));
        let scheduler = Arc::new(DrCadenceScheduler::new(orchestrator.clone()));

        Self {
            config: Arc::new(config),
            orchestrator,
            scheduler,
            progress,
        }
    }

    /// Open the configured database and wire the daemon's collaborators.
    pub async fn open(config: AppConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::create_dir_all(&config.workspace_root)
            .with_context(|| format!("Failed to create {}", config.workspace_root.display()))?;

        let store = SqliteStore::open(&config.database_path).await?;
        let latency = if config.simulation {
            Duration::from_millis(config.provisioning.simulated_delay_ms)
        } else {
            Duration::ZERO
        };
        let gateway: Arc<dyn ProviderGateway> = Arc::new(SimulatedGateway::new(latency));

        Ok(Self::new(config, store, gateway))
    }
}
