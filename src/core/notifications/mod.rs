mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::models::{JobStatus, JobType};

/// Events that trigger notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        job_id: String,
        client_id: String,
        job_type: JobType,
    },
    /// Success or PartialSuccess.
    Completed {
        job_id: String,
        client_id: String,
        job_type: JobType,
        status: JobStatus,
        duration_secs: i64,
        detail: Option<String>,
    },
    Failed {
        job_id: String,
        client_id: String,
        job_type: JobType,
        error: String,
    },
}

/// Trait for notification channel implementations (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
        }
    }
}
