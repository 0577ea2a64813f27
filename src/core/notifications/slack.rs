use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::models::{JobStatus, JobType};

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

fn title(job_type: JobType) -> &'static str {
    match job_type {
        JobType::Backup => "Backup",
        JobType::Restore => "Restore",
        JobType::DrTest => "DR Test",
        JobType::ProvisionInit => "Provisioning",
        JobType::ProvisionUpdate => "Provisioning Update",
        JobType::ProvisionDestroy => "Teardown",
        JobType::ProvisionRestore => "Provisioned Restore",
    }
}

fn header(text: String) -> Value {
    json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": text,
            "emoji": true
        }
    })
}

fn fields(client_id: &str, job_id: &str) -> Vec<Value> {
    let short_id = &job_id[..8.min(job_id.len())];
    vec![
        json!({
            "type": "mrkdwn",
            "text": format!("*Client:*\n{}", client_id)
        }),
        json!({
            "type": "mrkdwn",
            "text": format!("*Job ID:*\n`{}`", short_id)
        }),
    ]
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> Value {
        match event {
            JobEvent::Started {
                job_id,
                client_id,
                job_type,
            } => json!({
                "blocks": [
                    header(format!("{} Started", title(*job_type))),
                    { "type": "section", "fields": fields(client_id, job_id) }
                ]
            }),
            JobEvent::Completed {
                job_id,
                client_id,
                job_type,
                status,
                duration_secs,
                detail,
            } => {
                let heading = match status {
                    JobStatus::PartialSuccess => format!("{} Partially Complete", title(*job_type)),
                    _ => format!("{} Complete", title(*job_type)),
                };
                let mut section_fields = fields(client_id, job_id);
                section_fields.push(json!({
                    "type": "mrkdwn",
                    "text": format!("*Duration:*\n{}m {}s", duration_secs / 60, duration_secs % 60)
                }));

                let mut blocks = vec![
                    header(heading),
                    json!({ "type": "section", "fields": section_fields }),
                ];
                if let Some(detail) = detail {
                    blocks.push(json!({
                        "type": "section",
                        "text": { "type": "mrkdwn", "text": format!("*Details:*\n{}", detail) }
                    }));
                }
                json!({ "blocks": blocks })
            }
            JobEvent::Failed {
                job_id,
                client_id,
                job_type,
                error,
            } => json!({
                "blocks": [
                    header(format!("{} Failed", title(*job_type))),
                    { "type": "section", "fields": fields(client_id, job_id) },
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Error:*\n```{}```", error)
                        }
                    }
                ]
            }),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_success_gets_its_own_heading() {
        let notifier = SlackNotifier::new("http://localhost".into());
        let message = notifier.format_message(&JobEvent::Completed {
            job_id: "0192f0aa-1111".into(),
            client_id: "c1".into(),
            job_type: JobType::Restore,
            status: JobStatus::PartialSuccess,
            duration_secs: 125,
            detail: Some("Partial restore: 1 providers failed".into()),
        });

        assert_eq!(message["blocks"][0]["text"]["text"], "Restore Partially Complete");
        assert_eq!(message["blocks"][1]["fields"][1]["text"], "*Job ID:*\n`0192f0aa`");
        assert_eq!(message["blocks"][1]["fields"][2]["text"], "*Duration:*\n2m 5s");
        assert_eq!(message["blocks"].as_array().unwrap().len(), 3);
    }
}
