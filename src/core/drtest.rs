//! Disaster-recovery verification jobs and their reports.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::client::{Client, DrTestFrequency};
use super::fanout::{FanOut, fan_out, join_failures};
use super::lifecycle::Outcome;
use super::models::{
    DEFAULT_VERIFICATION_STEPS, DrTestKind, DrTestMetadata, DrTestParameters, DrTestResult, Job,
    JobMetadata, JobResult, JobStatus, JobType, Provider, Trigger, VerificationCheck,
};
use super::orchestrator::{JobOrchestrator, Paged};
use super::progress::JobPhase;
use crate::db::{JobFilter, JobSort, Page};
use crate::error::{OrchestratorError, Result};

pub const DEFAULT_DR_TARGET_ENVIRONMENT: &str = "isolated";

/// Tests considered by the compliance report.
const COMPLIANCE_WINDOW: u32 = 50;
const RECENT_TESTS: usize = 5;

/// Returned when a DR test is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrTestHandle {
    pub job_id: String,
    pub source_backup_id: String,
}

/// Achieved recovery figures of a successful DR test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrMetrics {
    pub recovery_time_minutes: i64,
    pub recovery_point_hours: Option<i64>,
    pub rto_target: String,
    pub rpo_target: String,
    pub rto_compliant: Option<bool>,
    pub rpo_compliant: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrTestReport {
    pub job: Job,
    pub metrics: Option<DrMetrics>,
    pub checks: Vec<VerificationCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrTestSummary {
    pub id: String,
    pub date: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub is_automated: bool,
    pub recovery_time_minutes: Option<i64>,
    pub provider: Option<Provider>,
    pub source_backup_id: Option<String>,
}

impl From<&Job> for DrTestSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            date: job.started_at.unwrap_or(job.created_at),
            completed_at: job.completed_at,
            status: job.status,
            is_automated: job.is_automated,
            recovery_time_minutes: job.duration_minutes(),
            provider: job.provider,
            source_backup_id: job.source_backup_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DrComplianceReport {
    pub client_id: String,
    pub client_name: String,
    pub total_tests: usize,
    pub successful_tests: usize,
    pub failed_tests: usize,
    pub pending_tests: usize,
    pub success_rate: f64,
    pub frequency: DrTestFrequency,
    pub frequency_compliant: bool,
    pub last_successful_test: Option<DrTestSummary>,
    pub average_recovery_minutes: i64,
    pub rto_target: String,
    pub rpo_target: String,
    pub rto_compliant: bool,
    pub most_recent_status: Option<JobStatus>,
    pub recent_tests: Vec<DrTestSummary>,
}

/// Parse a recovery objective such as `4h`, `30m`, `2d` or a bare `24`
/// (hours).
pub fn parse_objective(raw: &str) -> Option<Duration> {
    let raw = raw.trim().to_lowercase();
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: i64 = digits.parse().ok()?;
    match raw[digits.len()..].trim() {
        "" | "h" | "hr" | "hrs" | "hour" | "hours" => Some(Duration::hours(value)),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(Duration::minutes(value)),
        "d" | "day" | "days" => Some(Duration::days(value)),
        _ => None,
    }
}

fn round_minutes(d: Duration) -> i64 {
    (d.num_seconds() as f64 / 60.0).round() as i64
}

fn round_hours(d: Duration) -> i64 {
    (d.num_seconds() as f64 / 3600.0).round() as i64
}

/// Compute recovery metrics. `None` unless the test succeeded and has both timestamps.
pub fn dr_metrics(test: &Job, backup: Option<&Job>) -> Option<DrMetrics> {
    if test.status != JobStatus::Success {
        return None;
    }
    let (started, completed) = (test.started_at?, test.completed_at?);
    let meta = test.dr_test_metadata()?;

    let recovery_time = completed - started;
    let recovery_point = backup.and_then(|b| b.completed_at).map(|taken| started - taken);

    Some(DrMetrics {
        recovery_time_minutes: round_minutes(recovery_time),
        recovery_point_hours: recovery_point.map(round_hours),
        rto_target: meta.recovery_time_objective.clone(),
        rpo_target: meta.recovery_point_objective.clone(),
        rto_compliant: parse_objective(&meta.recovery_time_objective)
            .map(|target| recovery_time <= target),
        rpo_compliant: parse_objective(&meta.recovery_point_objective)
            .zip(recovery_point)
            .map(|(target, achieved)| achieved <= target),
    })
}

impl JobOrchestrator {
    /// Start a manual DR test against an explicit or the latest successful backup.
    pub async fn start_dr_test(
        &self,
        client_id: &str,
        backup_id: Option<&str>,
        parameters: DrTestParameters,
    ) -> Result<DrTestHandle> {
        let client = self.load_client(client_id).await?;
        let _admission = self.admission.lock().await;
        let backup = self.resolve_backup(&client.id, backup_id).await?;

        let steps = parameters
            .verification_steps
            .filter(|steps| !steps.is_empty())
            .unwrap_or_else(|| DEFAULT_VERIFICATION_STEPS.iter().map(|s| s.to_string()).collect());
        let target_environment = parameters
            .target_environment
            .unwrap_or_else(|| DEFAULT_DR_TARGET_ENVIRONMENT.to_string());

        self.create_dr_test(client, backup, DrTestKind::Manual, steps, target_environment)
            .await
    }

    /// Create an automated DR test. Used by the cadence scheduler.
    pub async fn schedule_client_dr_test(
        &self,
        client: &Client,
        backup: &Job,
    ) -> Result<DrTestHandle> {
        if !client.is_active() {
            return Err(OrchestratorError::validation(format!(
                "Cannot schedule DR tests for client {} in status {}",
                client.id, client.status
            )));
        }
        let _admission = self.admission.lock().await;
        let steps = DEFAULT_VERIFICATION_STEPS.iter().map(|s| s.to_string()).collect();

        self.create_dr_test(
            client.clone(),
            backup.clone(),
            DrTestKind::Automated,
            steps,
            DEFAULT_DR_TARGET_ENVIRONMENT.to_string(),
        )
        .await
    }

    /// Caller holds the admission lock.
    async fn create_dr_test(
        &self,
        client: Client,
        backup: Job,
        kind: DrTestKind,
        steps: Vec<String>,
        target_environment: String,
    ) -> Result<DrTestHandle> {
        if self.has_in_flight(&client.id, &[JobType::DrTest]).await? {
            return Err(OrchestratorError::validation(format!(
                "A DR test is already in progress for client {}",
                client.id
            )));
        }

        let trigger = match kind {
            DrTestKind::Automated => Trigger::Automated,
            DrTestKind::Manual => Trigger::Manual,
        };
        let metadata = DrTestMetadata {
            test_type: kind,
            verification_steps: steps.clone(),
            target_environment,
            recovery_point_objective: client.backup_config.recovery_point_objective.clone(),
            recovery_time_objective: client.backup_config.recovery_time_objective.clone(),
        };
        let job = Job::new(&client.id, JobType::DrTest, trigger, JobMetadata::DrTest(metadata))
            .with_source_backup(&backup);

        let handle = DrTestHandle {
            job_id: job.id.clone(),
            source_backup_id: backup.id.clone(),
        };

        let client = Arc::new(client);
        let backup = Arc::new(backup);
        let steps = Arc::new(steps);
        self.launch(job, move |this, job, _cancel| async move {
            this.run_dr_test(&job, client, backup, steps).await
        })
        .await?;

        info!(
            job_id = %handle.job_id,
            backup_id = %handle.source_backup_id,
            ?kind,
            "DR test started"
        );
        Ok(handle)
    }

    async fn run_dr_test(
        &self,
        job: &Job,
        client: Arc<Client>,
        backup: Arc<Job>,
        steps: Arc<Vec<String>>,
    ) -> Result<Outcome> {
        let providers = match backup.provider {
            Some(provider) => vec![provider],
            None => client.enabled_providers(),
        };
        self.progress
            .update(
                &job.id,
                JobPhase::Verifying {
                    providers: providers.clone(),
                },
            )
            .await;

        let gateway = self.gateway.clone();
        let outcome = fan_out(&providers, |provider| {
            let gateway = gateway.clone();
            let client = client.clone();
            let backup = backup.clone();
            let steps = steps.clone();
            async move { gateway.run_dr_test(provider, &client, &backup, &steps).await }
        })
        .await;

        Ok(match outcome {
            FanOut::AllSucceeded(results) => {
                let checks: Vec<VerificationCheck> =
                    results.into_iter().flat_map(|(_, c)| c).collect();
                let failed: Vec<String> = checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| format!("{}: {} check failed", c.provider, c.step))
                    .collect();

                if failed.is_empty() {
                    Outcome::success(JobResult::DrTest(DrTestResult { checks }))
                } else {
                    Outcome::Failed {
                        message: failed.join("; "),
                        result: Some(JobResult::DrTest(DrTestResult { checks })),
                    }
                }
            }
            FanOut::Mixed { successes, failures } => Outcome::Failed {
                message: join_failures(&failures),
                result: Some(JobResult::DrTest(DrTestResult {
                    checks: successes.into_iter().flat_map(|(_, c)| c).collect(),
                })),
            },
            FanOut::AllFailed(failures) => Outcome::failed(join_failures(&failures)),
        })
    }

    /// A DR test with its achieved recovery metrics.
    pub async fn dr_test_result(&self, job_id: &str) -> Result<DrTestReport> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .filter(|j| j.job_type == JobType::DrTest)
            .ok_or_else(|| OrchestratorError::not_found(format!("DR test {job_id} not found")))?;

        let backup = match &job.source_backup_id {
            Some(id) => self.jobs.get(id).await?,
            None => None,
        };
        let metrics = dr_metrics(&job, backup.as_ref());
        let checks = match &job.result {
            Some(JobResult::DrTest(result)) => result.checks.clone(),
            _ => Vec::new(),
        };

        Ok(DrTestReport { job, metrics, checks })
    }

    /// DR posture over the client's most recent tests.
    pub async fn dr_compliance_report(&self, client_id: &str) -> Result<DrComplianceReport> {
        let client = self.load_client(client_id).await?;
        let filter = JobFilter::for_client(&client.id).of_type(JobType::DrTest);
        let tests = self
            .jobs
            .find(&filter, JobSort::CreatedDesc, Page::first(COMPLIANCE_WINDOW))
            .await?;

        Ok(compliance_report(&client, &tests, Utc::now()))
    }

    pub async fn dr_test_history(
        &self,
        client_id: &str,
        page: Page,
    ) -> Result<Paged<DrTestSummary>> {
        let filter = JobFilter::for_client(client_id).of_type(JobType::DrTest);
        let total = self.jobs.count(&filter).await?;
        let jobs = self.jobs.find(&filter, JobSort::CreatedDesc, page).await?;
        Ok(Paged::new(jobs.iter().map(DrTestSummary::from).collect(), total, page))
    }
}

/// `tests` are newest first.
pub fn compliance_report(client: &Client, tests: &[Job], now: DateTime<Utc>) -> DrComplianceReport {
    let count = |status: JobStatus| tests.iter().filter(|t| t.status == status).count();
    let total_tests = tests.len();
    let successful_tests = count(JobStatus::Success);
    let success_rate = if total_tests > 0 {
        successful_tests as f64 / total_tests as f64 * 100.0
    } else {
        0.0
    };

    let frequency = client.backup_config.dr_test_frequency.unwrap_or_default();
    let last_success = tests.iter().find(|t| t.status == JobStatus::Success);
    let frequency_compliant = last_success
        .and_then(|t| t.completed_at)
        .is_some_and(|at| now - at <= frequency.threshold());

    let durations: Vec<i64> = tests
        .iter()
        .filter(|t| t.status == JobStatus::Success)
        .filter_map(Job::duration_minutes)
        .collect();
    let average_recovery_minutes = if durations.is_empty() {
        0
    } else {
        (durations.iter().sum::<i64>() as f64 / durations.len() as f64).round() as i64
    };

    let rto = &client.backup_config.recovery_time_objective;
    let rto_compliant = !durations.is_empty()
        && parse_objective(rto)
            .is_some_and(|target| average_recovery_minutes <= target.num_minutes());

    DrComplianceReport {
        client_id: client.id.clone(),
        client_name: client.name.clone(),
        total_tests,
        successful_tests,
        failed_tests: count(JobStatus::Failed),
        pending_tests: tests.iter().filter(|t| t.status.is_in_flight()).count(),
        success_rate,
        frequency,
        frequency_compliant,
        last_successful_test: last_success.map(DrTestSummary::from),
        average_recovery_minutes,
        rto_target: rto.clone(),
        rpo_target: client.backup_config.recovery_point_objective.clone(),
        rto_compliant,
        most_recent_status: tests.first().map(|t| t.status),
        recent_tests: tests.iter().take(RECENT_TESTS).map(DrTestSummary::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dr_test(status: JobStatus, started: DateTime<Utc>, minutes: i64) -> Job {
        let mut job = Job::new(
            "c1",
            JobType::DrTest,
            Trigger::Automated,
            JobMetadata::DrTest(DrTestMetadata {
                test_type: DrTestKind::Automated,
                verification_steps: vec!["integrity".into()],
                target_environment: "isolated".into(),
                recovery_point_objective: "24h".into(),
                recovery_time_objective: "4h".into(),
            }),
        );
        job.status = status;
        job.started_at = Some(started);
        job.completed_at = Some(started + Duration::minutes(minutes));
        job
    }

    #[test]
    fn objectives_parse_with_units() {
        assert_eq!(parse_objective("4h"), Some(Duration::hours(4)));
        assert_eq!(parse_objective("30m"), Some(Duration::minutes(30)));
        assert_eq!(parse_objective("2d"), Some(Duration::days(2)));
        assert_eq!(parse_objective("24"), Some(Duration::hours(24)));
        assert_eq!(parse_objective("N/A"), None);
        assert_eq!(parse_objective("5 weeks"), None);
    }

    #[test]
    fn metrics_compare_against_objectives() {
        let now = Utc::now();
        let test = dr_test(JobStatus::Success, now - Duration::hours(1), 45);
        let mut backup = Job::new(
            "c1",
            JobType::Backup,
            Trigger::Automated,
            JobMetadata::Backup {
                backup_type: Default::default(),
            },
        );
        backup.completed_at = Some(now - Duration::hours(31));

        let metrics = dr_metrics(&test, Some(&backup)).unwrap();
        assert_eq!(metrics.recovery_time_minutes, 45);
        assert_eq!(metrics.recovery_point_hours, Some(30));
        assert_eq!(metrics.rto_compliant, Some(true));
        assert_eq!(metrics.rpo_compliant, Some(false));
    }

    #[test]
    fn metrics_only_for_successful_tests() {
        let test = dr_test(JobStatus::Failed, Utc::now(), 10);
        assert!(dr_metrics(&test, None).is_none());
    }

    #[test]
    fn compliance_report_summarises_window() {
        let now = Utc::now();
        let mut client = Client::new("Acme", vec![Provider::Aws]);
        client.backup_config.dr_test_frequency = Some(DrTestFrequency::Weekly);

        let tests = vec![
            dr_test(JobStatus::Failed, now - Duration::days(1), 20),
            dr_test(JobStatus::Success, now - Duration::days(3), 30),
            dr_test(JobStatus::Success, now - Duration::days(10), 50),
            dr_test(JobStatus::Running, now - Duration::days(11), 0),
        ];

        let report = compliance_report(&client, &tests, now);
        assert_eq!(report.total_tests, 4);
        assert_eq!(report.successful_tests, 2);
        assert_eq!(report.failed_tests, 1);
        assert_eq!(report.pending_tests, 1);
        assert_eq!(report.success_rate, 50.0);
        assert!(report.frequency_compliant);
        assert_eq!(report.average_recovery_minutes, 40);
        assert!(report.rto_compliant);
        assert_eq!(report.most_recent_status, Some(JobStatus::Failed));
        assert_eq!(report.recent_tests.len(), 4);
    }

    #[test]
    fn stale_success_is_not_frequency_compliant() {
        let now = Utc::now();
        let mut client = Client::new("Acme", vec![Provider::Aws]);
        client.backup_config.dr_test_frequency = Some(DrTestFrequency::Weekly);

        let tests = vec![dr_test(JobStatus::Success, now - Duration::days(9), 10)];
        assert!(!compliance_report(&client, &tests, now).frequency_compliant);
        assert!(!compliance_report(&client, &[], now).rto_compliant);
    }
}
