use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio_rusqlite::{Connection, rusqlite};

use crate::core::client::{Client, TerraformState};
use crate::core::models::{Job, JobMetadata, JobResult, JobStatus, JobType};

pub mod clients;
pub mod jobs;

pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .await
        .map_err(|e| anyhow!("Failed to open database {}: {}", path.display(), e))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .await
        .map_err(|e| anyhow!("Failed to open in-memory database: {}", e))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to apply schema: {}", e))
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("Invalid timestamp {:?}: {}", raw, e))
}

/// Which jobs a query matches. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub client_id: Option<String>,
    pub job_types: Vec<JobType>,
    pub statuses: Vec<JobStatus>,
    pub source_backup_id: Option<String>,
    pub automated: Option<bool>,
}

impl JobFilter {
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, job_type: JobType) -> Self {
        self.job_types.push(job_type);
        self
    }

    pub fn of_types(mut self, job_types: &[JobType]) -> Self {
        self.job_types.extend_from_slice(job_types);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }

    pub fn from_backup(mut self, backup_id: impl Into<String>) -> Self {
        self.source_backup_id = Some(backup_id.into());
        self
    }

    pub fn automated(mut self, automated: bool) -> Self {
        self.automated = Some(automated);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    /// Unfinished jobs sort last.
    CompletedDesc,
}

/// 1-based page. `limit: None` returns everything from the offset on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub limit: Option<u32>,
}

impl Page {
    pub fn all() -> Self {
        Self {
            number: 1,
            limit: None,
        }
    }

    pub fn first(limit: u32) -> Self {
        Self {
            number: 1,
            limit: Some(limit),
        }
    }

    pub fn new(number: u32, limit: u32) -> Self {
        Self {
            number: number.max(1),
            limit: Some(limit),
        }
    }

    pub fn offset(&self) -> u64 {
        match self.limit {
            Some(limit) => u64::from(self.number.max(1) - 1) * u64::from(limit),
            None => 0,
        }
    }
}

/// A partial job update.
///
/// When `expected` is non-empty the write only lands if the job's current
/// status is one of them. That guard is what keeps terminal states final.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub data_size: Option<u64>,
    pub metadata: Option<JobMetadata>,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub expected: Vec<JobStatus>,
}

impl JobUpdate {
    /// Move to `next`, guarded by every status that may precede it.
    pub fn transition(next: JobStatus) -> Self {
        Self {
            status: Some(next),
            expected: JobStatus::predecessors(next),
            ..Default::default()
        }
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_result(mut self, result: JobResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = Some(data_size);
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    async fn find(&self, filter: &JobFilter, sort: JobSort, page: Page) -> Result<Vec<Job>>;

    async fn find_one(&self, filter: &JobFilter, sort: JobSort) -> Result<Option<Job>> {
        Ok(self.find(filter, sort, Page::first(1)).await?.into_iter().next())
    }

    /// Returns false when the status guard rejected the write.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<bool>;

    async fn count(&self, filter: &JobFilter) -> Result<u64>;

    async fn count_by_status(&self, client_id: Option<&str>) -> Result<HashMap<JobStatus, u64>>;
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Client>>;

    async fn save(&self, client: &Client) -> Result<()>;

    /// Active clients that have a DR test cadence configured.
    async fn list_active_with_dr_frequency(&self) -> Result<Vec<Client>>;

    async fn set_terraform_state(&self, id: &str, state: TerraformState) -> Result<()>;
}

/// SQLite-backed job and client store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(init(path).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(init_in_memory().await?))
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create(&self, job: &Job) -> Result<()> {
        jobs::create(&self.conn, job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        jobs::get(&self.conn, id.to_string()).await
    }

    async fn find(&self, filter: &JobFilter, sort: JobSort, page: Page) -> Result<Vec<Job>> {
        jobs::find(&self.conn, filter.clone(), sort, page).await
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<bool> {
        jobs::update(&self.conn, id.to_string(), update).await
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64> {
        jobs::count(&self.conn, filter.clone()).await
    }

    async fn count_by_status(&self, client_id: Option<&str>) -> Result<HashMap<JobStatus, u64>> {
        jobs::count_by_status(&self.conn, client_id.map(str::to_string)).await
    }
}

#[async_trait]
impl ClientStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Client>> {
        clients::get(&self.conn, id.to_string()).await
    }

    async fn save(&self, client: &Client) -> Result<()> {
        clients::save(&self.conn, client).await
    }

    async fn list_active_with_dr_frequency(&self) -> Result<Vec<Client>> {
        clients::list_active_with_dr_frequency(&self.conn).await
    }

    async fn set_terraform_state(&self, id: &str, state: TerraformState) -> Result<()> {
        clients::set_terraform_state(&self.conn, id.to_string(), state).await
    }
}
