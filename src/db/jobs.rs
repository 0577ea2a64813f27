use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::collections::HashMap;
use tokio_rusqlite::{
    Connection, params,
    rusqlite::{self, params_from_iter, types::Value},
};

use super::{JobFilter, JobSort, JobUpdate, Page, parse_ts, ts};
use crate::core::models::{Job, JobResult, JobStatus, JobType, Provider};

const COLUMNS: &str = "id, client_id, job_type, status, provider, source_backup_id, is_automated, \
     is_manual, data_size, created_at, started_at, completed_at, updated_at, metadata, result, \
     error_message";

/// A job as stored, before the text columns are decoded.
struct JobRow {
    id: String,
    client_id: String,
    job_type: String,
    status: String,
    provider: Option<String>,
    source_backup_id: Option<String>,
    is_automated: bool,
    is_manual: bool,
    data_size: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    metadata: String,
    result: Option<String>,
    error_message: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        client_id: row.get(1)?,
        job_type: row.get(2)?,
        status: row.get(3)?,
        provider: row.get(4)?,
        source_backup_id: row.get(5)?,
        is_automated: row.get(6)?,
        is_manual: row.get(7)?,
        data_size: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        updated_at: row.get(12)?,
        metadata: row.get(13)?,
        result: row.get(14)?,
        error_message: row.get(15)?,
    })
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let id = row.id;
        Ok(Job {
            job_type: JobType::parse(&row.job_type)
                .ok_or_else(|| anyhow!("Job {} has unknown type {:?}", id, row.job_type))?,
            status: JobStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("Job {} has unknown status {:?}", id, row.status))?,
            provider: row.provider.as_deref().and_then(Provider::parse),
            source_backup_id: row.source_backup_id,
            client_id: row.client_id,
            is_automated: row.is_automated,
            is_manual: row.is_manual,
            data_size: row.data_size.max(0) as u64,
            created_at: parse_ts(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            updated_at: parse_ts(&row.updated_at)?,
            metadata: serde_json::from_str(&row.metadata)
                .with_context(|| format!("Job {id} has malformed metadata"))?,
            result: row
                .result
                .as_deref()
                .map(|raw| serde_json::from_str::<JobResult>(raw))
                .transpose()
                .with_context(|| format!("Job {id} has malformed result"))?,
            error_message: row.error_message,
            id,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn where_clause(filter: &JobFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(client_id) = &filter.client_id {
        clauses.push("client_id = ?".into());
        values.push(Value::Text(client_id.clone()));
    }
    if !filter.job_types.is_empty() {
        clauses.push(format!("job_type IN ({})", placeholders(filter.job_types.len())));
        values.extend(filter.job_types.iter().map(|t| Value::Text(t.as_str().into())));
    }
    if !filter.statuses.is_empty() {
        clauses.push(format!("status IN ({})", placeholders(filter.statuses.len())));
        values.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().into())));
    }
    if let Some(backup_id) = &filter.source_backup_id {
        clauses.push("source_backup_id = ?".into());
        values.push(Value::Text(backup_id.clone()));
    }
    if let Some(automated) = filter.automated {
        clauses.push(if automated { "is_automated = 1" } else { "is_automated = 0" }.into());
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

pub async fn create(conn: &Connection, job: &Job) -> Result<()> {
    let metadata = serde_json::to_string(&job.metadata)?;
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    let job = job.clone();

    conn.call(move |c| {
        c.execute(
            &format!(
                "INSERT INTO jobs ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                job.id,
                job.client_id,
                job.job_type.as_str(),
                job.status.as_str(),
                job.provider.map(|p| p.as_str()),
                job.source_backup_id,
                job.is_automated,
                job.is_manual,
                job.data_size as i64,
                ts(job.created_at),
                job.started_at.map(ts),
                job.completed_at.map(ts),
                ts(job.updated_at),
                metadata,
                result,
                job.error_message,
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to create job: {}", e))
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<Job>> {
    let row = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))?;
            let mut rows = stmt.query_map(params![job_id], read_row)?;
            rows.next().transpose()
        })
        .await
        .map_err(|e| anyhow!("Failed to get job: {}", e))?;

    row.map(Job::try_from).transpose()
}

pub async fn find(
    conn: &Connection,
    filter: JobFilter,
    sort: JobSort,
    page: Page,
) -> Result<Vec<Job>> {
    let (clause, mut values) = where_clause(&filter);
    let order = match sort {
        JobSort::CreatedDesc => "created_at DESC, id DESC",
        JobSort::CreatedAsc => "created_at ASC, id ASC",
        JobSort::CompletedDesc => "completed_at IS NULL, completed_at DESC, id DESC",
    };
    values.push(Value::Integer(page.limit.map_or(-1, i64::from)));
    values.push(Value::Integer(page.offset() as i64));

    let sql = format!("SELECT {COLUMNS} FROM jobs{clause} ORDER BY {order} LIMIT ? OFFSET ?");

    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow!("Failed to list jobs: {}", e))?;

    rows.into_iter().map(Job::try_from).collect()
}

pub async fn update(conn: &Connection, job_id: String, update: JobUpdate) -> Result<bool> {
    let mut sets: Vec<&str> = vec!["updated_at = ?"];
    let mut values: Vec<Value> = vec![Value::Text(ts(Utc::now()))];

    if let Some(status) = update.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().into()));
    }
    if let Some(at) = update.started_at {
        sets.push("started_at = ?");
        values.push(Value::Text(ts(at)));
    }
    if let Some(at) = update.completed_at {
        sets.push("completed_at = ?");
        values.push(Value::Text(ts(at)));
    }
    if let Some(size) = update.data_size {
        sets.push("data_size = ?");
        values.push(Value::Integer(size as i64));
    }
    if let Some(metadata) = &update.metadata {
        sets.push("metadata = ?");
        values.push(Value::Text(serde_json::to_string(metadata)?));
    }
    if let Some(result) = &update.result {
        sets.push("result = ?");
        values.push(Value::Text(serde_json::to_string(result)?));
    }
    if let Some(message) = update.error_message {
        sets.push("error_message = ?");
        values.push(Value::Text(message));
    }

    let mut sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
    values.push(Value::Text(job_id));

    if !update.expected.is_empty() {
        sql.push_str(&format!(" AND status IN ({})", placeholders(update.expected.len())));
        values.extend(update.expected.iter().map(|s| Value::Text(s.as_str().into())));
    }

    let changed = conn
        .call(move |c| c.execute(&sql, params_from_iter(values.iter())))
        .await
        .map_err(|e| anyhow!("Failed to update job: {}", e))?;

    Ok(changed > 0)
}

pub async fn count(conn: &Connection, filter: JobFilter) -> Result<u64> {
    let (clause, values) = where_clause(&filter);
    let sql = format!("SELECT COUNT(*) FROM jobs{clause}");

    let n = conn
        .call(move |c| {
            c.query_row(&sql, params_from_iter(values.iter()), |row| {
                row.get::<_, i64>(0)
            })
        })
        .await
        .map_err(|e| anyhow!("Failed to count jobs: {}", e))?;

    Ok(n.max(0) as u64)
}

pub async fn count_by_status(
    conn: &Connection,
    client_id: Option<String>,
) -> Result<HashMap<JobStatus, u64>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT status, COUNT(*) FROM jobs
                 WHERE ?1 IS NULL OR client_id = ?1
                 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![client_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow!("Failed to count jobs by status: {}", e))?;

    let mut counts: HashMap<JobStatus, u64> = JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
    for (status, n) in rows {
        if let Some(status) = JobStatus::parse(&status) {
            counts.insert(status, n.max(0) as u64);
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::BackupType;
    use crate::core::models::{JobMetadata, Trigger};
    use crate::db::init_in_memory;

    fn backup_job(client_id: &str) -> Job {
        Job::new(
            client_id,
            JobType::Backup,
            Trigger::Manual,
            JobMetadata::Backup {
                backup_type: BackupType::Full,
            },
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let conn = init_in_memory().await.unwrap();
        let mut job = backup_job("c1");
        job.provider = Some(Provider::Azure);
        job.data_size = 2048;
        create(&conn, &job).await.unwrap();

        let loaded = get(&conn, job.id.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.provider, Some(Provider::Azure));
        assert_eq!(loaded.data_size, 2048);
        assert_eq!(loaded.metadata, job.metadata);
        assert!(loaded.is_manual && !loaded.is_automated);

        assert!(get(&conn, "missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guarded_update_rejects_wrong_state() {
        let conn = init_in_memory().await.unwrap();
        let job = backup_job("c1");
        create(&conn, &job).await.unwrap();

        // Pending cannot jump straight to Success.
        let applied = update(&conn, job.id.clone(), JobUpdate::transition(JobStatus::Success))
            .await
            .unwrap();
        assert!(!applied);

        let applied = update(
            &conn,
            job.id.clone(),
            JobUpdate::transition(JobStatus::Running).started(Utc::now()),
        )
        .await
        .unwrap();
        assert!(applied);

        let applied = update(
            &conn,
            job.id.clone(),
            JobUpdate::transition(JobStatus::Failed)
                .completed(Utc::now())
                .with_error("boom"),
        )
        .await
        .unwrap();
        assert!(applied);

        // Terminal is final.
        let applied = update(&conn, job.id.clone(), JobUpdate::transition(JobStatus::Cancelled))
            .await
            .unwrap();
        assert!(!applied);

        let loaded = get(&conn, job.id.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
        assert!(loaded.started_at.is_some() && loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn find_filters_sorts_and_pages() {
        let conn = init_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = backup_job("c1");
            ids.push(job.id.clone());
            create(&conn, &job).await.unwrap();
        }
        create(&conn, &backup_job("c2")).await.unwrap();

        let filter = JobFilter::for_client("c1").of_type(JobType::Backup);
        assert_eq!(count(&conn, filter.clone()).await.unwrap(), 5);

        let newest = find(&conn, filter.clone(), JobSort::CreatedDesc, Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, ids[4]);

        let last_page = find(&conn, filter.clone(), JobSort::CreatedDesc, Page::new(3, 2))
            .await
            .unwrap();
        assert_eq!(last_page.len(), 1);
        assert_eq!(last_page[0].id, ids[0]);

        let none = find(
            &conn,
            filter.with_status(JobStatus::Success),
            JobSort::CreatedDesc,
            Page::all(),
        )
        .await
        .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn counts_by_status() {
        let conn = init_in_memory().await.unwrap();
        let job = backup_job("c1");
        create(&conn, &job).await.unwrap();
        create(&conn, &backup_job("c1")).await.unwrap();
        update(&conn, job.id.clone(), JobUpdate::transition(JobStatus::Running))
            .await
            .unwrap();

        let counts = count_by_status(&conn, Some("c1".into())).await.unwrap();
        assert_eq!(counts[&JobStatus::Pending], 1);
        assert_eq!(counts[&JobStatus::Running], 1);
        assert_eq!(counts[&JobStatus::Success], 0);

        let other = count_by_status(&conn, Some("c2".into())).await.unwrap();
        assert_eq!(other[&JobStatus::Pending], 0);
    }
}
