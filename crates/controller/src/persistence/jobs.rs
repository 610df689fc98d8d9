use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub lab_id: String,
    /// `None` for lab-wide jobs.
    pub node_name: Option<String>,
    pub action: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn insert_job(
    pool: &Db,
    lab_id: &str,
    node_name: Option<&str>,
    action: &str,
    status: JobStatus,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO jobs (id, lab_id, node_name, action, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        "#,
    )
    .bind(id)
    .bind(lab_id)
    .bind(node_name)
    .bind(action)
    .bind(status)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn set_job_status(pool: &Db, id: Uuid, status: JobStatus) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether a queued or running job younger than `not_before` targets the node
/// or the whole lab. Older jobs are treated as abandoned.
pub async fn has_active_job(
    pool: &Db,
    lab_id: &str,
    node_name: Option<&str>,
    not_before: DateTime<Utc>,
) -> Result<bool> {
    let jobs = sqlx::query_as::<_, JobRecord>(
        r#"
        SELECT id, lab_id, node_name, action, status, created_at, updated_at
        FROM jobs
        WHERE lab_id = ?1 AND status IN ('queued', 'running')
        "#,
    )
    .bind(lab_id)
    .fetch_all(pool)
    .await?;

    Ok(jobs.iter().any(|job| {
        job.created_at >= not_before
            && match (&job.node_name, node_name) {
                (None, _) => true,
                (Some(job_node), Some(node)) => job_node == node,
                (Some(_), None) => false,
            }
    }))
}

/// Deletes completed and failed jobs last touched before `before`.
pub async fn prune_finished_jobs(pool: &Db, before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
    )
    .bind(before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
