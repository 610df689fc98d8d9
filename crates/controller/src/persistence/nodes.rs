use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum NodeDesiredState {
    Stopped,
    Running,
}

impl NodeDesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeDesiredState::Stopped => "stopped",
            NodeDesiredState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum NodeActualState {
    Undeployed,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Error,
}

impl NodeActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeActualState::Undeployed => "undeployed",
            NodeActualState::Pending => "pending",
            NodeActualState::Starting => "starting",
            NodeActualState::Running => "running",
            NodeActualState::Stopping => "stopping",
            NodeActualState::Stopped => "stopped",
            NodeActualState::Exited => "exited",
            NodeActualState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeStateRecord {
    pub id: Uuid,
    pub lab_id: String,
    pub node_name: String,
    pub host_id: Option<String>,
    pub desired_state: NodeDesiredState,
    pub actual_state: NodeActualState,
    pub error_message: Option<String>,
    pub enforcement_attempts: i64,
    pub last_enforcement_at: Option<DateTime<Utc>>,
    pub enforcement_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNodeState {
    pub lab_id: String,
    pub node_name: String,
    pub host_id: Option<String>,
    pub desired_state: NodeDesiredState,
}

const NODE_COLUMNS: &str = "id, lab_id, node_name, host_id, desired_state, actual_state, \
     error_message, enforcement_attempts, last_enforcement_at, enforcement_failed_at, \
     created_at, updated_at";

/// Declares a node. A change of desired state starts a fresh retry budget.
pub async fn upsert_node_state(pool: &Db, node: &NewNodeState) -> Result<NodeStateRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO node_states (id, lab_id, node_name, host_id, desired_state, actual_state, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'undeployed', ?6, ?6)
        ON CONFLICT(lab_id, node_name) DO UPDATE SET
            host_id = excluded.host_id,
            enforcement_attempts = CASE
                WHEN node_states.desired_state <> excluded.desired_state THEN 0
                ELSE node_states.enforcement_attempts END,
            enforcement_failed_at = CASE
                WHEN node_states.desired_state <> excluded.desired_state THEN NULL
                ELSE node_states.enforcement_failed_at END,
            desired_state = excluded.desired_state,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&node.lab_id)
    .bind(node.node_name.trim())
    .bind(&node.host_id)
    .bind(node.desired_state)
    .bind(now)
    .execute(pool)
    .await?;

    get_node_state(pool, &node.lab_id, node.node_name.trim())
        .await?
        .ok_or_else(|| anyhow::anyhow!("node upsert did not return row"))
}

pub async fn get_node_state(
    pool: &Db,
    lab_id: &str,
    node_name: &str,
) -> Result<Option<NodeStateRecord>> {
    let record = sqlx::query_as::<_, NodeStateRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM node_states WHERE lab_id = ?1 AND node_name = ?2"
    ))
    .bind(lab_id)
    .bind(node_name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_node_state_by_id(pool: &Db, id: Uuid) -> Result<Option<NodeStateRecord>> {
    let record = sqlx::query_as::<_, NodeStateRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM node_states WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_lab_node_states(pool: &Db, lab_id: &str) -> Result<Vec<NodeStateRecord>> {
    let records = sqlx::query_as::<_, NodeStateRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM node_states WHERE lab_id = ?1 ORDER BY node_name"
    ))
    .bind(lab_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Every lab with at least one declared node or link.
pub async fn list_lab_ids(pool: &Db) -> Result<Vec<String>> {
    let labs = sqlx::query_scalar::<_, String>(
        r#"
        SELECT lab_id FROM node_states
        UNION
        SELECT lab_id FROM link_states
        ORDER BY lab_id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(labs)
}

pub async fn delete_node_state(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM node_states WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Writes the actual state. Callers are responsible for checking legality
/// against the node state machine.
pub async fn set_node_actual_state(
    pool: &Db,
    id: Uuid,
    actual: NodeActualState,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE node_states
        SET actual_state = ?2, error_message = ?3, updated_at = ?4
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(actual)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_node_error_message(pool: &Db, id: Uuid, message: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE node_states SET error_message = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_node_attempt(
    pool: &Db,
    id: Uuid,
    attempts: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE node_states
        SET enforcement_attempts = ?2, last_enforcement_at = ?3, updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(attempts)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_node_failed(pool: &Db, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE node_states SET enforcement_failed_at = ?2, updated_at = ?2 WHERE id = ?1",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clears retry bookkeeping once the node matches its desired state.
pub async fn clear_node_enforcement(pool: &Db, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE node_states
        SET enforcement_attempts = 0, enforcement_failed_at = NULL, error_message = NULL, updated_at = ?2
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Manual reset: a fresh retry budget with no backoff history.
pub async fn reset_node_enforcement(pool: &Db, lab_id: &str, node_name: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE node_states
        SET enforcement_attempts = 0,
            last_enforcement_at = NULL,
            enforcement_failed_at = NULL,
            error_message = NULL,
            updated_at = ?3
        WHERE lab_id = ?1 AND node_name = ?2
        "#,
    )
    .bind(lab_id)
    .bind(node_name)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
