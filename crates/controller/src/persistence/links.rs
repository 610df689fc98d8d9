use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Db, vlan_from_db};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum LinkDesiredState {
    Up,
    Down,
}

impl LinkDesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkDesiredState::Up => "up",
            LinkDesiredState::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum LinkActualState {
    Unknown,
    Pending,
    Creating,
    Up,
    Down,
    Error,
}

impl LinkActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkActualState::Unknown => "unknown",
            LinkActualState::Pending => "pending",
            LinkActualState::Creating => "creating",
            LinkActualState::Up => "up",
            LinkActualState::Down => "down",
            LinkActualState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum OperState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum CarrierState {
    On,
    Off,
}

impl From<CarrierState> for common::api::CarrierState {
    fn from(value: CarrierState) -> Self {
        match value {
            CarrierState::On => common::api::CarrierState::On,
            CarrierState::Off => common::api::CarrierState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSide {
    Source,
    Target,
}

impl LinkSide {
    pub const BOTH: [LinkSide; 2] = [LinkSide::Source, LinkSide::Target];

    pub fn peer(&self) -> LinkSide {
        match self {
            LinkSide::Source => LinkSide::Target,
            LinkSide::Target => LinkSide::Source,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkSide::Source => "source",
            LinkSide::Target => "target",
        }
    }

    fn column(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.as_str())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LinkStateRecord {
    pub id: Uuid,
    pub lab_id: String,
    pub link_name: String,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    pub desired_state: LinkDesiredState,
    pub actual_state: LinkActualState,
    pub is_cross_host: bool,
    pub source_host_id: Option<String>,
    pub target_host_id: Option<String>,
    pub source_vlan_tag: Option<i64>,
    pub target_vlan_tag: Option<i64>,
    pub source_carrier_state: CarrierState,
    pub target_carrier_state: CarrierState,
    pub source_oper_state: OperState,
    pub target_oper_state: OperState,
    pub source_oper_reason: Option<String>,
    pub target_oper_reason: Option<String>,
    pub source_last_change_at: Option<DateTime<Utc>>,
    pub target_last_change_at: Option<DateTime<Utc>>,
    pub source_vxlan_attached: bool,
    pub target_vxlan_attached: bool,
    pub oper_epoch: i64,
    pub error_message: Option<String>,
    pub enforcement_attempts: i64,
    pub last_enforcement_at: Option<DateTime<Utc>>,
    pub enforcement_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Borrowed view of one side of a link.
#[derive(Debug, Clone, Copy)]
pub struct SideView<'a> {
    pub side: LinkSide,
    pub node: &'a str,
    pub interface: &'a str,
    pub host_id: Option<&'a str>,
    pub vlan_tag: Option<u16>,
    pub carrier: CarrierState,
    pub oper_state: OperState,
    pub oper_reason: Option<&'a str>,
    pub vxlan_attached: bool,
}

impl LinkStateRecord {
    pub fn side(&self, side: LinkSide) -> SideView<'_> {
        match side {
            LinkSide::Source => SideView {
                side,
                node: &self.source_node,
                interface: &self.source_interface,
                host_id: self.source_host_id.as_deref(),
                vlan_tag: vlan_from_db(self.source_vlan_tag),
                carrier: self.source_carrier_state,
                oper_state: self.source_oper_state,
                oper_reason: self.source_oper_reason.as_deref(),
                vxlan_attached: self.source_vxlan_attached,
            },
            LinkSide::Target => SideView {
                side,
                node: &self.target_node,
                interface: &self.target_interface,
                host_id: self.target_host_id.as_deref(),
                vlan_tag: vlan_from_db(self.target_vlan_tag),
                carrier: self.target_carrier_state,
                oper_state: self.target_oper_state,
                oper_reason: self.target_oper_reason.as_deref(),
                vxlan_attached: self.target_vxlan_attached,
            },
        }
    }

    pub fn attached_sides(&self) -> usize {
        usize::from(self.source_vxlan_attached) + usize::from(self.target_vxlan_attached)
    }
}

#[derive(Debug, Clone)]
pub struct NewLinkState {
    pub lab_id: String,
    pub link_name: String,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    pub source_host_id: Option<String>,
    pub target_host_id: Option<String>,
    pub desired_state: LinkDesiredState,
}

impl NewLinkState {
    /// Cross-host when both placements are known and differ.
    pub fn is_cross_host(&self) -> bool {
        matches!(
            (&self.source_host_id, &self.target_host_id),
            (Some(a), Some(b)) if a != b
        )
    }
}

/// Computed oper fields for both sides, written together with an epoch bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperUpdate {
    pub source_state: OperState,
    pub source_reason: Option<String>,
    pub target_state: OperState,
    pub target_reason: Option<String>,
    pub source_changed_at: Option<DateTime<Utc>>,
    pub target_changed_at: Option<DateTime<Utc>>,
}

const LINK_COLUMNS: &str = "id, lab_id, link_name, source_node, source_interface, target_node, \
     target_interface, desired_state, actual_state, is_cross_host, source_host_id, target_host_id, \
     source_vlan_tag, target_vlan_tag, source_carrier_state, target_carrier_state, \
     source_oper_state, target_oper_state, source_oper_reason, target_oper_reason, \
     source_last_change_at, target_last_change_at, source_vxlan_attached, target_vxlan_attached, \
     oper_epoch, error_message, enforcement_attempts, last_enforcement_at, enforcement_failed_at, \
     created_at, updated_at";

pub async fn upsert_link_state(pool: &Db, link: &NewLinkState) -> Result<LinkStateRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO link_states (
            id, lab_id, link_name, source_node, source_interface, target_node, target_interface,
            desired_state, actual_state, is_cross_host, source_host_id, target_host_id,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'unknown', ?9, ?10, ?11, ?12, ?12)
        ON CONFLICT(lab_id, link_name) DO UPDATE SET
            is_cross_host = excluded.is_cross_host,
            source_host_id = excluded.source_host_id,
            target_host_id = excluded.target_host_id,
            enforcement_attempts = CASE
                WHEN link_states.desired_state <> excluded.desired_state THEN 0
                ELSE link_states.enforcement_attempts END,
            enforcement_failed_at = CASE
                WHEN link_states.desired_state <> excluded.desired_state THEN NULL
                ELSE link_states.enforcement_failed_at END,
            desired_state = excluded.desired_state,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&link.lab_id)
    .bind(&link.link_name)
    .bind(&link.source_node)
    .bind(&link.source_interface)
    .bind(&link.target_node)
    .bind(&link.target_interface)
    .bind(link.desired_state)
    .bind(link.is_cross_host())
    .bind(&link.source_host_id)
    .bind(&link.target_host_id)
    .bind(now)
    .execute(pool)
    .await?;

    get_link_state_by_name(pool, &link.lab_id, &link.link_name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("link upsert did not return row"))
}

pub async fn get_link_state(pool: &Db, id: Uuid) -> Result<Option<LinkStateRecord>> {
    let record = sqlx::query_as::<_, LinkStateRecord>(&format!(
        "SELECT {LINK_COLUMNS} FROM link_states WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_link_state_by_name(
    pool: &Db,
    lab_id: &str,
    link_name: &str,
) -> Result<Option<LinkStateRecord>> {
    let record = sqlx::query_as::<_, LinkStateRecord>(&format!(
        "SELECT {LINK_COLUMNS} FROM link_states WHERE lab_id = ?1 AND link_name = ?2"
    ))
    .bind(lab_id)
    .bind(link_name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_lab_link_states(pool: &Db, lab_id: &str) -> Result<Vec<LinkStateRecord>> {
    let records = sqlx::query_as::<_, LinkStateRecord>(&format!(
        "SELECT {LINK_COLUMNS} FROM link_states WHERE lab_id = ?1 ORDER BY link_name"
    ))
    .bind(lab_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Takes any executor so the reservation ledger can read inside its
/// transaction.
pub async fn list_all_link_states<'e, E>(executor: E) -> Result<Vec<LinkStateRecord>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let records = sqlx::query_as::<_, LinkStateRecord>(&format!(
        "SELECT {LINK_COLUMNS} FROM link_states ORDER BY lab_id, link_name"
    ))
    .fetch_all(executor)
    .await?;
    Ok(records)
}

pub async fn delete_link_state(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM link_states WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn set_link_desired_state(pool: &Db, id: Uuid, desired: LinkDesiredState) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE link_states
        SET enforcement_attempts = CASE WHEN desired_state <> ?2 THEN 0 ELSE enforcement_attempts END,
            enforcement_failed_at = CASE WHEN desired_state <> ?2 THEN NULL ELSE enforcement_failed_at END,
            desired_state = ?2,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(desired)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Writes the actual state. Callers check legality against the link state
/// machine first.
pub async fn set_link_actual_state(
    pool: &Db,
    id: Uuid,
    actual: LinkActualState,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE link_states SET actual_state = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
    )
    .bind(id)
    .bind(actual)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_link_error_message(pool: &Db, id: Uuid, message: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE link_states SET error_message = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_side_vlan_tag(pool: &Db, id: Uuid, side: LinkSide, tag: Option<u16>) -> Result<()> {
    let column = side.column("vlan_tag");
    sqlx::query(&format!(
        "UPDATE link_states SET {column} = ?2, updated_at = ?3 WHERE id = ?1"
    ))
    .bind(id)
    .bind(tag.map(i64::from))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_side_attached(pool: &Db, id: Uuid, side: LinkSide, attached: bool) -> Result<()> {
    let column = side.column("vxlan_attached");
    sqlx::query(&format!(
        "UPDATE link_states SET {column} = ?2, updated_at = ?3 WHERE id = ?1"
    ))
    .bind(id)
    .bind(attached)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_side_carrier(
    pool: &Db,
    id: Uuid,
    side: LinkSide,
    carrier: CarrierState,
) -> Result<()> {
    let column = side.column("carrier_state");
    sqlx::query(&format!(
        "UPDATE link_states SET {column} = ?2, updated_at = ?3 WHERE id = ?1"
    ))
    .bind(id)
    .bind(carrier)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Clears per-side dataplane facts after a teardown.
pub async fn clear_link_dataplane(pool: &Db, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE link_states
        SET source_vlan_tag = NULL,
            target_vlan_tag = NULL,
            source_vxlan_attached = 0,
            target_vxlan_attached = 0,
            updated_at = ?2
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn write_oper_state(pool: &Db, id: Uuid, update: &OperUpdate) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE link_states
        SET source_oper_state = ?2,
            source_oper_reason = ?3,
            source_last_change_at = COALESCE(?4, source_last_change_at),
            target_oper_state = ?5,
            target_oper_reason = ?6,
            target_last_change_at = COALESCE(?7, target_last_change_at),
            oper_epoch = oper_epoch + 1,
            updated_at = ?8
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(update.source_state)
    .bind(&update.source_reason)
    .bind(update.source_changed_at)
    .bind(update.target_state)
    .bind(&update.target_reason)
    .bind(update.target_changed_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_link_attempt(
    pool: &Db,
    id: Uuid,
    attempts: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE link_states
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

pub async fn mark_link_failed(pool: &Db, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE link_states SET enforcement_failed_at = ?2, updated_at = ?2 WHERE id = ?1",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_link_enforcement(pool: &Db, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE link_states
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

pub async fn reset_link_enforcement(pool: &Db, lab_id: &str, link_name: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE link_states
        SET enforcement_attempts = 0,
            last_enforcement_at = NULL,
            enforcement_failed_at = NULL,
            error_message = NULL,
            updated_at = ?3
        WHERE lab_id = ?1 AND link_name = ?2
        "#,
    )
    .bind(lab_id)
    .bind(link_name)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
