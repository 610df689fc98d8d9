use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Db, vlan_from_db};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TunnelStatus {
    Pending,
    Creating,
    Active,
    Error,
    Deleting,
    /// Owning link is gone; the tunnel waits for its hosts to come back.
    Cleanup,
}

#[derive(Debug, Clone, FromRow)]
pub struct VxlanTunnelRecord {
    pub id: Uuid,
    pub lab_id: String,
    pub link_state_id: Option<Uuid>,
    pub link_name: String,
    pub vni: i64,
    pub vlan_tag: Option<i64>,
    pub agent_a_id: String,
    pub agent_a_ip: String,
    pub agent_b_id: String,
    pub agent_b_ip: String,
    pub port_name: String,
    pub status: TunnelStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VxlanTunnelRecord {
    pub fn vni(&self) -> u32 {
        u32::try_from(self.vni).unwrap_or_default()
    }

    pub fn vlan_tag(&self) -> Option<u16> {
        vlan_from_db(self.vlan_tag)
    }

    /// `(agent_id, vtep_ip)` pairs for both ends.
    pub fn agents(&self) -> [(&str, &str); 2] {
        [
            (&self.agent_a_id, &self.agent_a_ip),
            (&self.agent_b_id, &self.agent_b_ip),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct NewVxlanTunnel {
    pub lab_id: String,
    pub link_state_id: Uuid,
    pub link_name: String,
    pub vni: u32,
    pub agent_a_id: String,
    pub agent_a_ip: String,
    pub agent_b_id: String,
    pub agent_b_ip: String,
    pub port_name: String,
}

const TUNNEL_COLUMNS: &str = "id, lab_id, link_state_id, link_name, vni, vlan_tag, agent_a_id, \
     agent_a_ip, agent_b_id, agent_b_ip, port_name, status, error_message, created_at, updated_at";

pub async fn insert_tunnel(pool: &Db, tunnel: &NewVxlanTunnel) -> Result<VxlanTunnelRecord> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO vxlan_tunnels (
            id, lab_id, link_state_id, link_name, vni, agent_a_id, agent_a_ip,
            agent_b_id, agent_b_ip, port_name, status, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11, ?11)
        "#,
    )
    .bind(id)
    .bind(&tunnel.lab_id)
    .bind(tunnel.link_state_id)
    .bind(&tunnel.link_name)
    .bind(i64::from(tunnel.vni))
    .bind(&tunnel.agent_a_id)
    .bind(&tunnel.agent_a_ip)
    .bind(&tunnel.agent_b_id)
    .bind(&tunnel.agent_b_ip)
    .bind(&tunnel.port_name)
    .bind(now)
    .execute(pool)
    .await?;

    get_tunnel(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("tunnel insert did not return row"))
}

pub async fn get_tunnel(pool: &Db, id: Uuid) -> Result<Option<VxlanTunnelRecord>> {
    let record = sqlx::query_as::<_, VxlanTunnelRecord>(&format!(
        "SELECT {TUNNEL_COLUMNS} FROM vxlan_tunnels WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_tunnel_for_link(pool: &Db, link_state_id: Uuid) -> Result<Option<VxlanTunnelRecord>> {
    let record = sqlx::query_as::<_, VxlanTunnelRecord>(&format!(
        "SELECT {TUNNEL_COLUMNS} FROM vxlan_tunnels WHERE link_state_id = ?1"
    ))
    .bind(link_state_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Tunnels in `cleanup` or whose owning link no longer exists.
pub async fn list_orphan_tunnels(pool: &Db) -> Result<Vec<VxlanTunnelRecord>> {
    let records = sqlx::query_as::<_, VxlanTunnelRecord>(&format!(
        r#"
        SELECT {TUNNEL_COLUMNS}
        FROM vxlan_tunnels
        WHERE status = 'cleanup'
           OR link_state_id IS NULL
           OR link_state_id NOT IN (SELECT id FROM link_states)
        ORDER BY created_at
        "#
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Whether any tunnel other than the one owned by `link_state_id` uses `vni`.
pub async fn vni_in_use(pool: &Db, vni: u32, link_state_id: Uuid) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM vxlan_tunnels
        WHERE vni = ?1 AND (link_state_id IS NULL OR link_state_id <> ?2)
        "#,
    )
    .bind(i64::from(vni))
    .bind(link_state_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn set_tunnel_status(
    pool: &Db,
    id: Uuid,
    status: TunnelStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE vxlan_tunnels SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
    )
    .bind(id)
    .bind(status)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Annotates without touching `updated_at`, so deferral does not reset the
/// staleness clock.
pub async fn annotate_tunnel(pool: &Db, id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE vxlan_tunnels SET error_message = ?2 WHERE id = ?1")
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_tunnel_vlan(pool: &Db, id: Uuid, vlan_tag: Option<u16>) -> Result<()> {
    sqlx::query("UPDATE vxlan_tunnels SET vlan_tag = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(vlan_tag.map(i64::from))
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

/// Releases the tunnel from its link so the link row can be deleted while the
/// dataplane teardown is still pending.
pub async fn detach_tunnel_from_link(pool: &Db, id: Uuid, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE vxlan_tunnels
        SET link_state_id = NULL, status = 'cleanup', error_message = ?2, updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_tunnel(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM vxlan_tunnels WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
