use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, FromRow)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    /// Base URL of the host agent.
    pub address: String,
    /// VTEP address used as the VXLAN tunnel endpoint.
    pub data_ip: String,
    pub status: HostStatus,
    pub consecutive_failures: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    pub fn is_online(&self) -> bool {
        self.status == HostStatus::Online
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct NewHost {
    pub id: String,
    pub name: String,
    pub address: String,
    pub data_ip: String,
}

/// Inserts or refreshes a host's addressing. Status is left to the health
/// probe; new hosts start offline until their first successful probe.
pub async fn upsert_host(pool: &Db, host: &NewHost) -> Result<HostRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO hosts (id, name, address, data_ip, status, consecutive_failures, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 'offline', 0, ?5, ?5)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            address = excluded.address,
            data_ip = excluded.data_ip,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&host.id)
    .bind(&host.name)
    .bind(&host.address)
    .bind(&host.data_ip)
    .bind(now)
    .execute(pool)
    .await?;

    get_host(pool, &host.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("host upsert did not return row"))
}

pub async fn get_host(pool: &Db, id: &str) -> Result<Option<HostRecord>> {
    let host = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT id, name, address, data_ip, status, consecutive_failures, last_seen, created_at, updated_at
        FROM hosts
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(host)
}

pub async fn list_hosts(pool: &Db) -> Result<Vec<HostRecord>> {
    let hosts = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT id, name, address, data_ip, status, consecutive_failures, last_seen, created_at, updated_at
        FROM hosts
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(hosts)
}

/// Marks the host online and clears its failure streak. Returns the status
/// the host had before the probe.
pub async fn record_probe_success(
    pool: &Db,
    id: &str,
    seen_at: DateTime<Utc>,
) -> Result<Option<HostStatus>> {
    let previous = get_host(pool, id).await?.map(|h| h.status);
    sqlx::query(
        r#"
        UPDATE hosts
        SET status = 'online', consecutive_failures = 0, last_seen = ?2, updated_at = ?2
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(seen_at)
    .execute(pool)
    .await?;
    Ok(previous)
}

/// Counts a failed probe and flips the host offline once the streak reaches
/// `threshold`. Returns the resulting record.
pub async fn record_probe_failure(
    pool: &Db,
    id: &str,
    threshold: u32,
) -> Result<Option<HostRecord>> {
    sqlx::query(
        r#"
        UPDATE hosts
        SET consecutive_failures = consecutive_failures + 1,
            status = CASE WHEN consecutive_failures + 1 >= ?2 THEN 'offline' ELSE status END,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(i64::from(threshold.max(1)))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    get_host(pool, id).await
}

pub async fn set_host_status(pool: &Db, id: &str, status: HostStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE hosts SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::{init_pool, run_migrations};

    async fn setup() -> Db {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn host(id: &str) -> NewHost {
        NewHost {
            id: id.into(),
            name: format!("{id}-name"),
            address: format!("http://{id}:8081"),
            data_ip: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn new_hosts_start_offline_and_upsert_keeps_status() {
        let pool = setup().await;
        let created = upsert_host(&pool, &host("h1")).await.expect("insert");
        assert_eq!(created.status, HostStatus::Offline);

        record_probe_success(&pool, "h1", Utc::now()).await.expect("probe");
        let mut changed = host("h1");
        changed.data_ip = "10.0.0.9".into();
        let updated = upsert_host(&pool, &changed).await.expect("update");
        assert_eq!(updated.status, HostStatus::Online);
        assert_eq!(updated.data_ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn failures_flip_offline_at_threshold() {
        let pool = setup().await;
        upsert_host(&pool, &host("h1")).await.expect("insert");
        record_probe_success(&pool, "h1", Utc::now()).await.expect("probe");

        let first = record_probe_failure(&pool, "h1", 2).await.expect("fail").expect("row");
        assert_eq!(first.status, HostStatus::Online);
        assert_eq!(first.consecutive_failures, 1);

        let second = record_probe_failure(&pool, "h1", 2).await.expect("fail").expect("row");
        assert_eq!(second.status, HostStatus::Offline);

        let previous = record_probe_success(&pool, "h1", Utc::now()).await.expect("probe");
        assert_eq!(previous, Some(HostStatus::Offline));
        let host = get_host(&pool, "h1").await.expect("get").expect("row");
        assert_eq!(host.consecutive_failures, 0);
        assert!(host.is_online());
    }
}
