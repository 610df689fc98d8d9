use super::Db;
use crate::Result;

/// Takes `key` for `token` unless an unexpired lease exists. Expired leases
/// are overwritten in the same statement.
pub async fn try_acquire(pool: &Db, key: &str, token: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO leases (key, token, expires_at_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            token = excluded.token,
            expires_at_ms = excluded.expires_at_ms
        WHERE leases.expires_at_ms <= ?4
        "#,
    )
    .bind(key)
    .bind(token)
    .bind(now_ms.saturating_add(ttl_ms))
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Deletes the lease only if `token` still owns it.
pub async fn release(pool: &Db, key: &str, token: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM leases WHERE key = ?1 AND token = ?2")
        .bind(key)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Extends an unexpired lease still owned by `token`. An expired lease is
/// not revived even when nobody has taken it over.
pub async fn extend(pool: &Db, key: &str, token: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE leases SET expires_at_ms = ?3
        WHERE key = ?1 AND token = ?2 AND expires_at_ms > ?4
        "#,
    )
    .bind(key)
    .bind(token)
    .bind(now_ms.saturating_add(ttl_ms))
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn is_held(pool: &Db, key: &str, now_ms: i64) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE key = ?1 AND expires_at_ms > ?2")
            .bind(key)
            .bind(now_ms)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Drops expired rows so the table does not grow with one-shot cooldown keys.
pub async fn purge_expired(pool: &Db, now_ms: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM leases WHERE expires_at_ms <= ?1")
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
