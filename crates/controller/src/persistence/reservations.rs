use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ReservationRecord {
    pub id: Uuid,
    pub lab_id: String,
    pub node_name: String,
    pub interface_name: String,
    pub link_state_id: Uuid,
    pub created_at: DateTime<Utc>,
}

const RESERVATION_COLUMNS: &str =
    "id, lab_id, node_name, interface_name, link_state_id, created_at";

// These take a connection so the ledger can run them inside one transaction.

pub async fn find_reservation(
    conn: &mut SqliteConnection,
    lab_id: &str,
    node_name: &str,
    interface_name: &str,
) -> Result<Option<ReservationRecord>> {
    let record = sqlx::query_as::<_, ReservationRecord>(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM link_endpoint_reservations \
         WHERE lab_id = ?1 AND node_name = ?2 AND interface_name = ?3"
    ))
    .bind(lab_id)
    .bind(node_name)
    .bind(interface_name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(record)
}

pub async fn insert_reservation(
    conn: &mut SqliteConnection,
    lab_id: &str,
    node_name: &str,
    interface_name: &str,
    link_state_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO link_endpoint_reservations (id, lab_id, node_name, interface_name, link_state_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(lab_id)
    .bind(node_name)
    .bind(interface_name)
    .bind(link_state_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_reservations(conn: &mut SqliteConnection) -> Result<Vec<ReservationRecord>> {
    let records = sqlx::query_as::<_, ReservationRecord>(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM link_endpoint_reservations \
         ORDER BY lab_id, node_name, interface_name"
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(records)
}

pub async fn delete_reservation(conn: &mut SqliteConnection, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM link_endpoint_reservations WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_reservations_for_link(
    conn: &mut SqliteConnection,
    link_state_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM link_endpoint_reservations WHERE link_state_id = ?1")
        .bind(link_state_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
