//! Endpoint reservation ledger.
//!
//! Every link whose desired state is `up` owns exactly two rows in
//! `link_endpoint_reservations`, and the unique index on
//! `(lab_id, node_name, interface_name)` keeps any endpoint from being
//! claimed twice. The eager path (`claim_link_endpoints` /
//! `release_link_endpoints`) runs inside the caller's transaction; the sweep
//! (`reconcile_link_endpoint_reservations`) heals whatever drift remains.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::persistence::{
    Db, LinkDesiredState, LinkSide, LinkStateRecord, ReservationRecord, links as link_store,
    reservations as reservation_store,
};
use crate::telemetry;
use crate::Result;

/// An endpoint already reserved by another link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConflict {
    pub lab_id: String,
    pub node_name: String,
    pub interface_name: String,
    pub held_by: Uuid,
    pub requested_by: Uuid,
}

impl fmt::Display for EndpointConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint {}:{} in lab {} is already reserved by link {}",
            self.node_name, self.interface_name, self.lab_id, self.held_by
        )
    }
}

impl std::error::Error for EndpointConflict {}

/// Lab-scoped endpoint identity.
type EndpointId = (String, String, String);

fn link_endpoints(link: &LinkStateRecord) -> BTreeSet<EndpointId> {
    LinkSide::BOTH
        .iter()
        .map(|side| {
            let view = link.side(*side);
            (
                link.lab_id.clone(),
                view.node.to_string(),
                view.interface.to_string(),
            )
        })
        .collect()
}

/// Reserves both endpoints of `link` for it. Rows the link already owns are
/// kept; an endpoint owned by any other link fails with [`EndpointConflict`].
/// Returns the number of rows inserted.
pub async fn claim_link_endpoints(
    conn: &mut SqliteConnection,
    link: &LinkStateRecord,
) -> Result<usize> {
    let mut claimed = 0;
    for (lab_id, node, interface) in link_endpoints(link) {
        if let Some(existing) =
            reservation_store::find_reservation(conn, &lab_id, &node, &interface).await?
        {
            if existing.link_state_id == link.id {
                continue;
            }
            return Err(conflict(&existing, link.id).into());
        }

        match reservation_store::insert_reservation(conn, &lab_id, &node, &interface, link.id).await
        {
            Ok(()) => claimed += 1,
            Err(err) if is_unique_violation(&err) => {
                // Lost a race with another writer; report who won.
                let holder =
                    reservation_store::find_reservation(conn, &lab_id, &node, &interface).await?;
                return Err(match holder {
                    Some(existing) => conflict(&existing, link.id).into(),
                    None => err,
                });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(claimed)
}

fn conflict(existing: &ReservationRecord, requested_by: Uuid) -> EndpointConflict {
    EndpointConflict {
        lab_id: existing.lab_id.clone(),
        node_name: existing.node_name.clone(),
        interface_name: existing.interface_name.clone(),
        held_by: existing.link_state_id,
        requested_by,
    }
}

pub async fn release_link_endpoints(conn: &mut SqliteConnection, link_id: Uuid) -> Result<u64> {
    reservation_store::delete_reservations_for_link(conn, link_id).await
}

/// Claims in a transaction of its own.
pub async fn claim_for_link(db: &Db, link: &LinkStateRecord) -> Result<usize> {
    let mut tx = db.begin().await?;
    let claimed = claim_link_endpoints(&mut tx, link).await?;
    tx.commit().await?;
    Ok(claimed)
}

pub async fn release_for_link(db: &Db, link_id: Uuid) -> Result<u64> {
    let mut tx = db.begin().await?;
    let released = release_link_endpoints(&mut tx, link_id).await?;
    tx.commit().await?;
    Ok(released)
}

/// Fails with [`EndpointConflict`] when an endpoint is held by a link other
/// than `owner`. Used before a link row exists.
pub async fn ensure_endpoints_free(
    db: &Db,
    lab_id: &str,
    endpoints: &[(&str, &str)],
    owner: Option<Uuid>,
) -> Result<()> {
    let mut conn = db.acquire().await?;
    for (node, interface) in endpoints {
        if let Some(existing) =
            reservation_store::find_reservation(&mut conn, lab_id, node, interface).await?
            && Some(existing.link_state_id) != owner
        {
            return Err(conflict(&existing, owner.unwrap_or_else(Uuid::nil)).into());
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReservationReconcileReport {
    pub checked: usize,
    pub claimed: usize,
    pub released: usize,
    pub orphans_removed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReservationDriftCounts {
    pub missing: usize,
    pub orphaned: usize,
    pub conflicts: usize,
}

/// What a sweep would change, computed without touching the database.
#[derive(Debug, Default)]
struct ReservationPlan {
    orphans: Vec<Uuid>,
    stale: Vec<Uuid>,
    missing: Vec<(EndpointId, Uuid)>,
    conflicts: BTreeSet<EndpointId>,
}

fn plan_reservations(links: &[LinkStateRecord], reservations: &[ReservationRecord]) -> ReservationPlan {
    let mut plan = ReservationPlan::default();
    let by_id: HashMap<Uuid, &LinkStateRecord> = links.iter().map(|l| (l.id, l)).collect();

    // Endpoint -> every up link that wants it.
    let mut wanted: BTreeMap<EndpointId, Vec<Uuid>> = BTreeMap::new();
    for link in links.iter().filter(|l| l.desired_state == LinkDesiredState::Up) {
        for endpoint in link_endpoints(link) {
            wanted.entry(endpoint).or_default().push(link.id);
        }
    }
    plan.conflicts = wanted
        .iter()
        .filter(|(_, owners)| owners.len() > 1)
        .map(|(endpoint, _)| endpoint.clone())
        .collect();

    let mut held: HashMap<EndpointId, Uuid> = HashMap::new();
    for reservation in reservations {
        let endpoint = (
            reservation.lab_id.clone(),
            reservation.node_name.clone(),
            reservation.interface_name.clone(),
        );
        match by_id.get(&reservation.link_state_id) {
            None => plan.orphans.push(reservation.id),
            Some(link)
                if link.desired_state != LinkDesiredState::Up
                    || !link_endpoints(link).contains(&endpoint) =>
            {
                plan.stale.push(reservation.id)
            }
            Some(link) => {
                held.insert(endpoint, link.id);
            }
        }
    }

    for (endpoint, owners) in &wanted {
        if plan.conflicts.contains(endpoint) || held.contains_key(endpoint) {
            continue;
        }
        if let Some(owner) = owners.first() {
            plan.missing.push((endpoint.clone(), *owner));
        }
    }
    plan
}

/// Brings the ledger in line with link desired states in one transaction.
/// Conflicting endpoints are counted, logged and left as they are.
pub async fn reconcile_link_endpoint_reservations(db: &Db) -> Result<ReservationReconcileReport> {
    let mut tx = db.begin().await?;
    let links = link_store::list_all_link_states(&mut *tx).await?;
    let reservations = reservation_store::list_reservations(&mut tx).await?;
    let plan = plan_reservations(&links, &reservations);

    for id in &plan.orphans {
        reservation_store::delete_reservation(&mut tx, *id).await?;
    }
    for id in &plan.stale {
        reservation_store::delete_reservation(&mut tx, *id).await?;
    }
    for ((lab_id, node, interface), link_id) in &plan.missing {
        reservation_store::insert_reservation(&mut tx, lab_id, node, interface, *link_id).await?;
    }
    tx.commit().await?;

    for (lab_id, node, interface) in &plan.conflicts {
        warn!(
            lab_id,
            node,
            interface,
            "endpoint claimed by more than one up link; operator action required"
        );
    }

    let report = ReservationReconcileReport {
        checked: links.len(),
        claimed: plan.missing.len(),
        released: plan.stale.len(),
        orphans_removed: plan.orphans.len(),
        conflicts: plan.conflicts.len(),
    };
    telemetry::record_reservation_reconcile("claimed", report.claimed);
    telemetry::record_reservation_reconcile("released", report.released);
    telemetry::record_reservation_reconcile("orphans_removed", report.orphans_removed);
    telemetry::record_reservation_reconcile("conflicts", report.conflicts);
    if report.claimed + report.released + report.orphans_removed > 0 {
        info!(?report, "endpoint reservations reconciled");
    }
    Ok(report)
}

/// Read-only view of the drift the next sweep would act on.
pub async fn get_link_endpoint_reservation_drift_counts(db: &Db) -> Result<ReservationDriftCounts> {
    let mut conn = db.acquire().await?;
    let links = link_store::list_all_link_states(&mut *conn).await?;
    let reservations = reservation_store::list_reservations(&mut conn).await?;
    let plan = plan_reservations(&links, &reservations);
    Ok(ReservationDriftCounts {
        missing: plan.missing.len(),
        orphaned: plan.orphans.len() + plan.stale.len(),
        conflicts: plan.conflicts.len(),
    })
}
