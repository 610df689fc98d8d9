//! Verifies realized links against the agents and repairs drift.
//!
//! Runs on its own interval, independent of enforcement. Per lab (under the
//! lab lock) every `up` link is checked; cross-host links left in `error`
//! after a partial connect are recovered side by side. Orphaned tunnels,
//! the reservation ledger and oper state are swept afterwards.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::{ControllerContext, HostIndex};
use crate::coordination::{LeaseGuard, LockOutcome, still_held};
use crate::persistence::{
    LinkActualState, LinkDesiredState, LinkSide, LinkStateRecord, NodeActualState, TunnelStatus,
    links as link_store, nodes as node_store, tunnels as tunnel_store,
};
use crate::services::links::{self as link_service, apply_link_state};
use crate::services::overlay::{self, SideCheck};
use crate::services::reservations::{self, ReservationReconcileReport};
use crate::telemetry;
use crate::Result;

const VLAN_DRIFT: &str = "VLAN_DRIFT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub labs: usize,
    pub labs_locked: usize,
    /// Labs abandoned mid-pass because their lease was lost.
    pub leases_lost: usize,
    pub links_checked: usize,
    pub healthy: usize,
    /// Verification could not reach an agent; nothing changed.
    pub unverified: usize,
    pub repaired: usize,
    pub repair_failed: usize,
    pub recovered: usize,
    pub recovery_failed: usize,
    pub orphans_removed: usize,
    pub orphans_deferred: usize,
    pub oper_changed: usize,
    pub reservations: ReservationReconcileReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Untouched,
    Healthy,
    Unverified,
    Repaired,
    RepairFailed,
    Recovered,
    RecoveryFailed,
}

impl ReconciliationReport {
    fn count(&mut self, outcome: LinkOutcome) {
        match outcome {
            LinkOutcome::Untouched => return,
            LinkOutcome::Healthy => self.healthy += 1,
            LinkOutcome::Unverified => self.unverified += 1,
            LinkOutcome::Repaired => self.repaired += 1,
            LinkOutcome::RepairFailed => self.repair_failed += 1,
            LinkOutcome::Recovered => self.recovered += 1,
            LinkOutcome::RecoveryFailed => self.recovery_failed += 1,
        }
        self.links_checked += 1;
    }
}

pub async fn run_reconciliation_pass(ctx: &ControllerContext) -> Result<ReconciliationReport> {
    let mut report = ReconciliationReport::default();
    let hosts = ctx.hosts().await?;

    for lab_id in node_store::list_lab_ids(&ctx.db).await? {
        let guard = match ctx.lab_lock().acquire(&lab_id).await {
            LockOutcome::Acquired(guard) => Some(guard),
            LockOutcome::Contended => {
                debug!(lab_id, "lab locked elsewhere; skipping reconciliation");
                report.labs_locked += 1;
                continue;
            }
            LockOutcome::Unavailable => None,
        };
        match reconcile_lab(ctx, &hosts, &lab_id, guard.as_ref()).await {
            Ok((outcomes, lease_lost)) => {
                report.labs += 1;
                report.leases_lost += usize::from(lease_lost);
                for outcome in outcomes {
                    report.count(outcome);
                }
            }
            Err(err) => warn!(lab_id, ?err, "lab reconciliation failed"),
        }
        if let Some(guard) = guard {
            guard.release().await;
        }
    }

    cleanup_orphan_tunnels(ctx, &hosts, &mut report).await?;
    report.reservations = reservations::reconcile_link_endpoint_reservations(&ctx.db).await?;

    let hosts = ctx.hosts().await?;
    for link in link_store::list_all_link_states(&ctx.db).await? {
        if link_service::recompute_with_hosts(&ctx.db, &hosts, &link).await? {
            report.oper_changed += 1;
        }
    }
    Ok(report)
}

/// Links are checked in batches of `max_concurrent_links`; the lease is
/// renewed before each batch and the lab is abandoned once it is lost.
async fn reconcile_lab(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    lab_id: &str,
    guard: Option<&LeaseGuard>,
) -> Result<(Vec<LinkOutcome>, bool)> {
    let running: HashMap<String, bool> = node_store::list_lab_node_states(&ctx.db, lab_id)
        .await?
        .into_iter()
        .map(|n| (n.node_name, n.actual_state == NodeActualState::Running))
        .collect();
    let links = link_store::list_lab_link_states(&ctx.db, lab_id).await?;
    let limit = ctx.cfg.reconciliation.max_concurrent_links.max(1);

    let mut outcomes = Vec::with_capacity(links.len());
    for batch in links.chunks(limit) {
        if !still_held(guard).await {
            warn!(lab_id, remaining = links.len() - outcomes.len(), "lab lease lost; abandoning lab");
            return Ok((outcomes, true));
        }
        let pending: Vec<_> = batch.iter().map(|link| reconcile_link(ctx, hosts, link, &running)).collect();
        let done = futures_util::stream::iter(pending)
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await;
        outcomes.extend(done);
    }
    Ok((outcomes, false))
}

async fn reconcile_link(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
    running: &HashMap<String, bool>,
) -> LinkOutcome {
    let endpoints_running = [&link.source_node, &link.target_node]
        .iter()
        .all(|node| running.get(node.as_str()).copied().unwrap_or(false));
    let result = match link.actual_state {
        LinkActualState::Up if link.is_cross_host => verify_cross_host(ctx, hosts, link).await,
        LinkActualState::Up => verify_same_host(ctx, hosts, link).await,
        LinkActualState::Error
            if link.is_cross_host
                && link.desired_state == LinkDesiredState::Up
                && endpoints_running =>
        {
            recover_partial(ctx, link).await
        }
        _ => Ok(LinkOutcome::Untouched),
    };
    result.unwrap_or_else(|err| {
        warn!(lab_id = %link.lab_id, link = %link.link_name, ?err, "link reconciliation failed");
        LinkOutcome::RepairFailed
    })
}

/// Same-host links share one VLAN; each port's live tag must equal its
/// stored tag.
async fn verify_same_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<LinkOutcome> {
    let Some(target) = hosts.online_target(link.source_host_id.as_deref()) else {
        telemetry::record_link_verification("unreachable");
        return Ok(LinkOutcome::Unverified);
    };

    let mut repaired = false;
    for side in LinkSide::BOTH {
        let view = link.side(side);
        let Some(expected) = view.vlan_tag else {
            continue;
        };
        let live = match ctx
            .agents
            .get_interface_vlan(&target, &link.lab_id, view.node, view.interface)
            .await
        {
            Ok(live) => live,
            Err(err) => {
                debug!(link = %link.link_name, %err, "interface VLAN query failed");
                telemetry::record_link_verification("unreachable");
                return Ok(LinkOutcome::Unverified);
            }
        };
        if live == Some(expected) {
            continue;
        }

        warn!(
            lab_id = %link.lab_id,
            link = %link.link_name,
            side = side.as_str(),
            expected,
            found = ?live,
            "{VLAN_DRIFT}"
        );
        telemetry::record_link_verification("fault");
        if let Err(err) = ctx
            .agents
            .set_interface_vlan(&target, &link.lab_id, view.node, view.interface, expected)
            .await
        {
            telemetry::record_link_repair("vlan_drift", "failure");
            let message = format!("{VLAN_DRIFT} on {} side: repair failed: {err}", side.as_str());
            apply_link_state(&ctx.db, link.id, link.actual_state, LinkActualState::Error, Some(&message))
                .await?;
            return Ok(LinkOutcome::RepairFailed);
        }
        telemetry::record_link_repair("vlan_drift", "success");
        repaired = true;
    }

    if repaired {
        info!(lab_id = %link.lab_id, link = %link.link_name, "VLAN drift repaired");
        return Ok(LinkOutcome::Repaired);
    }
    telemetry::record_link_verification("pass");
    Ok(LinkOutcome::Healthy)
}

/// Checks both agents' overlay tables and re-attaches only faulty sides.
async fn verify_cross_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<LinkOutcome> {
    let Some(tunnel) = tunnel_store::get_tunnel_for_link(&ctx.db, link.id).await? else {
        warn!(lab_id = %link.lab_id, link = %link.link_name, "up link has no tunnel row; reconnecting");
        telemetry::record_link_verification("fault");
        return Ok(match link_service::connect_link(ctx, link).await {
            Ok(_) => {
                telemetry::record_link_repair("tunnel_row_missing", "success");
                LinkOutcome::Repaired
            }
            Err(_) => {
                telemetry::record_link_repair("tunnel_row_missing", "failure");
                LinkOutcome::RepairFailed
            }
        });
    };

    let checks = overlay::verify_sides(ctx, hosts, link, &tunnel).await;
    if checks.iter().all(|c| c.fault.is_none()) {
        telemetry::record_link_verification("pass");
        return Ok(LinkOutcome::Healthy);
    }
    let faulty: Vec<&SideCheck> = checks.iter().filter(|c| c.needs_repair()).collect();
    if faulty.is_empty() {
        debug!(link = %link.link_name, faults = %overlay::describe_faults(&checks), "overlay check inconclusive");
        telemetry::record_link_verification("unreachable");
        return Ok(LinkOutcome::Unverified);
    }

    telemetry::record_link_verification("fault");
    warn!(
        lab_id = %link.lab_id,
        link = %link.link_name,
        faults = %overlay::describe_faults(&checks),
        "overlay drift detected"
    );
    let mut failures = Vec::new();
    for check in faulty {
        let Some(fault) = &check.fault else {
            continue;
        };
        let kind = fault.code().to_ascii_lowercase();
        match overlay::attach_side(ctx, hosts, link, &tunnel, check.side).await {
            Ok(_) => telemetry::record_link_repair(&kind, "success"),
            Err(message) => {
                telemetry::record_link_repair(&kind, "failure");
                failures.push(format!(
                    "{} on {} side: repair failed: {message}",
                    fault.code(),
                    check.side.as_str()
                ));
            }
        }
    }

    if failures.is_empty() {
        info!(lab_id = %link.lab_id, link = %link.link_name, "overlay repaired");
        return Ok(LinkOutcome::Repaired);
    }
    let message = failures.join("; ");
    apply_link_state(&ctx.db, link.id, link.actual_state, LinkActualState::Error, Some(&message)).await?;
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Error, Some(&message)).await?;
    Ok(LinkOutcome::RepairFailed)
}

/// Errored cross-host links are resumed through the regular connect path,
/// which attaches only the missing side and verifies before marking up.
async fn recover_partial(ctx: &ControllerContext, link: &LinkStateRecord) -> Result<LinkOutcome> {
    Ok(match link_service::connect_link(ctx, link).await {
        Ok(_) => {
            info!(lab_id = %link.lab_id, link = %link.link_name, "errored link recovered");
            LinkOutcome::Recovered
        }
        Err(err) => {
            debug!(lab_id = %link.lab_id, link = %link.link_name, %err, "link recovery failed");
            LinkOutcome::RecoveryFailed
        }
    })
}

/// Tears down tunnels whose link is gone once they have been idle for the
/// staleness window. Hosts that cannot be reached keep the row alive.
async fn cleanup_orphan_tunnels(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    report: &mut ReconciliationReport,
) -> Result<()> {
    let stale_after =
        ChronoDuration::from_std(Duration::from_secs(ctx.cfg.reconciliation.orphan_stale_secs))
            .unwrap_or(ChronoDuration::MAX);
    let now = Utc::now();
    for tunnel in tunnel_store::list_orphan_tunnels(&ctx.db).await? {
        if now - tunnel.updated_at < stale_after {
            continue;
        }
        let deferrals = overlay::detach_tunnel(ctx, hosts, &tunnel).await;
        if deferrals.is_empty() {
            tunnel_store::delete_tunnel(&ctx.db, tunnel.id).await?;
            telemetry::record_orphan_tunnel("removed");
            info!(lab_id = %tunnel.lab_id, link = %tunnel.link_name, vni = tunnel.vni, "orphaned tunnel removed");
            report.orphans_removed += 1;
        } else {
            let message = overlay::deferral_message(&deferrals);
            debug!(lab_id = %tunnel.lab_id, link = %tunnel.link_name, %message, "orphaned tunnel cleanup deferred");
            tunnel_store::annotate_tunnel(&ctx.db, tunnel.id, &message).await?;
            telemetry::record_orphan_tunnel("deferred");
            report.orphans_deferred += 1;
        }
    }
    Ok(())
}

pub async fn link_reconciliation_loop(ctx: ControllerContext, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.cfg.reconciliation.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match run_reconciliation_pass(&ctx).await {
            Ok(report) => debug!(?report, "link reconciliation pass complete"),
            Err(err) => warn!(?err, "link reconciliation pass failed"),
        }
    }
    info!("link reconciliation loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::persistence::{HostStatus, hosts as host_store};
    use crate::services::test_support::{
        FakeAgent, TakenOverLeaseStore, seed_host, seed_running_pair, setup_context, setup_context_with,
    };

    async fn cross_host_link(ctx: &ControllerContext, agent: &FakeAgent) -> LinkStateRecord {
        seed_host(ctx, "h1", "10.0.0.1").await;
        seed_host(ctx, "h2", "10.0.0.2").await;
        seed_running_pair(ctx, agent, "lab", ("r1", "h1"), ("r2", "h2")).await;
        link_service::create_link(ctx, "lab", ("r1", "eth1"), ("r2", "eth1"), LinkDesiredState::Up)
            .await
            .expect("link")
    }

    async fn stored(ctx: &ControllerContext, link: &LinkStateRecord) -> LinkStateRecord {
        link_store::get_link_state(&ctx.db, link.id)
            .await
            .expect("get")
            .expect("link")
    }

    #[tokio::test]
    async fn same_host_vlan_drift_is_reapplied() {
        let (ctx, agent) = setup_context().await;
        seed_host(&ctx, "h1", "10.0.0.1").await;
        seed_running_pair(&ctx, &agent, "lab", ("r1", "h1"), ("r2", "h1")).await;
        let link = link_service::create_link(&ctx, "lab", ("r1", "eth1"), ("r2", "eth1"), LinkDesiredState::Up)
            .await
            .expect("link");
        let up = link_service::connect_link(&ctx, &link).await.expect("connect");
        let tag = up.side(LinkSide::Target).vlan_tag.expect("tag");

        let clean = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(clean.healthy, 1);

        agent.set_port_vlan("h1", "lab", "r2", "eth1", 999);
        let report = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(report.repaired, 1);
        assert_eq!(agent.port_vlan("h1", "lab", "r2", "eth1"), Some(tag));
        assert_eq!(stored(&ctx, &link).await.actual_state, LinkActualState::Up);
    }

    #[tokio::test]
    async fn lost_lease_leaves_the_lab_alone() {
        let (ctx, agent) = setup_context().await;
        seed_host(&ctx, "h1", "10.0.0.1").await;
        seed_running_pair(&ctx, &agent, "lab", ("r1", "h1"), ("r2", "h1")).await;
        let link = link_service::create_link(&ctx, "lab", ("r1", "eth1"), ("r2", "eth1"), LinkDesiredState::Up)
            .await
            .expect("link");
        link_service::connect_link(&ctx, &link).await.expect("connect");
        agent.set_port_vlan("h1", "lab", "r2", "eth1", 999);

        let stolen = ControllerContext {
            leases: Arc::new(TakenOverLeaseStore),
            ..ctx
        };
        let report = run_reconciliation_pass(&stolen).await.expect("pass");
        assert_eq!(report.leases_lost, 1);
        assert_eq!(report.links_checked, 0);
        assert_eq!(agent.port_vlan("h1", "lab", "r2", "eth1"), Some(999));
    }

    #[tokio::test]
    async fn missing_tunnel_is_reattached_on_the_faulty_side_only() {
        let (ctx, agent) = setup_context().await;
        let link = cross_host_link(&ctx, &agent).await;
        link_service::connect_link(&ctx, &link).await.expect("connect");

        agent.remove_tunnel("h2", &link.link_name);
        let report = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(report.repaired, 1);
        assert!(agent.tunnel("h2", &link.link_name).is_some());
        let attaches: Vec<String> = agent
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("attach:"))
            .collect();
        assert_eq!(attaches, ["attach:h1", "attach:h2", "attach:h2"].map(String::from).to_vec());
        assert_eq!(stored(&ctx, &link).await.actual_state, LinkActualState::Up);
    }

    #[tokio::test]
    async fn unreachable_agent_leaves_link_untouched() {
        let (ctx, agent) = setup_context().await;
        let link = cross_host_link(&ctx, &agent).await;
        link_service::connect_link(&ctx, &link).await.expect("connect");

        agent.set_offline("h2", true);
        let report = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(report.unverified, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(agent.calls_for("attach"), 2);
        assert_eq!(stored(&ctx, &link).await.actual_state, LinkActualState::Up);
    }

    #[tokio::test]
    async fn partial_connect_is_recovered_by_attaching_missing_side() {
        let (ctx, agent) = setup_context().await;
        let link = cross_host_link(&ctx, &agent).await;
        agent.fail("attach:h2");
        link_service::connect_link(&ctx, &link).await.expect_err("partial");
        agent.clear_failures();

        let report = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(report.recovered, 1);
        let recovered = stored(&ctx, &link).await;
        assert_eq!(recovered.actual_state, LinkActualState::Up);
        assert_eq!(recovered.attached_sides(), 2);
        assert!(recovered.error_message.is_none());
        let tunnel = tunnel_store::get_tunnel_for_link(&ctx.db, link.id)
            .await
            .expect("lookup")
            .expect("tunnel");
        assert_eq!(tunnel.status, TunnelStatus::Active);
    }

    #[tokio::test]
    async fn failed_validation_keeps_attachment_flags() {
        let (ctx, agent) = setup_context().await;
        let link = cross_host_link(&ctx, &agent).await;
        link_service::connect_link(&ctx, &link).await.expect("connect");
        link_store::set_link_actual_state(&ctx.db, link.id, LinkActualState::Error, Some("flapped"))
            .await
            .expect("error");
        agent.set_tunnel_vni("h2", &link.link_name, 1);

        let report = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(report.recovery_failed, 1);
        let kept = stored(&ctx, &link).await;
        assert_eq!(kept.actual_state, LinkActualState::Error);
        assert_eq!(kept.attached_sides(), 2);
        let message = kept.error_message.expect("message");
        assert!(message.starts_with("validation failed"), "{message}");
        assert!(message.contains("VNI_MISMATCH"), "{message}");
    }

    #[tokio::test]
    async fn orphaned_tunnel_waits_for_offline_host() {
        let (ctx, agent) = setup_context_with("[reconciliation]\norphan_stale_secs = 0\n").await;
        let link = cross_host_link(&ctx, &agent).await;
        link_service::connect_link(&ctx, &link).await.expect("connect");
        let tunnel = tunnel_store::get_tunnel_for_link(&ctx.db, link.id)
            .await
            .expect("lookup")
            .expect("tunnel");

        agent.set_offline("h2", true);
        host_store::set_host_status(&ctx.db, "h2", HostStatus::Offline)
            .await
            .expect("offline");
        link_service::delete_link(&ctx, "lab", &link.link_name)
            .await
            .expect("delete");

        let deferred = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(deferred.orphans_deferred, 1);
        let kept = tunnel_store::get_tunnel(&ctx.db, tunnel.id)
            .await
            .expect("get")
            .expect("kept");
        assert!(kept.error_message.as_deref().unwrap_or_default().contains("offline"));

        agent.set_offline("h2", false);
        host_store::record_probe_success(&ctx.db, "h2", Utc::now())
            .await
            .expect("online");
        let cleaned = run_reconciliation_pass(&ctx).await.expect("pass");
        assert_eq!(cleaned.orphans_removed, 1);
        assert!(tunnel_store::get_tunnel(&ctx.db, tunnel.id).await.expect("get").is_none());
        assert!(agent.tunnel("h2", &link.link_name).is_none());
    }
}
