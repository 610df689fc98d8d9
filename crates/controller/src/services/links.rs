//! Link lifecycle: declaration, realization on the agents, teardown and the
//! computed operational state.

use chrono::Utc;
use common::api::{ConnectLinkRequest, DisconnectLinkRequest, EndpointRef};
use common::naming::{self, Endpoint};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::{ControllerContext, HostIndex};
use crate::coordination::release_if_held;
use crate::persistence::{
    CarrierState, Db, LinkActualState, LinkDesiredState, LinkSide, LinkStateRecord, NewLinkState,
    OperState, OperUpdate, TunnelStatus, VxlanTunnelRecord, links as link_store,
    nodes as node_store, tunnels as tunnel_store,
};
use crate::services::{overlay, reservations};
use crate::state_machine::LinkStateMachine;
use crate::telemetry;
use crate::Result;

pub const REASON_ADMIN_DOWN: &str = "admin_down";
pub const REASON_LOCAL_HOST_OFFLINE: &str = "local_host_offline";
pub const REASON_PEER_HOST_OFFLINE: &str = "peer_host_offline";
pub const REASON_LOCAL_CARRIER_OFF: &str = "local_carrier_off";
pub const REASON_PEER_CARRIER_OFF: &str = "peer_carrier_off";

/// Outcome of pushing a link change to the agents. Failures are annotations
/// for the link, not errors of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dataplane {
    Ready,
    Failed(String),
}

pub async fn find_link(ctx: &ControllerContext, lab_id: &str, link_name: &str) -> Result<LinkStateRecord> {
    link_store::get_link_state_by_name(&ctx.db, lab_id, link_name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("link {link_name} not found in lab {lab_id}"))
}

async fn reload(db: &Db, id: Uuid) -> Result<LinkStateRecord> {
    link_store::get_link_state(db, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("link {id} disappeared"))
}

/// Writes `to` when the link state machine has a legal path from `from`.
pub(crate) async fn apply_link_state(
    db: &Db,
    id: Uuid,
    from: LinkActualState,
    to: LinkActualState,
    error_message: Option<&str>,
) -> Result<bool> {
    if LinkStateMachine::path(from, to).is_none() {
        warn!(
            link_id = %id,
            from = from.as_str(),
            to = to.as_str(),
            "no legal link transition; keeping state"
        );
        return Ok(false);
    }
    link_store::set_link_actual_state(db, id, to, error_message).await?;
    Ok(true)
}

/// Declares a link between two endpoints. Endpoint order and interface
/// spelling do not matter. An `up` link reserves both endpoints and fails
/// with [`reservations::EndpointConflict`] before any row is written when
/// another link holds one of them. Fails with
/// [`LabBusy`](crate::coordination::LabBusy) while the lab is locked.
pub async fn create_link(
    ctx: &ControllerContext,
    lab_id: &str,
    source: (&str, &str),
    target: (&str, &str),
    desired: LinkDesiredState,
) -> Result<LinkStateRecord> {
    let guard = ctx.lab_lock().lock_for_change(lab_id).await?;
    let result = create_link_locked(ctx, lab_id, source, target, desired).await;
    release_if_held(guard).await;
    result
}

/// [`create_link`] for callers that already hold the lab lock.
pub(crate) async fn create_link_locked(
    ctx: &ControllerContext,
    lab_id: &str,
    source: (&str, &str),
    target: (&str, &str),
    desired: LinkDesiredState,
) -> Result<LinkStateRecord> {
    let (first, second) = naming::canonical_endpoints(
        Endpoint::new(source.0, source.1),
        Endpoint::new(target.0, target.1),
    );
    let link_name = naming::generate_link_name(&first.node, &first.interface, &second.node, &second.interface);
    let existing = link_store::get_link_state_by_name(&ctx.db, lab_id, &link_name).await?;
    if desired == LinkDesiredState::Up {
        reservations::ensure_endpoints_free(
            &ctx.db,
            lab_id,
            &[
                (first.node.as_str(), first.interface.as_str()),
                (second.node.as_str(), second.interface.as_str()),
            ],
            existing.as_ref().map(|l| l.id),
        )
        .await?;
    }

    let source_host_id = node_store::get_node_state(&ctx.db, lab_id, &first.node)
        .await?
        .and_then(|n| n.host_id);
    let target_host_id = node_store::get_node_state(&ctx.db, lab_id, &second.node)
        .await?
        .and_then(|n| n.host_id);
    let link = link_store::upsert_link_state(
        &ctx.db,
        &NewLinkState {
            lab_id: lab_id.to_string(),
            link_name,
            source_node: first.node,
            source_interface: first.interface,
            target_node: second.node,
            target_interface: second.interface,
            source_host_id,
            target_host_id,
            desired_state: desired,
        },
    )
    .await?;

    match desired {
        LinkDesiredState::Up => {
            reservations::claim_for_link(&ctx.db, &link).await?;
        }
        LinkDesiredState::Down => {
            reservations::release_for_link(&ctx.db, link.id).await?;
        }
    }
    debug!(lab_id, link = %link.link_name, cross_host = link.is_cross_host, "link declared");
    Ok(link)
}

/// Going up claims both endpoints first and leaves the link untouched on
/// conflict; going down releases them.
pub async fn set_link_desired_state(
    ctx: &ControllerContext,
    lab_id: &str,
    link_name: &str,
    desired: LinkDesiredState,
) -> Result<LinkStateRecord> {
    let guard = ctx.lab_lock().lock_for_change(lab_id).await?;
    let result = set_desired_locked(ctx, lab_id, link_name, desired).await;
    release_if_held(guard).await;
    result
}

async fn set_desired_locked(
    ctx: &ControllerContext,
    lab_id: &str,
    link_name: &str,
    desired: LinkDesiredState,
) -> Result<LinkStateRecord> {
    let link = find_link(ctx, lab_id, link_name).await?;
    match desired {
        LinkDesiredState::Up => {
            reservations::claim_for_link(&ctx.db, &link).await?;
            link_store::set_link_desired_state(&ctx.db, link.id, desired).await?;
        }
        LinkDesiredState::Down => {
            link_store::set_link_desired_state(&ctx.db, link.id, desired).await?;
            reservations::release_for_link(&ctx.db, link.id).await?;
        }
    }
    let updated = reload(&ctx.db, link.id).await?;
    let hosts = ctx.hosts().await?;
    recompute_with_hosts(&ctx.db, &hosts, &updated).await?;
    reload(&ctx.db, link.id).await
}

/// Removes a link and whatever it realized. A cross-host tunnel that cannot
/// be detached on every host outlives the link in `cleanup` status so the
/// orphan sweep finishes the teardown once the host returns.
pub async fn delete_link(ctx: &ControllerContext, lab_id: &str, link_name: &str) -> Result<bool> {
    let guard = ctx.lab_lock().lock_for_change(lab_id).await?;
    let result = delete_link_locked(ctx, lab_id, link_name).await;
    release_if_held(guard).await;
    result
}

pub(crate) async fn delete_link_locked(
    ctx: &ControllerContext,
    lab_id: &str,
    link_name: &str,
) -> Result<bool> {
    let Some(link) = link_store::get_link_state_by_name(&ctx.db, lab_id, link_name).await? else {
        return Ok(false);
    };
    let hosts = ctx.hosts().await?;

    if link.is_cross_host {
        if let Some(tunnel) = tunnel_store::get_tunnel_for_link(&ctx.db, link.id).await? {
            let deferrals = overlay::detach_tunnel(ctx, &hosts, &tunnel).await;
            if deferrals.is_empty() {
                tunnel_store::delete_tunnel(&ctx.db, tunnel.id).await?;
            } else {
                let message = overlay::deferral_message(&deferrals);
                warn!(lab_id, link = link_name, %message, "tunnel kept for deferred cleanup");
                tunnel_store::detach_tunnel_from_link(&ctx.db, tunnel.id, &message).await?;
            }
        }
    } else if let Dataplane::Failed(message) = disconnect_same_host(ctx, &hosts, &link).await? {
        warn!(lab_id, link = link_name, %message, "same-host teardown failed; deleting link anyway");
    }

    reservations::release_for_link(&ctx.db, link.id).await?;
    link_store::delete_link_state(&ctx.db, link.id).await?;
    info!(lab_id, link = link_name, "link deleted");
    Ok(true)
}

fn endpoint_refs(link: &LinkStateRecord) -> (EndpointRef, EndpointRef) {
    let side = |s: LinkSide| {
        let view = link.side(s);
        EndpointRef {
            node: view.node.to_string(),
            interface: view.interface.to_string(),
        }
    };
    (side(LinkSide::Source), side(LinkSide::Target))
}

/// Realizes the link: reserves its endpoints, then shares a VLAN on one host
/// or attaches both sides of a VXLAN tunnel. A cross-host link with a side
/// already attached is resumed instead: only missing sides are attached. Agent
/// failures are recorded on the link and returned as the error.
pub async fn connect_link(ctx: &ControllerContext, link: &LinkStateRecord) -> Result<LinkStateRecord> {
    if let Err(err) = reservations::claim_for_link(&ctx.db, link).await {
        link_store::set_link_error_message(&ctx.db, link.id, Some(&err.to_string())).await?;
        return Err(err);
    }
    let hosts = ctx.hosts().await?;
    if link.is_cross_host
        && link.attached_sides() > 0
        && let Some(tunnel) = tunnel_store::get_tunnel_for_link(&ctx.db, link.id).await?
    {
        return resume_cross_host(ctx, &hosts, link, &tunnel).await;
    }
    apply_link_state(&ctx.db, link.id, link.actual_state, LinkActualState::Creating, None).await?;

    let outcome = if link.is_cross_host {
        connect_cross_host(ctx, &hosts, link).await?
    } else {
        connect_same_host(ctx, &hosts, link).await?
    };

    match &outcome {
        Dataplane::Ready => {
            apply_link_state(&ctx.db, link.id, LinkActualState::Creating, LinkActualState::Up, None)
                .await?;
            info!(lab_id = %link.lab_id, link = %link.link_name, "link up");
        }
        Dataplane::Failed(message) => {
            apply_link_state(
                &ctx.db,
                link.id,
                LinkActualState::Creating,
                LinkActualState::Error,
                Some(message),
            )
            .await?;
            warn!(lab_id = %link.lab_id, link = %link.link_name, %message, "link connect failed");
        }
    }

    let current = reload(&ctx.db, link.id).await?;
    recompute_with_hosts(&ctx.db, &hosts, &current).await?;
    match outcome {
        Dataplane::Ready => reload(&ctx.db, link.id).await,
        Dataplane::Failed(message) => Err(anyhow::anyhow!(message)),
    }
}

async fn connect_same_host(ctx: &ControllerContext, hosts: &HostIndex, link: &LinkStateRecord) -> Result<Dataplane> {
    let Some(host_id) = link.source_host_id.as_deref() else {
        return Ok(Dataplane::Failed("endpoint placement unknown".into()));
    };
    let Some(target) = hosts.online_target(Some(host_id)) else {
        return Ok(Dataplane::Failed(format!("host {host_id} offline")));
    };
    let (source, target_endpoint) = endpoint_refs(link);
    let request = ConnectLinkRequest {
        link_id: link.link_name.clone(),
        source,
        target: target_endpoint,
    };
    let response = match ctx.agents.connect_link(&target, &link.lab_id, &request).await {
        Ok(response) => response,
        Err(err) => return Ok(Dataplane::Failed(format!("connect failed: {err}"))),
    };
    let Some(tag) = response.vlan_tag else {
        return Ok(Dataplane::Failed(format!(
            "agent {host_id} connected without reporting a VLAN"
        )));
    };
    for side in LinkSide::BOTH {
        link_store::set_side_vlan_tag(&ctx.db, link.id, side, Some(tag)).await?;
    }
    Ok(Dataplane::Ready)
}

/// Finishes a cross-host link that already has an attached side. Only the
/// missing sides are attached, then the overlay is checked on both hosts
/// before the link goes up. A failed check leaves the attachment flags as
/// they are and records `validation failed: ...` on the link.
async fn resume_cross_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
    tunnel: &VxlanTunnelRecord,
) -> Result<LinkStateRecord> {
    let missing: Vec<LinkSide> = LinkSide::BOTH
        .into_iter()
        .filter(|side| !link.side(*side).vxlan_attached)
        .collect();
    for side in &missing {
        if let Err(message) = overlay::attach_side(ctx, hosts, link, tunnel, *side).await {
            let message = format!("{} attach failed: {message}", side.as_str());
            link_store::set_link_error_message(&ctx.db, link.id, Some(&message)).await?;
            warn!(lab_id = %link.lab_id, link = %link.link_name, %message, "link resume failed");
            return Err(anyhow::anyhow!(message));
        }
    }

    let current = reload(&ctx.db, link.id).await?;
    let checks = overlay::verify_sides(ctx, hosts, &current, tunnel).await;
    if checks.iter().any(|c| c.fault.is_some()) {
        let message = format!("validation failed: {}", overlay::describe_faults(&checks));
        warn!(lab_id = %link.lab_id, link = %link.link_name, %message, "resumed link not verified");
        telemetry::record_link_verification("fault");
        link_store::set_link_error_message(&ctx.db, link.id, Some(&message)).await?;
        return Err(anyhow::anyhow!(message));
    }

    telemetry::record_link_verification("pass");
    if current.actual_state != LinkActualState::Up {
        apply_link_state(&ctx.db, link.id, current.actual_state, LinkActualState::Up, None).await?;
    }
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Active, None).await?;
    info!(lab_id = %link.lab_id, link = %link.link_name, resumed = missing.len(), "link up");

    let current = reload(&ctx.db, link.id).await?;
    recompute_with_hosts(&ctx.db, hosts, &current).await?;
    reload(&ctx.db, link.id).await
}

/// Ensures the tunnel row and attaches both sides. Each side succeeds or
/// fails on its own and successes are recorded even when the other side
/// fails.
async fn connect_cross_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<Dataplane> {
    let tunnel = match overlay::ensure_tunnel(ctx, hosts, link).await {
        Ok(tunnel) => tunnel,
        Err(err) => return Ok(Dataplane::Failed(err.to_string())),
    };
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Creating, None).await?;

    let tunnel_ref = &tunnel;
    let attempts = LinkSide::BOTH.into_iter().map(|side| async move {
        (side, overlay::attach_side(ctx, hosts, link, tunnel_ref, side).await)
    });
    let results = futures_util::future::join_all(attempts).await;

    let failures: Vec<String> = results
        .iter()
        .filter_map(|(side, result)| {
            result
                .as_ref()
                .err()
                .map(|message| format!("{} attach failed: {message}", side.as_str()))
        })
        .collect();
    if failures.is_empty() {
        tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Active, None).await?;
        return Ok(Dataplane::Ready);
    }
    let message = failures.join("; ");
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Error, Some(&message)).await?;
    Ok(Dataplane::Failed(message))
}

/// Tears the link down on the agents and moves it to `down`. Unreachable
/// sides leave the link in `error` with a deferral message; the reachable
/// side's teardown is kept.
pub async fn disconnect_link(ctx: &ControllerContext, link: &LinkStateRecord) -> Result<LinkStateRecord> {
    let hosts = ctx.hosts().await?;
    let outcome = if link.is_cross_host {
        disconnect_cross_host(ctx, &hosts, link).await?
    } else {
        disconnect_same_host(ctx, &hosts, link).await?
    };

    match &outcome {
        Dataplane::Ready => {
            apply_link_state(&ctx.db, link.id, link.actual_state, LinkActualState::Down, None).await?;
            debug!(lab_id = %link.lab_id, link = %link.link_name, "link down");
        }
        Dataplane::Failed(message) => {
            apply_link_state(
                &ctx.db,
                link.id,
                link.actual_state,
                LinkActualState::Error,
                Some(message),
            )
            .await?;
            warn!(lab_id = %link.lab_id, link = %link.link_name, %message, "link disconnect incomplete");
        }
    }

    let current = reload(&ctx.db, link.id).await?;
    recompute_with_hosts(&ctx.db, &hosts, &current).await?;
    match outcome {
        Dataplane::Ready => reload(&ctx.db, link.id).await,
        Dataplane::Failed(message) => Err(anyhow::anyhow!(message)),
    }
}

async fn disconnect_same_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<Dataplane> {
    // Never realized: nothing to undo on the agent.
    if link.source_vlan_tag.is_none() && link.target_vlan_tag.is_none() {
        return Ok(Dataplane::Ready);
    }
    let Some(host_id) = link.source_host_id.as_deref() else {
        link_store::clear_link_dataplane(&ctx.db, link.id).await?;
        return Ok(Dataplane::Ready);
    };
    let Some(target) = hosts.online_target(Some(host_id)) else {
        return Ok(Dataplane::Failed(format!(
            "teardown deferred: host {host_id} offline"
        )));
    };
    let (source, target_endpoint) = endpoint_refs(link);
    let request = DisconnectLinkRequest {
        link_id: link.link_name.clone(),
        source,
        target: target_endpoint,
    };
    match ctx.agents.disconnect_link(&target, &link.lab_id, &request).await {
        Ok(response) => {
            link_store::set_side_vlan_tag(&ctx.db, link.id, LinkSide::Source, response.source_vlan)
                .await?;
            link_store::set_side_vlan_tag(&ctx.db, link.id, LinkSide::Target, response.target_vlan)
                .await?;
            Ok(Dataplane::Ready)
        }
        Err(err) => Ok(Dataplane::Failed(format!("disconnect failed: {err}"))),
    }
}

async fn disconnect_cross_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<Dataplane> {
    let Some(tunnel) = tunnel_store::get_tunnel_for_link(&ctx.db, link.id).await? else {
        link_store::clear_link_dataplane(&ctx.db, link.id).await?;
        return Ok(Dataplane::Ready);
    };
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Deleting, None).await?;

    let [(source_host, _), (target_host, _)] = tunnel.agents();
    let (source, target) = tokio::join!(
        overlay::detach_on_host(ctx, hosts, &tunnel, source_host),
        overlay::detach_on_host(ctx, hosts, &tunnel, target_host)
    );
    let mut deferrals = Vec::new();
    for (side, result) in [(LinkSide::Source, source), (LinkSide::Target, target)] {
        match result {
            Ok(()) => {
                link_store::set_side_attached(&ctx.db, link.id, side, false).await?;
                link_store::set_side_vlan_tag(&ctx.db, link.id, side, None).await?;
            }
            Err(deferral) => deferrals.push(deferral),
        }
    }

    if deferrals.is_empty() {
        tunnel_store::delete_tunnel(&ctx.db, tunnel.id).await?;
        return Ok(Dataplane::Ready);
    }
    let message = overlay::deferral_message(&deferrals);
    tunnel_store::set_tunnel_status(&ctx.db, tunnel.id, TunnelStatus::Deleting, Some(&message)).await?;
    Ok(Dataplane::Failed(message))
}

/// Oper state for `[source, target]` as a function of admin state, host
/// reachability and carrier.
pub fn compute_oper_state(
    link: &LinkStateRecord,
    hosts: &HostIndex,
) -> [(OperState, Option<&'static str>); 2] {
    if link.desired_state == LinkDesiredState::Down {
        return [(OperState::Down, Some(REASON_ADMIN_DOWN)); 2];
    }
    LinkSide::BOTH.map(|side| {
        let local = link.side(side);
        let peer = link.side(side.peer());
        let reason = if !hosts.is_online(local.host_id) {
            Some(REASON_LOCAL_HOST_OFFLINE)
        } else if !hosts.is_online(peer.host_id) {
            Some(REASON_PEER_HOST_OFFLINE)
        } else if local.carrier == CarrierState::Off {
            Some(REASON_LOCAL_CARRIER_OFF)
        } else if peer.carrier == CarrierState::Off {
            Some(REASON_PEER_CARRIER_OFF)
        } else {
            None
        };
        match reason {
            Some(reason) => (OperState::Down, Some(reason)),
            None => (OperState::Up, None),
        }
    })
}

/// Persists the computed oper state when it differs from the stored one,
/// bumping `oper_epoch`. Returns whether anything changed.
pub async fn recompute_with_hosts(db: &Db, hosts: &HostIndex, link: &LinkStateRecord) -> Result<bool> {
    let [source, target] = compute_oper_state(link, hosts);
    let source_changed =
        (link.source_oper_state, link.source_oper_reason.as_deref()) != (source.0, source.1);
    let target_changed =
        (link.target_oper_state, link.target_oper_reason.as_deref()) != (target.0, target.1);
    if !source_changed && !target_changed {
        return Ok(false);
    }

    let now = Utc::now();
    let update = OperUpdate {
        source_state: source.0,
        source_reason: source.1.map(str::to_string),
        target_state: target.0,
        target_reason: target.1.map(str::to_string),
        source_changed_at: source_changed.then_some(now),
        target_changed_at: target_changed.then_some(now),
    };
    link_store::write_oper_state(db, link.id, &update).await?;
    debug!(
        link = %link.link_name,
        source = ?update.source_state,
        target = ?update.target_state,
        "link oper state changed"
    );
    Ok(true)
}

pub async fn recompute_link_oper_state(ctx: &ControllerContext, link_id: Uuid) -> Result<bool> {
    let Some(link) = link_store::get_link_state(&ctx.db, link_id).await? else {
        return Ok(false);
    };
    let hosts = ctx.hosts().await?;
    recompute_with_hosts(&ctx.db, &hosts, &link).await
}

/// Simulates a cable pull (or reconnect) on one side. The carrier is stored
/// first; the agent is told when its host is reachable.
pub async fn set_link_carrier(
    ctx: &ControllerContext,
    lab_id: &str,
    link_name: &str,
    side: LinkSide,
    carrier: CarrierState,
) -> Result<bool> {
    let guard = ctx.lab_lock().lock_for_change(lab_id).await?;
    let result = set_carrier_locked(ctx, lab_id, link_name, side, carrier).await;
    release_if_held(guard).await;
    result
}

async fn set_carrier_locked(
    ctx: &ControllerContext,
    lab_id: &str,
    link_name: &str,
    side: LinkSide,
    carrier: CarrierState,
) -> Result<bool> {
    let link = find_link(ctx, lab_id, link_name).await?;
    link_store::set_side_carrier(&ctx.db, link.id, side, carrier).await?;
    let hosts = ctx.hosts().await?;

    let view = link.side(side);
    match hosts.online_target(view.host_id) {
        Some(target) => {
            if let Err(err) = ctx
                .agents
                .set_carrier(&target, lab_id, view.node, view.interface, carrier.into())
                .await
            {
                warn!(lab_id, link = link_name, side = side.as_str(), %err, "carrier update failed");
                let message = format!("carrier update on host {} failed: {err}", target.host_id);
                link_store::set_link_error_message(&ctx.db, link.id, Some(&message)).await?;
            }
        }
        None => debug!(lab_id, link = link_name, side = side.as_str(), "host offline; carrier stored only"),
    }

    let updated = reload(&ctx.db, link.id).await?;
    recompute_with_hosts(&ctx.db, &hosts, &updated).await
}
