//! Cross-host overlay orchestration: tunnel rows, per-side attach/detach and
//! verification against what each agent reports.
//!
//! Each side of a cross-host link owns its host-local VLAN; only the VNI is
//! shared, so verification compares a side's live tag with that side's stored
//! tag and never across sides.

use std::fmt;

use common::api::{AttachOverlayRequest, DetachOverlayRequest, OverlayStatusResponse};
use common::naming;
use tracing::{debug, warn};

use crate::app_state::{ControllerContext, HostIndex};
use crate::agent_client::AgentTarget;
use crate::persistence::{
    LinkSide, LinkStateRecord, NewVxlanTunnel, VxlanTunnelRecord, links as link_store,
    tunnels as tunnel_store,
};
use crate::Result;

/// Upper bound on VNI probes past a hash collision.
const MAX_VNI_PROBES: u32 = 4096;

/// Hash-derived VNI for the link, probing upward (wrapping inside the
/// configured range) past VNIs held by other links.
pub async fn allocate_vni(ctx: &ControllerContext, link: &LinkStateRecord) -> Result<u32> {
    let base = ctx.cfg.overlay.vni_base;
    let max = ctx.cfg.overlay.vni_max;
    let span = max - base + 1;
    let start = naming::vni_candidate(&link.lab_id, &link.link_name, base, max);
    for probe in 0..span.min(MAX_VNI_PROBES) {
        let vni = base + (start - base + probe) % span;
        if !tunnel_store::vni_in_use(&ctx.db, vni, link.id).await? {
            if probe > 0 {
                debug!(link = %link.link_name, vni, probe, "VNI candidate collided; probed past it");
            }
            return Ok(vni);
        }
    }
    anyhow::bail!(
        "no free VNI for link {} within {} probes of {}",
        link.link_name,
        MAX_VNI_PROBES,
        start
    )
}

/// The link's tunnel row, created on first use. Agent A is the source side.
pub async fn ensure_tunnel(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
) -> Result<VxlanTunnelRecord> {
    if let Some(existing) = tunnel_store::get_tunnel_for_link(&ctx.db, link.id).await? {
        return Ok(existing);
    }
    let (Some(source_host), Some(target_host)) =
        (link.source_host_id.as_deref(), link.target_host_id.as_deref())
    else {
        anyhow::bail!("link {} has an unplaced endpoint", link.link_name);
    };
    let source_ip = hosts
        .data_ip(source_host)
        .ok_or_else(|| anyhow::anyhow!("unknown host {source_host}"))?;
    let target_ip = hosts
        .data_ip(target_host)
        .ok_or_else(|| anyhow::anyhow!("unknown host {target_host}"))?;

    let vni = allocate_vni(ctx, link).await?;
    tunnel_store::insert_tunnel(
        &ctx.db,
        &NewVxlanTunnel {
            lab_id: link.lab_id.clone(),
            link_state_id: link.id,
            link_name: link.link_name.clone(),
            vni,
            agent_a_id: source_host.to_string(),
            agent_a_ip: source_ip.to_string(),
            agent_b_id: target_host.to_string(),
            agent_b_ip: target_ip.to_string(),
            port_name: naming::overlay_port_name(&link.lab_id, &link.link_name),
        },
    )
    .await
}

/// `(local, remote)` agent/VTEP pairs for one side of the tunnel.
fn tunnel_ends(tunnel: &VxlanTunnelRecord, side: LinkSide) -> ((&str, &str), (&str, &str)) {
    let [a, b] = tunnel.agents();
    match side {
        LinkSide::Source => (a, b),
        LinkSide::Target => (b, a),
    }
}

/// Attaches one side and records the attachment and its local VLAN. The
/// error is a human-readable reason for the link's error message.
pub async fn attach_side(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
    tunnel: &VxlanTunnelRecord,
    side: LinkSide,
) -> std::result::Result<u16, String> {
    let view = link.side(side);
    let ((local_id, local_ip), (_, remote_ip)) = tunnel_ends(tunnel, side);
    let Some(target) = hosts.online_target(Some(local_id)) else {
        return Err(format!("host {local_id} offline"));
    };
    let request = AttachOverlayRequest {
        lab_id: link.lab_id.clone(),
        link_id: link.link_name.clone(),
        node: view.node.to_string(),
        interface: view.interface.to_string(),
        vni: tunnel.vni(),
        local_ip: local_ip.to_string(),
        remote_ip: remote_ip.to_string(),
        port_name: tunnel.port_name.clone(),
    };
    let response = ctx
        .agents
        .attach_overlay_interface(&target, &request)
        .await
        .map_err(|err| err.to_string())?;
    let Some(local_vlan) = response.local_vlan else {
        return Err(format!("agent {local_id} attached without reporting a local VLAN"));
    };

    let persisted = async {
        link_store::set_side_attached(&ctx.db, link.id, side, true).await?;
        link_store::set_side_vlan_tag(&ctx.db, link.id, side, Some(local_vlan)).await?;
        if side == LinkSide::Source {
            tunnel_store::set_tunnel_vlan(&ctx.db, tunnel.id, Some(local_vlan)).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    persisted.await.map_err(|err| format!("recording attachment failed: {err}"))?;
    Ok(local_vlan)
}

/// Why a detach did not happen on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachDeferral {
    Offline { host_id: String },
    Failed { host_id: String, message: String },
}

impl fmt::Display for DetachDeferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetachDeferral::Offline { host_id } => write!(f, "host {host_id} offline"),
            DetachDeferral::Failed { host_id, message } => {
                write!(f, "detach on host {host_id} failed: {message}")
            }
        }
    }
}

pub async fn detach_on_host(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    tunnel: &VxlanTunnelRecord,
    host_id: &str,
) -> std::result::Result<(), DetachDeferral> {
    let Some(target) = hosts.online_target(Some(host_id)) else {
        return Err(DetachDeferral::Offline {
            host_id: host_id.to_string(),
        });
    };
    let request = DetachOverlayRequest {
        lab_id: tunnel.lab_id.clone(),
        link_id: tunnel.link_name.clone(),
        port_name: tunnel.port_name.clone(),
    };
    ctx.agents
        .detach_overlay_interface(&target, &request)
        .await
        .map(|_| ())
        .map_err(|err| DetachDeferral::Failed {
            host_id: host_id.to_string(),
            message: err.to_string(),
        })
}

/// Detaches the tunnel on both hosts, returning the hosts that could not be
/// reached. Sides are independent; one failure does not stop the other.
pub async fn detach_tunnel(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    tunnel: &VxlanTunnelRecord,
) -> Vec<DetachDeferral> {
    let [(a, _), (b, _)] = tunnel.agents();
    let (first, second) = tokio::join!(
        detach_on_host(ctx, hosts, tunnel, a),
        detach_on_host(ctx, hosts, tunnel, b)
    );
    [first, second].into_iter().filter_map(|r| r.err()).collect()
}

/// Joins deferrals into one annotation, e.g.
/// `teardown deferred: host h2 offline`.
pub fn deferral_message(deferrals: &[DetachDeferral]) -> String {
    let reasons: Vec<String> = deferrals.iter().map(ToString::to_string).collect();
    format!("teardown deferred: {}", reasons.join("; "))
}

/// A divergence between an agent's overlay table and the stored link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayFault {
    TunnelMissing,
    VniMismatch { expected: u32, found: u32 },
    VlanMismatch { expected: u16, found: u16 },
    /// Transient; says nothing about the dataplane.
    AgentUnreachable(String),
}

impl OverlayFault {
    pub fn code(&self) -> &'static str {
        match self {
            OverlayFault::TunnelMissing => "TUNNEL_MISSING",
            OverlayFault::VniMismatch { .. } => "VNI_MISMATCH",
            OverlayFault::VlanMismatch { .. } => "VLAN_MISMATCH",
            OverlayFault::AgentUnreachable(_) => "AGENT_UNREACHABLE",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OverlayFault::AgentUnreachable(_))
    }
}

impl fmt::Display for OverlayFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayFault::TunnelMissing => write!(f, "TUNNEL_MISSING"),
            OverlayFault::VniMismatch { expected, found } => {
                write!(f, "VNI_MISMATCH (expected {expected}, found {found})")
            }
            OverlayFault::VlanMismatch { expected, found } => {
                write!(f, "VLAN_MISMATCH (expected {expected}, found {found})")
            }
            OverlayFault::AgentUnreachable(message) => write!(f, "AGENT_UNREACHABLE ({message})"),
        }
    }
}

/// Compares one agent's overlay table with the stored expectations for its
/// side. `expected_vlan` is that side's own tag; `None` skips the tag check.
pub fn check_side(
    status: &OverlayStatusResponse,
    link_name: &str,
    expected_vni: u32,
    expected_vlan: Option<u16>,
) -> Option<OverlayFault> {
    let Some(tunnel) = status.tunnel_for(link_name) else {
        return Some(OverlayFault::TunnelMissing);
    };
    if tunnel.vni != expected_vni {
        return Some(OverlayFault::VniMismatch {
            expected: expected_vni,
            found: tunnel.vni,
        });
    }
    if let Some(expected) = expected_vlan
        && tunnel.local_vlan != expected
    {
        return Some(OverlayFault::VlanMismatch {
            expected,
            found: tunnel.local_vlan,
        });
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideCheck {
    pub side: LinkSide,
    pub fault: Option<OverlayFault>,
}

impl SideCheck {
    /// A non-transient fault that warrants a repair.
    pub fn needs_repair(&self) -> bool {
        self.fault.as_ref().is_some_and(|f| !f.is_transient())
    }
}

async fn check_one(
    ctx: &ControllerContext,
    target: Option<AgentTarget>,
    link: &LinkStateRecord,
    tunnel: &VxlanTunnelRecord,
    side: LinkSide,
) -> SideCheck {
    let fault = match target {
        None => Some(OverlayFault::AgentUnreachable("host offline".into())),
        Some(target) => match ctx.agents.get_overlay_status(&target).await {
            Ok(status) => check_side(
                &status,
                &link.link_name,
                tunnel.vni(),
                link.side(side).vlan_tag,
            ),
            Err(err) => {
                warn!(link = %link.link_name, side = side.as_str(), %err, "overlay status query failed");
                Some(OverlayFault::AgentUnreachable(err.to_string()))
            }
        },
    };
    SideCheck { side, fault }
}

/// Reads both agents' overlay tables concurrently. Passive: nothing on the
/// agents or in the database changes.
pub async fn verify_sides(
    ctx: &ControllerContext,
    hosts: &HostIndex,
    link: &LinkStateRecord,
    tunnel: &VxlanTunnelRecord,
) -> [SideCheck; 2] {
    let (source_host, _) = tunnel_ends(tunnel, LinkSide::Source).0;
    let (target_host, _) = tunnel_ends(tunnel, LinkSide::Target).0;
    let (source, target) = tokio::join!(
        check_one(ctx, hosts.online_target(Some(source_host)), link, tunnel, LinkSide::Source),
        check_one(ctx, hosts.online_target(Some(target_host)), link, tunnel, LinkSide::Target)
    );
    [source, target]
}

/// `source: TUNNEL_MISSING; target: VNI_MISMATCH (...)`.
pub fn describe_faults(checks: &[SideCheck]) -> String {
    checks
        .iter()
        .filter_map(|check| {
            check
                .fault
                .as_ref()
                .map(|fault| format!("{}: {fault}", check.side.as_str()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}
