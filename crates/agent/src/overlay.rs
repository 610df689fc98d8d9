//! Per-link VXLAN attachments for cross-host links.

use std::collections::BTreeSet;
use std::net::IpAddr;

use common::api::{AttachOverlayRequest, DetachOverlayRequest, OverlayStatusResponse};
use common::naming::endpoint_key;
use tracing::{info, warn};

use crate::error::DataplaneError;
use crate::links::apply_tag;
use crate::ovs::{PortKind, VxlanPortSpec};
use crate::state::{AgentState, TunnelRecord};
use crate::telemetry;

const MAX_VNI: u32 = (1 << 24) - 1;
const MAX_PORT_NAME_LEN: usize = 15;

fn result_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}

/// Bridges the local endpoint to the link's VXLAN port. The endpoint keeps
/// its own tag, which becomes the tunnel's local VLAN. Repeating an attach
/// re-applies the same configuration.
pub async fn attach(state: &AgentState, request: &AttachOverlayRequest) -> Result<u16, DataplaneError> {
    let result = attach_inner(state, request).await;
    telemetry::record_overlay_operation("attach", result_label(&result));
    result
}

async fn attach_inner(
    state: &AgentState,
    request: &AttachOverlayRequest,
) -> Result<u16, DataplaneError> {
    validate_attach(request)?;
    let ovs = state.ovs.as_ref();
    let mut dp = state.dataplane().await;

    dp.resolve_port(ovs, &request.lab_id, &request.node, &request.interface)
        .await?;
    let key = endpoint_key(&request.lab_id, &request.node, &request.interface);
    let local_vlan = dp.vlans.allocate(&key)?;
    apply_tag(
        &mut dp,
        ovs,
        &request.lab_id,
        &request.node,
        &request.interface,
        local_vlan,
    )
    .await?;

    let tunnel_key = (request.lab_id.clone(), request.link_id.clone());
    if let Some(previous) = dp.tunnels.get(&tunnel_key)
        && previous.port_name != request.port_name
    {
        warn!(
            link_id = %request.link_id,
            old_port = %previous.port_name,
            new_port = %request.port_name,
            "replacing overlay port under a new name"
        );
        ovs.delete_port(&previous.port_name).await?;
    }

    ovs.ensure_vxlan_port(&VxlanPortSpec {
        port_name: request.port_name.clone(),
        lab_id: request.lab_id.clone(),
        link_id: request.link_id.clone(),
        vni: request.vni,
        local_ip: request.local_ip.clone(),
        remote_ip: request.remote_ip.clone(),
        tag: local_vlan,
    })
    .await?;

    dp.tunnels.insert(
        tunnel_key,
        TunnelRecord {
            lab_id: request.lab_id.clone(),
            link_id: request.link_id.clone(),
            vni: request.vni,
            local_vlan,
            port_name: request.port_name.clone(),
            remote_ip: request.remote_ip.clone(),
            endpoint: Some(key),
        },
    );
    dp.publish_metrics();
    info!(
        lab_id = %request.lab_id,
        link_id = %request.link_id,
        vni = request.vni,
        local_vlan,
        port = %request.port_name,
        "overlay endpoint attached"
    );
    Ok(local_vlan)
}

fn validate_attach(request: &AttachOverlayRequest) -> Result<(), DataplaneError> {
    if request.lab_id.trim().is_empty() || request.link_id.trim().is_empty() {
        return Err(DataplaneError::InvalidRequest(
            "lab_id and link_id are required".into(),
        ));
    }
    if request.vni == 0 || request.vni > MAX_VNI {
        return Err(DataplaneError::InvalidRequest(format!(
            "vni {} outside 1-{MAX_VNI}",
            request.vni
        )));
    }
    validate_port_name(&request.port_name)?;
    for (field, value) in [("local_ip", &request.local_ip), ("remote_ip", &request.remote_ip)] {
        if value.parse::<IpAddr>().is_err() {
            return Err(DataplaneError::InvalidRequest(format!(
                "{field} `{value}` is not an IP address"
            )));
        }
    }
    Ok(())
}

fn validate_port_name(name: &str) -> Result<(), DataplaneError> {
    if name.is_empty() || name.len() > MAX_PORT_NAME_LEN {
        return Err(DataplaneError::InvalidRequest(format!(
            "port name `{name}` must be 1-{MAX_PORT_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Removes the link's VXLAN port. The endpoint keeps its tag, which leaves it
/// isolated. Detaching an unknown link succeeds.
pub async fn detach(state: &AgentState, request: &DetachOverlayRequest) -> Result<(), DataplaneError> {
    let result = detach_inner(state, request).await;
    telemetry::record_overlay_operation("detach", result_label(&result));
    result
}

async fn detach_inner(state: &AgentState, request: &DetachOverlayRequest) -> Result<(), DataplaneError> {
    validate_port_name(&request.port_name)?;
    let ovs = state.ovs.as_ref();
    let mut dp = state.dataplane().await;

    let tunnel_key = (request.lab_id.clone(), request.link_id.clone());
    if let Some(record) = dp.tunnels.get(&tunnel_key)
        && record.port_name != request.port_name
    {
        ovs.delete_port(&record.port_name).await?;
    }
    ovs.delete_port(&request.port_name).await?;
    let removed = dp.tunnels.remove(&tunnel_key);
    info!(
        lab_id = %request.lab_id,
        link_id = %request.link_id,
        port = %request.port_name,
        known = removed.is_some(),
        "overlay endpoint detached"
    );
    Ok(())
}

/// Tunnels whose VXLAN port is still on the bridge. Records whose port
/// vanished are dropped so callers see the live overlay.
pub async fn status(state: &AgentState) -> Result<OverlayStatusResponse, DataplaneError> {
    let live: BTreeSet<String> = state
        .ovs
        .list_ports()
        .await?
        .into_iter()
        .filter(|port| port.kind == PortKind::Vxlan)
        .map(|port| port.name)
        .collect();

    let mut dp = state.dataplane().await;
    dp.tunnels.retain(|(lab_id, link_id), record| {
        let present = live.contains(&record.port_name);
        if !present {
            warn!(%lab_id, %link_id, port = %record.port_name, "overlay port missing from bridge");
        }
        present
    });
    Ok(OverlayStatusResponse {
        link_tunnels: dp.link_tunnels(),
    })
}
