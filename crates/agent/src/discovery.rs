//! Startup bootstrap from the live bridge.
//!
//! The bridge and the container runtime are the source of truth after a
//! restart: the port and tunnel maps are rebuilt from them, tags seen on live
//! ports are re-registered, and allocations nothing uses any more are freed.

use std::collections::BTreeSet;

use common::api::DiscoveryResponse;
use common::naming::endpoint_key;
use tracing::{debug, info};

use crate::error::DataplaneError;
use crate::ovs::{BridgePort, PortKind};
use crate::state::{AgentState, TunnelRecord};
use crate::telemetry;
use crate::vlan::VlanError;

pub async fn discover_existing_state(state: &AgentState) -> Result<DiscoveryResponse, DataplaneError> {
    let running: BTreeSet<(String, String)> =
        state.runtime.running_nodes().await?.into_iter().collect();
    let ports = state.ovs.list_ports().await?;

    let mut live_ports: Vec<&BridgePort> = Vec::new();
    let mut vxlan_ports: Vec<&BridgePort> = Vec::new();
    let mut stale_ports = 0;
    for port in &ports {
        match port.kind {
            PortKind::Container => {
                let Some((lab, node, _)) = port.endpoint() else {
                    continue;
                };
                if running.contains(&(lab.to_string(), node.to_string())) {
                    live_ports.push(port);
                } else {
                    debug!(port = %port.name, lab, node, "port of a stopped node");
                    stale_ports += 1;
                }
            }
            PortKind::Vxlan => vxlan_ports.push(port),
            PortKind::Other => {}
        }
    }

    let mut dp = state.dataplane().await;
    dp.record_ports(live_ports.iter().copied());

    let mut observed: BTreeSet<u16> = BTreeSet::new();
    for port in &live_ports {
        let (Some(tag), Some((lab, node, iface))) = (port.tag, port.endpoint()) else {
            continue;
        };
        observed.insert(tag);
        let key = endpoint_key(lab, node, iface);
        match dp.vlans.claim(&key, tag) {
            Ok(()) => {}
            // Connected ports share a tag; the first one seen records it.
            Err(VlanError::TagInUse { holder, .. }) => {
                debug!(%key, tag, %holder, "tag already recorded")
            }
            Err(VlanError::OutOfRange { .. }) => {
                debug!(%key, tag, "tag outside pool left unmanaged")
            }
            Err(err) => return Err(err.into()),
        }
    }

    dp.tunnels.clear();
    for port in &vxlan_ports {
        let (Some(lab_id), Some(link_id), Some(vni), Some(remote_ip), Some(tag)) = (
            port.lab(),
            port.link_id(),
            port.vni(),
            port.remote_ip(),
            port.tag,
        ) else {
            debug!(port = %port.name, "vxlan port without netlab metadata");
            continue;
        };
        observed.insert(tag);
        let endpoint = live_ports
            .iter()
            .filter(|p| p.tag == Some(tag))
            .find_map(|p| p.endpoint().filter(|(lab, _, _)| *lab == lab_id))
            .map(|(lab, node, iface)| endpoint_key(lab, node, iface));
        dp.tunnels.insert(
            (lab_id.to_string(), link_id.to_string()),
            TunnelRecord {
                lab_id: lab_id.to_string(),
                link_id: link_id.to_string(),
                vni,
                local_vlan: tag,
                port_name: port.name.clone(),
                remote_ip: remote_ip.to_string(),
                endpoint,
            },
        );
    }

    let released = dp.vlans.retain(|_, tag| observed.contains(&tag))?;
    for (key, tag) in &released {
        debug!(%key, tag, "released vlan of vanished endpoint");
    }
    dp.publish_metrics();

    let response = DiscoveryResponse {
        ports: dp.ports.len(),
        link_tunnels: dp.tunnels.len(),
        stale_ports,
        released_tags: released.len(),
    };
    telemetry::record_discovery(response.ports, response.link_tunnels);
    info!(
        ports = response.ports,
        link_tunnels = response.link_tunnels,
        stale_ports = response.stale_ports,
        released_tags = response.released_tags,
        "existing dataplane state discovered"
    );
    Ok(response)
}
