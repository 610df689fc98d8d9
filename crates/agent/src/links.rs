//! Same-host links and per-interface operations.
//!
//! Two ports on the bridge are connected when they share an access VLAN; a
//! disconnected port sits alone in its own tag.

use common::api::{CarrierState, ConnectLinkRequest, DisconnectLinkRequest, EndpointRef, PortInfo};
use common::naming::endpoint_key;
use tracing::{debug, info};

use crate::error::DataplaneError;
use crate::ovs::{OvsBackend, OvsError};
use crate::runtime::container_name;
use crate::state::{AgentState, Dataplane, PortRecord};
use crate::telemetry;

/// Allocation key of the shared tag of a same-host link.
pub fn link_vlan_key(lab_id: &str, link_id: &str) -> String {
    format!("link:{lab_id}/{link_id}")
}

pub async fn list_ports(state: &AgentState, lab_id: &str) -> Result<Vec<PortInfo>, DataplaneError> {
    let ports = state.ovs.list_ports().await?;
    let mut dp = state.dataplane().await;
    dp.record_ports(&ports);
    Ok(ports
        .iter()
        .filter_map(|port| {
            let (lab, node, interface) = port.endpoint()?;
            (lab == lab_id).then(|| PortInfo {
                container: container_name(lab, node),
                interface: interface.to_string(),
                port_name: port.name.clone(),
                bridge_name: state.cfg.bridge_name.clone(),
                vlan_tag: port.tag.unwrap_or_default(),
            })
        })
        .collect())
}

/// Live tag of an interface port; `None` when the port is unknown or
/// untagged.
pub async fn get_interface_vlan(
    state: &AgentState,
    lab_id: &str,
    node: &str,
    interface: &str,
) -> Result<Option<u16>, DataplaneError> {
    let mut dp = state.dataplane().await;
    let port = match dp.resolve_port(state.ovs.as_ref(), lab_id, node, interface).await {
        Ok(port) => port,
        Err(DataplaneError::PortNotFound { .. }) => return Ok(None),
        Err(err) => return Err(err),
    };
    match state.ovs.port_tag(&port.port_name).await {
        Ok(tag) => Ok(tag),
        Err(OvsError::NoSuchPort(_)) => {
            dp.ports.remove(&endpoint_key(lab_id, node, interface));
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Re-applies `vlan_tag` to an interface port. An unheld tag inside the pool
/// is recorded under the endpoint.
pub async fn set_interface_vlan(
    state: &AgentState,
    lab_id: &str,
    node: &str,
    interface: &str,
    vlan_tag: u16,
) -> Result<u16, DataplaneError> {
    if !(1..=4094).contains(&vlan_tag) {
        return Err(DataplaneError::InvalidRequest(format!(
            "vlan tag {vlan_tag} outside 1-4094"
        )));
    }
    let mut dp = state.dataplane().await;
    apply_tag(&mut dp, state.ovs.as_ref(), lab_id, node, interface, vlan_tag).await?;

    let (start, end) = dp.vlans.range();
    if dp.vlans.holder(vlan_tag).is_none() && (start..=end).contains(&vlan_tag) {
        dp.vlans
            .claim(&endpoint_key(lab_id, node, interface), vlan_tag)?;
        dp.publish_metrics();
    }
    info!(lab_id, node, interface, vlan_tag, "interface vlan applied");
    Ok(vlan_tag)
}

pub async fn set_carrier(
    state: &AgentState,
    lab_id: &str,
    node: &str,
    interface: &str,
    carrier: CarrierState,
) -> Result<(), DataplaneError> {
    let mut dp = state.dataplane().await;
    let port = dp
        .resolve_port(state.ovs.as_ref(), lab_id, node, interface)
        .await?;
    state
        .ovs
        .set_admin_state(&port.port_name, carrier == CarrierState::On)
        .await?;
    info!(lab_id, node, interface, carrier = carrier.as_str(), "carrier changed");
    Ok(())
}

/// Puts both endpoints into the link's shared tag and frees their isolated
/// tags. Returns the shared tag.
pub async fn connect(
    state: &AgentState,
    lab_id: &str,
    request: &ConnectLinkRequest,
) -> Result<u16, DataplaneError> {
    let result = connect_inner(state, lab_id, request).await;
    telemetry::record_link_operation("connect", if result.is_ok() { "ok" } else { "error" });
    result
}

async fn connect_inner(
    state: &AgentState,
    lab_id: &str,
    request: &ConnectLinkRequest,
) -> Result<u16, DataplaneError> {
    ensure_distinct(&request.source, &request.target)?;
    let mut dp = state.dataplane().await;
    let ovs = state.ovs.as_ref();

    // Both ports must exist before a tag is spent.
    for side in [&request.source, &request.target] {
        dp.resolve_port(ovs, lab_id, &side.node, &side.interface)
            .await?;
    }
    let tag = dp.vlans.allocate(&link_vlan_key(lab_id, &request.link_id))?;
    for side in [&request.source, &request.target] {
        apply_tag(&mut dp, ovs, lab_id, &side.node, &side.interface, tag).await?;
    }
    for side in [&request.source, &request.target] {
        dp.vlans
            .release(&endpoint_key(lab_id, &side.node, &side.interface))?;
    }
    dp.publish_metrics();
    info!(lab_id, link_id = %request.link_id, vlan_tag = tag, "link connected");
    Ok(tag)
}

/// Releases the shared tag and gives each endpoint a fresh isolated tag.
pub async fn disconnect(
    state: &AgentState,
    lab_id: &str,
    request: &DisconnectLinkRequest,
) -> Result<(u16, u16), DataplaneError> {
    let result = disconnect_inner(state, lab_id, request).await;
    telemetry::record_link_operation("disconnect", if result.is_ok() { "ok" } else { "error" });
    result
}

async fn disconnect_inner(
    state: &AgentState,
    lab_id: &str,
    request: &DisconnectLinkRequest,
) -> Result<(u16, u16), DataplaneError> {
    ensure_distinct(&request.source, &request.target)?;
    let mut dp = state.dataplane().await;
    let ovs = state.ovs.as_ref();

    for side in [&request.source, &request.target] {
        dp.resolve_port(ovs, lab_id, &side.node, &side.interface)
            .await?;
    }
    let released = dp.vlans.release(&link_vlan_key(lab_id, &request.link_id))?;
    debug!(lab_id, link_id = %request.link_id, ?released, "shared tag released");

    let source_tag = isolate(&mut dp, ovs, lab_id, &request.source).await?;
    let target_tag = isolate(&mut dp, ovs, lab_id, &request.target).await?;
    dp.publish_metrics();
    info!(
        lab_id,
        link_id = %request.link_id,
        source_vlan = source_tag,
        target_vlan = target_tag,
        "link disconnected"
    );
    Ok((source_tag, target_tag))
}

async fn isolate(
    dp: &mut Dataplane,
    ovs: &dyn OvsBackend,
    lab_id: &str,
    side: &EndpointRef,
) -> Result<u16, DataplaneError> {
    let key = endpoint_key(lab_id, &side.node, &side.interface);
    dp.vlans.release(&key)?;
    let tag = dp.vlans.allocate(&key)?;
    apply_tag(dp, ovs, lab_id, &side.node, &side.interface, tag).await?;
    Ok(tag)
}

fn ensure_distinct(source: &EndpointRef, target: &EndpointRef) -> Result<(), DataplaneError> {
    if source.node.trim().is_empty() || target.node.trim().is_empty() {
        return Err(DataplaneError::InvalidRequest("endpoint node is empty".into()));
    }
    if endpoint_key("", &source.node, &source.interface)
        == endpoint_key("", &target.node, &target.interface)
    {
        return Err(DataplaneError::InvalidRequest(
            "link endpoints must differ".into(),
        ));
    }
    Ok(())
}

/// Sets the tag on an endpoint's port. A cached port that vanished from the
/// bridge is looked up again once.
pub(crate) async fn apply_tag(
    dp: &mut Dataplane,
    ovs: &dyn OvsBackend,
    lab_id: &str,
    node: &str,
    interface: &str,
    tag: u16,
) -> Result<PortRecord, DataplaneError> {
    let port = dp.resolve_port(ovs, lab_id, node, interface).await?;
    match ovs.set_port_tag(&port.port_name, tag).await {
        Ok(()) => Ok(port),
        Err(OvsError::NoSuchPort(_)) => {
            dp.ports.remove(&endpoint_key(lab_id, node, interface));
            let port = dp.resolve_port(ovs, lab_id, node, interface).await?;
            ovs.set_port_tag(&port.port_name, tag).await?;
            Ok(port)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{endpoint, test_state};

    fn connect_request() -> ConnectLinkRequest {
        ConnectLinkRequest {
            link_id: "r1:eth1-r2:eth1".into(),
            source: endpoint("r1", "eth1"),
            target: endpoint("r2", "eth1"),
        }
    }

    #[tokio::test]
    async fn connect_shares_one_tag_and_disconnect_isolates() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-r1-1", "lab", "r1", "eth1", Some(100));
        ovs.add_container_port("veth-r2-1", "lab", "r2", "eth1", Some(101));

        let tag = connect(&state, "lab", &connect_request()).await.expect("connect");
        assert_eq!(ovs.tag("veth-r1-1"), Some(tag));
        assert_eq!(ovs.tag("veth-r2-1"), Some(tag));
        {
            let dp = state.dataplane().await;
            assert_eq!(dp.vlans.get("link:lab/r1:eth1-r2:eth1"), Some(tag));
            assert_eq!(dp.vlans.get("lab/r1/eth1"), None);
        }

        let again = connect(&state, "lab", &connect_request()).await.expect("reconnect");
        assert_eq!(again, tag);

        let request = DisconnectLinkRequest {
            link_id: "r1:eth1-r2:eth1".into(),
            source: endpoint("r1", "eth1"),
            target: endpoint("r2", "eth1"),
        };
        let (source, target) = disconnect(&state, "lab", &request).await.expect("disconnect");
        assert_ne!(source, target);
        assert_eq!(ovs.tag("veth-r1-1"), Some(source));
        assert_eq!(ovs.tag("veth-r2-1"), Some(target));
        let dp = state.dataplane().await;
        assert_eq!(dp.vlans.get("link:lab/r1:eth1-r2:eth1"), None);
        assert_eq!(dp.vlans.get("lab/r1/eth1"), Some(source));
    }

    #[tokio::test]
    async fn connect_with_missing_port_spends_no_tag() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-r1-1", "lab", "r1", "eth1", None);

        let err = connect(&state, "lab", &connect_request()).await.unwrap_err();
        assert!(matches!(err, DataplaneError::PortNotFound { ref node, .. } if node == "r2"));
        assert!(state.dataplane().await.vlans.is_empty());
    }

    #[tokio::test]
    async fn interface_vlan_round_trips_through_the_bridge() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-r1-1", "lab", "r1", "eth1", Some(150));

        assert_eq!(
            get_interface_vlan(&state, "lab", "r1", "Ethernet1").await.expect("get"),
            Some(150)
        );
        assert_eq!(
            get_interface_vlan(&state, "lab", "r9", "eth1").await.expect("get"),
            None
        );

        set_interface_vlan(&state, "lab", "r1", "eth1", 160).await.expect("set");
        assert_eq!(ovs.tag("veth-r1-1"), Some(160));
        assert_eq!(state.dataplane().await.vlans.holder(160), Some("lab/r1/eth1"));

        assert!(matches!(
            set_interface_vlan(&state, "lab", "r1", "eth1", 4095).await,
            Err(DataplaneError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn recreated_port_is_found_again() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-old", "lab", "r1", "eth1", Some(100));
        assert_eq!(
            get_interface_vlan(&state, "lab", "r1", "eth1").await.expect("get"),
            Some(100)
        );

        ovs.remove_port("veth-old");
        ovs.add_container_port("veth-new", "lab", "r1", "eth1", None);
        set_interface_vlan(&state, "lab", "r1", "eth1", 120).await.expect("set");
        assert_eq!(ovs.tag("veth-new"), Some(120));
    }

    #[tokio::test]
    async fn carrier_toggles_admin_state() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-r1-1", "lab", "r1", "eth1", Some(100));

        set_carrier(&state, "lab", "r1", "eth1", CarrierState::Off).await.expect("off");
        assert_eq!(ovs.admin_up("veth-r1-1"), Some(false));
        set_carrier(&state, "lab", "r1", "eth1", CarrierState::On).await.expect("on");
        assert_eq!(ovs.admin_up("veth-r1-1"), Some(true));
    }

    #[tokio::test]
    async fn list_ports_filters_by_lab() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-a", "lab", "r1", "eth1", Some(100));
        ovs.add_container_port("veth-b", "other", "r1", "eth1", Some(101));

        let ports = list_ports(&state, "lab").await.expect("ports");
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container, "netlab-lab-r1");
        assert_eq!(ports[0].vlan_tag, 100);
        assert_eq!(ports[0].bridge_name, "netlab0");
    }
}
