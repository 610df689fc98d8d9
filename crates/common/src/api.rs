//! Agent API DTOs used by the controller client and the host-agent router.

use serde::{Deserialize, Serialize};

/// Link-layer carrier signal for one side of a link (wire format is lowercase).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CarrierState {
    /// Interface is administratively up.
    #[default]
    On,
    /// Interface is administratively down (simulated cable pull).
    Off,
}

impl CarrierState {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierState::On => "on",
            CarrierState::Off => "off",
        }
    }
}

/// Runtime state of a lab node as observed by the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRuntimeState {
    /// Container/VM is running.
    Running,
    /// Container/VM exists but was stopped cleanly.
    Stopped,
    /// Container/VM exited on its own (crash or non-zero exit).
    Exited,
    /// No container/VM exists for the node.
    Missing,
}

impl NodeRuntimeState {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRuntimeState::Running => "running",
            NodeRuntimeState::Stopped => "stopped",
            NodeRuntimeState::Exited => "exited",
            NodeRuntimeState::Missing => "missing",
        }
    }
}

/// Liveness response served at `/healthz`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    /// Identifier the agent was configured with.
    pub agent_id: String,
    /// Agent package version.
    pub version: String,
    /// Always `ok` when the agent answers.
    pub status: String,
}

/// One OVS port plumbed into a lab container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortInfo {
    /// Container (lab node) owning the interface.
    pub container: String,
    /// Interface name inside the container.
    pub interface: String,
    /// Host-side OVS port name.
    pub port_name: String,
    /// Bridge the port is attached to.
    pub bridge_name: String,
    /// Access VLAN tag currently applied to the port.
    pub vlan_tag: u16,
}

/// Runtime state of one lab node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node name within the lab.
    pub node: String,
    /// Observed runtime state.
    pub state: NodeRuntimeState,
}

/// Response for `GET /labs/{lab}/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeStatusResponse {
    /// Every node the agent knows about for the lab.
    pub nodes: Vec<NodeStatus>,
}

/// Response for node start/stop actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeActionResponse {
    /// Node name within the lab.
    pub node: String,
    /// Whether the action completed.
    pub success: bool,
    /// Observed state after the action.
    pub state: NodeRuntimeState,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for `GET /labs/{lab}/interfaces/{node}/{iface}/vlan`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceVlanResponse {
    /// Node name within the lab.
    pub node: String,
    /// Interface name inside the node.
    pub interface: String,
    /// Live VLAN tag read from OVS, `None` when the port is unknown or untagged.
    pub vlan_tag: Option<u16>,
}

/// Request to re-apply a VLAN tag to an interface port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetInterfaceVlanRequest {
    /// Tag to apply.
    pub vlan_tag: u16,
}

/// Request to change the carrier of an interface port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetCarrierRequest {
    /// Desired carrier signal.
    pub state: CarrierState,
}

/// One endpoint of a link as sent to agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EndpointRef {
    /// Node name within the lab.
    pub node: String,
    /// Interface name inside the node.
    pub interface: String,
}

/// Request to connect two endpoints that live on the same host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectLinkRequest {
    /// Canonical link name.
    pub link_id: String,
    /// Source endpoint.
    pub source: EndpointRef,
    /// Target endpoint.
    pub target: EndpointRef,
}

/// Result of a same-host connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectLinkResponse {
    /// Whether both ports now share a VLAN.
    pub success: bool,
    /// Shared VLAN tag applied to both ports.
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request to disconnect a same-host link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectLinkRequest {
    /// Canonical link name.
    pub link_id: String,
    /// Source endpoint.
    pub source: EndpointRef,
    /// Target endpoint.
    pub target: EndpointRef,
}

/// Result of a same-host disconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectLinkResponse {
    /// Whether both ports were moved to isolated VLANs.
    pub success: bool,
    /// Isolated tag now applied to the source port.
    #[serde(default)]
    pub source_vlan: Option<u16>,
    /// Isolated tag now applied to the target port.
    #[serde(default)]
    pub target_vlan: Option<u16>,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overlay tunnel entry reported by an agent for one link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkTunnel {
    /// Canonical link name the tunnel carries.
    pub link_id: String,
    /// Lab the link belongs to.
    pub lab_id: String,
    /// VXLAN network identifier.
    pub vni: u32,
    /// Host-local VLAN tag bridging the container port to the tunnel.
    pub local_vlan: u16,
    /// OVS VXLAN port name.
    pub port_name: String,
    /// Peer VTEP address.
    pub remote_ip: String,
}

/// Response for `GET /overlay/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OverlayStatusResponse {
    /// Every link tunnel currently realized on the host.
    pub link_tunnels: Vec<LinkTunnel>,
}

impl OverlayStatusResponse {
    /// Finds the tunnel entry for a link, if any.
    pub fn tunnel_for(&self, link_id: &str) -> Option<&LinkTunnel> {
        self.link_tunnels.iter().find(|t| t.link_id == link_id)
    }
}

/// Request to attach one endpoint of a cross-host link to the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachOverlayRequest {
    /// Lab the link belongs to.
    pub lab_id: String,
    /// Canonical link name.
    pub link_id: String,
    /// Local node name.
    pub node: String,
    /// Interface inside the local node.
    pub interface: String,
    /// VXLAN network identifier shared by both sides.
    pub vni: u32,
    /// Local VTEP address.
    pub local_ip: String,
    /// Peer VTEP address.
    pub remote_ip: String,
    /// Deterministic OVS port name for the tunnel.
    pub port_name: String,
}

/// Result of an overlay attach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachOverlayResponse {
    /// Whether the endpoint is attached.
    pub success: bool,
    /// Host-local VLAN bridging the endpoint to the tunnel.
    #[serde(default)]
    pub local_vlan: Option<u16>,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request to detach one endpoint of a cross-host link from the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetachOverlayRequest {
    /// Lab the link belongs to.
    pub lab_id: String,
    /// Canonical link name.
    pub link_id: String,
    /// Deterministic OVS port name for the tunnel.
    pub port_name: String,
}

/// Result of an overlay detach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetachOverlayResponse {
    /// Whether nothing of the tunnel remains on the host.
    pub success: bool,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary returned by `POST /discover`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiscoveryResponse {
    /// Container ports recovered into the port map.
    pub ports: usize,
    /// Overlay tunnels recovered into the tunnel map.
    pub link_tunnels: usize,
    /// Ports on the bridge whose container is not running.
    pub stale_ports: usize,
    /// VLAN allocations released because their endpoint vanished.
    pub released_tags: usize,
}

/// JSON error body returned by agent endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_state_uses_lowercase_wire_format() {
        let encoded = serde_json::to_string(&CarrierState::Off).expect("encode");
        assert_eq!(encoded, "\"off\"");
        let decoded: CarrierState = serde_json::from_str("\"on\"").expect("decode");
        assert_eq!(decoded, CarrierState::On);
    }

    #[test]
    fn overlay_status_finds_tunnel_by_link_id() {
        let status = OverlayStatusResponse {
            link_tunnels: vec![LinkTunnel {
                link_id: "r1:eth1-r2:eth1".into(),
                lab_id: "lab".into(),
                vni: 40001,
                local_vlan: 100,
                port_name: "vxl0123456789a".into(),
                remote_ip: "10.0.0.2".into(),
            }],
        };

        assert_eq!(
            status.tunnel_for("r1:eth1-r2:eth1").map(|t| t.vni),
            Some(40001)
        );
        assert!(status.tunnel_for("r1:eth2-r2:eth2").is_none());
    }

    #[test]
    fn attach_response_tolerates_missing_optional_fields() {
        let decoded: AttachOverlayResponse =
            serde_json::from_str(r#"{"success": false}"#).expect("decode");
        assert!(!decoded.success);
        assert!(decoded.local_vlan.is_none());
        assert!(decoded.error.is_none());
    }
}
