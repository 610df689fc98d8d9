use std::collections::BTreeMap;
use std::sync::Arc;

use common::api::LinkTunnel;
use common::naming::endpoint_key;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::AppConfig;
use crate::error::DataplaneError;
use crate::ovs::{BridgePort, DynOvsBackend, OvsBackend};
use crate::runtime::DynNodeRuntime;
use crate::telemetry;
use crate::vlan::VlanAllocator;

pub type SharedState = Arc<AgentState>;

pub struct AgentState {
    pub cfg: AppConfig,
    pub ovs: DynOvsBackend,
    pub runtime: DynNodeRuntime,
    dataplane: Mutex<Dataplane>,
}

impl AgentState {
    pub fn new(
        cfg: AppConfig,
        ovs: DynOvsBackend,
        runtime: DynNodeRuntime,
        vlans: VlanAllocator,
    ) -> SharedState {
        Arc::new(Self {
            cfg,
            ovs,
            runtime,
            dataplane: Mutex::new(Dataplane::new(vlans)),
        })
    }

    /// Every VLAN, port-map and tunnel-map mutation happens under this guard.
    pub async fn dataplane(&self) -> MutexGuard<'_, Dataplane> {
        self.dataplane.lock().await
    }
}

/// Container port known to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub lab_id: String,
    pub node: String,
    pub interface: String,
    pub port_name: String,
}

/// Overlay attachment realized on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRecord {
    pub lab_id: String,
    pub link_id: String,
    pub vni: u32,
    pub local_vlan: u16,
    pub port_name: String,
    pub remote_ip: String,
    /// Endpoint key of the local side, unknown for tunnels rebuilt from a
    /// bare VXLAN port.
    pub endpoint: Option<String>,
}

impl From<&TunnelRecord> for LinkTunnel {
    fn from(record: &TunnelRecord) -> Self {
        LinkTunnel {
            link_id: record.link_id.clone(),
            lab_id: record.lab_id.clone(),
            vni: record.vni,
            local_vlan: record.local_vlan,
            port_name: record.port_name.clone(),
            remote_ip: record.remote_ip.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Dataplane {
    pub vlans: VlanAllocator,
    /// Keyed by endpoint key.
    pub ports: BTreeMap<String, PortRecord>,
    /// Keyed by `(lab, link_id)`.
    pub tunnels: BTreeMap<(String, String), TunnelRecord>,
}

impl Dataplane {
    pub fn new(vlans: VlanAllocator) -> Self {
        Self {
            vlans,
            ports: BTreeMap::new(),
            tunnels: BTreeMap::new(),
        }
    }

    /// Replaces the port map with the container ports in `ports`.
    pub fn record_ports<'a>(&mut self, ports: impl IntoIterator<Item = &'a BridgePort>) {
        self.ports = ports
            .into_iter()
            .filter_map(|port| {
                let (lab_id, node, interface) = port.endpoint()?;
                Some((
                    endpoint_key(lab_id, node, interface),
                    PortRecord {
                        lab_id: lab_id.to_string(),
                        node: node.to_string(),
                        interface: interface.to_string(),
                        port_name: port.name.clone(),
                    },
                ))
            })
            .collect();
    }

    pub fn link_tunnels(&self) -> Vec<LinkTunnel> {
        self.tunnels.values().map(LinkTunnel::from).collect()
    }

    /// Finds the bridge port of an endpoint, re-reading the bridge once when
    /// the cached map does not know it.
    pub async fn resolve_port(
        &mut self,
        ovs: &dyn OvsBackend,
        lab_id: &str,
        node: &str,
        interface: &str,
    ) -> Result<PortRecord, DataplaneError> {
        let key = endpoint_key(lab_id, node, interface);
        if let Some(port) = self.ports.get(&key) {
            return Ok(port.clone());
        }
        self.refresh_ports(ovs).await?;
        self.ports
            .get(&key)
            .cloned()
            .ok_or_else(|| DataplaneError::PortNotFound {
                lab_id: lab_id.to_string(),
                node: node.to_string(),
                interface: interface.to_string(),
            })
    }

    pub async fn refresh_ports(&mut self, ovs: &dyn OvsBackend) -> Result<(), DataplaneError> {
        let ports = ovs.list_ports().await?;
        self.record_ports(&ports);
        Ok(())
    }

    pub fn publish_metrics(&self) {
        telemetry::record_vlan_allocations(self.vlans.len());
    }
}
