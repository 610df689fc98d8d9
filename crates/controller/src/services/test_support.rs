use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::api::{
    AttachOverlayRequest, AttachOverlayResponse, CarrierState, ConnectLinkRequest,
    ConnectLinkResponse, DetachOverlayRequest, DetachOverlayResponse, DisconnectLinkRequest,
    DisconnectLinkResponse, HealthResponse, LinkTunnel, NodeActionResponse, NodeRuntimeState,
    NodeStatus, NodeStatusResponse, OverlayStatusResponse, PortInfo,
};

use crate::agent_client::{AgentApi, AgentError, AgentResult, AgentTarget};
use crate::app_state::ControllerContext;
use crate::coordination::{LeaseStore, SqlLeaseStore};
use crate::persistence::{
    self, HostRecord, NewHost, NewNodeState, NodeActualState, NodeDesiredState, NodeStateRecord,
};

type NodeKey = (String, String, String);
type PortKey = (String, String, String, String);

fn node_key(host: &str, lab: &str, node: &str) -> NodeKey {
    (host.into(), lab.into(), node.into())
}

fn port_key(host: &str, lab: &str, node: &str, iface: &str) -> PortKey {
    (host.into(), lab.into(), node.into(), iface.into())
}

#[derive(Default)]
struct FakeFabric {
    offline: HashSet<String>,
    failing: HashSet<String>,
    nodes: HashMap<NodeKey, NodeRuntimeState>,
    port_vlans: HashMap<PortKey, u16>,
    carriers: HashMap<PortKey, CarrierState>,
    tunnels: HashMap<String, Vec<LinkTunnel>>,
    next_tag: HashMap<String, u16>,
    calls: Vec<String>,
}

impl FakeFabric {
    fn allocate_tag(&mut self, host: &str) -> u16 {
        let next = self.next_tag.entry(host.to_string()).or_insert(100);
        let tag = *next;
        *next += 1;
        tag
    }
}

/// In-memory stand-in for a fleet of host agents. Every host shares one
/// fabric so tests can inspect both ends of a link.
#[derive(Default)]
pub(crate) struct FakeAgent {
    fabric: StdMutex<FakeFabric>,
}

impl FakeAgent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeFabric> {
        self.fabric.lock().expect("lock fabric")
    }

    pub(crate) fn set_offline(&self, host: &str, offline: bool) {
        let mut fabric = self.lock();
        if offline {
            fabric.offline.insert(host.to_string());
        } else {
            fabric.offline.remove(host);
        }
    }

    /// Makes `op` (or `op:host`) fail with a rejection until cleared.
    pub(crate) fn fail(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Calls recorded as `op:host`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn calls_for(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub(crate) fn set_node(&self, host: &str, lab: &str, node: &str, state: NodeRuntimeState) {
        self.lock().nodes.insert(node_key(host, lab, node), state);
    }

    pub(crate) fn node(&self, host: &str, lab: &str, node: &str) -> Option<NodeRuntimeState> {
        self.lock().nodes.get(&node_key(host, lab, node)).copied()
    }

    pub(crate) fn set_port_vlan(&self, host: &str, lab: &str, node: &str, iface: &str, tag: u16) {
        self.lock()
            .port_vlans
            .insert(port_key(host, lab, node, iface), tag);
    }

    pub(crate) fn port_vlan(&self, host: &str, lab: &str, node: &str, iface: &str) -> Option<u16> {
        self.lock()
            .port_vlans
            .get(&port_key(host, lab, node, iface))
            .copied()
    }

    pub(crate) fn carrier(&self, host: &str, lab: &str, node: &str, iface: &str) -> Option<CarrierState> {
        self.lock()
            .carriers
            .get(&port_key(host, lab, node, iface))
            .copied()
    }

    pub(crate) fn tunnel(&self, host: &str, link_id: &str) -> Option<LinkTunnel> {
        self.lock()
            .tunnels
            .get(host)
            .and_then(|tunnels| tunnels.iter().find(|t| t.link_id == link_id).cloned())
    }

    pub(crate) fn remove_tunnel(&self, host: &str, link_id: &str) {
        if let Some(tunnels) = self.lock().tunnels.get_mut(host) {
            tunnels.retain(|t| t.link_id != link_id);
        }
    }

    pub(crate) fn set_tunnel_vni(&self, host: &str, link_id: &str, vni: u32) {
        if let Some(tunnel) = self
            .lock()
            .tunnels
            .get_mut(host)
            .and_then(|tunnels| tunnels.iter_mut().find(|t| t.link_id == link_id))
        {
            tunnel.vni = vni;
        }
    }

    pub(crate) fn insert_tunnel(&self, host: &str, tunnel: LinkTunnel) {
        self.lock()
            .tunnels
            .entry(host.to_string())
            .or_default()
            .push(tunnel);
    }

    /// Records the call and applies offline/failure injection.
    fn begin(&self, op: &'static str, target: &AgentTarget) -> AgentResult<MutexGuard<'_, FakeFabric>> {
        let mut fabric = self.lock();
        fabric.calls.push(format!("{op}:{}", target.host_id));
        if fabric.offline.contains(&target.host_id) {
            return Err(AgentError::Unreachable {
                host_id: target.host_id.clone(),
                message: "connection refused".into(),
            });
        }
        if fabric.failing.contains(op) || fabric.failing.contains(&format!("{op}:{}", target.host_id)) {
            return Err(AgentError::Rejected {
                host_id: target.host_id.clone(),
                operation: op,
                message: format!("injected {op} failure"),
            });
        }
        Ok(fabric)
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn health(&self, target: &AgentTarget) -> AgentResult<HealthResponse> {
        let _fabric = self.begin("health", target)?;
        Ok(HealthResponse {
            agent_id: target.host_id.clone(),
            version: "test".into(),
            status: "ok".into(),
        })
    }

    async fn node_status(&self, target: &AgentTarget, lab_id: &str) -> AgentResult<NodeStatusResponse> {
        let fabric = self.begin("node_status", target)?;
        let mut nodes: Vec<NodeStatus> = fabric
            .nodes
            .iter()
            .filter(|((host, lab, _), _)| *host == target.host_id && lab == lab_id)
            .map(|((_, _, node), state)| NodeStatus {
                node: node.clone(),
                state: *state,
            })
            .collect();
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(NodeStatusResponse { nodes })
    }

    async fn start_node(&self, target: &AgentTarget, lab_id: &str, node: &str) -> AgentResult<NodeActionResponse> {
        let mut fabric = self.begin("start", target)?;
        fabric
            .nodes
            .insert(node_key(&target.host_id, lab_id, node), NodeRuntimeState::Running);
        Ok(NodeActionResponse {
            node: node.to_string(),
            success: true,
            state: NodeRuntimeState::Running,
            error: None,
        })
    }

    async fn stop_node(&self, target: &AgentTarget, lab_id: &str, node: &str) -> AgentResult<NodeActionResponse> {
        let mut fabric = self.begin("stop", target)?;
        fabric
            .nodes
            .insert(node_key(&target.host_id, lab_id, node), NodeRuntimeState::Stopped);
        Ok(NodeActionResponse {
            node: node.to_string(),
            success: true,
            state: NodeRuntimeState::Stopped,
            error: None,
        })
    }

    async fn list_ports(&self, target: &AgentTarget, lab_id: &str) -> AgentResult<Vec<PortInfo>> {
        let fabric = self.begin("list_ports", target)?;
        Ok(fabric
            .port_vlans
            .iter()
            .filter(|((host, lab, _, _), _)| *host == target.host_id && lab == lab_id)
            .map(|((_, lab, node, iface), tag)| PortInfo {
                container: format!("netlab-{lab}-{node}"),
                interface: iface.clone(),
                port_name: format!("vh-{node}-{iface}"),
                bridge_name: "netlab0".into(),
                vlan_tag: *tag,
            })
            .collect())
    }

    async fn get_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
    ) -> AgentResult<Option<u16>> {
        let fabric = self.begin("get_vlan", target)?;
        Ok(fabric
            .port_vlans
            .get(&port_key(&target.host_id, lab_id, node, interface))
            .copied())
    }

    async fn set_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
        vlan_tag: u16,
    ) -> AgentResult<()> {
        let mut fabric = self.begin("set_vlan", target)?;
        fabric
            .port_vlans
            .insert(port_key(&target.host_id, lab_id, node, interface), vlan_tag);
        Ok(())
    }

    async fn set_carrier(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
        state: CarrierState,
    ) -> AgentResult<()> {
        let mut fabric = self.begin("carrier", target)?;
        fabric
            .carriers
            .insert(port_key(&target.host_id, lab_id, node, interface), state);
        Ok(())
    }

    async fn connect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &ConnectLinkRequest,
    ) -> AgentResult<ConnectLinkResponse> {
        let mut fabric = self.begin("connect", target)?;
        let tag = fabric.allocate_tag(&target.host_id);
        for endpoint in [&request.source, &request.target] {
            fabric.port_vlans.insert(
                port_key(&target.host_id, lab_id, &endpoint.node, &endpoint.interface),
                tag,
            );
        }
        Ok(ConnectLinkResponse {
            success: true,
            vlan_tag: Some(tag),
            error: None,
        })
    }

    async fn disconnect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &DisconnectLinkRequest,
    ) -> AgentResult<DisconnectLinkResponse> {
        let mut fabric = self.begin("disconnect", target)?;
        let mut isolated = Vec::with_capacity(2);
        for endpoint in [&request.source, &request.target] {
            let tag = fabric.allocate_tag(&target.host_id);
            fabric.port_vlans.insert(
                port_key(&target.host_id, lab_id, &endpoint.node, &endpoint.interface),
                tag,
            );
            isolated.push(tag);
        }
        Ok(DisconnectLinkResponse {
            success: true,
            source_vlan: isolated.first().copied(),
            target_vlan: isolated.get(1).copied(),
            error: None,
        })
    }

    async fn get_overlay_status(&self, target: &AgentTarget) -> AgentResult<OverlayStatusResponse> {
        let fabric = self.begin("overlay_status", target)?;
        Ok(OverlayStatusResponse {
            link_tunnels: fabric
                .tunnels
                .get(&target.host_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn attach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &AttachOverlayRequest,
    ) -> AgentResult<AttachOverlayResponse> {
        let mut fabric = self.begin("attach", target)?;
        let key = port_key(&target.host_id, &request.lab_id, &request.node, &request.interface);
        let local_vlan = match fabric.port_vlans.get(&key).copied() {
            Some(tag) => tag,
            None => {
                let tag = fabric.allocate_tag(&target.host_id);
                fabric.port_vlans.insert(key, tag);
                tag
            }
        };
        let tunnels = fabric.tunnels.entry(target.host_id.clone()).or_default();
        tunnels.retain(|t| t.link_id != request.link_id);
        tunnels.push(LinkTunnel {
            link_id: request.link_id.clone(),
            lab_id: request.lab_id.clone(),
            vni: request.vni,
            local_vlan,
            port_name: request.port_name.clone(),
            remote_ip: request.remote_ip.clone(),
        });
        Ok(AttachOverlayResponse {
            success: true,
            local_vlan: Some(local_vlan),
            error: None,
        })
    }

    async fn detach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &DetachOverlayRequest,
    ) -> AgentResult<DetachOverlayResponse> {
        let mut fabric = self.begin("detach", target)?;
        if let Some(tunnels) = fabric.tunnels.get_mut(&target.host_id) {
            tunnels.retain(|t| t.port_name != request.port_name);
        }
        Ok(DetachOverlayResponse {
            success: true,
            error: None,
        })
    }
}

/// Lease store whose backend is always down.
pub(crate) struct UnavailableLeaseStore;

#[async_trait]
impl LeaseStore for UnavailableLeaseStore {
    async fn set_if_absent(&self, _key: &str, _token: &str, _ttl: Duration) -> crate::Result<bool> {
        Err(anyhow::anyhow!("lease store unavailable"))
    }

    async fn delete_if_owner(&self, _key: &str, _token: &str) -> crate::Result<bool> {
        Err(anyhow::anyhow!("lease store unavailable"))
    }

    async fn extend_if_owner(&self, _key: &str, _token: &str, _ttl: Duration) -> crate::Result<bool> {
        Err(anyhow::anyhow!("lease store unavailable"))
    }

    async fn exists(&self, _key: &str) -> crate::Result<bool> {
        Err(anyhow::anyhow!("lease store unavailable"))
    }
}

/// Lease store that grants every lease and loses it right after: renewals
/// report another holder.
pub(crate) struct TakenOverLeaseStore;

#[async_trait]
impl LeaseStore for TakenOverLeaseStore {
    async fn set_if_absent(&self, _key: &str, _token: &str, _ttl: Duration) -> crate::Result<bool> {
        Ok(true)
    }

    async fn delete_if_owner(&self, _key: &str, _token: &str) -> crate::Result<bool> {
        Ok(false)
    }

    async fn extend_if_owner(&self, _key: &str, _token: &str, _ttl: Duration) -> crate::Result<bool> {
        Ok(false)
    }

    async fn exists(&self, _key: &str) -> crate::Result<bool> {
        Ok(false)
    }
}

pub(crate) async fn setup_context() -> (ControllerContext, Arc<FakeAgent>) {
    setup_context_with("").await
}

/// Context over a fresh in-memory database with config overrides in TOML.
pub(crate) async fn setup_context_with(overrides: &str) -> (ControllerContext, Arc<FakeAgent>) {
    let cfg = crate::config::load_from_toml(overrides).expect("config");
    let db = persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let agent = Arc::new(FakeAgent::new());
    let leases = Arc::new(SqlLeaseStore::new(db.clone()));
    let ctx = ControllerContext::new(db, agent.clone(), leases, cfg);
    (ctx, agent)
}

/// Registers an online host whose VTEP is `data_ip`.
pub(crate) async fn seed_host(ctx: &ControllerContext, id: &str, data_ip: &str) -> HostRecord {
    persistence::hosts::upsert_host(
        &ctx.db,
        &NewHost {
            id: id.into(),
            name: format!("host-{id}"),
            address: format!("http://{id}.agents.test"),
            data_ip: data_ip.into(),
        },
    )
    .await
    .expect("host");
    persistence::hosts::record_probe_success(&ctx.db, id, Utc::now())
        .await
        .expect("probe");
    persistence::hosts::get_host(&ctx.db, id)
        .await
        .expect("get host")
        .expect("host row")
}

pub(crate) async fn seed_node(
    ctx: &ControllerContext,
    lab: &str,
    node: &str,
    host: &str,
    desired: NodeDesiredState,
    actual: NodeActualState,
) -> NodeStateRecord {
    let record = persistence::nodes::upsert_node_state(
        &ctx.db,
        &NewNodeState {
            lab_id: lab.into(),
            node_name: node.into(),
            host_id: Some(host.into()),
            desired_state: desired,
        },
    )
    .await
    .expect("node");
    persistence::nodes::set_node_actual_state(&ctx.db, record.id, actual, None)
        .await
        .expect("actual");
    persistence::nodes::get_node_state_by_id(&ctx.db, record.id)
        .await
        .expect("get node")
        .expect("node row")
}

/// Two running nodes on `host_a`/`host_b`, the agents agreeing.
pub(crate) async fn seed_running_pair(
    ctx: &ControllerContext,
    agent: &FakeAgent,
    lab: &str,
    (node_a, host_a): (&str, &str),
    (node_b, host_b): (&str, &str),
) {
    for (node, host) in [(node_a, host_a), (node_b, host_b)] {
        seed_node(
            ctx,
            lab,
            node,
            host,
            NodeDesiredState::Running,
            NodeActualState::Running,
        )
        .await;
        agent.set_node(host, lab, node, NodeRuntimeState::Running);
    }
}
