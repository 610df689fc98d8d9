use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use common::api::{EndpointRef, NodeRuntimeState, NodeStatus};

use crate::config::{self, AppConfig};
use crate::ovs::{
    BridgePort, EXT_IFACE, EXT_LAB, EXT_LINK, EXT_NODE, OvsBackend, OvsError, PortKind,
    VxlanPortSpec,
};
use crate::runtime::{NodeRuntime, RuntimeError};
use crate::state::{AgentState, SharedState};
use crate::vlan::VlanAllocator;

pub(crate) fn base_config() -> AppConfig {
    let mut cfg = config::load_from_toml(
        r#"
        agent_id = "h1"
        [vlan]
        range_start = 100
        range_end = 200
        "#,
    )
    .expect("test config");
    cfg.listen_port = 0;
    cfg.metrics_port = 0;
    cfg
}

pub(crate) fn test_state() -> (SharedState, Arc<FakeOvs>, Arc<FakeRuntime>) {
    let cfg = base_config();
    let ovs = Arc::new(FakeOvs::default());
    let runtime = Arc::new(FakeRuntime::default());
    let vlans = VlanAllocator::in_memory(cfg.vlan.range_start, cfg.vlan.range_end);
    let state = AgentState::new(cfg, ovs.clone(), runtime.clone(), vlans);
    (state, ovs, runtime)
}

pub(crate) fn endpoint(node: &str, interface: &str) -> EndpointRef {
    EndpointRef {
        node: node.into(),
        interface: interface.into(),
    }
}

/// In-memory bridge.
#[derive(Default)]
pub(crate) struct FakeOvs {
    ports: StdMutex<BTreeMap<String, BridgePort>>,
    admin: StdMutex<HashMap<String, bool>>,
    fail_commands: StdMutex<bool>,
}

impl FakeOvs {
    pub(crate) fn add_container_port(
        &self,
        name: &str,
        lab: &str,
        node: &str,
        iface: &str,
        tag: Option<u16>,
    ) {
        let external_ids = BTreeMap::from([
            (EXT_LAB.to_string(), lab.to_string()),
            (EXT_NODE.to_string(), node.to_string()),
            (EXT_IFACE.to_string(), iface.to_string()),
        ]);
        self.ports.lock().expect("ports").insert(
            name.to_string(),
            BridgePort {
                name: name.to_string(),
                tag,
                kind: PortKind::Container,
                external_ids,
                options: BTreeMap::new(),
            },
        );
    }

    pub(crate) fn add_vxlan_port(
        &self,
        name: &str,
        lab: &str,
        link_id: &str,
        vni: u32,
        remote_ip: &str,
        tag: u16,
    ) {
        self.ensure(&VxlanPortSpec {
            port_name: name.into(),
            lab_id: lab.into(),
            link_id: link_id.into(),
            vni,
            local_ip: "10.0.0.1".into(),
            remote_ip: remote_ip.into(),
            tag,
        });
    }

    pub(crate) fn remove_port(&self, name: &str) {
        self.ports.lock().expect("ports").remove(name);
    }

    pub(crate) fn port(&self, name: &str) -> Option<BridgePort> {
        self.ports.lock().expect("ports").get(name).cloned()
    }

    pub(crate) fn tag(&self, name: &str) -> Option<u16> {
        self.port(name).and_then(|p| p.tag)
    }

    pub(crate) fn admin_up(&self, name: &str) -> Option<bool> {
        self.admin.lock().expect("admin").get(name).copied()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        *self.fail_commands.lock().expect("fail") = failing;
    }

    fn check(&self) -> Result<(), OvsError> {
        if *self.fail_commands.lock().expect("fail") {
            return Err(OvsError::Failed {
                command: "ovs-vsctl".into(),
                stderr: "database connection failed".into(),
            });
        }
        Ok(())
    }

    fn ensure(&self, spec: &VxlanPortSpec) {
        let external_ids = BTreeMap::from([
            (EXT_LAB.to_string(), spec.lab_id.clone()),
            (EXT_LINK.to_string(), spec.link_id.clone()),
        ]);
        let options = BTreeMap::from([
            ("key".to_string(), spec.vni.to_string()),
            ("local_ip".to_string(), spec.local_ip.clone()),
            ("remote_ip".to_string(), spec.remote_ip.clone()),
        ]);
        self.ports.lock().expect("ports").insert(
            spec.port_name.clone(),
            BridgePort {
                name: spec.port_name.clone(),
                tag: Some(spec.tag),
                kind: PortKind::Vxlan,
                external_ids,
                options,
            },
        );
    }
}

#[async_trait]
impl OvsBackend for FakeOvs {
    async fn list_ports(&self) -> Result<Vec<BridgePort>, OvsError> {
        self.check()?;
        Ok(self.ports.lock().expect("ports").values().cloned().collect())
    }

    async fn port_tag(&self, port: &str) -> Result<Option<u16>, OvsError> {
        self.check()?;
        self.ports
            .lock()
            .expect("ports")
            .get(port)
            .map(|p| p.tag)
            .ok_or_else(|| OvsError::NoSuchPort(port.to_string()))
    }

    async fn set_port_tag(&self, port: &str, tag: u16) -> Result<(), OvsError> {
        self.check()?;
        let mut ports = self.ports.lock().expect("ports");
        let entry = ports
            .get_mut(port)
            .ok_or_else(|| OvsError::NoSuchPort(port.to_string()))?;
        entry.tag = Some(tag);
        Ok(())
    }

    async fn ensure_vxlan_port(&self, spec: &VxlanPortSpec) -> Result<(), OvsError> {
        self.check()?;
        self.ensure(spec);
        Ok(())
    }

    async fn delete_port(&self, port: &str) -> Result<(), OvsError> {
        self.check()?;
        self.remove_port(port);
        Ok(())
    }

    async fn set_admin_state(&self, port: &str, up: bool) -> Result<(), OvsError> {
        self.check()?;
        if !self.ports.lock().expect("ports").contains_key(port) {
            return Err(OvsError::NoSuchPort(port.to_string()));
        }
        self.admin.lock().expect("admin").insert(port.to_string(), up);
        Ok(())
    }
}

/// Runtime whose nodes exist only when a test declares them.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    nodes: StdMutex<BTreeMap<(String, String), NodeRuntimeState>>,
}

impl FakeRuntime {
    pub(crate) fn set_state(&self, lab: &str, node: &str, state: NodeRuntimeState) {
        self.nodes
            .lock()
            .expect("nodes")
            .insert((lab.to_string(), node.to_string()), state);
    }

    pub(crate) fn set_running(&self, lab: &str, node: &str) {
        self.set_state(lab, node, NodeRuntimeState::Running);
    }

    fn get(&self, lab: &str, node: &str) -> NodeRuntimeState {
        self.nodes
            .lock()
            .expect("nodes")
            .get(&(lab.to_string(), node.to_string()))
            .copied()
            .unwrap_or(NodeRuntimeState::Missing)
    }

    fn transition(
        &self,
        lab: &str,
        node: &str,
        to: NodeRuntimeState,
    ) -> Result<NodeRuntimeState, RuntimeError> {
        if self.get(lab, node) == NodeRuntimeState::Missing {
            return Err(RuntimeError::NotFound {
                lab_id: lab.to_string(),
                node: node.to_string(),
            });
        }
        self.set_state(lab, node, to);
        Ok(to)
    }
}

#[async_trait]
impl NodeRuntime for FakeRuntime {
    async fn node_states(&self, lab_id: &str) -> Result<Vec<NodeStatus>, RuntimeError> {
        Ok(self
            .nodes
            .lock()
            .expect("nodes")
            .iter()
            .filter(|((lab, _), _)| lab == lab_id)
            .map(|((_, node), state)| NodeStatus {
                node: node.clone(),
                state: *state,
            })
            .collect())
    }

    async fn node_state(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        Ok(self.get(lab_id, node))
    }

    async fn start_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        self.transition(lab_id, node, NodeRuntimeState::Running)
    }

    async fn stop_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        if self.get(lab_id, node) == NodeRuntimeState::Missing {
            return Ok(NodeRuntimeState::Missing);
        }
        self.transition(lab_id, node, NodeRuntimeState::Stopped)
    }

    async fn running_nodes(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        Ok(self
            .nodes
            .lock()
            .expect("nodes")
            .iter()
            .filter(|(_, state)| **state == NodeRuntimeState::Running)
            .map(|(key, _)| key.clone())
            .collect())
    }
}
