use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::api::{NodeRuntimeState, NodeStatus};
use host_agent::config;
use host_agent::ovs::{BridgePort, OvsBackend, OvsError, VxlanPortSpec};
use host_agent::runner::{self, AgentOptions};
use host_agent::runtime::{NodeRuntime, RuntimeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bridge with no ports.
struct EmptyBridge;

#[async_trait]
impl OvsBackend for EmptyBridge {
    async fn list_ports(&self) -> Result<Vec<BridgePort>, OvsError> {
        Ok(Vec::new())
    }
    async fn port_tag(&self, port: &str) -> Result<Option<u16>, OvsError> {
        Err(OvsError::NoSuchPort(port.to_string()))
    }
    async fn set_port_tag(&self, port: &str, _tag: u16) -> Result<(), OvsError> {
        Err(OvsError::NoSuchPort(port.to_string()))
    }
    async fn ensure_vxlan_port(&self, _spec: &VxlanPortSpec) -> Result<(), OvsError> {
        Ok(())
    }
    async fn delete_port(&self, _port: &str) -> Result<(), OvsError> {
        Ok(())
    }
    async fn set_admin_state(&self, port: &str, _up: bool) -> Result<(), OvsError> {
        Err(OvsError::NoSuchPort(port.to_string()))
    }
}

/// Host without lab containers.
struct NoNodes;

#[async_trait]
impl NodeRuntime for NoNodes {
    async fn node_states(&self, _lab_id: &str) -> Result<Vec<NodeStatus>, RuntimeError> {
        Ok(Vec::new())
    }
    async fn node_state(&self, _lab_id: &str, _node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        Ok(NodeRuntimeState::Missing)
    }
    async fn start_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        Err(RuntimeError::NotFound {
            lab_id: lab_id.to_string(),
            node: node.to_string(),
        })
    }
    async fn stop_node(&self, _lab_id: &str, _node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        Ok(NodeRuntimeState::Missing)
    }
    async fn running_nodes(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn serves_health_and_shuts_down_with_metrics_enabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("vlans.json");
    let cfg = config::load_from_toml(&format!(
        r#"
        agent_id = "itest"
        listen_host = "127.0.0.1"
        listen_port = 0
        metrics_host = "127.0.0.1"
        metrics_port = 0
        [vlan]
        state_path = "{}"
        "#,
        state_path.display()
    ))
    .expect("config");

    let agent = runner::start_agent(
        cfg,
        AgentOptions {
            // Avoid global tracing subscriber conflicts in tests.
            init_tracing: false,
            serve_metrics: true,
            discover_on_start: true,
            ovs: Some(Arc::new(EmptyBridge)),
            runtime: Some(Arc::new(NoNodes)),
        },
    )
    .await
    .expect("agent starts");

    let mut stream = tokio::net::TcpStream::connect(agent.api_addr())
        .await
        .expect("connect");
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: agent\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""agent_id":"itest""#), "{response}");

    let shutdown = tokio::time::timeout(Duration::from_secs(5), agent.shutdown()).await;
    let res = shutdown.expect("shutdown should complete within timeout");
    res.expect("shutdown should succeed");
}
