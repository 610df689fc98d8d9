use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::api::{
    AttachOverlayRequest, AttachOverlayResponse, CarrierState, ConnectLinkRequest,
    ConnectLinkResponse, DetachOverlayRequest, DetachOverlayResponse, DisconnectLinkRequest,
    DisconnectLinkResponse, ErrorBody, HealthResponse, InterfaceVlanResponse, NodeActionResponse,
    NodeStatusResponse, OverlayStatusResponse, PortInfo, SetCarrierRequest,
    SetInterfaceVlanRequest,
};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentsConfig;
use crate::persistence::HostRecord;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {host_id} unreachable: {message}")]
    Unreachable { host_id: String, message: String },
    #[error("agent {host_id} timed out after {}s", .timeout.as_secs())]
    Timeout { host_id: String, timeout: Duration },
    #[error("agent {host_id} returned HTTP {status}: {message}")]
    Status {
        host_id: String,
        status: u16,
        message: String,
    },
    #[error("agent {host_id} sent an unreadable response: {message}")]
    Decode { host_id: String, message: String },
    #[error("agent {host_id} rejected {operation}: {message}")]
    Rejected {
        host_id: String,
        operation: &'static str,
        message: String,
    },
}

impl AgentError {
    /// Failures that say nothing about the dataplane and may clear on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Unreachable { .. } | AgentError::Timeout { .. } => true,
            AgentError::Status { status, .. } => *status >= 500,
            AgentError::Decode { .. } | AgentError::Rejected { .. } => false,
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Where to reach one host agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTarget {
    pub host_id: String,
    pub address: String,
}

impl From<&HostRecord> for AgentTarget {
    fn from(host: &HostRecord) -> Self {
        Self {
            host_id: host.id.clone(),
            address: host.address.clone(),
        }
    }
}

#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn health(&self, target: &AgentTarget) -> AgentResult<HealthResponse>;

    async fn node_status(&self, target: &AgentTarget, lab_id: &str)
    -> AgentResult<NodeStatusResponse>;
    async fn start_node(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
    ) -> AgentResult<NodeActionResponse>;
    async fn stop_node(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
    ) -> AgentResult<NodeActionResponse>;

    async fn list_ports(&self, target: &AgentTarget, lab_id: &str) -> AgentResult<Vec<PortInfo>>;
    async fn get_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
    ) -> AgentResult<Option<u16>>;
    async fn set_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
        vlan_tag: u16,
    ) -> AgentResult<()>;
    async fn set_carrier(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
        state: CarrierState,
    ) -> AgentResult<()>;

    async fn connect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &ConnectLinkRequest,
    ) -> AgentResult<ConnectLinkResponse>;
    async fn disconnect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &DisconnectLinkRequest,
    ) -> AgentResult<DisconnectLinkResponse>;

    async fn get_overlay_status(&self, target: &AgentTarget) -> AgentResult<OverlayStatusResponse>;
    async fn attach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &AttachOverlayRequest,
    ) -> AgentResult<AttachOverlayResponse>;
    async fn detach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &DetachOverlayRequest,
    ) -> AgentResult<DetachOverlayResponse>;
}

pub type DynAgentApi = Arc<dyn AgentApi>;

/// JSON-over-HTTP client for host agents.
#[derive(Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    rpc_timeout: Duration,
    overlay_timeout: Duration,
    health_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(cfg: &AgentsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netlab-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            rpc_timeout: cfg.rpc_timeout(),
            overlay_timeout: cfg.overlay_timeout(),
            health_timeout: cfg.health_timeout(),
        })
    }

    fn url(target: &AgentTarget, path: &str) -> String {
        format!("{}{}", target.address.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        target: &AgentTarget,
        request: RequestBuilder,
        timeout: Duration,
    ) -> AgentResult<T> {
        let host_id = target.host_id.clone();
        let response = request.timeout(timeout).send().await.map_err(|err| {
            if err.is_timeout() {
                AgentError::Timeout {
                    host_id: host_id.clone(),
                    timeout,
                }
            } else {
                AgentError::Unreachable {
                    host_id: host_id.clone(),
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|err| err.message)
                .unwrap_or(body);
            debug!(%host_id, %status, %message, "agent returned error status");
            return Err(AgentError::Status {
                host_id,
                status: status.as_u16(),
                message,
            });
        }

        response.json::<T>().await.map_err(|err| {
            if err.is_timeout() {
                AgentError::Timeout {
                    host_id: host_id.clone(),
                    timeout,
                }
            } else {
                AgentError::Decode {
                    host_id: host_id.clone(),
                    message: err.to_string(),
                }
            }
        })
    }

    async fn node_action(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        action: &'static str,
    ) -> AgentResult<NodeActionResponse> {
        let url = Self::url(target, &format!("/labs/{lab_id}/nodes/{node}/{action}"));
        let response: NodeActionResponse = self
            .send(target, self.client.post(url), self.rpc_timeout)
            .await?;
        if !response.success {
            return Err(rejected(target, action, response.error.clone()));
        }
        Ok(response)
    }
}

fn rejected(target: &AgentTarget, operation: &'static str, error: Option<String>) -> AgentError {
    AgentError::Rejected {
        host_id: target.host_id.clone(),
        operation,
        message: error.unwrap_or_else(|| "no detail".to_string()),
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn health(&self, target: &AgentTarget) -> AgentResult<HealthResponse> {
        let url = Self::url(target, "/healthz");
        self.send(target, self.client.get(url), self.health_timeout)
            .await
    }

    async fn node_status(
        &self,
        target: &AgentTarget,
        lab_id: &str,
    ) -> AgentResult<NodeStatusResponse> {
        let url = Self::url(target, &format!("/labs/{lab_id}/nodes"));
        self.send(target, self.client.get(url), self.rpc_timeout)
            .await
    }

    async fn start_node(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
    ) -> AgentResult<NodeActionResponse> {
        self.node_action(target, lab_id, node, "start").await
    }

    async fn stop_node(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
    ) -> AgentResult<NodeActionResponse> {
        self.node_action(target, lab_id, node, "stop").await
    }

    async fn list_ports(&self, target: &AgentTarget, lab_id: &str) -> AgentResult<Vec<PortInfo>> {
        let url = Self::url(target, &format!("/labs/{lab_id}/ports"));
        self.send(target, self.client.get(url), self.rpc_timeout)
            .await
    }

    async fn get_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
    ) -> AgentResult<Option<u16>> {
        let url = Self::url(
            target,
            &format!("/labs/{lab_id}/interfaces/{node}/{interface}/vlan"),
        );
        let response: InterfaceVlanResponse = self
            .send(target, self.client.get(url), self.rpc_timeout)
            .await?;
        Ok(response.vlan_tag)
    }

    async fn set_interface_vlan(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        node: &str,
        interface: &str,
        vlan_tag: u16,
    ) -> AgentResult<()> {
        let url = Self::url(
            target,
            &format!("/labs/{lab_id}/interfaces/{node}/{interface}/vlan"),
        );
        let request = self
            .client
            .put(url)
            .json(&SetInterfaceVlanRequest { vlan_tag });
        let _: InterfaceVlanResponse = self.send(target, request, self.rpc_timeout).await?;
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
        let url = Self::url(
            target,
            &format!("/labs/{lab_id}/interfaces/{node}/{interface}/carrier"),
        );
        let request = self.client.put(url).json(&SetCarrierRequest { state });
        let _: serde_json::Value = self.send(target, request, self.rpc_timeout).await?;
        Ok(())
    }

    async fn connect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &ConnectLinkRequest,
    ) -> AgentResult<ConnectLinkResponse> {
        let url = Self::url(target, &format!("/labs/{lab_id}/links/connect"));
        let response: ConnectLinkResponse = self
            .send(target, self.client.post(url).json(request), self.rpc_timeout)
            .await?;
        if !response.success {
            return Err(rejected(target, "connect", response.error.clone()));
        }
        Ok(response)
    }

    async fn disconnect_link(
        &self,
        target: &AgentTarget,
        lab_id: &str,
        request: &DisconnectLinkRequest,
    ) -> AgentResult<DisconnectLinkResponse> {
        let url = Self::url(target, &format!("/labs/{lab_id}/links/disconnect"));
        let response: DisconnectLinkResponse = self
            .send(target, self.client.post(url).json(request), self.rpc_timeout)
            .await?;
        if !response.success {
            return Err(rejected(target, "disconnect", response.error.clone()));
        }
        Ok(response)
    }

    async fn get_overlay_status(&self, target: &AgentTarget) -> AgentResult<OverlayStatusResponse> {
        let url = Self::url(target, "/overlay/status");
        self.send(target, self.client.get(url), self.overlay_timeout)
            .await
    }

    async fn attach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &AttachOverlayRequest,
    ) -> AgentResult<AttachOverlayResponse> {
        let url = Self::url(target, "/overlay/attach");
        let response: AttachOverlayResponse = self
            .send(target, self.client.post(url).json(request), self.overlay_timeout)
            .await?;
        if !response.success {
            return Err(rejected(target, "overlay attach", response.error.clone()));
        }
        Ok(response)
    }

    async fn detach_overlay_interface(
        &self,
        target: &AgentTarget,
        request: &DetachOverlayRequest,
    ) -> AgentResult<DetachOverlayResponse> {
        let url = Self::url(target, "/overlay/detach");
        let response: DetachOverlayResponse = self
            .send(target, self.client.post(url).json(request), self.overlay_timeout)
            .await?;
        if !response.success {
            return Err(rejected(target, "overlay detach", response.error.clone()));
        }
        Ok(response)
    }
}
