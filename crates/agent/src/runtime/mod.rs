use std::sync::Arc;

use async_trait::async_trait;
use common::api::{NodeRuntimeState, NodeStatus};
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

pub type DynNodeRuntime = Arc<dyn NodeRuntime>;

/// Container labels identifying a lab node.
pub const LABEL_LAB: &str = "netlab.lab";
pub const LABEL_NODE: &str = "netlab.node";

/// Lab nodes as the local container runtime sees them.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    async fn node_states(&self, lab_id: &str) -> Result<Vec<NodeStatus>, RuntimeError>;
    /// `Missing` when the node has no container on this host.
    async fn node_state(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError>;
    async fn start_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError>;
    async fn stop_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError>;
    /// `(lab, node)` for every running lab container on the host.
    async fn running_nodes(&self) -> Result<Vec<(String, String)>, RuntimeError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to runtime ({context}): {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("node {lab_id}/{node} has no container")]
    NotFound { lab_id: String, node: String },
    #[error("failed to {action} node {lab_id}/{node}: {source}")]
    Action {
        action: &'static str,
        lab_id: String,
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list lab containers: {0}")]
    List(#[source] anyhow::Error),
}

impl RuntimeError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RuntimeError::Connection { .. })
    }
}

/// Container name for a lab node.
pub fn container_name(lab_id: &str, node: &str) -> String {
    format!("netlab-{lab_id}-{node}")
}
