use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as DockerError,
    models::{ContainerState, ContainerStateStatusEnum},
    query_parameters::{
        InspectContainerOptions, ListContainersOptions, StartContainerOptions,
        StopContainerOptions,
    },
};
use common::api::{NodeRuntimeState, NodeStatus};
use tracing::debug;

use crate::runtime::{LABEL_LAB, LABEL_NODE, NodeRuntime, RuntimeError, container_name};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_defaults().map_err(|err| RuntimeError::Connection {
            context: "connect",
            source: err.into(),
        })?;
        Ok(Self::from_client(docker))
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Labels of every lab container matching `label_filter`, with its state.
    async fn list_lab_containers(
        &self,
        label_filter: String,
        all: bool,
    ) -> Result<Vec<(HashMap<String, String>, NodeRuntimeState)>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|err| {
                if is_connection_error(&err) {
                    RuntimeError::Connection {
                        context: "list_containers",
                        source: err.into(),
                    }
                } else {
                    RuntimeError::List(err.into())
                }
            })?;

        let mut out = Vec::new();
        for id in containers.iter().filter_map(|c| c.id.as_ref()) {
            match self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            {
                Ok(details) => {
                    let labels = details
                        .config
                        .and_then(|c| c.labels)
                        .unwrap_or_default();
                    out.push((labels, map_status(details.state.as_ref())));
                }
                Err(err) if is_not_found(&err) => continue,
                Err(err) if is_connection_error(&err) => {
                    return Err(RuntimeError::Connection {
                        context: "inspect_container",
                        source: err.into(),
                    });
                }
                Err(err) => return Err(RuntimeError::List(err.into())),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn node_states(&self, lab_id: &str) -> Result<Vec<NodeStatus>, RuntimeError> {
        let mut nodes: Vec<NodeStatus> = self
            .list_lab_containers(format!("{LABEL_LAB}={lab_id}"), true)
            .await?
            .into_iter()
            .filter_map(|(labels, state)| {
                Some(NodeStatus {
                    node: labels.get(LABEL_NODE)?.clone(),
                    state,
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(nodes)
    }

    async fn node_state(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        let name = container_name(lab_id, node);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(map_status(details.state.as_ref())),
            Err(err) if is_not_found(&err) => Ok(NodeRuntimeState::Missing),
            Err(err) => Err(map_action_error(err, "inspect", lab_id, node)),
        }
    }

    async fn start_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        let name = container_name(lab_id, node);
        match self
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_modified(&err) => debug!(%name, "container already running"),
            Err(err) => return Err(map_action_error(err, "start", lab_id, node)),
        }
        self.node_state(lab_id, node).await
    }

    async fn stop_node(&self, lab_id: &str, node: &str) -> Result<NodeRuntimeState, RuntimeError> {
        let name = container_name(lab_id, node);
        match self
            .docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    signal: None,
                    t: Some(10),
                }),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_modified(&err) => {}
            Err(err) if is_not_found(&err) => return Ok(NodeRuntimeState::Missing),
            Err(err) => return Err(map_action_error(err, "stop", lab_id, node)),
        }
        self.node_state(lab_id, node).await
    }

    async fn running_nodes(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        Ok(self
            .list_lab_containers(LABEL_LAB.to_string(), false)
            .await?
            .into_iter()
            .filter(|(_, state)| *state == NodeRuntimeState::Running)
            .filter_map(|(labels, _)| {
                Some((labels.get(LABEL_LAB)?.clone(), labels.get(LABEL_NODE)?.clone()))
            })
            .collect())
    }
}

/// A cleanly stopped container (exit 0 or never started) is `Stopped`; any
/// other non-running state counts as a crash.
fn map_status(state: Option<&ContainerState>) -> NodeRuntimeState {
    let Some(state) = state else {
        return NodeRuntimeState::Exited;
    };
    match state.status.as_ref() {
        Some(ContainerStateStatusEnum::RUNNING) => NodeRuntimeState::Running,
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::PAUSED) => {
            NodeRuntimeState::Stopped
        }
        Some(ContainerStateStatusEnum::EXITED) if state.exit_code == Some(0) => {
            NodeRuntimeState::Stopped
        }
        Some(ContainerStateStatusEnum::REMOVING) => NodeRuntimeState::Missing,
        _ => NodeRuntimeState::Exited,
    }
}

fn map_action_error(
    err: DockerError,
    action: &'static str,
    lab_id: &str,
    node: &str,
) -> RuntimeError {
    if is_not_found(&err) {
        RuntimeError::NotFound {
            lab_id: lab_id.to_string(),
            node: node.to_string(),
        }
    } else if is_connection_error(&err) {
        RuntimeError::Connection {
            context: action,
            source: err.into(),
        }
    } else {
        RuntimeError::Action {
            action,
            lab_id: lab_id.to_string(),
            node: node.to_string(),
            source: err.into(),
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn is_connection_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
            | DockerError::SocketNotFoundError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: ContainerStateStatusEnum, exit_code: Option<i64>) -> ContainerState {
        ContainerState {
            status: Some(status),
            exit_code,
            ..Default::default()
        }
    }

    #[test]
    fn map_status_separates_clean_stop_from_crash() {
        assert_eq!(
            map_status(Some(&state(ContainerStateStatusEnum::RUNNING, None))),
            NodeRuntimeState::Running
        );
        assert_eq!(
            map_status(Some(&state(ContainerStateStatusEnum::EXITED, Some(0)))),
            NodeRuntimeState::Stopped
        );
        assert_eq!(
            map_status(Some(&state(ContainerStateStatusEnum::EXITED, Some(137)))),
            NodeRuntimeState::Exited
        );
        assert_eq!(
            map_status(Some(&state(ContainerStateStatusEnum::CREATED, None))),
            NodeRuntimeState::Stopped
        );
        assert_eq!(map_status(None), NodeRuntimeState::Exited);
    }

    #[test]
    fn docker_errors_map_to_runtime_errors() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "missing".into(),
        };
        assert!(matches!(
            map_action_error(not_found, "start", "lab", "r1"),
            RuntimeError::NotFound { .. }
        ));

        let mapped = map_action_error(DockerError::RequestTimeoutError, "stop", "lab", "r1");
        assert!(mapped.is_connection_error());

        let other = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        match map_action_error(other, "start", "lab", "r1") {
            RuntimeError::Action { action, node, .. } => {
                assert_eq!(action, "start");
                assert_eq!(node, "r1");
            }
            other => panic!("expected action error, got {other:?}"),
        }
    }

    #[test]
    fn not_modified_is_distinct_from_not_found() {
        let not_modified = DockerError::DockerResponseServerError {
            status_code: 304,
            message: "unchanged".into(),
        };
        assert!(is_not_modified(&not_modified));
        assert!(!is_not_found(&not_modified));
    }
}
