use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use common::api::{
    AttachOverlayRequest, AttachOverlayResponse, ConnectLinkRequest, ConnectLinkResponse,
    DetachOverlayRequest, DetachOverlayResponse, DisconnectLinkRequest, DisconnectLinkResponse,
    DiscoveryResponse, ErrorBody, HealthResponse, InterfaceVlanResponse, NodeActionResponse,
    NodeRuntimeState, NodeStatusResponse, OverlayStatusResponse, PortInfo, SetCarrierRequest,
    SetInterfaceVlanRequest,
};
use serde_json::json;
use tracing::warn;

use crate::error::DataplaneError;
use crate::ovs::OvsError;
use crate::runtime::RuntimeError;
use crate::state::SharedState;
use crate::vlan::VlanError;
use crate::{discovery, links, overlay, telemetry, version};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl From<DataplaneError> for ApiError {
    fn from(err: DataplaneError) -> Self {
        let status = match &err {
            DataplaneError::PortNotFound { .. }
            | DataplaneError::Ovs(OvsError::NoSuchPort(_))
            | DataplaneError::Runtime(RuntimeError::NotFound { .. }) => StatusCode::NOT_FOUND,
            DataplaneError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DataplaneError::Vlan(
                VlanError::Exhausted { .. }
                | VlanError::TagInUse { .. }
                | VlanError::OutOfRange { .. },
            ) => StatusCode::CONFLICT,
            DataplaneError::Runtime(RuntimeError::Connection { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Splits dataplane failures into `success: false` answers for rejected
/// requests and error statuses for switch or runtime trouble.
fn rejection(err: DataplaneError) -> Result<String, ApiError> {
    if err.is_rejection() {
        Ok(err.to_string())
    } else {
        Err(err.into())
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/labs/{lab}/ports", get(list_ports))
        .route("/labs/{lab}/nodes", get(node_status))
        .route("/labs/{lab}/nodes/{node}/start", post(start_node))
        .route("/labs/{lab}/nodes/{node}/stop", post(stop_node))
        .route(
            "/labs/{lab}/interfaces/{node}/{iface}/vlan",
            get(get_interface_vlan).put(set_interface_vlan),
        )
        .route(
            "/labs/{lab}/interfaces/{node}/{iface}/carrier",
            put(set_carrier),
        )
        .route("/labs/{lab}/links/connect", post(connect_link))
        .route("/labs/{lab}/links/disconnect", post(disconnect_link))
        .route("/overlay/status", get(overlay_status))
        .route("/overlay/attach", post(attach_overlay))
        .route("/overlay/detach", post(detach_overlay))
        .route("/discover", post(discover))
        .with_state(state)
}

async fn healthz(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        agent_id: state.cfg.agent_id.clone(),
        version: version::VERSION.to_string(),
        status: "ok".to_string(),
    })
}

async fn list_ports(
    State(state): State<SharedState>,
    Path(lab): Path<String>,
) -> ApiResult<Vec<PortInfo>> {
    Ok(Json(links::list_ports(&state, &lab).await?))
}

async fn node_status(
    State(state): State<SharedState>,
    Path(lab): Path<String>,
) -> ApiResult<NodeStatusResponse> {
    let nodes = state
        .runtime
        .node_states(&lab)
        .await
        .map_err(DataplaneError::from)?;
    Ok(Json(NodeStatusResponse { nodes }))
}

async fn start_node(
    State(state): State<SharedState>,
    Path((lab, node)): Path<(String, String)>,
) -> ApiResult<NodeActionResponse> {
    let result = state.runtime.start_node(&lab, &node).await;
    node_action(&state, "start", &lab, node, result).await
}

async fn stop_node(
    State(state): State<SharedState>,
    Path((lab, node)): Path<(String, String)>,
) -> ApiResult<NodeActionResponse> {
    let result = state.runtime.stop_node(&lab, &node).await;
    node_action(&state, "stop", &lab, node, result).await
}

async fn node_action(
    state: &SharedState,
    action: &'static str,
    lab: &str,
    node: String,
    result: Result<NodeRuntimeState, RuntimeError>,
) -> ApiResult<NodeActionResponse> {
    let expected = if action == "start" {
        NodeRuntimeState::Running
    } else {
        NodeRuntimeState::Stopped
    };
    match result {
        Ok(observed) => {
            let success = observed == expected
                || (action == "stop" && observed == NodeRuntimeState::Missing);
            telemetry::record_node_action(action, if success { "ok" } else { "mismatch" });
            Ok(Json(NodeActionResponse {
                error: (!success).then(|| format!("node is {} after {action}", observed.as_str())),
                node,
                success,
                state: observed,
            }))
        }
        Err(err) if err.is_connection_error() => {
            telemetry::record_node_action(action, "unavailable");
            Err(DataplaneError::from(err).into())
        }
        Err(err) => {
            telemetry::record_node_action(action, "error");
            warn!(lab, %node, action, error = %err, "node action failed");
            let observed = state
                .runtime
                .node_state(lab, &node)
                .await
                .unwrap_or(NodeRuntimeState::Missing);
            Ok(Json(NodeActionResponse {
                node,
                success: false,
                state: observed,
                error: Some(err.to_string()),
            }))
        }
    }
}

async fn get_interface_vlan(
    State(state): State<SharedState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
) -> ApiResult<InterfaceVlanResponse> {
    let vlan_tag = links::get_interface_vlan(&state, &lab, &node, &iface).await?;
    Ok(Json(InterfaceVlanResponse {
        node,
        interface: iface,
        vlan_tag,
    }))
}

async fn set_interface_vlan(
    State(state): State<SharedState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
    Json(request): Json<SetInterfaceVlanRequest>,
) -> ApiResult<InterfaceVlanResponse> {
    let tag = links::set_interface_vlan(&state, &lab, &node, &iface, request.vlan_tag).await?;
    Ok(Json(InterfaceVlanResponse {
        node,
        interface: iface,
        vlan_tag: Some(tag),
    }))
}

async fn set_carrier(
    State(state): State<SharedState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
    Json(request): Json<SetCarrierRequest>,
) -> ApiResult<serde_json::Value> {
    links::set_carrier(&state, &lab, &node, &iface, request.state).await?;
    Ok(Json(json!({
        "node": node,
        "interface": iface,
        "state": request.state,
    })))
}

async fn connect_link(
    State(state): State<SharedState>,
    Path(lab): Path<String>,
    Json(request): Json<ConnectLinkRequest>,
) -> ApiResult<ConnectLinkResponse> {
    let response = match links::connect(&state, &lab, &request).await {
        Ok(tag) => ConnectLinkResponse {
            success: true,
            vlan_tag: Some(tag),
            error: None,
        },
        Err(err) => ConnectLinkResponse {
            success: false,
            vlan_tag: None,
            error: Some(rejection(err)?),
        },
    };
    Ok(Json(response))
}

async fn disconnect_link(
    State(state): State<SharedState>,
    Path(lab): Path<String>,
    Json(request): Json<DisconnectLinkRequest>,
) -> ApiResult<DisconnectLinkResponse> {
    let response = match links::disconnect(&state, &lab, &request).await {
        Ok((source, target)) => DisconnectLinkResponse {
            success: true,
            source_vlan: Some(source),
            target_vlan: Some(target),
            error: None,
        },
        Err(err) => DisconnectLinkResponse {
            success: false,
            source_vlan: None,
            target_vlan: None,
            error: Some(rejection(err)?),
        },
    };
    Ok(Json(response))
}

async fn overlay_status(State(state): State<SharedState>) -> ApiResult<OverlayStatusResponse> {
    Ok(Json(overlay::status(&state).await?))
}

async fn attach_overlay(
    State(state): State<SharedState>,
    Json(request): Json<AttachOverlayRequest>,
) -> ApiResult<AttachOverlayResponse> {
    let response = match overlay::attach(&state, &request).await {
        Ok(local_vlan) => AttachOverlayResponse {
            success: true,
            local_vlan: Some(local_vlan),
            error: None,
        },
        Err(err) => AttachOverlayResponse {
            success: false,
            local_vlan: None,
            error: Some(rejection(err)?),
        },
    };
    Ok(Json(response))
}

async fn detach_overlay(
    State(state): State<SharedState>,
    Json(request): Json<DetachOverlayRequest>,
) -> ApiResult<DetachOverlayResponse> {
    let response = match overlay::detach(&state, &request).await {
        Ok(()) => DetachOverlayResponse {
            success: true,
            error: None,
        },
        Err(err) => DetachOverlayResponse {
            success: false,
            error: Some(rejection(err)?),
        },
    };
    Ok(Json(response))
}

async fn discover(State(state): State<SharedState>) -> ApiResult<DiscoveryResponse> {
    Ok(Json(discovery::discover_existing_state(&state).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{endpoint, test_state};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn call<T: DeserializeOwned>(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn healthz_reports_agent_id() {
        let (state, _ovs, _runtime) = test_state();
        let router = build_router(state);
        let (status, body): (_, HealthResponse) = call(&router, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.agent_id, "h1");
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn node_actions_report_observed_state() {
        let (state, _ovs, runtime) = test_state();
        runtime.set_state("lab", "r1", NodeRuntimeState::Stopped);
        let router = build_router(state);

        let (status, body): (_, NodeActionResponse) =
            call(&router, Method::POST, "/labs/lab/nodes/r1/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.state, NodeRuntimeState::Running);

        let (_, body): (_, NodeStatusResponse) =
            call(&router, Method::GET, "/labs/lab/nodes", None).await;
        assert_eq!(body.nodes.len(), 1);
        assert_eq!(body.nodes[0].state, NodeRuntimeState::Running);

        let (status, body): (_, NodeActionResponse) =
            call(&router, Method::POST, "/labs/lab/nodes/ghost/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.state, NodeRuntimeState::Missing);
        assert!(body.error.is_some());
    }

    #[tokio::test]
    async fn connect_over_http_returns_shared_tag() {
        let (state, ovs, _runtime) = test_state();
        ovs.add_container_port("veth-r1-1", "lab", "r1", "eth1", None);
        ovs.add_container_port("veth-r2-1", "lab", "r2", "eth1", None);
        let router = build_router(state);

        let request = ConnectLinkRequest {
            link_id: "r1:eth1-r2:eth1".into(),
            source: endpoint("r1", "eth1"),
            target: endpoint("r2", "eth1"),
        };
        let (status, body): (_, ConnectLinkResponse) = call(
            &router,
            Method::POST,
            "/labs/lab/links/connect",
            Some(serde_json::to_value(&request).expect("encode")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let tag = body.vlan_tag.expect("tag");

        let (_, vlan): (_, InterfaceVlanResponse) = call(
            &router,
            Method::GET,
            "/labs/lab/interfaces/r2/eth1/vlan",
            None,
        )
        .await;
        assert_eq!(vlan.vlan_tag, Some(tag));
    }

    #[tokio::test]
    async fn rejected_connect_is_unsuccessful_not_an_error_status() {
        let (state, _ovs, _runtime) = test_state();
        let router = build_router(state);
        let request = ConnectLinkRequest {
            link_id: "r1:eth1-r2:eth1".into(),
            source: endpoint("r1", "eth1"),
            target: endpoint("r2", "eth1"),
        };
        let (status, body): (_, ConnectLinkResponse) = call(
            &router,
            Method::POST,
            "/labs/lab/links/connect",
            Some(serde_json::to_value(&request).expect("encode")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert!(body.error.expect("error").contains("no bridge port"));
    }

    #[tokio::test]
    async fn switch_failure_maps_to_server_error_body() {
        let (state, ovs, _runtime) = test_state();
        ovs.set_failing(true);
        let router = build_router(state);

        let (status, body): (_, ErrorBody) =
            call(&router, Method::GET, "/overlay/status", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, "ovs_error");
        assert!(body.message.contains("database connection failed"));
    }

    #[tokio::test]
    async fn unknown_port_carrier_is_not_found() {
        let (state, _ovs, _runtime) = test_state();
        let router = build_router(state);
        let (status, body): (_, ErrorBody) = call(
            &router,
            Method::PUT,
            "/labs/lab/interfaces/r1/eth1/carrier",
            Some(json!({"state": "off"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "port_not_found");
    }

    #[tokio::test]
    async fn overlay_attach_and_discover_over_http() {
        let (state, ovs, runtime) = test_state();
        runtime.set_running("lab", "r1");
        ovs.add_container_port("veth-r1-2", "lab", "r1", "eth2", None);
        let router = build_router(state);

        let attach = json!({
            "lab_id": "lab",
            "link_id": "r1:eth2-r3:eth1",
            "node": "r1",
            "interface": "eth2",
            "vni": 40001,
            "local_ip": "10.0.0.1",
            "remote_ip": "10.0.0.2",
            "port_name": "vxl0123456789a"
        });
        let (status, body): (_, AttachOverlayResponse) =
            call(&router, Method::POST, "/overlay/attach", Some(attach)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);

        let (_, report): (_, DiscoveryResponse) =
            call(&router, Method::POST, "/discover", None).await;
        assert_eq!(report.ports, 1);
        assert_eq!(report.link_tunnels, 1);

        let (_, overlay): (_, OverlayStatusResponse) =
            call(&router, Method::GET, "/overlay/status", None).await;
        assert_eq!(
            overlay.tunnel_for("r1:eth2-r3:eth1").map(|t| t.local_vlan),
            body.local_vlan
        );
    }
}
