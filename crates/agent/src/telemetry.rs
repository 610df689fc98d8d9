use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{Router, http::StatusCode, routing::get};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .add_global_label("app_version", crate::version::VERSION)
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "agent metrics listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_vlan_allocations(count: usize) {
    gauge!("agent_vlan_allocations").set(count as f64);
}

pub fn record_overlay_operation(op: &str, result: &str) {
    counter!(
        "agent_overlay_operations_total",
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_link_operation(op: &str, result: &str) {
    counter!(
        "agent_link_operations_total",
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_node_action(action: &str, result: &str) {
    counter!(
        "agent_node_actions_total",
        "action" => action.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_ovs_command(result: &str, duration: Duration) {
    histogram!(
        "agent_ovs_command_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_discovery(ports: usize, tunnels: usize) {
    gauge!("agent_discovered_ports").set(ports as f64);
    gauge!("agent_discovered_tunnels").set(tunnels as f64);
}
