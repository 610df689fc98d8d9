use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, http::StatusCode, routing::get};
use metrics::{counter, gauge};
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

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
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
    )
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "controller metrics listening");
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_build_info(schema_version: Option<i64>) {
    gauge!(
        "controller_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA
    )
    .set(1.0);
    gauge!("controller_schema_version").set(schema_version.unwrap_or_default() as f64);
}

pub fn record_enforcement_action(kind: &str, result: &str) {
    counter!(
        "controller_enforcement_actions_total",
        "kind" => kind.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_enforcement_skip(reason: &str) {
    counter!(
        "controller_enforcement_skips_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_link_verification(result: &str) {
    counter!(
        "controller_link_verifications_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_link_repair(kind: &str, result: &str) {
    counter!(
        "controller_link_repairs_total",
        "kind" => kind.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_orphan_tunnel(result: &str) {
    counter!(
        "controller_orphan_tunnels_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_reservation_reconcile(category: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "controller_reservation_reconcile_total",
        "category" => category.to_string()
    )
    .increment(count as u64);
}

pub fn record_hosts_online(count: usize) {
    gauge!("controller_hosts_online").set(count as f64);
}
