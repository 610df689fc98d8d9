pub mod agent_client;
pub mod app_state;
pub mod config;
pub mod coordination;
pub mod error;
pub mod persistence;
pub mod services;
pub mod state_machine;
pub mod tasks;
pub mod telemetry;

pub mod version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agent_client::HttpAgentClient;
use crate::app_state::ControllerContext;
use crate::coordination::SqlLeaseStore;
use crate::tasks::enforcement::{Enforcer, enforcement_loop};
use crate::tasks::host_health::{host_health_loop, seed_hosts};
use crate::tasks::link_reconciliation::link_reconciliation_loop;

pub use crate::telemetry::init_tracing;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Boot the controller with configuration from `config.toml` and the
/// environment.
pub async fn run() -> Result<()> {
    run_with_shutdown(config::load()?, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(app_config: config::AppConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = telemetry::init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    let migrations = persistence::migrations::run_migrations(&db_pool).await?;
    if migrations.applied.is_empty() {
        info!(current_version = migrations.latest, "database schema is up to date");
    } else {
        for version in &migrations.applied {
            info!(version, "applied database migration");
        }
    }
    telemetry::record_build_info(migrations.latest);

    let leases = SqlLeaseStore::new(db_pool.clone());
    match leases.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "expired leases removed"),
        Err(err) => warn!(?err, "lease purge failed"),
    }
    let agents = HttpAgentClient::new(&app_config.agents)?;
    let metrics_addr: SocketAddr = format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let ctx = ControllerContext::new(db_pool, Arc::new(agents), Arc::new(leases), app_config);
    seed_hosts(&ctx).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut enforcement_task = tokio::spawn(enforcement_loop(
        Enforcer::new(ctx.clone()),
        shutdown_rx.clone(),
    ));
    let mut reconciliation_task =
        tokio::spawn(link_reconciliation_loop(ctx.clone(), shutdown_rx.clone()));
    let mut health_task = tokio::spawn(host_health_loop(ctx.clone(), shutdown_rx.clone()));

    let mut metrics_shutdown = shutdown_rx.clone();
    let mut metrics_task = tokio::spawn(telemetry::serve_metrics_with_shutdown(
        metrics_handle,
        metrics_addr,
        async move {
            let _ = metrics_shutdown.changed().await;
        },
    ));
    info!(
        enforcement_interval_secs = ctx.cfg.enforcement.interval_secs,
        reconciliation_interval_secs = ctx.cfg.reconciliation.interval_secs,
        health_interval_secs = ctx.cfg.host_health.interval_secs,
        "controller loops started"
    );

    tokio::select! {
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("controller metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("controller metrics server failed: {err}"))?;
        }
        res = &mut enforcement_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("enforcement task failed: {err}"))?;
        }
        res = &mut reconciliation_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("link reconciliation task failed: {err}"))?;
        }
        res = &mut health_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("host health task failed: {err}"))?;
        }
    }

    // The task that won the select has been consumed; the rest observe the
    // shutdown flag and exit on their own.
    for (name, task) in [
        ("enforcement", enforcement_task),
        ("link reconciliation", reconciliation_task),
        ("host health", health_task),
    ] {
        if task.is_finished() {
            continue;
        }
        if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
            warn!(task = name, "background task did not stop in time");
        }
    }
    if !metrics_task.is_finished()
        && let Ok(Ok(Err(err))) = tokio::time::timeout(STOP_TIMEOUT, metrics_task).await
    {
        warn!(?err, "metrics server stopped with an error");
    }

    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
