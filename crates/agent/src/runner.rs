use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    config, discovery, http,
    ovs::{DynOvsBackend, OvsVsctl},
    runtime::{DockerRuntime, DynNodeRuntime},
    state::{AgentState, SharedState},
    telemetry, version,
    vlan::VlanAllocator,
};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
    /// Rebuild port, tunnel and VLAN state from the bridge before serving.
    pub discover_on_start: bool,
    /// Switch backend; `ovs-vsctl` when unset.
    pub ovs: Option<DynOvsBackend>,
    /// Node runtime; the local Docker daemon when unset.
    pub runtime: Option<DynNodeRuntime>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
            discover_on_start: true,
            ovs: None,
            runtime: None,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown when embedded.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    api_addr: SocketAddr,
    state: SharedState,
}

impl AgentHandle {
    /// Address the agent API is bound to.
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await
                && join_err.is_panic()
            {
                error!(?join_err, "agent task panicked during shutdown");
                anyhow::bail!("agent task panicked");
            }
        }
        info!("host agent stopped");
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

fn shutdown_future(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if *shutdown.borrow() {
            return;
        }
        let _ = shutdown.changed().await;
    }
}

/// Start the host agent: load the VLAN pool, optionally rebuild state from
/// the bridge, then serve the API (and metrics) until shutdown is requested.
pub async fn start_agent(
    cfg: config::AppConfig,
    mut options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }

    let api_addr: SocketAddr = format!("{}:{}", cfg.listen_host, cfg.listen_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    let vlans = VlanAllocator::load(
        &cfg.vlan.state_path,
        cfg.vlan.range_start,
        cfg.vlan.range_end,
    )?;
    let ovs: DynOvsBackend = match options.ovs.take() {
        Some(ovs) => ovs,
        None => Arc::new(OvsVsctl::new(&cfg)),
    };
    let runtime: DynNodeRuntime = match options.runtime.take() {
        Some(runtime) => runtime,
        None => Arc::new(DockerRuntime::connect()?),
    };

    info!(
        agent_id = %cfg.agent_id,
        bridge = %cfg.bridge_name,
        vlan_start = cfg.vlan.range_start,
        vlan_end = cfg.vlan.range_end,
        persisted_vlans = vlans.len(),
        version = version::VERSION,
        git_sha = version::GIT_SHA,
        built_at = version::BUILD_TIMESTAMP,
        "host agent starting"
    );
    let state = AgentState::new(cfg, ovs, runtime, vlans);

    if options.discover_on_start
        && let Err(err) = discovery::discover_existing_state(&state).await
    {
        warn!(error = %err, "startup discovery failed; serving with persisted state");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics {
        let metrics_handle = telemetry::init_metrics_recorder();
        let shutdown = shutdown_future(shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown).await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let listener = TcpListener::bind(api_addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(api_addr);
    info!(%bound_addr, "agent api listening");
    let router = http::build_router(state.clone());
    let shutdown = shutdown_future(shutdown_rx.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(?err, "agent api server exited with error");
        }
    }));

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
        api_addr: bound_addr,
        state,
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
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
}
