//! Probes every registered host agent and maintains host status.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent_client::AgentTarget;
use crate::app_state::ControllerContext;
use crate::persistence::{HostRecord, HostStatus, hosts as host_store, links as link_store};
use crate::services::links as link_service;
use crate::telemetry;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostHealthReport {
    pub probed: usize,
    pub online: usize,
    pub went_online: Vec<String>,
    pub went_offline: Vec<String>,
    pub oper_changed: usize,
}

/// Registers the hosts listed in configuration. Existing rows keep their
/// status.
pub async fn seed_hosts(ctx: &ControllerContext) -> Result<usize> {
    for host in &ctx.cfg.hosts {
        host_store::upsert_host(&ctx.db, host).await?;
    }
    if !ctx.cfg.hosts.is_empty() {
        info!(count = ctx.cfg.hosts.len(), "configured hosts registered");
    }
    Ok(ctx.cfg.hosts.len())
}

/// One probe. An agent answering under a different id counts as a failure.
async fn probe(ctx: &ControllerContext, host: &HostRecord) -> std::result::Result<(), String> {
    let response = ctx
        .agents
        .health(&AgentTarget::from(host))
        .await
        .map_err(|err| err.to_string())?;
    if response.agent_id != host.id {
        return Err(format!(
            "address answered as agent {} instead of {}",
            response.agent_id, host.id
        ));
    }
    Ok(())
}

/// Probes every host, offline ones included so they can come back. A host
/// goes offline after `failure_threshold` consecutive failed probes and
/// online again on its first success. Oper state of all links is recomputed
/// when any host flips.
pub async fn run_health_sweep(ctx: &ControllerContext) -> Result<HostHealthReport> {
    let mut report = HostHealthReport::default();
    let threshold = ctx.cfg.host_health.failure_threshold;

    for host in host_store::list_hosts(&ctx.db).await? {
        report.probed += 1;
        match probe(ctx, &host).await {
            Ok(()) => {
                let previous = host_store::record_probe_success(&ctx.db, &host.id, Utc::now()).await?;
                if previous != Some(HostStatus::Online) {
                    info!(host_id = %host.id, "host online");
                    report.went_online.push(host.id.clone());
                }
                report.online += 1;
            }
            Err(message) => {
                let updated = host_store::record_probe_failure(&ctx.db, &host.id, threshold).await?;
                let now_online = updated.as_ref().is_some_and(HostRecord::is_online);
                if host.is_online() && !now_online {
                    warn!(host_id = %host.id, %message, "host offline");
                    report.went_offline.push(host.id.clone());
                } else {
                    debug!(
                        host_id = %host.id,
                        failures = updated.as_ref().map(|h| h.consecutive_failures),
                        %message,
                        "host probe failed"
                    );
                }
                if now_online {
                    report.online += 1;
                }
            }
        }
    }

    if !report.went_online.is_empty() || !report.went_offline.is_empty() {
        let hosts = ctx.hosts().await?;
        for link in link_store::list_all_link_states(&ctx.db).await? {
            if link_service::recompute_with_hosts(&ctx.db, &hosts, &link).await? {
                report.oper_changed += 1;
            }
        }
    }
    telemetry::record_hosts_online(report.online);
    Ok(report)
}

pub async fn host_health_loop(ctx: ControllerContext, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.cfg.host_health.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match run_health_sweep(&ctx).await {
            Ok(report) => debug!(?report, "host health sweep complete"),
            Err(err) => warn!(?err, "host health sweep failed"),
        }
    }
    info!("host health loop stopped");
}
