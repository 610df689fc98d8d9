#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use controller::{
    agent_client::HttpAgentClient,
    app_state::ControllerContext,
    config,
    coordination::SqlLeaseStore,
    persistence::{self as db, NewHost, NewNodeState, NodeDesiredState},
};
use httpmock::MockServer;

/// Context backed by a throwaway database and the real HTTP agent client.
pub async fn http_context(overrides: &str) -> ControllerContext {
    let cfg = config::load_from_toml(overrides).expect("config");
    let pool = db::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    db::migrations::run_migrations(&pool)
        .await
        .expect("migrations");
    let agents = HttpAgentClient::new(&cfg.agents).expect("agent client");
    let leases = SqlLeaseStore::new(pool.clone());
    ControllerContext::new(pool, Arc::new(agents), Arc::new(leases), cfg)
}

/// Registers a host whose agent is the mock server.
pub async fn register_host(ctx: &ControllerContext, id: &str, server: &MockServer, online: bool) {
    db::hosts::upsert_host(
        &ctx.db,
        &NewHost {
            id: id.into(),
            name: format!("host-{id}"),
            address: server.base_url(),
            data_ip: format!("192.0.2.{}", id.trim_start_matches('h')),
        },
    )
    .await
    .expect("host");
    if online {
        db::hosts::record_probe_success(&ctx.db, id, Utc::now())
            .await
            .expect("online");
    }
}

pub async fn declare_node(ctx: &ControllerContext, lab: &str, node: &str, host: &str) {
    db::nodes::upsert_node_state(
        &ctx.db,
        &NewNodeState {
            lab_id: lab.into(),
            node_name: node.into(),
            host_id: Some(host.into()),
            desired_state: NodeDesiredState::Running,
        },
    )
    .await
    .expect("node");
}
