pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod links;
pub mod overlay;
pub mod ovs;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod vlan;

pub mod version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

#[cfg(test)]
pub(crate) mod test_support;

/// Run the agent with configuration from `config.toml` and the environment
/// until Ctrl+C or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let cfg = config::load()?;
    let agent = runner::start_agent(cfg, runner::AgentOptions::default()).await?;
    runner::wait_for_shutdown_signal().await;
    agent.shutdown().await
}
