use std::time::Duration;

use config::ConfigBuilder;
use config::builder::DefaultState;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "NETLAB_AGENT";

/// 802.1Q usable tag space.
const VLAN_MIN: u16 = 1;
const VLAN_MAX: u16 = 4094;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Identity reported on `/healthz`; the controller checks it against its
    /// host record.
    pub agent_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// OVS bridge carrying every lab port on this host.
    pub bridge_name: String,
    pub ovs_vsctl_path: String,
    pub ip_path: String,
    /// Upper bound for one OVS or `ip` invocation.
    pub command_timeout_secs: u64,
    pub vlan: VlanConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VlanConfig {
    pub range_start: u16,
    pub range_end: u16,
    /// JSON file holding the allocation map across restarts.
    pub state_path: String,
}

impl AppConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

impl VlanConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.range_start < VLAN_MIN || self.range_end > VLAN_MAX {
            anyhow::bail!("vlan range must lie within {VLAN_MIN}..={VLAN_MAX}");
        }
        if self.range_start > self.range_end {
            anyhow::bail!("vlan.range_start must be <= vlan.range_end");
        }
        Ok(())
    }
}

fn with_defaults(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<ConfigBuilder<DefaultState>> {
    Ok(builder
        .set_default("listen_host", "0.0.0.0")?
        .set_default("listen_port", 8001)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9465)?
        .set_default("bridge_name", "netlab0")?
        .set_default("ovs_vsctl_path", "ovs-vsctl")?
        .set_default("ip_path", "ip")?
        .set_default("command_timeout_secs", 20)?
        .set_default("vlan.range_start", 100)?
        .set_default("vlan.range_end", 4000)?
        .set_default("vlan.state_path", "/var/lib/netlab/vlan_allocations.json")?)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<AppConfig> {
    let mut app: AppConfig = builder.build()?.try_deserialize()?;
    app.agent_id = app.agent_id.trim().to_string();
    if app.agent_id.is_empty() {
        anyhow::bail!("agent_id cannot be empty");
    }
    if app.bridge_name.trim().is_empty() {
        anyhow::bail!("bridge_name cannot be empty");
    }
    app.vlan.validate()?;
    Ok(app)
}

/// Loads `config.{toml,yaml,json}` (optional) overlaid with
/// `NETLAB_AGENT__KEY` / `NETLAB_AGENT__VLAN__KEY` environment variables.
pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true);
    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env);
    finish(with_defaults(builder)?)
}

pub fn load_from_toml(contents: &str) -> anyhow::Result<AppConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::from_str(contents, config::FileFormat::Toml));
    finish(with_defaults(builder)?)
}
