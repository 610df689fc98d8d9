use std::time::Duration;

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::persistence::NewHost;

pub const ENV_PREFIX: &str = "NETLAB_CTL";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub agents: AgentsConfig,
    /// Hosts registered at startup; agents are addressed by `address`.
    #[serde(default)]
    pub hosts: Vec<NewHost>,
    pub enforcement: EnforcementConfig,
    pub reconciliation: ReconciliationConfig,
    pub lock: LockConfig,
    pub overlay: OverlayConfig,
    pub host_health: HostHealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    pub rpc_timeout_secs: u64,
    /// Overlay attach/detach and status calls can take longer on busy hosts.
    pub overlay_timeout_secs: u64,
    pub health_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcementConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub crash_cooldown_secs: u64,
    pub cooldown_ttl_secs: u64,
    /// Queued/running jobs older than this no longer block enforcement.
    pub job_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    pub orphan_stale_secs: u64,
    pub max_concurrent_links: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    pub vni_base: u32,
    pub vni_max: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostHealthConfig {
    pub interval_secs: u64,
    pub failure_threshold: u32,
}

impl AgentsConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }

    pub fn overlay_timeout(&self) -> Duration {
        Duration::from_secs(self.overlay_timeout_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.max(1))
    }
}

impl EnforcementConfig {
    /// `min(base * 2^attempts, cap)`.
    pub fn backoff_for(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts.clamp(0, 32)).unwrap_or(32);
        let secs = self
            .backoff_base_secs
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries == 0 {
            anyhow::bail!("enforcement.max_retries must be > 0");
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            anyhow::bail!("enforcement.backoff_base_secs must be <= enforcement.backoff_max_secs");
        }
        Ok(())
    }
}

impl OverlayConfig {
    fn validate(&self) -> anyhow::Result<()> {
        // 24-bit VNI space.
        if self.vni_base == 0 || self.vni_max > 0x00FF_FFFF {
            anyhow::bail!("overlay VNI range must lie within 1..=16777215");
        }
        if self.vni_base > self.vni_max {
            anyhow::bail!("overlay.vni_base must be <= overlay.vni_max");
        }
        Ok(())
    }
}

fn with_defaults(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<ConfigBuilder<DefaultState>> {
    Ok(builder
        .set_default("database.url", "sqlite://data/controller.db")?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9464)?
        .set_default("agents.rpc_timeout_secs", 30)?
        .set_default("agents.overlay_timeout_secs", 60)?
        .set_default("agents.health_timeout_secs", 5)?
        .set_default("enforcement.interval_secs", 30)?
        .set_default("enforcement.max_retries", 5)?
        .set_default("enforcement.backoff_base_secs", 5)?
        .set_default("enforcement.backoff_max_secs", 300)?
        .set_default("enforcement.crash_cooldown_secs", 60)?
        .set_default("enforcement.cooldown_ttl_secs", 10)?
        .set_default("enforcement.job_timeout_secs", 600)?
        .set_default("reconciliation.interval_secs", 60)?
        .set_default("reconciliation.orphan_stale_secs", 300)?
        .set_default("reconciliation.max_concurrent_links", 8)?
        .set_default("lock.ttl_secs", 60)?
        .set_default("overlay.vni_base", 1000)?
        .set_default("overlay.vni_max", 16_000_000)?
        .set_default("host_health.interval_secs", 10)?
        .set_default("host_health.failure_threshold", 3)?)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<AppConfig> {
    let mut app: AppConfig = builder.build()?.try_deserialize()?;
    for host in &mut app.hosts {
        host.id = host.id.trim().to_string();
        host.address = host.address.trim().trim_end_matches('/').to_string();
        if host.id.is_empty() || host.address.is_empty() {
            anyhow::bail!("hosts entries need a non-empty id and address");
        }
    }
    if app.reconciliation.max_concurrent_links == 0 {
        anyhow::bail!("reconciliation.max_concurrent_links must be > 0");
    }
    app.enforcement.validate()?;
    app.overlay.validate()?;
    Ok(app)
}

/// Loads `config.{toml,yaml,json}` (optional) overlaid with
/// `NETLAB_CTL__SECTION__KEY` environment variables.
pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);
    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env);
    finish(with_defaults(builder)?)
}

/// Loads configuration from an inline TOML document on top of the defaults.
pub fn load_from_toml(contents: &str) -> anyhow::Result<AppConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::from_str(contents, config::FileFormat::Toml));
    finish(with_defaults(builder)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = load_from_toml("").expect("defaults load");
        assert_eq!(cfg.agents.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.agents.overlay_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.enforcement.max_retries, 5);
        assert_eq!(cfg.reconciliation.max_concurrent_links, 8);
        assert!(cfg.hosts.is_empty());
    }

    #[test]
    fn hosts_are_trimmed() {
        let cfg = load_from_toml(
            r#"
            [[hosts]]
            id = " h1 "
            name = "host-1"
            address = "http://10.0.0.1:8081/"
            data_ip = "10.0.0.1"
            "#,
        )
        .expect("hosts load");
        assert_eq!(cfg.hosts[0].id, "h1");
        assert_eq!(cfg.hosts[0].address, "http://10.0.0.1:8081");
    }

    #[test]
    fn inverted_vni_range_is_rejected() {
        let err = load_from_toml("[overlay]\nvni_base = 5000\nvni_max = 10\n")
            .expect_err("inverted range");
        assert!(err.to_string().contains("vni_base"));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let cfg = load_from_toml("").expect("defaults").enforcement;
        assert_eq!(cfg.backoff_for(0), Duration::from_secs(5));
        assert_eq!(cfg.backoff_for(1), Duration::from_secs(10));
        assert_eq!(cfg.backoff_for(3), Duration::from_secs(40));
        assert_eq!(cfg.backoff_for(10), Duration::from_secs(300));
        assert_eq!(cfg.backoff_for(1_000), Duration::from_secs(300));
    }
}
