//! Open vSwitch access.
//!
//! `OvsBackend` is the seam the dataplane logic talks to; `OvsVsctl` drives
//! the real switch through `ovs-vsctl` (and `ip` for carrier changes).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::AppConfig;
use crate::telemetry;

pub type DynOvsBackend = Arc<dyn OvsBackend>;

pub const EXT_LAB: &str = "netlab-lab";
pub const EXT_NODE: &str = "netlab-node";
pub const EXT_IFACE: &str = "netlab-iface";
pub const EXT_LINK: &str = "netlab-link-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Host side of a container veth.
    Container,
    Vxlan,
    Other,
}

/// One port on the lab bridge as OVS reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePort {
    pub name: String,
    pub tag: Option<u16>,
    pub kind: PortKind,
    pub external_ids: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

impl BridgePort {
    /// `(lab, node, interface)` for container ports.
    pub fn endpoint(&self) -> Option<(&str, &str, &str)> {
        if self.kind != PortKind::Container {
            return None;
        }
        Some((
            self.external_ids.get(EXT_LAB)?.as_str(),
            self.external_ids.get(EXT_NODE)?.as_str(),
            self.external_ids.get(EXT_IFACE)?.as_str(),
        ))
    }

    pub fn lab(&self) -> Option<&str> {
        self.external_ids.get(EXT_LAB).map(String::as_str)
    }

    pub fn link_id(&self) -> Option<&str> {
        self.external_ids.get(EXT_LINK).map(String::as_str)
    }

    pub fn vni(&self) -> Option<u32> {
        self.options.get("key")?.parse().ok()
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.options.get("remote_ip").map(String::as_str)
    }
}

/// Desired shape of a per-link VXLAN port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanPortSpec {
    pub port_name: String,
    pub lab_id: String,
    pub link_id: String,
    pub vni: u32,
    pub local_ip: String,
    pub remote_ip: String,
    pub tag: u16,
}

#[derive(Debug, Error)]
pub enum OvsError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("port {0} does not exist")]
    NoSuchPort(String),
    #[error("unexpected ovs output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait OvsBackend: Send + Sync {
    /// Every port on the lab bridge.
    async fn list_ports(&self) -> Result<Vec<BridgePort>, OvsError>;
    async fn port_tag(&self, port: &str) -> Result<Option<u16>, OvsError>;
    async fn set_port_tag(&self, port: &str, tag: u16) -> Result<(), OvsError>;
    /// Creates the port or corrects an existing one in place.
    async fn ensure_vxlan_port(&self, spec: &VxlanPortSpec) -> Result<(), OvsError>;
    /// Removes the port; absent ports are not an error.
    async fn delete_port(&self, port: &str) -> Result<(), OvsError>;
    async fn set_admin_state(&self, port: &str, up: bool) -> Result<(), OvsError>;
}

#[derive(Debug, Clone)]
pub struct OvsVsctl {
    vsctl: String,
    ip: String,
    bridge: String,
    timeout: Duration,
}

impl OvsVsctl {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            vsctl: cfg.ovs_vsctl_path.clone(),
            ip: cfg.ip_path.clone(),
            bridge: cfg.bridge_name.clone(),
            timeout: cfg.command_timeout(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, OvsError> {
        let command = format!("{} {}", program, args.join(" "));
        let started = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                telemetry::record_ovs_command("spawn_error", started.elapsed());
                return Err(OvsError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Err(_) => {
                telemetry::record_ovs_command("timeout", started.elapsed());
                return Err(OvsError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            telemetry::record_ovs_command("error", started.elapsed());
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(%command, %stderr, "ovs command failed");
            return Err(OvsError::Failed { command, stderr });
        }
        telemetry::record_ovs_command("ok", started.elapsed());
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn vsctl(&self, args: &[String]) -> Result<String, OvsError> {
        self.run(&self.vsctl, args).await
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn no_such_port(err: OvsError, port: &str) -> OvsError {
    match err {
        OvsError::Failed { ref stderr, .. } if stderr.contains("no row") => {
            OvsError::NoSuchPort(port.to_string())
        }
        other => other,
    }
}

#[async_trait]
impl OvsBackend for OvsVsctl {
    async fn list_ports(&self) -> Result<Vec<BridgePort>, OvsError> {
        let names = self.vsctl(&args(&["list-ports", &self.bridge])).await?;
        let names: Vec<&str> = names.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let ports = self
            .vsctl(&args(&[
                "--format=json",
                "--columns=name,tag,external_ids",
                "list",
                "Port",
            ]))
            .await?;
        let interfaces = self
            .vsctl(&args(&[
                "--format=json",
                "--columns=name,type,options",
                "list",
                "Interface",
            ]))
            .await?;
        parse_bridge_ports(&names, &ports, &interfaces)
    }

    async fn port_tag(&self, port: &str) -> Result<Option<u16>, OvsError> {
        let raw = self
            .vsctl(&args(&["get", "Port", port, "tag"]))
            .await
            .map_err(|err| no_such_port(err, port))?;
        parse_tag(&raw)
    }

    async fn set_port_tag(&self, port: &str, tag: u16) -> Result<(), OvsError> {
        self.vsctl(&args(&["set", "Port", port, &format!("tag={tag}")]))
            .await
            .map_err(|err| no_such_port(err, port))?;
        Ok(())
    }

    async fn ensure_vxlan_port(&self, spec: &VxlanPortSpec) -> Result<(), OvsError> {
        self.vsctl(&vxlan_port_args(&self.bridge, spec)).await?;
        Ok(())
    }

    async fn delete_port(&self, port: &str) -> Result<(), OvsError> {
        self.vsctl(&args(&["--if-exists", "del-port", &self.bridge, port]))
            .await?;
        Ok(())
    }

    async fn set_admin_state(&self, port: &str, up: bool) -> Result<(), OvsError> {
        let state = if up { "up" } else { "down" };
        self.run(&self.ip, &args(&["link", "set", "dev", port, state]))
            .await
            .map_err(|err| match err {
                OvsError::Failed { ref stderr, .. } if stderr.contains("does not exist") => {
                    OvsError::NoSuchPort(port.to_string())
                }
                other => other,
            })?;
        Ok(())
    }
}

fn vxlan_port_args(bridge: &str, spec: &VxlanPortSpec) -> Vec<String> {
    let port = spec.port_name.as_str();
    vec![
        "--may-exist".into(),
        "add-port".into(),
        bridge.into(),
        port.into(),
        "--".into(),
        "set".into(),
        "Port".into(),
        port.into(),
        format!("tag={}", spec.tag),
        format!("external_ids:{EXT_LAB}={}", spec.lab_id),
        format!("external_ids:{EXT_LINK}={}", spec.link_id),
        "--".into(),
        "set".into(),
        "Interface".into(),
        port.into(),
        "type=vxlan".into(),
        format!("options:key={}", spec.vni),
        format!("options:local_ip={}", spec.local_ip),
        format!("options:remote_ip={}", spec.remote_ip),
    ]
}

/// `ovs-vsctl get Port <p> tag` prints `[]` for untagged ports.
fn parse_tag(raw: &str) -> Result<Option<u16>, OvsError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "[]" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| OvsError::Parse(format!("port tag `{raw}`")))
}

/// Rows of an `ovs-vsctl --format=json list` table keyed by column heading.
fn parse_table(raw: &str) -> Result<Vec<BTreeMap<String, Value>>, OvsError> {
    let doc: Value = serde_json::from_str(raw).map_err(|err| OvsError::Parse(err.to_string()))?;
    let headings: Vec<String> = doc
        .get("headings")
        .and_then(Value::as_array)
        .ok_or_else(|| OvsError::Parse("missing headings".into()))?
        .iter()
        .filter_map(|h| h.as_str().map(str::to_string))
        .collect();
    let rows = doc
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| OvsError::Parse("missing data".into()))?;
    Ok(rows
        .iter()
        .filter_map(Value::as_array)
        .map(|row| headings.iter().cloned().zip(row.iter().cloned()).collect())
        .collect())
}

/// OVSDB encodes empty optional columns as `["set", []]`.
fn ovsdb_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn ovsdb_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let pairs = value
        .and_then(Value::as_array)
        .filter(|v| v.first().and_then(Value::as_str) == Some("map"))
        .and_then(|v| v.get(1))
        .and_then(Value::as_array);
    pairs
        .into_iter()
        .flatten()
        .filter_map(|pair| {
            let pair = pair.as_array()?;
            Some((
                pair.first()?.as_str()?.to_string(),
                pair.get(1)?.as_str()?.to_string(),
            ))
        })
        .collect()
}

fn parse_bridge_ports(
    names: &[&str],
    ports_raw: &str,
    interfaces_raw: &str,
) -> Result<Vec<BridgePort>, OvsError> {
    let interfaces: BTreeMap<String, BTreeMap<String, Value>> = parse_table(interfaces_raw)?
        .into_iter()
        .filter_map(|row| Some((row.get("name")?.as_str()?.to_string(), row)))
        .collect();

    let mut out = Vec::new();
    for row in parse_table(ports_raw)? {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            continue;
        };
        if !names.contains(&name) {
            continue;
        }
        let external_ids = ovsdb_map(row.get("external_ids"));
        let iface = interfaces.get(name);
        let iface_type = iface
            .and_then(|i| i.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = if iface_type == "vxlan" {
            PortKind::Vxlan
        } else if external_ids.contains_key(EXT_NODE) {
            PortKind::Container
        } else {
            PortKind::Other
        };
        out.push(BridgePort {
            name: name.to_string(),
            tag: ovsdb_int(row.get("tag")).and_then(|t| u16::try_from(t).ok()),
            kind,
            external_ids,
            options: ovsdb_map(iface.and_then(|i| i.get("options"))),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORTS: &str = r#"{"data":[
        ["veth-r1-eth1",100,["map",[["netlab-iface","eth1"],["netlab-lab","lab"],["netlab-node","r1"]]]],
        ["vxl0123456789a",205,["map",[["netlab-lab","lab"],["netlab-link-id","r1:eth2-r3:eth1"]]]],
        ["uplink",["set",[]],["map",[]]],
        ["other-bridge-port",7,["map",[]]]
    ],"headings":["name","tag","external_ids"]}"#;

    const INTERFACES: &str = r#"{"data":[
        ["veth-r1-eth1","",["map",[]]],
        ["vxl0123456789a","vxlan",["map",[["key","40001"],["local_ip","10.0.0.1"],["remote_ip","10.0.0.2"]]]],
        ["uplink","system",["map",[]]]
    ],"headings":["name","type","options"]}"#;

    #[test]
    fn parses_bridge_ports_from_json_tables() {
        let ports = parse_bridge_ports(
            &["veth-r1-eth1", "vxl0123456789a", "uplink"],
            PORTS,
            INTERFACES,
        )
        .expect("parse");
        assert_eq!(ports.len(), 3);

        let uplink = &ports[0];
        assert_eq!(uplink.name, "uplink");
        assert_eq!(uplink.kind, PortKind::Other);
        assert_eq!(uplink.tag, None);

        let veth = &ports[1];
        assert_eq!(veth.endpoint(), Some(("lab", "r1", "eth1")));
        assert_eq!(veth.tag, Some(100));

        let vxlan = &ports[2];
        assert_eq!(vxlan.kind, PortKind::Vxlan);
        assert_eq!(vxlan.link_id(), Some("r1:eth2-r3:eth1"));
        assert_eq!(vxlan.vni(), Some(40001));
        assert_eq!(vxlan.remote_ip(), Some("10.0.0.2"));
        assert!(vxlan.endpoint().is_none());
    }

    #[test]
    fn parses_port_tag_output() {
        assert_eq!(parse_tag("[]\n").expect("tag"), None);
        assert_eq!(parse_tag("312\n").expect("tag"), Some(312));
        assert!(parse_tag("bogus").is_err());
    }

    #[test]
    fn vxlan_port_command_sets_tag_ids_and_options() {
        let spec = VxlanPortSpec {
            port_name: "vxl0123456789a".into(),
            lab_id: "lab".into(),
            link_id: "r1:eth2-r3:eth1".into(),
            vni: 40001,
            local_ip: "10.0.0.1".into(),
            remote_ip: "10.0.0.2".into(),
            tag: 205,
        };
        let cmd = vxlan_port_args("netlab0", &spec).join(" ");
        assert!(cmd.starts_with("--may-exist add-port netlab0 vxl0123456789a"));
        assert!(cmd.contains("tag=205"));
        assert!(cmd.contains("external_ids:netlab-link-id=r1:eth2-r3:eth1"));
        assert!(cmd.contains("options:key=40001"));
        assert!(cmd.contains("options:remote_ip=10.0.0.2"));
    }

    #[test]
    fn missing_row_maps_to_no_such_port() {
        let err = OvsError::Failed {
            command: "ovs-vsctl get Port x tag".into(),
            stderr: "ovs-vsctl: no row \"x\" in table Port".into(),
        };
        assert!(matches!(no_such_port(err, "x"), OvsError::NoSuchPort(p) if p == "x"));
    }
}
