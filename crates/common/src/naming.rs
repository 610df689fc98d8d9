//! Deterministic naming rules.
//!
//! Both the controller and every agent compute these names independently, so
//! any change here is a wire-format change.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of per-link VXLAN port names on the OVS bridge.
pub const OVERLAY_PORT_PREFIX: &str = "vxl";

/// Linux limits interface names to 15 bytes (IFNAMSIZ - 1).
const MAX_IFACE_NAME_LEN: usize = 15;

/// Vendor spellings that map onto the kernel `ethN` naming.
const ETHERNET_PREFIXES: [&str; 4] = ["ethernet", "eth", "et", "e"];

/// Normalizes an interface name so vendor spellings compare equal.
///
/// `Ethernet1`, `Eth1`, `et1` and `eth1` all normalize to `eth1`;
/// `Ethernet1/2` becomes `eth1_2`. Names that do not follow an
/// `<ethernet-prefix><number>` shape are only trimmed and lowercased.
pub fn normalize_interface(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    for prefix in ETHERNET_PREFIXES {
        if let Some(rest) = lowered.strip_prefix(prefix)
            && is_port_number(rest)
        {
            return format!("eth{}", rest.replace('/', "_"));
        }
    }
    lowered
}

fn is_port_number(rest: &str) -> bool {
    !rest.is_empty()
        && rest
            .split('/')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// One side of a link: a node and one of its interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Node name within the lab.
    pub node: String,
    /// Normalized interface name.
    pub interface: String,
}

impl Endpoint {
    /// Builds an endpoint with a trimmed node name and a normalized interface.
    pub fn new(node: &str, interface: &str) -> Self {
        Self {
            node: node.trim().to_string(),
            interface: normalize_interface(interface),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// Orders two endpoints lexicographically so endpoint order never matters.
pub fn canonical_endpoints(a: Endpoint, b: Endpoint) -> (Endpoint, Endpoint) {
    if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    }
}

/// Canonical link name, e.g. `r1:eth1-r2:eth1`.
pub fn generate_link_name(
    source_node: &str,
    source_interface: &str,
    target_node: &str,
    target_interface: &str,
) -> String {
    let (first, second) = canonical_endpoints(
        Endpoint::new(source_node, source_interface),
        Endpoint::new(target_node, target_interface),
    );
    format!("{first}-{second}")
}

/// Lab-scoped key identifying one endpoint, used by reservations and the
/// agent VLAN allocator.
pub fn endpoint_key(lab_id: &str, node: &str, interface: &str) -> String {
    format!(
        "{}/{}/{}",
        lab_id,
        node.trim(),
        normalize_interface(interface)
    )
}

/// Deterministic OVS port name for the VXLAN tunnel of a link.
///
/// The same `(lab, link)` always yields the same name, so a recreated link
/// reuses it and agents need no coordination to find it.
pub fn overlay_port_name(lab_id: &str, link_name: &str) -> String {
    let digest = link_digest(lab_id, link_name);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let budget = MAX_IFACE_NAME_LEN - 1 - OVERLAY_PORT_PREFIX.len();
    format!("{}{}", OVERLAY_PORT_PREFIX, &hex[..budget])
}

/// First VNI candidate for a link inside `[base, max]`.
///
/// Callers probe upward (wrapping inside the range) when the candidate is
/// already taken by another link.
pub fn vni_candidate(lab_id: &str, link_name: &str, base: u32, max: u32) -> u32 {
    let (low, high) = if base <= max { (base, max) } else { (max, base) };
    let span = u64::from(high - low) + 1;
    let digest = link_digest(lab_id, link_name);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let offset = u64::from_be_bytes(prefix) % span;
    low + offset as u32
}

fn link_digest(lab_id: &str, link_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(lab_id.as_bytes());
    hasher.update(b":");
    hasher.update(link_name.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_spellings_normalize_to_eth() {
        assert_eq!(normalize_interface("Ethernet1"), "eth1");
        assert_eq!(normalize_interface(" eth1 "), "eth1");
        assert_eq!(normalize_interface("Et12"), "eth12");
        assert_eq!(normalize_interface("Ethernet1/2"), "eth1_2");
        assert_eq!(normalize_interface("e1-1"), "e1-1");
        assert_eq!(normalize_interface("mgmt0"), "mgmt0");
        assert_eq!(normalize_interface("eth"), "eth");
    }

    #[test]
    fn link_name_ignores_endpoint_order_and_spelling() {
        let forward = generate_link_name("r1", "Ethernet1", "r2", "eth1");
        let reverse = generate_link_name("r2", "eth1", "r1", "eth1");
        assert_eq!(forward, "r1:eth1-r2:eth1");
        assert_eq!(forward, reverse);
    }

    #[test]
    fn endpoint_key_normalizes_interface() {
        assert_eq!(
            endpoint_key("lab-a", "r1", "Ethernet1"),
            endpoint_key("lab-a", "r1", "eth1")
        );
        assert_ne!(
            endpoint_key("lab-a", "r1", "eth1"),
            endpoint_key("lab-b", "r1", "eth1")
        );
    }

    #[test]
    fn overlay_port_name_is_stable_and_fits_ifnamsiz() {
        let first = overlay_port_name("lab-a", "r1:eth1-r2:eth1");
        let second = overlay_port_name("lab-a", "r1:eth1-r2:eth1");
        let other_lab = overlay_port_name("lab-b", "r1:eth1-r2:eth1");

        assert_eq!(first, second);
        assert_ne!(first, other_lab);
        assert!(first.starts_with(OVERLAY_PORT_PREFIX));
        assert!(first.len() <= MAX_IFACE_NAME_LEN);
    }

    #[test]
    fn vni_candidate_stays_in_range() {
        for link in ["a:eth1-b:eth1", "a:eth2-b:eth2", "c:eth9-d:eth3"] {
            let vni = vni_candidate("lab", link, 5000, 5009);
            assert!((5000..=5009).contains(&vni));
            assert_eq!(vni, vni_candidate("lab", link, 5000, 5009));
        }
        assert_eq!(vni_candidate("lab", "x", 7, 7), 7);
    }
}
