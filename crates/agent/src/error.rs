use thiserror::Error;

use crate::ovs::OvsError;
use crate::runtime::RuntimeError;
use crate::vlan::VlanError;

/// Failure of a dataplane operation.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("no bridge port for {lab_id}/{node}/{interface}")]
    PortNotFound {
        lab_id: String,
        node: String,
        interface: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Vlan(#[from] VlanError),
    #[error(transparent)]
    Ovs(#[from] OvsError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl DataplaneError {
    /// Stable code carried in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DataplaneError::PortNotFound { .. } => "port_not_found",
            DataplaneError::InvalidRequest(_) => "invalid_request",
            DataplaneError::Vlan(VlanError::Exhausted { .. }) => "vlan_exhausted",
            DataplaneError::Vlan(VlanError::TagInUse { .. }) => "vlan_in_use",
            DataplaneError::Vlan(VlanError::OutOfRange { .. }) => "vlan_out_of_range",
            DataplaneError::Vlan(_) => "vlan_state",
            DataplaneError::Ovs(OvsError::NoSuchPort(_)) => "port_not_found",
            DataplaneError::Ovs(_) => "ovs_error",
            DataplaneError::Runtime(RuntimeError::NotFound { .. }) => "node_not_found",
            DataplaneError::Runtime(RuntimeError::Connection { .. }) => "runtime_unavailable",
            DataplaneError::Runtime(_) => "runtime_error",
        }
    }

    /// Faults in the request or the lab itself rather than in the switch or
    /// runtime; retrying the same call will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DataplaneError::PortNotFound { .. }
                | DataplaneError::InvalidRequest(_)
                | DataplaneError::Vlan(
                    VlanError::Exhausted { .. }
                        | VlanError::TagInUse { .. }
                        | VlanError::OutOfRange { .. }
                )
                | DataplaneError::Ovs(OvsError::NoSuchPort(_))
                | DataplaneError::Runtime(RuntimeError::NotFound { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_distinguish_missing_ports_from_switch_failures() {
        let missing = DataplaneError::Ovs(OvsError::NoSuchPort("veth1".into()));
        assert_eq!(missing.code(), "port_not_found");
        let failed = DataplaneError::Ovs(OvsError::Parse("garbage".into()));
        assert_eq!(failed.code(), "ovs_error");
        let exhausted = DataplaneError::Vlan(VlanError::Exhausted { start: 1, end: 2 });
        assert_eq!(exhausted.code(), "vlan_exhausted");
        assert!(exhausted.is_rejection());
        assert!(missing.is_rejection());
        assert!(!failed.is_rejection());
    }
}
