use sqlx::SqlitePool;

pub mod hosts;
pub mod jobs;
pub mod leases;
pub mod links;
pub mod migrations;
pub mod nodes;
pub mod reservations;
pub mod tunnels;

pub type Db = SqlitePool;

pub use hosts::{HostRecord, HostStatus, NewHost};
pub use jobs::{JobRecord, JobStatus};
pub use links::{
    CarrierState, LinkActualState, LinkDesiredState, LinkSide, LinkStateRecord, NewLinkState,
    OperState, OperUpdate, SideView,
};
pub use migrations::MigrationReport;
pub use nodes::{NewNodeState, NodeActualState, NodeDesiredState, NodeStateRecord};
pub use reservations::ReservationRecord;
pub use tunnels::{NewVxlanTunnel, TunnelStatus, VxlanTunnelRecord};

/// Converts a stored VLAN column into a tag, dropping out-of-range values.
pub(crate) fn vlan_from_db(value: Option<i64>) -> Option<u16> {
    value.and_then(|v| u16::try_from(v).ok())
}
