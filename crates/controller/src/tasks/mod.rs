pub mod enforcement;
pub mod host_health;
pub mod link_reconciliation;
