//! Shared types for the netlab workspace.
//!
//! Keep the controller/agent wire contract and the deterministic naming rules
//! here so both sides derive identical identifiers without a handshake.

#![warn(missing_docs)]

/// Wire DTOs exchanged between the controller and host agents.
pub mod api;

/// Canonical link names, endpoint keys and overlay port names.
pub mod naming;
