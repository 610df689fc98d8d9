//! Declarative lab topology: the caller states the full set of nodes and
//! links and the stored rows are brought in line.

use std::collections::{BTreeMap, HashSet};

use common::naming::{self, Endpoint};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app_state::ControllerContext;
use crate::coordination::release_if_held;
use crate::persistence::{
    LinkDesiredState, NewNodeState, NodeDesiredState, links as link_store, nodes as node_store,
};
use crate::services::links;
use crate::services::reservations::EndpointConflict;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub host_id: Option<String>,
    pub desired_state: NodeDesiredState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
    pub desired_state: LinkDesiredState,
}

impl LinkSpec {
    fn canonical_name(&self) -> String {
        let (first, second) = naming::canonical_endpoints(
            Endpoint::new(&self.source_node, &self.source_interface),
            Endpoint::new(&self.target_node, &self.target_interface),
        );
        naming::generate_link_name(&first.node, &first.interface, &second.node, &second.interface)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyReport {
    pub nodes_upserted: usize,
    pub nodes_removed: usize,
    pub links_upserted: usize,
    pub links_removed: usize,
    /// Links left undeclared because an endpoint is held by another link.
    pub conflicts: Vec<String>,
}

/// Applies a full topology for `lab_id`.
///
/// Links that disappear from the declaration are deleted through the link
/// lifecycle so their dataplane is torn down. Spellings of the same link
/// (endpoint order, interface aliases) collapse to one row; the last
/// declaration wins. The whole declaration runs under the lab lock.
pub async fn declare_topology(
    ctx: &ControllerContext,
    lab_id: &str,
    nodes: &[NodeSpec],
    links_declared: &[LinkSpec],
) -> Result<TopologyReport> {
    let guard = ctx.lab_lock().lock_for_change(lab_id).await?;
    let result = declare_locked(ctx, lab_id, nodes, links_declared).await;
    release_if_held(guard).await;
    result
}

async fn declare_locked(
    ctx: &ControllerContext,
    lab_id: &str,
    nodes: &[NodeSpec],
    links_declared: &[LinkSpec],
) -> Result<TopologyReport> {
    let mut report = TopologyReport::default();

    for spec in nodes {
        node_store::upsert_node_state(
            &ctx.db,
            &NewNodeState {
                lab_id: lab_id.to_string(),
                node_name: spec.name.clone(),
                host_id: spec.host_id.clone(),
                desired_state: spec.desired_state,
            },
        )
        .await?;
        report.nodes_upserted += 1;
    }

    let wanted: BTreeMap<String, &LinkSpec> = links_declared
        .iter()
        .map(|spec| (spec.canonical_name(), spec))
        .collect();

    for existing in link_store::list_lab_link_states(&ctx.db, lab_id).await? {
        if !wanted.contains_key(&existing.link_name)
            && links::delete_link_locked(ctx, lab_id, &existing.link_name).await?
        {
            report.links_removed += 1;
        }
    }

    let declared_nodes: HashSet<&str> = nodes.iter().map(|n| n.name.trim()).collect();
    for existing in node_store::list_lab_node_states(&ctx.db, lab_id).await? {
        if !declared_nodes.contains(existing.node_name.as_str()) {
            node_store::delete_node_state(&ctx.db, existing.id).await?;
            report.nodes_removed += 1;
        }
    }

    // Downs first so endpoints they free are available to the ups.
    let mut ordered: Vec<(&String, &&LinkSpec)> = wanted.iter().collect();
    ordered.sort_by_key(|(_, spec)| spec.desired_state == LinkDesiredState::Up);
    for (name, spec) in ordered {
        let created = links::create_link_locked(
            ctx,
            lab_id,
            (spec.source_node.as_str(), spec.source_interface.as_str()),
            (spec.target_node.as_str(), spec.target_interface.as_str()),
            spec.desired_state,
        )
        .await;
        match created {
            Ok(_) => report.links_upserted += 1,
            Err(err) => match err.downcast_ref::<EndpointConflict>() {
                Some(conflict) => {
                    warn!(lab_id, link = %name, %conflict, "link not declared");
                    report.conflicts.push(conflict.to_string());
                }
                None => return Err(err),
            },
        }
    }

    info!(
        lab_id,
        nodes = report.nodes_upserted,
        links = report.links_upserted,
        removed_links = report.links_removed,
        removed_nodes = report.nodes_removed,
        conflicts = report.conflicts.len(),
        "topology declared"
    );
    Ok(report)
}
