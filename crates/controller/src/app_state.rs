use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent_client::{AgentTarget, DynAgentApi};
use crate::config::AppConfig;
use crate::coordination::{CooldownCache, DynLeaseStore, LabLock};
use crate::persistence::{self, Db, HostRecord};
use crate::Result;

/// Everything the background tasks and link services share. Built once in
/// `run()` and cloned into each task.
#[derive(Clone)]
pub struct ControllerContext {
    pub db: Db,
    pub agents: DynAgentApi,
    pub leases: DynLeaseStore,
    pub cfg: Arc<AppConfig>,
}

impl ControllerContext {
    pub fn new(db: Db, agents: DynAgentApi, leases: DynLeaseStore, cfg: AppConfig) -> Self {
        Self {
            db,
            agents,
            leases,
            cfg: Arc::new(cfg),
        }
    }

    pub fn lab_lock(&self) -> LabLock {
        LabLock::new(
            self.leases.clone(),
            Duration::from_secs(self.cfg.lock.ttl_secs.max(1)),
        )
    }

    pub fn cooldown(&self) -> CooldownCache {
        CooldownCache::new(
            self.leases.clone(),
            Duration::from_secs(self.cfg.enforcement.cooldown_ttl_secs),
        )
    }

    /// Snapshot of the host table for one pass.
    pub async fn hosts(&self) -> Result<HostIndex> {
        Ok(HostIndex::new(persistence::hosts::list_hosts(&self.db).await?))
    }
}

/// Host records keyed by id.
#[derive(Debug, Clone, Default)]
pub struct HostIndex {
    hosts: HashMap<String, HostRecord>,
}

impl HostIndex {
    pub fn new(records: Vec<HostRecord>) -> Self {
        Self {
            hosts: records.into_iter().map(|h| (h.id.clone(), h)).collect(),
        }
    }

    /// Unknown or unplaced hosts count as offline.
    pub fn is_online(&self, host_id: Option<&str>) -> bool {
        host_id
            .and_then(|id| self.hosts.get(id))
            .is_some_and(HostRecord::is_online)
    }

    /// Agent address for an online host.
    pub fn online_target(&self, host_id: Option<&str>) -> Option<AgentTarget> {
        let host = self.hosts.get(host_id?)?;
        host.is_online().then(|| AgentTarget::from(host))
    }

    pub fn data_ip(&self, host_id: &str) -> Option<&str> {
        self.hosts.get(host_id).map(|h| h.data_ip.as_str())
    }
}
