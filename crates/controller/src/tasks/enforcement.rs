//! Drives nodes and links toward their desired state.
//!
//! Each pass walks every lab under its lab lock, refreshes node states from
//! the agents, then dispatches at most one agent action per node and link.
//! Retry bookkeeping is persisted before the agent call, so a controller that
//! dies mid-call resumes with the attempt already counted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::NodeRuntimeState;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::{ControllerContext, HostIndex};
use crate::config::EnforcementConfig;
use crate::coordination::{LeaseGuard, LockOutcome, still_held};
use crate::persistence::{
    Db, JobStatus, LinkStateRecord, NodeActualState, NodeDesiredState, NodeStateRecord, jobs as job_store,
    links as link_store, nodes as node_store,
};
use crate::services::links as link_service;
use crate::state_machine::{LinkAction, LinkStateMachine, NodeAction, NodeStateMachine};
use crate::telemetry;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    Periodic,
    /// Operator-triggered: ignores crash cooldown, backoff and the cooldown
    /// cache. Exhausted retries still require a manual reset.
    Forced,
}

/// Why a node or link was left alone this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MaxRetries { max: u32 },
    CrashCooldown { remaining: Duration },
    Backoff { remaining: Duration },
    ActiveJob,
    RecentlyEnforced,
    HostOffline { host_id: Option<String> },
    EndpointsNotRunning,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::MaxRetries { .. } => "max_retries",
            SkipReason::CrashCooldown { .. } => "crash_cooldown",
            SkipReason::Backoff { .. } => "backoff",
            SkipReason::ActiveJob => "active_job",
            SkipReason::RecentlyEnforced => "cooldown",
            SkipReason::HostOffline { .. } => "host_offline",
            SkipReason::EndpointsNotRunning => "endpoints_not_running",
        }
    }

    /// Terminal reasons are written to the row's `error_message`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SkipReason::MaxRetries { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MaxRetries { max } => {
                write!(f, "max retries ({max}) exhausted; manual reset required")
            }
            SkipReason::CrashCooldown { remaining } => {
                write!(f, "crash cooldown ({}s remaining)", remaining.as_secs())
            }
            SkipReason::Backoff { remaining } => {
                write!(f, "retry backoff ({}s remaining)", remaining.as_secs())
            }
            SkipReason::ActiveJob => write!(f, "a job is already in progress"),
            SkipReason::RecentlyEnforced => write!(f, "recently enforced"),
            SkipReason::HostOffline { host_id: Some(host_id) } => write!(f, "host {host_id} offline"),
            SkipReason::HostOffline { host_id: None } => write!(f, "no host placement"),
            SkipReason::EndpointsNotRunning => write!(f, "endpoint nodes not running"),
        }
    }
}

/// Retry bookkeeping shared by node and link rows.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: i64,
    last_enforcement_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl From<&NodeStateRecord> for RetryState {
    fn from(node: &NodeStateRecord) -> Self {
        Self {
            attempts: node.enforcement_attempts,
            last_enforcement_at: node.last_enforcement_at,
            failed_at: node.enforcement_failed_at,
        }
    }
}

impl From<&LinkStateRecord> for RetryState {
    fn from(link: &LinkStateRecord) -> Self {
        Self {
            attempts: link.enforcement_attempts,
            last_enforcement_at: link.last_enforcement_at,
            failed_at: link.enforcement_failed_at,
        }
    }
}

fn chrono_from(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration)
        .unwrap_or_else(|_| ChronoDuration::seconds(duration.as_secs() as i64))
}

fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (deadline > now).then(|| (deadline - now).to_std().unwrap_or_default())
}

/// Skip checks that depend only on the row: retry budget, crash cooldown
/// and backoff, in that order.
fn retry_budget_skip(
    cfg: &EnforcementConfig,
    retry: RetryState,
    mode: EnforcementMode,
    now: DateTime<Utc>,
) -> Option<SkipReason> {
    if retry.attempts >= i64::from(cfg.max_retries) {
        return Some(SkipReason::MaxRetries {
            max: cfg.max_retries,
        });
    }
    if mode == EnforcementMode::Forced {
        return None;
    }
    if let Some(failed_at) = retry.failed_at {
        let deadline = failed_at + chrono_from(Duration::from_secs(cfg.crash_cooldown_secs));
        if let Some(remaining) = remaining_until(deadline, now) {
            return Some(SkipReason::CrashCooldown { remaining });
        }
    }
    if retry.attempts > 0
        && let Some(last) = retry.last_enforcement_at
    {
        let deadline = last + chrono_from(cfg.backoff_for(retry.attempts));
        if let Some(remaining) = remaining_until(deadline, now) {
            return Some(SkipReason::Backoff { remaining });
        }
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnforcementReport {
    pub labs: usize,
    pub labs_locked: usize,
    pub leases_lost: usize,
    pub nodes_checked: usize,
    pub links_checked: usize,
    pub crashes: usize,
    pub started: usize,
    pub stopped: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl EnforcementReport {
    fn absorb(&mut self, other: EnforcementReport) {
        self.labs += other.labs;
        self.labs_locked += other.labs_locked;
        self.leases_lost += other.leases_lost;
        self.nodes_checked += other.nodes_checked;
        self.links_checked += other.links_checked;
        self.crashes += other.crashes;
        self.started += other.started;
        self.stopped += other.stopped;
        self.connected += other.connected;
        self.disconnected += other.disconnected;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

fn observed_state(runtime: NodeRuntimeState) -> NodeActualState {
    match runtime {
        NodeRuntimeState::Running => NodeActualState::Running,
        NodeRuntimeState::Stopped => NodeActualState::Stopped,
        NodeRuntimeState::Exited => NodeActualState::Exited,
        NodeRuntimeState::Missing => NodeActualState::Undeployed,
    }
}

/// Writes `to` when a legal path from `from` exists.
async fn apply_node_state(
    db: &Db,
    node: &NodeStateRecord,
    from: NodeActualState,
    to: NodeActualState,
    error_message: Option<&str>,
) -> Result<bool> {
    if NodeStateMachine::path(from, to).is_none() {
        warn!(
            lab_id = %node.lab_id,
            node = %node.node_name,
            from = from.as_str(),
            to = to.as_str(),
            "no legal node transition; keeping state"
        );
        return Ok(false);
    }
    node_store::set_node_actual_state(db, node.id, to, error_message).await?;
    Ok(true)
}

#[derive(Clone)]
pub struct Enforcer {
    ctx: ControllerContext,
}

impl Enforcer {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// One periodic pass over every lab. A failing lab is logged and the
    /// pass moves on. Finished jobs older than the job timeout are pruned
    /// first.
    pub async fn run_pass(&self) -> Result<EnforcementReport> {
        let mut report = EnforcementReport::default();
        let retention = chrono_from(Duration::from_secs(self.ctx.cfg.enforcement.job_timeout_secs));
        let pruned = job_store::prune_finished_jobs(&self.ctx.db, Utc::now() - retention).await?;
        if pruned > 0 {
            debug!(pruned, "finished jobs pruned");
        }
        for lab_id in node_store::list_lab_ids(&self.ctx.db).await? {
            match self.enforce_lab(&lab_id, EnforcementMode::Periodic).await {
                Ok(lab_report) => report.absorb(lab_report),
                Err(err) => warn!(lab_id, ?err, "lab enforcement failed"),
            }
        }
        Ok(report)
    }

    /// Immediate forced pass for one lab.
    pub async fn enforce_lab_now(&self, lab_id: &str) -> Result<EnforcementReport> {
        info!(lab_id, "forced enforcement requested");
        self.enforce_lab(lab_id, EnforcementMode::Forced).await
    }

    /// Manual reset: fresh retry budget, no backoff history.
    pub async fn reset_node(&self, lab_id: &str, node_name: &str) -> Result<bool> {
        let updated = node_store::reset_node_enforcement(&self.ctx.db, lab_id, node_name).await? > 0;
        if updated {
            info!(lab_id, node = node_name, "node enforcement reset");
        }
        Ok(updated)
    }

    pub async fn reset_link(&self, lab_id: &str, link_name: &str) -> Result<bool> {
        let updated = link_store::reset_link_enforcement(&self.ctx.db, lab_id, link_name).await? > 0;
        if updated {
            info!(lab_id, link = link_name, "link enforcement reset");
        }
        Ok(updated)
    }

    async fn enforce_lab(&self, lab_id: &str, mode: EnforcementMode) -> Result<EnforcementReport> {
        let mut report = EnforcementReport::default();
        let guard = match self.ctx.lab_lock().acquire(lab_id).await {
            LockOutcome::Acquired(guard) => Some(guard),
            LockOutcome::Contended => {
                debug!(lab_id, "lab locked elsewhere; skipping this pass");
                report.labs_locked = 1;
                return Ok(report);
            }
            LockOutcome::Unavailable => None,
        };

        let result = self
            .enforce_lab_locked(lab_id, mode, guard.as_ref(), &mut report)
            .await;
        if let Some(guard) = guard {
            guard.release().await;
        }
        result.map(|()| report)
    }

    async fn enforce_lab_locked(
        &self,
        lab_id: &str,
        mode: EnforcementMode,
        guard: Option<&LeaseGuard>,
        report: &mut EnforcementReport,
    ) -> Result<()> {
        report.labs = 1;
        let hosts = self.ctx.hosts().await?;
        self.refresh_node_states(lab_id, &hosts, report).await?;

        // The lease is renewed before every dispatch; a pass that outlives it
        // leaves the rest of the lab to the new holder.
        for node in node_store::list_lab_node_states(&self.ctx.db, lab_id).await? {
            if !still_held(guard).await {
                warn!(lab_id, "lab lease lost; abandoning pass");
                report.leases_lost = 1;
                return Ok(());
            }
            report.nodes_checked += 1;
            if let Err(err) = self.enforce_node(&hosts, &node, mode, report).await {
                warn!(lab_id, node = %node.node_name, ?err, "node enforcement failed");
                report.failed += 1;
            }
        }

        let running: HashMap<String, bool> = node_store::list_lab_node_states(&self.ctx.db, lab_id)
            .await?
            .into_iter()
            .map(|n| (n.node_name, n.actual_state == NodeActualState::Running))
            .collect();
        for link in link_store::list_lab_link_states(&self.ctx.db, lab_id).await? {
            if !still_held(guard).await {
                warn!(lab_id, "lab lease lost; abandoning pass");
                report.leases_lost = 1;
                return Ok(());
            }
            report.links_checked += 1;
            if let Err(err) = self.enforce_link(&hosts, &link, &running, mode, report).await {
                warn!(lab_id, link = %link.link_name, ?err, "link enforcement failed");
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Applies what the agents report. A node that stops running on its own
    /// while it should be running is a crash: it starts the crash cooldown.
    async fn refresh_node_states(
        &self,
        lab_id: &str,
        hosts: &HostIndex,
        report: &mut EnforcementReport,
    ) -> Result<()> {
        let nodes = node_store::list_lab_node_states(&self.ctx.db, lab_id).await?;
        let mut by_host: BTreeMap<&str, Vec<&NodeStateRecord>> = BTreeMap::new();
        for node in &nodes {
            if let Some(host_id) = node.host_id.as_deref() {
                by_host.entry(host_id).or_default().push(node);
            }
        }

        for (host_id, placed) in by_host {
            let Some(target) = hosts.online_target(Some(host_id)) else {
                continue;
            };
            let status = match self.ctx.agents.node_status(&target, lab_id).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(lab_id, host_id, %err, "node status query failed");
                    continue;
                }
            };
            let observed: HashMap<&str, NodeRuntimeState> = status
                .nodes
                .iter()
                .map(|n| (n.node.as_str(), n.state))
                .collect();

            for node in placed {
                let Some(runtime) = observed.get(node.node_name.as_str()).copied() else {
                    continue;
                };
                let seen = observed_state(runtime);
                if seen == node.actual_state {
                    continue;
                }
                let crashed = node.actual_state == NodeActualState::Running
                    && node.desired_state == NodeDesiredState::Running
                    && matches!(seen, NodeActualState::Exited | NodeActualState::Undeployed);
                if crashed {
                    let message = match runtime {
                        NodeRuntimeState::Missing => "node container disappeared",
                        _ => "node exited unexpectedly",
                    };
                    warn!(lab_id, node = %node.node_name, host_id, "{message}");
                    apply_node_state(&self.ctx.db, node, node.actual_state, seen, Some(message)).await?;
                    node_store::mark_node_failed(&self.ctx.db, node.id, Utc::now()).await?;
                    report.crashes += 1;
                } else {
                    apply_node_state(&self.ctx.db, node, node.actual_state, seen, None).await?;
                }
            }
        }
        Ok(())
    }

    /// Shared skip checks (a)-(e) for a node or link target.
    async fn skip_reason(
        &self,
        lab_id: &str,
        target: &str,
        job_node: Option<&str>,
        retry: RetryState,
        mode: EnforcementMode,
    ) -> Result<Option<SkipReason>> {
        let cfg = &self.ctx.cfg.enforcement;
        let now = Utc::now();
        if let Some(reason) = retry_budget_skip(cfg, retry, mode, now) {
            return Ok(Some(reason));
        }
        let cutoff = now - chrono_from(Duration::from_secs(cfg.job_timeout_secs));
        if job_store::has_active_job(&self.ctx.db, lab_id, job_node, cutoff).await? {
            return Ok(Some(SkipReason::ActiveJob));
        }
        if mode == EnforcementMode::Periodic && self.ctx.cooldown().is_cooling(lab_id, target).await {
            return Ok(Some(SkipReason::RecentlyEnforced));
        }
        Ok(None)
    }

    fn note_skip(&self, lab_id: &str, target: &str, reason: &SkipReason, report: &mut EnforcementReport) {
        debug!(lab_id, target, reason = %reason, "enforcement skipped");
        telemetry::record_enforcement_skip(reason.label());
        report.skipped += 1;
    }

    async fn enforce_node(
        &self,
        hosts: &HostIndex,
        node: &NodeStateRecord,
        mode: EnforcementMode,
        report: &mut EnforcementReport,
    ) -> Result<()> {
        let db = &self.ctx.db;
        let Some(action) = NodeStateMachine::get_enforcement_action(node.actual_state, node.desired_state)
        else {
            if NodeStateMachine::matches_desired(node.actual_state, node.desired_state)
                && (node.enforcement_attempts > 0 || node.enforcement_failed_at.is_some())
            {
                node_store::clear_node_enforcement(db, node.id).await?;
            }
            return Ok(());
        };

        let lab_id = node.lab_id.as_str();
        let name = node.node_name.as_str();
        if let Some(reason) = self
            .skip_reason(lab_id, name, Some(name), RetryState::from(node), mode)
            .await?
        {
            if reason.is_terminal() {
                let message = reason.to_string();
                if node.error_message.as_deref() != Some(message.as_str()) {
                    warn!(lab_id, node = name, %message, "node enforcement halted");
                    node_store::set_node_error_message(db, node.id, Some(&message)).await?;
                }
            }
            self.note_skip(lab_id, name, &reason, report);
            return Ok(());
        }
        let Some(target) = hosts.online_target(node.host_id.as_deref()) else {
            let reason = SkipReason::HostOffline {
                host_id: node.host_id.clone(),
            };
            self.note_skip(lab_id, name, &reason, report);
            return Ok(());
        };

        let attempts = node.enforcement_attempts + 1;
        node_store::record_node_attempt(db, node.id, attempts, Utc::now()).await?;
        self.ctx.cooldown().mark(lab_id, name).await;
        let job_id = job_store::insert_job(db, lab_id, Some(name), action.as_str(), JobStatus::Running).await?;

        let mut current = node.actual_state;
        if let Some(next) = NodeStateMachine::get_transition_for_desired(current, node.desired_state)
            && apply_node_state(db, node, current, next, None).await?
        {
            current = next;
        }
        info!(lab_id, node = name, action = action.as_str(), attempt = attempts, host_id = %target.host_id, "dispatching node action");

        let outcome = match action {
            NodeAction::Start => self.ctx.agents.start_node(&target, lab_id, name).await,
            NodeAction::Stop => self.ctx.agents.stop_node(&target, lab_id, name).await,
        };
        let kind = match action {
            NodeAction::Start => "node_start",
            NodeAction::Stop => "node_stop",
        };
        match outcome {
            Ok(_) => {
                let done = match action {
                    NodeAction::Start => NodeActualState::Running,
                    NodeAction::Stop => NodeActualState::Stopped,
                };
                apply_node_state(db, node, current, done, None).await?;
                node_store::clear_node_enforcement(db, node.id).await?;
                job_store::set_job_status(db, job_id, JobStatus::Completed).await?;
                telemetry::record_enforcement_action(kind, "success");
                match action {
                    NodeAction::Start => report.started += 1,
                    NodeAction::Stop => report.stopped += 1,
                }
            }
            Err(err) => {
                let message = format!("{} failed: {err}", action.as_str());
                warn!(lab_id, node = name, attempt = attempts, %message, "node action failed");
                apply_node_state(db, node, current, NodeActualState::Error, Some(&message)).await?;
                self.exhaust_if_needed(db, node.id, attempts, true).await?;
                job_store::set_job_status(db, job_id, JobStatus::Failed).await?;
                telemetry::record_enforcement_action(kind, "failure");
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn enforce_link(
        &self,
        hosts: &HostIndex,
        link: &LinkStateRecord,
        running: &HashMap<String, bool>,
        mode: EnforcementMode,
        report: &mut EnforcementReport,
    ) -> Result<()> {
        let db = &self.ctx.db;
        let Some(action) = LinkStateMachine::get_enforcement_action(link.actual_state, link.desired_state)
        else {
            if LinkStateMachine::matches_desired(link.actual_state, link.desired_state)
                && (link.enforcement_attempts > 0 || link.enforcement_failed_at.is_some())
            {
                link_store::clear_link_enforcement(db, link.id).await?;
            }
            return Ok(());
        };

        let lab_id = link.lab_id.as_str();
        let name = link.link_name.as_str();
        if action == LinkAction::Connect {
            let is_running = |node: &str| running.get(node).copied().unwrap_or(false);
            if !LinkStateMachine::should_auto_connect(
                link.actual_state,
                link.desired_state,
                is_running(&link.source_node),
                is_running(&link.target_node),
            ) {
                // Waiting for nodes does not consume the retry budget.
                self.note_skip(lab_id, name, &SkipReason::EndpointsNotRunning, report);
                return Ok(());
            }
        }

        if let Some(reason) = self
            .skip_reason(lab_id, name, None, RetryState::from(link), mode)
            .await?
        {
            if reason.is_terminal() {
                let message = reason.to_string();
                if link.error_message.as_deref() != Some(message.as_str()) {
                    warn!(lab_id, link = name, %message, "link enforcement halted");
                    link_store::set_link_error_message(db, link.id, Some(&message)).await?;
                }
            }
            self.note_skip(lab_id, name, &reason, report);
            return Ok(());
        }
        if let Some(offline) = [link.source_host_id.as_deref(), link.target_host_id.as_deref()]
            .into_iter()
            .find(|host| !hosts.is_online(*host))
        {
            let reason = SkipReason::HostOffline {
                host_id: offline.map(str::to_string),
            };
            self.note_skip(lab_id, name, &reason, report);
            return Ok(());
        }

        let attempts = link.enforcement_attempts + 1;
        link_store::record_link_attempt(db, link.id, attempts, Utc::now()).await?;
        self.ctx.cooldown().mark(lab_id, name).await;
        info!(lab_id, link = name, action = action.as_str(), attempt = attempts, "dispatching link action");

        let (kind, outcome) = match action {
            LinkAction::Connect => ("link_connect", link_service::connect_link(&self.ctx, link).await),
            LinkAction::Disconnect => (
                "link_disconnect",
                link_service::disconnect_link(&self.ctx, link).await,
            ),
        };
        match outcome {
            Ok(_) => {
                link_store::clear_link_enforcement(db, link.id).await?;
                telemetry::record_enforcement_action(kind, "success");
                match action {
                    LinkAction::Connect => report.connected += 1,
                    LinkAction::Disconnect => report.disconnected += 1,
                }
            }
            Err(err) => {
                warn!(lab_id, link = name, attempt = attempts, ?err, "link action failed");
                self.exhaust_if_needed(db, link.id, attempts, false).await?;
                telemetry::record_enforcement_action(kind, "failure");
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Stamps `enforcement_failed_at` once the retry budget is spent so
    /// automatic retries stop.
    async fn exhaust_if_needed(&self, db: &Db, id: Uuid, attempts: i64, is_node: bool) -> Result<()> {
        let max = self.ctx.cfg.enforcement.max_retries;
        if attempts < i64::from(max) {
            return Ok(());
        }
        warn!(%id, attempts, max, "retry budget exhausted; manual reset required");
        if is_node {
            node_store::mark_node_failed(db, id, Utc::now()).await
        } else {
            link_store::mark_link_failed(db, id, Utc::now()).await
        }
    }
}

pub async fn enforcement_loop(enforcer: Enforcer, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(enforcer.ctx.cfg.enforcement.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match enforcer.run_pass().await {
            Ok(report) => debug!(?report, "enforcement pass complete"),
            Err(err) => warn!(?err, "enforcement pass failed"),
        }
    }
    info!("enforcement loop stopped");
}
