//! Per-lab lease lock and the enforcement cooldown cache.
//!
//! Both sit on a [`LeaseStore`]: a key/value store with set-if-absent and
//! expiry. Store failures never surface as errors to the loops; they become
//! explicit `Unavailable` outcomes and the caller proceeds (fail open).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::{Db, leases};
use crate::Result;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Stores `token` under `key` unless an unexpired entry exists.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;
    /// Removes `key` only while `token` still owns it.
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool>;
    /// Pushes the expiry of an unexpired entry owned by `token` out to `ttl`
    /// from now. False when the entry expired or changed hands.
    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

pub type DynLeaseStore = Arc<dyn LeaseStore>;

/// Lease store backed by the controller database.
#[derive(Clone)]
pub struct SqlLeaseStore {
    db: Db,
}

impl SqlLeaseStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        leases::purge_expired(&self.db, Utc::now().timestamp_millis()).await
    }
}

#[async_trait]
impl LeaseStore for SqlLeaseStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        leases::try_acquire(&self.db, key, token, Utc::now().timestamp_millis(), ttl_ms).await
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        leases::release(&self.db, key, token).await
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        leases::extend(&self.db, key, token, Utc::now().timestamp_millis(), ttl_ms).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        leases::is_held(&self.db, key, Utc::now().timestamp_millis()).await
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LeaseGuard),
    /// Another holder owns the lab; skip it this pass.
    Contended,
    /// The lease store failed; proceed without the lock.
    Unavailable,
}

/// Returned by user-triggered changes that find the lab locked by a pass or
/// another change.
#[derive(Debug, Error)]
#[error("lab {lab_id} is busy; retry shortly")]
pub struct LabBusy {
    pub lab_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCheck {
    Held,
    /// The lease expired or another holder took it over.
    Lost,
    /// Store failed; keep going as if held.
    Unavailable,
}

/// Held lab lock. Release is explicit and token-checked; a guard that is
/// dropped without release simply expires after the TTL. Long passes call
/// [`LeaseGuard::renew`] between units of work.
pub struct LeaseGuard {
    store: DynLeaseStore,
    key: String,
    token: String,
    ttl: Duration,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn renew(&self) -> LeaseCheck {
        match self.store.extend_if_owner(&self.key, &self.token, self.ttl).await {
            Ok(true) => LeaseCheck::Held,
            Ok(false) => {
                warn!(key = %self.key, "lease lost while held");
                LeaseCheck::Lost
            }
            Err(err) => {
                warn!(key = %self.key, ?err, "lease renewal failed");
                LeaseCheck::Unavailable
            }
        }
    }

    pub async fn release(self) {
        match self.store.delete_if_owner(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "lease released"),
            Ok(false) => warn!(key = %self.key, "lease expired before release"),
            Err(err) => warn!(key = %self.key, ?err, "lease release failed"),
        }
    }
}

#[derive(Clone)]
pub struct LabLock {
    store: DynLeaseStore,
    ttl: Duration,
}

impl LabLock {
    pub fn new(store: DynLeaseStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(lab_id: &str) -> String {
        format!("lab-lock:{lab_id}")
    }

    pub async fn acquire(&self, lab_id: &str) -> LockOutcome {
        let key = Self::key(lab_id);
        let token = Uuid::new_v4().to_string();
        match self.store.set_if_absent(&key, &token, self.ttl).await {
            Ok(true) => LockOutcome::Acquired(LeaseGuard {
                store: self.store.clone(),
                key,
                token,
                ttl: self.ttl,
            }),
            Ok(false) => LockOutcome::Contended,
            Err(err) => {
                warn!(lab_id, ?err, "lease store unavailable; proceeding without lab lock");
                LockOutcome::Unavailable
            }
        }
    }

    /// Lock for a user-triggered change. Contention is a [`LabBusy`] error;
    /// an unavailable store yields `None` and the change proceeds unlocked.
    pub async fn lock_for_change(&self, lab_id: &str) -> Result<Option<LeaseGuard>> {
        match self.acquire(lab_id).await {
            LockOutcome::Acquired(guard) => Ok(Some(guard)),
            LockOutcome::Contended => Err(LabBusy {
                lab_id: lab_id.to_string(),
            }
            .into()),
            LockOutcome::Unavailable => Ok(None),
        }
    }
}

/// Renews `guard` when there is one. False only when the lease is known to
/// be lost; running without a lock counts as held.
pub async fn still_held(guard: Option<&LeaseGuard>) -> bool {
    match guard {
        Some(guard) => guard.renew().await != LeaseCheck::Lost,
        None => true,
    }
}

pub async fn release_if_held(guard: Option<LeaseGuard>) {
    if let Some(guard) = guard {
        guard.release().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownCheck {
    Cooling,
    Clear,
    /// Store failed; treat as clear.
    Unavailable,
}

/// Short-lived "recently enforced" markers keyed by lab and target.
#[derive(Clone)]
pub struct CooldownCache {
    store: DynLeaseStore,
    ttl: Duration,
}

impl CooldownCache {
    pub fn new(store: DynLeaseStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(lab_id: &str, target: &str) -> String {
        format!("enforce-cooldown:{lab_id}:{target}")
    }

    pub async fn mark(&self, lab_id: &str, target: &str) {
        let key = Self::key(lab_id, target);
        if let Err(err) = self.store.set_if_absent(&key, "1", self.ttl).await {
            warn!(lab_id, target, ?err, "failed to mark enforcement cooldown");
        }
    }

    pub async fn check(&self, lab_id: &str, target: &str) -> CooldownCheck {
        match self.store.exists(&Self::key(lab_id, target)).await {
            Ok(true) => CooldownCheck::Cooling,
            Ok(false) => CooldownCheck::Clear,
            Err(err) => {
                warn!(lab_id, target, ?err, "cooldown cache unavailable");
                CooldownCheck::Unavailable
            }
        }
    }

    pub async fn is_cooling(&self, lab_id: &str, target: &str) -> bool {
        self.check(lab_id, target).await == CooldownCheck::Cooling
    }
}
