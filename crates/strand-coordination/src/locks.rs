//! # Distributed Lock Manager
//!
//! Time-bounded leases over logical resource keys.
//!
//! The lease table lives in one process and serves a single trusted
//! coordinator. It is not fault tolerant: a coordinator restart loses every
//! lease, and two coordinators would each grant the same key. Deployments
//! with more than one coordinator need a consensus-backed lease service in
//! its place.
//!
//! Acquisition never queues; a held key fails immediately with
//! `AlreadyLocked` and the caller owns its retry policy. Every grant carries
//! a fencing token that increases across the lifetime of the manager.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use strand_core::time::duration_ms;
use strand_core::{LockConfig, Result, SharedClock, StrandError, TaskRegistry};

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedLock {
    /// Resource key
    pub key: String,
    /// Identifier of this grant; required to renew or release
    pub lock_id: Uuid,
    /// Holder
    pub owner_id: String,
    /// Monotonic grant counter
    pub fencing_token: u64,
    /// Grant time, Unix milliseconds
    pub acquired_at: u64,
    /// Expiry, Unix milliseconds
    pub expires_at: u64,
}

impl DistributedLock {
    /// Lease has run out at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Single-process lease table
pub struct DistributedLockManager {
    locks: Mutex<HashMap<String, DistributedLock>>,
    next_token: AtomicU64,
    config: LockConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for DistributedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockManager")
            .field("held", &self.locks.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributedLockManager {
    /// Empty lease table
    pub fn new(config: LockConfig, clock: SharedClock) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            config,
            clock,
        }
    }

    /// Lease settings
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Grant `key` to `owner` for `ttl`, replacing an expired lease
    pub fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<DistributedLock> {
        let ttl_ms = positive_ttl(ttl)?;
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(key) {
            if !held.is_expired(now) {
                return Err(StrandError::already_locked(key, held.owner_id.clone()));
            }
            tracing::debug!(key, previous = %held.owner_id, "expired lease replaced");
        }
        let lock = DistributedLock {
            key: key.to_string(),
            lock_id: Uuid::new_v4(),
            owner_id: owner.to_string(),
            fencing_token: self.next_token.fetch_add(1, Ordering::SeqCst),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };
        locks.insert(key.to_string(), lock.clone());
        tracing::debug!(key, owner, token = lock.fencing_token, ttl_ms, "lock acquired");
        Ok(lock)
    }

    /// Extend a live lease held under `lock_id` to `now + ttl`
    pub fn renew_lock(&self, key: &str, lock_id: Uuid, ttl: Duration) -> Result<DistributedLock> {
        let ttl_ms = positive_ttl(ttl)?;
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        let held = locks
            .get_mut(key)
            .filter(|held| !held.is_expired(now))
            .ok_or_else(|| StrandError::not_found(format!("lock {key}")))?;
        if held.lock_id != lock_id {
            return Err(StrandError::already_locked(key, held.owner_id.clone()));
        }
        held.expires_at = now.saturating_add(ttl_ms);
        tracing::trace!(key, expires_at = held.expires_at, "lock renewed");
        Ok(held.clone())
    }

    /// Release a lease; only the grant identified by `lock_id` may release it
    pub fn release_lock(&self, key: &str, lock_id: Uuid) -> Result<()> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            None => Err(StrandError::not_found(format!("lock {key}"))),
            Some(held) if held.lock_id != lock_id => {
                Err(StrandError::already_locked(key, held.owner_id.clone()))
            }
            Some(_) => {
                locks.remove(key);
                tracing::debug!(key, "lock released");
                Ok(())
            }
        }
    }

    /// Live lease on `key`
    pub fn get_lock(&self, key: &str) -> Option<DistributedLock> {
        let now = self.clock.now_ms();
        self.locks
            .lock()
            .get(key)
            .filter(|held| !held.is_expired(now))
            .cloned()
    }

    /// A live lease exists on `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.get_lock(key).is_some()
    }

    /// Drop expired leases; returns how many were reclaimed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|key, held| {
            let expired = held.is_expired(now);
            if expired {
                tracing::info!(key = %key, owner = %held.owner_id, "lease expired");
            }
            !expired
        });
        before - locks.len()
    }

    /// Run [`Self::sweep_expired`] every `sweep_interval` until shutdown
    pub fn spawn_sweeper(self: &Arc<Self>, tasks: &TaskRegistry) {
        let manager = Arc::downgrade(self);
        tasks.spawn_interval_until(self.config.sweep_interval(), move || {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else {
                    return false;
                };
                let reclaimed = manager.sweep_expired();
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "lock sweep");
                }
                true
            }
        });
    }
}

fn positive_ttl(ttl: Duration) -> Result<u64> {
    match duration_ms(ttl) {
        0 => Err(StrandError::invalid("lock ttl must be at least 1ms")),
        ms => Ok(ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{ManualClock, PhysicalClock};

    fn manager() -> (Arc<ManualClock>, DistributedLockManager) {
        let clock = ManualClock::new(1_000);
        let manager = DistributedLockManager::new(LockConfig::default(), clock.clone());
        (clock, manager)
    }

    #[test]
    fn test_second_acquire_fails_until_expiry() {
        let (clock, locks) = manager();
        let ttl = Duration::from_secs(5);
        let first = locks.acquire_lock("timeline:conv:c1", "a", ttl).unwrap();
        let err = locks.acquire_lock("timeline:conv:c1", "b", ttl).unwrap_err();
        assert_eq!(
            err,
            StrandError::already_locked("timeline:conv:c1", "a")
        );

        clock.advance(ttl);
        let second = locks.acquire_lock("timeline:conv:c1", "b", ttl).unwrap();
        assert!(second.fencing_token > first.fencing_token);
        assert_eq!(locks.get_lock("timeline:conv:c1").unwrap().owner_id, "b");
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let (_clock, locks) = manager();
        let locks = Arc::new(locks);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                std::thread::spawn(move || {
                    locks
                        .acquire_lock("k", &format!("owner-{i}"), Duration::from_secs(1))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_renew_and_release_require_the_grant() {
        let (clock, locks) = manager();
        let ttl = Duration::from_secs(5);
        let lock = locks.acquire_lock("k", "a", ttl).unwrap();

        clock.advance(Duration::from_secs(4));
        let renewed = locks.renew_lock("k", lock.lock_id, ttl).unwrap();
        assert_eq!(renewed.expires_at, clock.now_ms() + 5_000);
        assert!(matches!(
            locks.renew_lock("k", Uuid::new_v4(), ttl),
            Err(StrandError::AlreadyLocked { .. })
        ));
        assert!(matches!(
            locks.release_lock("k", Uuid::new_v4()),
            Err(StrandError::AlreadyLocked { .. })
        ));

        clock.advance(Duration::from_secs(4));
        assert!(locks.is_locked("k"), "renewal pushed expiry out");
        locks.release_lock("k", lock.lock_id).unwrap();
        assert!(!locks.is_locked("k"));
        assert!(matches!(
            locks.release_lock("k", lock.lock_id),
            Err(StrandError::NotFound { .. })
        ));
    }

    #[test]
    fn test_expired_lease_cannot_be_renewed() {
        let (clock, locks) = manager();
        let lock = locks.acquire_lock("k", "a", Duration::from_secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(matches!(
            locks.renew_lock("k", lock.lock_id, Duration::from_secs(1)),
            Err(StrandError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sweep_reclaims_only_expired() {
        let (clock, locks) = manager();
        locks.acquire_lock("short", "a", Duration::from_secs(1)).unwrap();
        locks.acquire_lock("long", "a", Duration::from_secs(60)).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(locks.sweep_expired(), 1);
        assert!(locks.is_locked("long"));
        assert_eq!(locks.sweep_expired(), 0);
    }

    #[test]
    fn test_zero_ttl_is_invalid() {
        let (_clock, locks) = manager();
        assert!(matches!(
            locks.acquire_lock("k", "a", Duration::ZERO),
            Err(StrandError::Invalid { .. })
        ));
    }
}
