//! Per-entity cooperative locks.
//!
//! Locks are advisory and short-lived: every write path acquires the lock
//! for the entities it touches, reads never lock. A lock is owned by an
//! opaque session token and expires after its TTL; expired entries are
//! reclaimed lazily on the next acquisition attempt. The internal table is
//! guarded by a standard-library mutex that is never held across an await
//! point.

use crate::error::{OrchestratorError, Result};
use crate::models::EntityKind;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Default lock lifetime.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 60;

/// Identity of a lockable entity. Ordering is the canonical acquisition
/// order: kind ordinal first, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl LockKey {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

/// Handle to a held lock. Releasing requires the handle so a session
/// cannot drop a lock that was reclaimed and re-acquired by someone else.
#[derive(Debug, Clone)]
pub struct Lock {
    pub key: LockKey,
    pub session: String,
    token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewStatus {
    Renewed { expires_at: DateTime<Utc> },
    Expired,
}

#[derive(Debug, Clone)]
struct LockEntry {
    session: String,
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Table of per-entity exclusive locks.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<HashMap<LockKey, LockEntry>>,
    default_ttl: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_LOCK_TTL_SECS))
    }

    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<LockKey, LockEntry>> {
        // Recover from poisoning: the table itself is always consistent.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire the lock for one entity.
    ///
    /// Re-acquisition by the owning session is idempotent and renews the
    /// TTL. A lock held by another session yields `LockConflict` with the
    /// owner and expiry; expired locks are reclaimed in place.
    pub fn acquire(
        &self,
        kind: EntityKind,
        id: Uuid,
        session: &str,
        ttl: Option<Duration>,
    ) -> Result<Lock> {
        let key = LockKey::new(kind, id);
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let mut table = self.table();

        if let Some(entry) = table.get(&key) {
            if entry.expires_at > now && entry.session != session {
                return Err(OrchestratorError::LockConflict {
                    owner: entry.session.clone(),
                    expires_at: entry.expires_at,
                });
            }
        }

        let entry = LockEntry {
            session: session.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        let lock = Lock {
            key,
            session: entry.session.clone(),
            token: entry.token,
            expires_at: entry.expires_at,
        };
        table.insert(key, entry);
        Ok(lock)
    }

    /// Acquire several locks atomically, in canonical order. On conflict,
    /// everything acquired so far is released and the conflict returned.
    pub fn acquire_many(
        &self,
        keys: &[LockKey],
        session: &str,
        ttl: Option<Duration>,
    ) -> Result<Vec<Lock>> {
        let mut ordered: Vec<LockKey> = keys.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for key in ordered {
            match self.acquire(key.kind, key.id, session, ttl) {
                Ok(lock) => held.push(lock),
                Err(e) => {
                    for lock in &held {
                        self.release(lock);
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Release a lock. Always succeeds; releasing an expired or reclaimed
    /// lock is a no-op.
    pub fn release(&self, lock: &Lock) {
        let mut table = self.table();
        if let Some(entry) = table.get(&lock.key) {
            if entry.token == lock.token {
                table.remove(&lock.key);
            }
        }
    }

    /// Extend a held lock's TTL.
    pub fn renew(&self, lock: &Lock, ttl: Option<Duration>) -> RenewStatus {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let mut table = self.table();
        match table.get_mut(&lock.key) {
            Some(entry) if entry.token == lock.token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                RenewStatus::Renewed {
                    expires_at: entry.expires_at,
                }
            }
            _ => RenewStatus::Expired,
        }
    }

    /// Number of live (unexpired) locks; expired entries are swept as a
    /// side effect.
    pub fn live_count(&self) -> usize {
        let now = Utc::now();
        let mut table = self.table();
        table.retain(|_, entry| entry.expires_at > now);
        table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new()
    }

    #[test]
    fn acquire_and_release() {
        let locks = manager();
        let id = Uuid::new_v4();

        let lock = locks
            .acquire(EntityKind::Task, id, "session-a", None)
            .unwrap();
        assert_eq!(locks.live_count(), 1);

        locks.release(&lock);
        assert_eq!(locks.live_count(), 0);
    }

    #[test]
    fn conflicting_sessions_are_rejected() {
        let locks = manager();
        let id = Uuid::new_v4();

        let _held = locks
            .acquire(EntityKind::Task, id, "session-a", None)
            .unwrap();
        let err = locks
            .acquire(EntityKind::Task, id, "session-b", None)
            .unwrap_err();
        match err {
            OrchestratorError::LockConflict { owner, .. } => assert_eq!(owner, "session-a"),
            other => panic!("expected LockConflict, got {other:?}"),
        }
    }

    #[test]
    fn same_session_reacquire_is_idempotent() {
        let locks = manager();
        let id = Uuid::new_v4();

        let first = locks
            .acquire(EntityKind::Task, id, "session-a", None)
            .unwrap();
        let second = locks
            .acquire(EntityKind::Task, id, "session-a", None)
            .unwrap();
        assert!(second.expires_at >= first.expires_at);
        assert_eq!(locks.live_count(), 1);
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let locks = manager();
        let id = Uuid::new_v4();

        let _stale = locks
            .acquire(EntityKind::Task, id, "session-a", Some(Duration::seconds(-1)))
            .unwrap();
        // Already past its expiry, so another session may take it.
        let lock = locks
            .acquire(EntityKind::Task, id, "session-b", None)
            .unwrap();
        assert_eq!(lock.session, "session-b");
    }

    #[test]
    fn releasing_a_reclaimed_lock_is_a_noop() {
        let locks = manager();
        let id = Uuid::new_v4();

        let stale = locks
            .acquire(EntityKind::Task, id, "session-a", Some(Duration::seconds(-1)))
            .unwrap();
        let fresh = locks
            .acquire(EntityKind::Task, id, "session-b", None)
            .unwrap();

        // The stale handle must not evict the new owner.
        locks.release(&stale);
        let err = locks
            .acquire(EntityKind::Task, id, "session-c", None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LockConflict { .. }));
        locks.release(&fresh);
    }

    #[test]
    fn renew_extends_and_expired_reports() {
        let locks = manager();
        let id = Uuid::new_v4();

        let lock = locks
            .acquire(EntityKind::Task, id, "session-a", None)
            .unwrap();
        match locks.renew(&lock, Some(Duration::seconds(120))) {
            RenewStatus::Renewed { expires_at } => assert!(expires_at > lock.expires_at),
            RenewStatus::Expired => panic!("live lock must renew"),
        }

        let stale = locks
            .acquire(EntityKind::Feature, id, "session-a", Some(Duration::seconds(-1)))
            .unwrap();
        assert_eq!(locks.renew(&stale, None), RenewStatus::Expired);
    }

    #[test]
    fn acquire_many_is_all_or_nothing() {
        let locks = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _held = locks
            .acquire(EntityKind::Task, b, "session-x", None)
            .unwrap();

        let keys = vec![
            LockKey::new(EntityKind::Task, a),
            LockKey::new(EntityKind::Task, b),
        ];
        let err = locks.acquire_many(&keys, "session-y", None).unwrap_err();
        assert!(matches!(err, OrchestratorError::LockConflict { .. }));
        // The first lock must have been rolled back.
        assert!(locks.acquire(EntityKind::Task, a, "session-z", None).is_ok());
    }

    #[test]
    fn canonical_ordering_sorts_kind_then_id() {
        let mut keys = vec![
            LockKey::new(EntityKind::Task, Uuid::nil()),
            LockKey::new(EntityKind::Project, Uuid::new_v4()),
            LockKey::new(EntityKind::Feature, Uuid::new_v4()),
        ];
        keys.sort_unstable();
        assert_eq!(keys[0].kind, EntityKind::Project);
        assert_eq!(keys[1].kind, EntityKind::Feature);
        assert_eq!(keys[2].kind, EntityKind::Task);
    }
}
