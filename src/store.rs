//! In-memory lock table. All mutation goes through the state machine applier,
//! so the operations here are plain synchronous functions; the caller owns
//! the locking. Expiry is lazy: an entry with `now >= expires_at` counts as
//! absent for whichever operation touches it next, and no timer runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub holder_client_id: String,
    /// Region that granted the lock. An entry whose region differs from the
    /// store's own region is an advisory record from the cross-region
    /// protocol and is excluded from fencing-token allocation.
    pub region_id: String,
    pub fencing_token: u64,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lock {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Result of applying a committed command to the store. This is what resolves
/// a proposal handle, so it carries everything the front-end reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Ok {
        fencing_token: u64,
        expires_at: u64,
    },
    AlreadyLocked {
        holder: Lock,
    },
    NotFound,
    InvalidToken,
    Expired,
}

#[derive(Debug)]
pub struct LockStore {
    region_id: String,
    locks: HashMap<String, Lock>,
}

impl LockStore {
    pub fn new(region_id: impl Into<String>) -> Self {
        Self {
            region_id: region_id.into(),
            locks: HashMap::new(),
        }
    }

    /// Insert a lock with a pre-assigned token. Succeeds when the id is free
    /// or the current entry has lapsed. A re-acquire by the same holder
    /// (client and region both matching) renews the entry in place with the
    /// new token and lease.
    pub fn acquire_with_token(
        &mut self,
        lock_id: &str,
        client_id: &str,
        region_id: &str,
        fencing_token: u64,
        expires_at: u64,
        now: u64,
    ) -> ApplyOutcome {
        if let Some(existing) = self.locks.get(lock_id) {
            let reentrant =
                existing.holder_client_id == client_id && existing.region_id == region_id;
            if !existing.is_expired(now) && !reentrant {
                return ApplyOutcome::AlreadyLocked {
                    holder: existing.clone(),
                };
            }
        }
        self.locks.insert(
            lock_id.to_string(),
            Lock {
                holder_client_id: client_id.to_string(),
                region_id: region_id.to_string(),
                fencing_token,
                acquired_at: now,
                expires_at,
            },
        );
        ApplyOutcome::Ok {
            fencing_token,
            expires_at,
        }
    }

    /// Remove a lock, fenced by its token. A lapsed entry is dropped on the
    /// way through: the holder gets `Expired` if the token still matched,
    /// anyone else gets `NotFound`.
    pub fn release_by_token(&mut self, lock_id: &str, fencing_token: u64, now: u64) -> ApplyOutcome {
        let Some(existing) = self.locks.get(lock_id) else {
            return ApplyOutcome::NotFound;
        };
        let expired = existing.is_expired(now);
        let matched = existing.fencing_token == fencing_token;

        if expired {
            self.locks.remove(lock_id);
            return if matched {
                ApplyOutcome::Expired
            } else {
                ApplyOutcome::NotFound
            };
        }
        if !matched {
            return ApplyOutcome::InvalidToken;
        }
        self.locks.remove(lock_id);
        ApplyOutcome::Ok {
            fencing_token,
            expires_at: 0,
        }
    }

    /// Move the lease of a held lock, fenced by its token.
    pub fn extend_by_token(
        &mut self,
        lock_id: &str,
        fencing_token: u64,
        expires_at: u64,
        now: u64,
    ) -> ApplyOutcome {
        let Some(existing) = self.locks.get(lock_id) else {
            return ApplyOutcome::NotFound;
        };
        let expired = existing.is_expired(now);
        let matched = existing.fencing_token == fencing_token;

        if expired {
            self.locks.remove(lock_id);
            return if matched {
                ApplyOutcome::Expired
            } else {
                ApplyOutcome::NotFound
            };
        }
        if !matched {
            return ApplyOutcome::InvalidToken;
        }
        if let Some(lock) = self.locks.get_mut(lock_id) {
            lock.expires_at = expires_at;
        }
        ApplyOutcome::Ok {
            fencing_token,
            expires_at,
        }
    }

    /// Current holder of a lock, filtering lapsed entries.
    pub fn check(&self, lock_id: &str, now: u64) -> Option<&Lock> {
        self.locks.get(lock_id).filter(|l| !l.is_expired(now))
    }

    /// Highest token this store has handed out for `lock_id`, ignoring
    /// advisory entries recorded on behalf of other regions. Token
    /// pre-assignment takes the max of this and the node-wide counter.
    pub fn token_floor(&self, lock_id: &str) -> u64 {
        self.locks
            .get(lock_id)
            .filter(|l| l.region_id == self.region_id)
            .map(|l| l.fencing_token)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Test-only reset.
    pub fn clear(&mut self) {
        self.locks.clear();
    }
}
