//! Hierarchical lock manager.
//!
//! Mediates per-DBO locks in four modes with blocking acquisition. A wait-for
//! graph is checked before every wait; when the requester would close a
//! cycle it is aborted with [`DbError::Deadlock`] (requester-as-victim).

use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Most resources see only a handful of holders at once.
type Holders = SmallVec<[(u64, LockMode); 4]>;

/// Lock resource name of the catalog root.
pub const RESOURCE_ROOT: &str = "/";
/// Lock resource name of the substrate's exclusive writer slot. Routing the
/// writer through the lock manager lets writer waits participate in deadlock
/// detection.
pub const RESOURCE_WRITER: &str = "$writer";

/// Lock modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility matrix.
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Least upper bound when a transaction strengthens a lock it holds.
    /// Shared + IntentionExclusive has no dedicated mode here and widens to
    /// Exclusive.
    pub fn combine(&self, other: &LockMode) -> LockMode {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => Exclusive,
            (Shared, _) | (_, Shared) => Shared,
            (IntentionExclusive, _) | (_, IntentionExclusive) => IntentionExclusive,
            (IntentionShared, IntentionShared) => IntentionShared,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        };
        write!(f, "{name}")
    }
}

#[derive(Default)]
struct LockState {
    /// resource → current holders
    resources: HashMap<String, Holders>,
    /// blocked transaction → (resource, requested mode)
    waiting: HashMap<u64, (String, LockMode)>,
}

impl LockState {
    /// True when `start` waiting as recorded would close a wait-for cycle.
    fn closes_cycle(&self, start: u64) -> bool {
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(tx) = stack.pop() {
            let Some((resource, mode)) = self.waiting.get(&tx) else {
                continue;
            };
            let Some(holders) = self.resources.get(resource) else {
                continue;
            };
            for (holder, held) in holders {
                if *holder == tx || mode.is_compatible(held) {
                    continue;
                }
                if *holder == start {
                    return true;
                }
                if visited.insert(*holder) {
                    stack.push(*holder);
                }
            }
        }
        false
    }
}

/// Blocking multi-granularity lock manager with deadlock detection.
pub struct LockManager {
    state: Mutex<LockState>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire `mode` on `resource` for transaction `txid`, blocking until
    /// compatible. Re-requests strengthen the held mode (see
    /// [`LockMode::combine`]).
    pub fn acquire(&self, txid: u64, resource: &str, mode: LockMode) -> DbResult<()> {
        let mut state = self.state.lock();
        loop {
            let holders = state.resources.entry(resource.to_string()).or_default();
            let own = holders.iter().position(|(id, _)| *id == txid);
            let effective = match own {
                Some(pos) => holders[pos].1.combine(&mode),
                None => mode,
            };
            let compatible = holders
                .iter()
                .all(|(id, held)| *id == txid || effective.is_compatible(held));
            if compatible {
                match own {
                    Some(pos) => holders[pos].1 = effective,
                    None => holders.push((txid, effective)),
                }
                trace!(txid, resource, mode = %effective, "lock granted");
                return Ok(());
            }

            state
                .waiting
                .insert(txid, (resource.to_string(), effective));
            if state.closes_cycle(txid) {
                state.waiting.remove(&txid);
                trace!(txid, resource, "deadlock detected, aborting requester");
                return Err(DbError::Deadlock {
                    txid,
                    resource: resource.to_string(),
                });
            }
            self.released
                .wait_for(&mut state, Duration::from_millis(100));
            state.waiting.remove(&txid);
        }
    }

    /// Release every lock held by `txid`, waking blocked requesters.
    pub fn release_all(&self, txid: u64) {
        let mut state = self.state.lock();
        state.waiting.remove(&txid);
        state.resources.retain(|_, holders| {
            holders.retain(|(id, _)| *id != txid);
            !holders.is_empty()
        });
        drop(state);
        self.released.notify_all();
    }

    /// Mode currently held by `txid` on `resource`, if any.
    pub fn held(&self, txid: u64, resource: &str) -> Option<LockMode> {
        let state = self.state.lock();
        state
            .resources
            .get(resource)?
            .iter()
            .find(|(id, _)| *id == txid)
            .map(|(_, mode)| *mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(IntentionShared.is_compatible(&IntentionExclusive));
        assert!(IntentionExclusive.is_compatible(&IntentionExclusive));
        assert!(Shared.is_compatible(&Shared));
        assert!(!Shared.is_compatible(&IntentionExclusive));
        assert!(!Exclusive.is_compatible(&IntentionShared));
        assert!(!Exclusive.is_compatible(&Exclusive));
    }

    #[test]
    fn strengthening_keeps_single_entry() {
        let locks = LockManager::new();
        locks.acquire(1, "a", LockMode::Shared).unwrap();
        locks.acquire(1, "a", LockMode::Exclusive).unwrap();
        assert_eq!(locks.held(1, "a"), Some(LockMode::Exclusive));
    }

    #[test]
    fn shared_holders_coexist() {
        let locks = LockManager::new();
        locks.acquire(1, "a", LockMode::Shared).unwrap();
        locks.acquire(2, "a", LockMode::Shared).unwrap();
        assert_eq!(locks.held(2, "a"), Some(LockMode::Shared));
    }

    #[test]
    fn blocked_acquire_resumes_after_release() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(1, "a", LockMode::Exclusive).unwrap();
        let contender = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(2, "a", LockMode::Exclusive))
        };
        thread::sleep(Duration::from_millis(50));
        locks.release_all(1);
        contender.join().unwrap().unwrap();
        assert_eq!(locks.held(2, "a"), Some(LockMode::Exclusive));
    }

    #[test]
    fn deadlock_aborts_exactly_one() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(1, "a", LockMode::Exclusive).unwrap();
        locks.acquire(2, "b", LockMode::Exclusive).unwrap();

        let crossing = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let blocked = locks.acquire(2, "a", LockMode::Exclusive);
                locks.release_all(2);
                blocked
            })
        };
        thread::sleep(Duration::from_millis(50));
        // Tx 1 closes the cycle and must be the victim.
        let result = locks.acquire(1, "b", LockMode::Exclusive);
        assert!(matches!(result, Err(DbError::Deadlock { txid: 1, .. })));
        locks.release_all(1);
        crossing.join().unwrap().unwrap();
    }
}
