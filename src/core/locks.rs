//! Transaction-scoped advisory locks keyed by a hash of a logical id.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Condvar, Mutex};

use hashbrown::HashSet;
use tracing::debug;

use crate::persist::{PersistError, PersistResult};

/// Hashed lock key. Distinct ids may collide; a collision only
/// over-serializes, it never lets two holders in at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(pub u64);

impl LockKey {
    /// Derives the key for a reservation (or any other string id).
    pub fn for_id(id: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// In-process registry of held keys.
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl AdvisoryLocks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, then holds it until the guard drops.
    pub fn acquire(&self, key: LockKey) -> PersistResult<AdvisoryGuard<'_>> {
        let mut held = self.held.lock().map_err(|_| PersistError::Poisoned)?;
        while held.contains(&key) {
            debug!(key = key.0, "waiting on advisory lock");
            held = self
                .released
                .wait(held)
                .map_err(|_| PersistError::Poisoned)?;
        }
        held.insert(key);
        Ok(AdvisoryGuard { locks: self, key })
    }

    #[cfg(test)]
    fn is_held(&self, key: LockKey) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&key))
            .unwrap_or(false)
    }
}

/// Releases its key on drop, after the surrounding transaction ends.
#[derive(Debug)]
pub struct AdvisoryGuard<'a> {
    locks: &'a AdvisoryLocks,
    key: LockKey,
}

impl Drop for AdvisoryGuard<'_> {
    fn drop(&mut self) {
        // A poisoned set still has to forget the key or waiters hang forever.
        let mut held = match self.locks.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_all();
    }
}
