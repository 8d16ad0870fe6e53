//! Set-granularity entry lock serializing procedures whose effects
//! intersect. Entries are 64-bit values, in practice shard IDs.

use std::collections::HashSet;

use parking_lot::Mutex;

/// A process-wide lock over an explicit set of entries.
///
/// `try_lock` is all-or-nothing: either every requested entry is acquired
/// or none is. `unlock` panics when asked to release an entry that is not
/// held — that is an integrity violation in the caller, not a recoverable
/// condition.
#[derive(Default)]
pub struct EntryLock {
    entries: Mutex<HashSet<u64>>,
}

impl EntryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all entries or none. Locking the empty set always succeeds:
    /// acquiring nothing cannot conflict with anything.
    pub fn try_lock(&self, locks: &[u64]) -> bool {
        let mut held = self.entries.lock();
        if locks.iter().any(|l| held.contains(l)) {
            return false;
        }
        held.extend(locks.iter().copied());
        true
    }

    /// Release previously acquired entries.
    ///
    /// # Panics
    ///
    /// Panics if any entry is not currently held.
    pub fn unlock(&self, locks: &[u64]) {
        let mut held = self.entries.lock();
        for lock in locks {
            if !held.contains(lock) {
                panic!("unlock of entry {lock} that is not held, held: {held:?}");
            }
        }
        for lock in locks {
            held.remove(lock);
        }
    }

    /// Number of currently held entries.
    pub fn held(&self) -> usize {
        self.entries.lock().len()
    }
}
