//! Per-UID async mutex. Two workers handling events for the same resource
//! serialize on its UID; slots are reclaimed once the last guard drops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use rudder_core::Uid;

#[derive(Clone)]
struct Slot {
    lock: Arc<Mutex<()>>,
    refs: Arc<AtomicUsize>,
}

#[derive(Clone, Default)]
pub struct KeyedMutex {
    slots: Arc<DashMap<Uid, Slot>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live slots, for tests and introspection.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Acquire the lock for a UID, waiting if another holder is active.
    pub async fn lock(&self, uid: Uid) -> KeyedGuard {
        // Refcount goes up while the entry's shard lock is held, so a
        // concurrent drop cannot reclaim the slot between lookup and acquire.
        let slot = {
            let entry = self.slots.entry(uid).or_insert_with(|| Slot {
                lock: Arc::new(Mutex::new(())),
                refs: Arc::new(AtomicUsize::new(0)),
            });
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry.clone()
        };
        let guard = slot.lock.clone().lock_owned().await;
        KeyedGuard { _guard: guard, uid, slots: Arc::clone(&self.slots), refs: slot.refs }
    }
}

pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
    uid: Uid,
    slots: Arc<DashMap<Uid, Slot>>,
    refs: Arc<AtomicUsize>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.slots
                .remove_if(&self.uid, |_, slot| slot.refs.load(Ordering::SeqCst) == 0);
        }
    }
}
