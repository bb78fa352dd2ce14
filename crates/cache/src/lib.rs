//! UID-keyed cache of last-observed snapshots, used to classify incoming
//! watch events by diffing against the previous state.
//!
//! The cache reflects the last event handed to a worker, not merely received
//! from the watch, so handlers observe monotonically-advancing state per
//! resource.

#![forbid(unsafe_code)]

use dashmap::DashMap;
use tracing::trace;

use rudder_core::{ModifiedKind, Snapshot, Uid};

struct Entry {
    snapshot: Snapshot,
    /// A finalizer run is currently in flight for this resource. Distinct
    /// from the Kubernetes finalizer list; guards against duplicate runs.
    finalizing: bool,
}

#[derive(Default)]
pub struct ResourceCache {
    entries: DashMap<Uid, Entry>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn get(&self, uid: &Uid) -> Option<Snapshot> {
        self.entries.get(uid).map(|e| e.snapshot.clone())
    }

    /// Insert or overwrite the cached snapshot. Returns the previous snapshot
    /// (None when first seen) and the classification of the change.
    pub fn upsert(&self, snapshot: Snapshot) -> (Option<Snapshot>, ModifiedKind) {
        let uid = snapshot.uid();
        match self.entries.get_mut(&uid) {
            Some(mut entry) => {
                let kind = classify(Some(&entry.snapshot), &snapshot);
                let prev = std::mem::replace(&mut entry.snapshot, snapshot);
                trace!(resource = %prev.id, ?kind, "cache upsert");
                (Some(prev), kind)
            }
            None => {
                trace!(resource = %snapshot.id, "cache insert");
                self.entries.insert(uid, Entry { snapshot, finalizing: false });
                (None, ModifiedKind::Other)
            }
        }
    }

    /// Read-only classification against the cached snapshot.
    pub fn compare(&self, snapshot: &Snapshot) -> ModifiedKind {
        match self.entries.get(&snapshot.uid()) {
            Some(entry) => classify(Some(&entry.snapshot), snapshot),
            None => ModifiedKind::Other,
        }
    }

    /// Evict by UID; no-op when absent.
    pub fn remove(&self, uid: &Uid) {
        self.entries.remove(uid);
    }

    pub fn is_finalizing(&self, uid: &Uid) -> bool {
        self.entries.get(uid).map(|e| e.finalizing).unwrap_or(false)
    }

    /// Mark a finalizer run in flight. Returns false if one already was,
    /// so callers can skip duplicate concurrent runs.
    pub fn set_finalizing(&self, uid: &Uid) -> bool {
        match self.entries.get_mut(uid) {
            Some(entry) if entry.finalizing => false,
            Some(mut entry) => {
                entry.finalizing = true;
                true
            }
            None => false,
        }
    }

    pub fn clear_finalizing(&self, uid: &Uid) {
        if let Some(mut entry) = self.entries.get_mut(uid) {
            entry.finalizing = false;
        }
    }
}

/// Classification ladder. Deletion-timestamp presence wins; a resourceVersion
/// bump with no observable diff is `NoChanges`. First-seen is always `Other`.
pub fn classify(prev: Option<&Snapshot>, next: &Snapshot) -> ModifiedKind {
    let Some(prev) = prev else {
        return ModifiedKind::Other;
    };
    if next.deletion_timestamp.is_some() && prev.deletion_timestamp.is_none() {
        return ModifiedKind::Finalizing;
    }
    if prev.status != next.status {
        return ModifiedKind::StatusUpdate;
    }
    if prev.finalizers != next.finalizers {
        return ModifiedKind::FinalizerUpdate;
    }
    if prev.resource_version != next.resource_version && prev.comparable() != next.comparable() {
        return ModifiedKind::Other;
    }
    ModifiedKind::NoChanges
}
