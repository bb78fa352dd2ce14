//! Rudder core types: resource identities, snapshots, watch events and the
//! controller/finalizer contracts the runtime invokes.

#![forbid(unsafe_code)]

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub mod config;
pub mod contract;

pub use config::{CrdDescriptor, DependentDescriptor, LeaseConfig, OperatorConfig, ResourceScope};
pub use contract::{Controller, ErrorDecision, FinalizerRegistry, NoFinalizers, Requeue};

/// Cluster-unique, update-stable resource identity (`metadata.uid`).
pub type Uid = [u8; 16];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("access denied for {verb} on {plural}: grant list/watch to the operator service account via RBAC ({detail})")]
    Permission {
        verb: String,
        plural: String,
        detail: String,
    },
    #[error("kubernetes api: {0}")]
    Api(#[from] kube::Error),
    #[error("watch stream desynchronized: {0}")]
    WatchDesync(String),
    #[error("object missing metadata.uid")]
    MissingUid,
    #[error("invalid metadata.uid {0:?}")]
    InvalidUid(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lease conflict: {0}")]
    LeaseConflict(String),
    #[error(transparent)]
    Controller(#[from] anyhow::Error),
}

/// Parse `metadata.uid` into the binary key used by the queue and cache.
pub fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).map_err(|_| Error::InvalidUid(uid_str.to_string()))?;
    Ok(*u.as_bytes())
}

pub fn uid_string(uid: &Uid) -> String {
    Uuid::from_bytes(*uid).to_string()
}

/// Human-readable secondary key; all dedup/lookup is by `uid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub uid: Uid,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub uid: Uid,
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// Parsed view of one observed object. `raw` keeps the full JSON (minus
/// `managedFields`) for whole-object diffing.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: ResourceId,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub finalizers: Vec<String>,
    pub status: Option<Value>,
    pub owners: Vec<OwnerRef>,
    pub raw: Value,
}

impl Snapshot {
    /// Build a snapshot from the serialized form of a watched object.
    pub fn from_json(kind: &str, mut raw: Value) -> Result<Self> {
        strip_managed_fields(&mut raw);
        let meta = raw.get("metadata").cloned().unwrap_or(Value::Null);
        let uid_str = meta.get("uid").and_then(Value::as_str).ok_or(Error::MissingUid)?;
        let uid = to_uid(uid_str)?;
        let name = meta.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let namespace = meta.get("namespace").and_then(Value::as_str).map(str::to_string);
        let resource_version = meta
            .get("resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        let generation = meta.get("generation").and_then(Value::as_i64);
        let deletion_timestamp = meta
            .get("deletionTimestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let finalizers = meta
            .get("finalizers")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let owners = meta
            .get("ownerReferences")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(parse_owner_ref).collect())
            .unwrap_or_default();
        let status = raw.get("status").cloned();

        Ok(Self {
            id: ResourceId {
                uid,
                kind: kind.to_string(),
                namespace,
                name,
            },
            resource_version,
            generation,
            deletion_timestamp,
            finalizers,
            status,
            owners,
            raw,
        })
    }

    /// Build a snapshot from a dynamic object off a watch stream.
    pub fn from_dynamic(kind: &str, obj: &kube::core::DynamicObject) -> Result<Self> {
        Self::from_json(kind, serde_json::to_value(obj)?)
    }

    pub fn uid(&self) -> Uid {
        self.id.uid
    }

    /// Whole-object view with volatile metadata removed, for "did anything
    /// observable change" diffs. A bare resourceVersion bump must not count.
    pub fn comparable(&self) -> Value {
        let mut v = self.raw.clone();
        if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }
        v
    }
}

fn parse_owner_ref(v: &Value) -> Option<OwnerRef> {
    let uid = to_uid(v.get("uid")?.as_str()?).ok()?;
    Some(OwnerRef {
        uid,
        kind: v.get("kind")?.as_str()?.to_string(),
        name: v.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        controller: v.get("controller").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

/// Classification of a `Modified` event against the cached snapshot.
/// Exactly one applies; deletion-timestamp presence takes precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedKind {
    /// Spec or any other observable field changed; triggers reconcile.
    Other,
    /// Deletion timestamp newly set; routes to the finalizer pipeline.
    Finalizing,
    /// Only the status subresource changed.
    StatusUpdate,
    /// Only the finalizer list changed; no action.
    FinalizerUpdate,
    /// resourceVersion bump with no observable diff; ignored.
    NoChanges,
}

/// One unit of work: consumed exactly once by a worker, replaced (never
/// mutated in place) on requeue with an incremented attempt.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub snapshot: Snapshot,
    pub attempt: u32,
    pub created_at: Instant,
    pub modified: ModifiedKind,
    pub force: bool,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, snapshot: Snapshot, modified: ModifiedKind) -> Self {
        Self {
            kind,
            snapshot,
            attempt: 0,
            created_at: Instant::now(),
            modified,
            force: false,
        }
    }

    /// Synthetic event re-triggering the owner of a changed dependent.
    pub fn forced(snapshot: Snapshot) -> Self {
        Self {
            force: true,
            ..Self::new(WatchEventKind::Modified, snapshot, ModifiedKind::Other)
        }
    }

    pub fn uid(&self) -> Uid {
        self.snapshot.uid()
    }

    /// Replacement event for a retry pass.
    pub fn retry(&self, attempt: u32, kind: WatchEventKind) -> Self {
        Self {
            kind,
            snapshot: self.snapshot.clone(),
            attempt,
            created_at: Instant::now(),
            modified: self.modified,
            force: self.force,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(uid: &str) -> Value {
        json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": {
                "uid": uid,
                "name": "w1",
                "namespace": "default",
                "resourceVersion": "41",
                "generation": 3,
                "finalizers": ["example.io/cleanup"],
                "managedFields": [{"manager": "kubectl"}],
                "ownerReferences": [{
                    "apiVersion": "example.io/v1",
                    "kind": "Gadget",
                    "name": "g1",
                    "uid": "9f6f0566-9b54-4f17-9b09-3b1e1dbe024c",
                    "controller": true
                }]
            },
            "spec": {"replicas": 2},
            "status": {"phase": "Ready"}
        })
    }

    #[test]
    fn snapshot_parses_metadata() {
        let s = Snapshot::from_json("Widget", obj("bd8507f5-e761-4e70-b711-7e01ee33c71c")).unwrap();
        assert_eq!(s.id.name, "w1");
        assert_eq!(s.id.namespace.as_deref(), Some("default"));
        assert_eq!(s.resource_version.as_deref(), Some("41"));
        assert_eq!(s.generation, Some(3));
        assert_eq!(s.finalizers, vec!["example.io/cleanup".to_string()]);
        assert_eq!(s.status, Some(json!({"phase": "Ready"})));
        assert_eq!(s.owners.len(), 1);
        assert!(s.owners[0].controller);
        assert_eq!(s.owners[0].kind, "Gadget");
        assert_eq!(uid_string(&s.uid()), "bd8507f5-e761-4e70-b711-7e01ee33c71c");
    }

    #[test]
    fn snapshot_strips_managed_fields() {
        let s = Snapshot::from_json("Widget", obj("bd8507f5-e761-4e70-b711-7e01ee33c71c")).unwrap();
        assert!(s.raw["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn comparable_ignores_resource_version() {
        let a = Snapshot::from_json("Widget", obj("bd8507f5-e761-4e70-b711-7e01ee33c71c")).unwrap();
        let mut bumped = obj("bd8507f5-e761-4e70-b711-7e01ee33c71c");
        bumped["metadata"]["resourceVersion"] = json!("42");
        let b = Snapshot::from_json("Widget", bumped).unwrap();
        assert_ne!(a.resource_version, b.resource_version);
        assert_eq!(a.comparable(), b.comparable());
    }

    #[test]
    fn missing_uid_is_an_error() {
        let res = Snapshot::from_json("Widget", json!({"metadata": {"name": "w1"}}));
        assert!(matches!(res, Err(Error::MissingUid)));
    }

    #[test]
    fn retry_replaces_instead_of_mutating() {
        let s = Snapshot::from_json("Widget", obj("bd8507f5-e761-4e70-b711-7e01ee33c71c")).unwrap();
        let ev = WatchEvent::new(WatchEventKind::Modified, s, ModifiedKind::Other);
        let next = ev.retry(ev.attempt + 1, WatchEventKind::Modified);
        assert_eq!(ev.attempt, 0);
        assert_eq!(next.attempt, 1);
        assert!(next.created_at >= ev.created_at);
    }
}
