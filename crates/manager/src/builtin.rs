//! Process-wide table of built-in Kubernetes types, keyed the same way as
//! [`CrdDescriptor::gvk_key`]. Initialized once at startup and read-only
//! after; the cluster's built-in set does not change at runtime.

use once_cell::sync::OnceCell;
use std::collections::HashMap;

use kube::core::{ApiResource, GroupVersionKind};

use rudder_core::config::{CrdDescriptor, DependentDescriptor, ResourceScope};

#[derive(Debug, Clone, Copy)]
pub struct BuiltinType {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

static TABLE: OnceCell<HashMap<String, BuiltinType>> = OnceCell::new();

const BUILTINS: &[BuiltinType] = &[
    BuiltinType { group: "", version: "v1", kind: "Pod", plural: "pods", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "Service", plural: "services", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "ConfigMap", plural: "configmaps", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "Secret", plural: "secrets", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "ServiceAccount", plural: "serviceaccounts", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "PersistentVolumeClaim", plural: "persistentvolumeclaims", namespaced: true },
    BuiltinType { group: "", version: "v1", kind: "PersistentVolume", plural: "persistentvolumes", namespaced: false },
    BuiltinType { group: "", version: "v1", kind: "Namespace", plural: "namespaces", namespaced: false },
    BuiltinType { group: "", version: "v1", kind: "Node", plural: "nodes", namespaced: false },
    BuiltinType { group: "", version: "v1", kind: "Endpoints", plural: "endpoints", namespaced: true },
    BuiltinType { group: "apps", version: "v1", kind: "Deployment", plural: "deployments", namespaced: true },
    BuiltinType { group: "apps", version: "v1", kind: "StatefulSet", plural: "statefulsets", namespaced: true },
    BuiltinType { group: "apps", version: "v1", kind: "DaemonSet", plural: "daemonsets", namespaced: true },
    BuiltinType { group: "apps", version: "v1", kind: "ReplicaSet", plural: "replicasets", namespaced: true },
    BuiltinType { group: "batch", version: "v1", kind: "Job", plural: "jobs", namespaced: true },
    BuiltinType { group: "batch", version: "v1", kind: "CronJob", plural: "cronjobs", namespaced: true },
    BuiltinType { group: "networking.k8s.io", version: "v1", kind: "Ingress", plural: "ingresses", namespaced: true },
    BuiltinType { group: "networking.k8s.io", version: "v1", kind: "NetworkPolicy", plural: "networkpolicies", namespaced: true },
    BuiltinType { group: "rbac.authorization.k8s.io", version: "v1", kind: "Role", plural: "roles", namespaced: true },
    BuiltinType { group: "rbac.authorization.k8s.io", version: "v1", kind: "RoleBinding", plural: "rolebindings", namespaced: true },
    BuiltinType { group: "rbac.authorization.k8s.io", version: "v1", kind: "ClusterRole", plural: "clusterroles", namespaced: false },
    BuiltinType { group: "rbac.authorization.k8s.io", version: "v1", kind: "ClusterRoleBinding", plural: "clusterrolebindings", namespaced: false },
    BuiltinType { group: "policy", version: "v1", kind: "PodDisruptionBudget", plural: "poddisruptionbudgets", namespaced: true },
    BuiltinType { group: "autoscaling", version: "v2", kind: "HorizontalPodAutoscaler", plural: "horizontalpodautoscalers", namespaced: true },
];

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{version}/{kind}")
    } else {
        format!("{group}/{version}/{kind}")
    }
}

fn table() -> &'static HashMap<String, BuiltinType> {
    TABLE.get_or_init(|| {
        BUILTINS
            .iter()
            .map(|t| (gvk_key(t.group, t.version, t.kind), *t))
            .collect()
    })
}

pub fn lookup(key: &str) -> Option<BuiltinType> {
    table().get(key).copied()
}

/// Resolve a dependent to an [`ApiResource`] plus a namespaced flag. Built-in
/// kinds come from the table; anything else needs a declared plural on the
/// descriptor. Plurals are never guessed — "+s" is wrong for half the real
/// CRDs out there and a wrong plural watches a path that cannot exist.
pub fn resolve(dep: &DependentDescriptor) -> Option<(ApiResource, bool)> {
    if let Some(t) = lookup(&dep.gvk_key) {
        let gvk = GroupVersionKind {
            group: t.group.to_string(),
            version: t.version.to_string(),
            kind: t.kind.to_string(),
        };
        return Some((ApiResource::from_gvk_with_plural(&gvk, t.plural), t.namespaced));
    }
    let parts: Vec<&str> = dep.gvk_key.split('/').collect();
    let (group, version, kind) = match parts.as_slice() {
        [version, kind] => ("", *version, *kind),
        [group, version, kind] => (*group, *version, *kind),
        _ => return None,
    };
    let plural = dep.plural.as_deref()?;
    let gvk = GroupVersionKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
    };
    Some((
        ApiResource::from_gvk_with_plural(&gvk, plural),
        dep.scope == ResourceScope::Namespaced,
    ))
}

/// Matches a dependent key against the primary CRD, so operators can't
/// accidentally fan a CRD's own events back onto itself.
pub fn is_primary(key: &str, crd: &CrdDescriptor) -> bool {
    key == crd.gvk_key()
}
