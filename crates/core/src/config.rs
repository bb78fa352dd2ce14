//! Runtime configuration consumed from the operator's config-loading
//! collaborator, with `RUDDER_*` env overrides for the tunables.

use std::time::Duration;

use kube::core::{ApiResource, GroupVersionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

/// Typed description of the custom resource an operator manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub scope: ResourceScope,
}

impl CrdDescriptor {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// CRD object name (`<plural>.<group>`).
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        };
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }

    pub fn namespaced(&self) -> bool {
        self.scope == ResourceScope::Namespaced
    }
}

/// A dependent (owned) resource type whose changes re-trigger the owner.
///
/// Built-in kinds resolve from the process-wide type table; custom kinds must
/// declare their plural (and scope, when cluster-wide) explicitly, since
/// plurals are not derivable from the kind name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentDescriptor {
    /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment".
    pub gvk_key: String,
    /// Plural for types outside the built-in set.
    pub plural: Option<String>,
    pub scope: ResourceScope,
}

impl DependentDescriptor {
    pub fn new(gvk_key: impl Into<String>) -> Self {
        Self {
            gvk_key: gvk_key.into(),
            plural: None,
            scope: ResourceScope::Namespaced,
        }
    }

    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = Some(plural.into());
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.scope = ResourceScope::Cluster;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub namespace: String,
    /// Overrides the controller-supplied lease name when set.
    pub name: Option<String>,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name: None,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub operator_name: String,
    /// Empty means cluster-wide (or a single unscoped watch).
    pub watch_namespaces: Vec<String>,
    pub max_concurrent_reconciles: usize,
    pub max_concurrent_finalizers: usize,
    pub error_requeue_min: Duration,
    pub error_requeue_max: Duration,
    /// Delay before re-polling a watch stream after a transient error.
    pub watch_retry_delay: Duration,
    pub auto_register_finalizers: bool,
    pub manage_crds: bool,
    pub dependents: Vec<DependentDescriptor>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
    pub lease: LeaseConfig,
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> Self {
        Self {
            operator_name: operator_name.into(),
            watch_namespaces: Vec::new(),
            max_concurrent_reconciles: 4,
            max_concurrent_finalizers: 2,
            error_requeue_min: Duration::from_secs(1),
            error_requeue_max: Duration::from_secs(300),
            watch_retry_delay: Duration::from_secs(5),
            auto_register_finalizers: true,
            manage_crds: false,
            dependents: Vec::new(),
            field_selector: None,
            label_selector: None,
            lease: LeaseConfig::default(),
        }
    }

    /// Defaults with `RUDDER_*` env overrides applied.
    pub fn from_env(operator_name: impl Into<String>) -> Self {
        let mut cfg = Self::new(operator_name);
        if let Ok(ns) = std::env::var("RUDDER_WATCH_NAMESPACES") {
            cfg.watch_namespaces = ns
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        cfg.max_concurrent_reconciles =
            env_usize("RUDDER_MAX_CONCURRENT_RECONCILES", cfg.max_concurrent_reconciles);
        cfg.max_concurrent_finalizers =
            env_usize("RUDDER_MAX_CONCURRENT_FINALIZERS", cfg.max_concurrent_finalizers);
        cfg.error_requeue_min = env_secs("RUDDER_ERROR_REQUEUE_MIN_SECS", cfg.error_requeue_min);
        cfg.error_requeue_max = env_secs("RUDDER_ERROR_REQUEUE_MAX_SECS", cfg.error_requeue_max);
        cfg.watch_retry_delay = env_secs("RUDDER_WATCH_RETRY_SECS", cfg.watch_retry_delay);
        cfg.auto_register_finalizers =
            env_bool("RUDDER_AUTO_REGISTER_FINALIZERS", cfg.auto_register_finalizers);
        cfg.manage_crds = env_bool("RUDDER_MANAGE_CRDS", cfg.manage_crds);
        if let Ok(ns) = std::env::var("RUDDER_LEASE_NAMESPACE") {
            cfg.lease.namespace = ns;
        }
        cfg.lease.lease_duration = env_secs("RUDDER_LEASE_DURATION_SECS", cfg.lease.lease_duration);
        cfg.lease.renew_deadline = env_secs("RUDDER_LEASE_RENEW_SECS", cfg.lease.renew_deadline);
        cfg.lease.retry_period = env_secs("RUDDER_LEASE_RETRY_SECS", cfg.lease.retry_period);
        cfg
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
