//! Contracts implemented by operator authors. The runtime owns scheduling,
//! dedup and retries; these traits only see fully-classified snapshots.

use std::time::Duration;

use async_trait::async_trait;

use crate::{Result, Snapshot, WatchEventKind};

/// A controller-requested follow-up pass after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requeue {
    /// None lets the queue pick the attempt-scaled default.
    pub delay: Option<Duration>,
    pub kind: WatchEventKind,
}

impl Requeue {
    pub fn after(delay: Duration) -> Self {
        Self { delay: Some(delay), kind: WatchEventKind::Modified }
    }

    pub fn backoff() -> Self {
        Self { delay: None, kind: WatchEventKind::Modified }
    }
}

/// Outcome of the controller's error policy for a failed handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDecision {
    pub requeue: bool,
    pub delay: Option<Duration>,
    pub kind: WatchEventKind,
}

impl ErrorDecision {
    /// Retry with the queue's attempt-scaled default backoff.
    pub fn retry() -> Self {
        Self { requeue: true, delay: None, kind: WatchEventKind::Modified }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self { requeue: true, delay: Some(delay), kind: WatchEventKind::Modified }
    }

    pub fn give_up() -> Self {
        Self { requeue: false, delay: None, kind: WatchEventKind::Modified }
    }
}

/// Operator-author callbacks invoked by the runtime. Reconcile must be
/// idempotent; the runtime may deliver the same state more than once.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Converge real-world state toward the resource's spec. Returning a
    /// [`Requeue`] schedules another pass from fresh watch-sourced state.
    async fn reconcile(&self, resource: &Snapshot) -> Result<Option<Requeue>>;

    /// The resource is gone from the cluster. Failures are logged, not retried.
    async fn deleted(&self, resource: &Snapshot) -> Result<()>;

    /// Only the status subresource changed.
    async fn status_modified(&self, resource: &Snapshot) -> Result<()> {
        let _ = resource;
        Ok(())
    }

    /// Decide retry-vs-drop for a failed reconcile/finalize call.
    async fn error_policy(
        &self,
        resource: &Snapshot,
        attempt: u32,
        error: &crate::Error,
    ) -> ErrorDecision {
        let _ = (resource, attempt, error);
        ErrorDecision::retry()
    }

    async fn on_promotion(&self) -> Result<()> {
        Ok(())
    }

    async fn on_demotion(&self) {}

    async fn on_new_leader(&self, identity: &str) {
        let _ = identity;
    }

    /// Lease object name; defaults to a name derived from the CRD.
    fn lease_name(&self) -> Option<String> {
        None
    }

    fn field_selector(&self) -> Option<String> {
        None
    }

    fn label_selector(&self) -> Option<String> {
        None
    }
}

/// Finalizer coordination, implemented by the finalizer-manager collaborator.
#[async_trait]
pub trait FinalizerRegistry: Send + Sync + 'static {
    /// Attach all registered finalizers to a live resource.
    async fn register_all(&self, resource: &Snapshot) -> Result<()>;

    /// Run registered finalizers for a resource being deleted.
    async fn finalize(&self, resource: &Snapshot) -> Result<()>;
}

/// Registry for controllers that declare no finalizers.
pub struct NoFinalizers;

#[async_trait]
impl FinalizerRegistry for NoFinalizers {
    async fn register_all(&self, _resource: &Snapshot) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _resource: &Snapshot) -> Result<()> {
        Ok(())
    }
}
