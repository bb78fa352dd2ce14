//! Worker-side event dispatch. Runs inside the queue's worker pools under a
//! per-UID lock, upserts the cache for the authoritative classification, and
//! routes to the controller or finalizer contract.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::Label;
use tracing::{debug, error, warn};

use rudder_cache::ResourceCache;
use rudder_core::{Controller, FinalizerRegistry, ModifiedKind, WatchEvent, WatchEventKind};
use rudder_queue::{EventHandler, EventQueue, KeyedMutex};

pub struct Dispatcher {
    cache: Arc<ResourceCache>,
    queue: Arc<EventQueue>,
    locks: KeyedMutex,
    controller: Arc<dyn Controller>,
    finalizers: Arc<dyn FinalizerRegistry>,
    auto_register_finalizers: bool,
    labels: Vec<Label>,
}

enum Stage {
    Reconcile,
    Finalize,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<ResourceCache>,
        queue: Arc<EventQueue>,
        controller: Arc<dyn Controller>,
        finalizers: Arc<dyn FinalizerRegistry>,
        auto_register_finalizers: bool,
        labels: Vec<Label>,
    ) -> Self {
        Self {
            cache,
            queue,
            locks: KeyedMutex::new(),
            controller,
            finalizers,
            auto_register_finalizers,
            labels,
        }
    }

    async fn dispatch(&self, event: WatchEvent) {
        let uid = event.uid();
        match event.kind {
            WatchEventKind::Bookmark | WatchEventKind::Error => return,
            WatchEventKind::Deleted => {
                // The resource is gone; failures here are logged, not retried.
                if let Err(err) = self.controller.deleted(&event.snapshot).await {
                    error!(resource = %event.snapshot.id, error = %err, "deleted handler failed");
                }
                self.cache.remove(&uid);
                return;
            }
            WatchEventKind::Added | WatchEventKind::Modified => {}
        }

        let (prev, classified) = self.cache.upsert(event.snapshot.clone());
        let effective = if event.force {
            // Synthetic owner re-trigger: full reconcile even with no diff.
            ModifiedKind::Other
        } else if event.snapshot.deletion_timestamp.is_some() && classified == ModifiedKind::Other {
            // First-seen (or requeued-after-eviction) while mid-deletion
            // still belongs to the cleanup path.
            ModifiedKind::Finalizing
        } else {
            classified
        };

        match effective {
            ModifiedKind::Other => self.reconcile(event).await,
            ModifiedKind::Finalizing => self.finalize(event).await,
            ModifiedKind::StatusUpdate => {
                let differs = prev
                    .map(|p| p.status != event.snapshot.status)
                    .unwrap_or(true);
                if differs {
                    if let Err(err) = self.controller.status_modified(&event.snapshot).await {
                        error!(resource = %event.snapshot.id, error = %err, "status handler failed");
                    }
                }
            }
            ModifiedKind::FinalizerUpdate | ModifiedKind::NoChanges => {
                debug!(resource = %event.snapshot.id, ?effective, "no action");
            }
        }
    }

    async fn reconcile(&self, event: WatchEvent) {
        if self.auto_register_finalizers && event.snapshot.deletion_timestamp.is_none() {
            if let Err(err) = self.finalizers.register_all(&event.snapshot).await {
                self.handle_error(Stage::Reconcile, event, err).await;
                return;
            }
        }
        match self.controller.reconcile(&event.snapshot).await {
            Ok(None) => {}
            Ok(Some(requeue)) => {
                // Evict so the next pass sees fresh watch-sourced state.
                self.cache.remove(&event.uid());
                self.queue.requeue(event, requeue.delay, Some(requeue.kind));
            }
            Err(err) => self.handle_error(Stage::Reconcile, event, err).await,
        }
    }

    async fn finalize(&self, event: WatchEvent) {
        let uid = event.uid();
        if !self.cache.set_finalizing(&uid) {
            debug!(resource = %event.snapshot.id, "finalizer run already in flight");
            return;
        }
        let outcome = self.finalizers.finalize(&event.snapshot).await;
        self.cache.clear_finalizing(&uid);
        if let Err(err) = outcome {
            self.handle_error(Stage::Finalize, event, err).await;
        }
    }

    async fn handle_error(&self, stage: Stage, event: WatchEvent, err: rudder_core::Error) {
        match stage {
            Stage::Reconcile => {
                metrics::counter!("reconcile_errors_total", 1, self.labels.clone())
            }
            Stage::Finalize => metrics::counter!("finalize_errors_total", 1, self.labels.clone()),
        }
        let decision = self
            .controller
            .error_policy(&event.snapshot, event.attempt, &err)
            .await;
        if decision.requeue {
            warn!(
                resource = %event.snapshot.id,
                attempt = event.attempt,
                error = %err,
                "handler failed; requeueing"
            );
            self.cache.remove(&event.uid());
            self.queue.requeue(event, decision.delay, Some(decision.kind));
        } else {
            error!(
                resource = %event.snapshot.id,
                attempt = event.attempt,
                error = %err,
                "handler failed; dropping per error policy"
            );
        }
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    async fn handle(&self, event: WatchEvent) {
        let _guard = self.locks.lock(event.uid()).await;
        // A panic escaping the critical section would leave cache/queue state
        // suspect; fail loud instead of limping on.
        if AssertUnwindSafe(self.dispatch(event))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("panic inside the per-resource critical section; aborting process");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::{Error, ErrorDecision, Requeue, Result, Snapshot};
    use rudder_queue::{QueueChannels, QueueLabels, WorkerPools};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const UID: &str = "bd8507f5-e761-4e70-b711-7e01ee33c71c";

    fn obj(rv: &str) -> Value {
        json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": {
                "uid": UID,
                "name": "w1",
                "namespace": "default",
                "resourceVersion": rv,
            },
            "spec": {"size": rv.parse::<i64>().unwrap_or(0)},
            "status": {"phase": "Pending"}
        })
    }

    fn snap(v: Value) -> Snapshot {
        Snapshot::from_json("Widget", v).unwrap()
    }

    #[derive(Default)]
    struct Recording {
        reconciles: AtomicU32,
        fail_first: AtomicU32,
        deletes: AtomicU32,
        status_calls: AtomicU32,
        policy_attempts: Mutex<Vec<u32>>,
        policy_delay: Option<Duration>,
        requeue_once: AtomicU32,
    }

    #[async_trait]
    impl Controller for Recording {
        async fn reconcile(&self, _resource: &Snapshot) -> Result<Option<Requeue>> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Controller(anyhow::anyhow!("converge failed")));
            }
            if self.requeue_once.swap(0, Ordering::SeqCst) > 0 {
                return Ok(Some(Requeue::after(Duration::from_millis(20))));
            }
            Ok(None)
        }

        async fn deleted(&self, _resource: &Snapshot) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status_modified(&self, _resource: &Snapshot) -> Result<()> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn error_policy(
            &self,
            _resource: &Snapshot,
            attempt: u32,
            _error: &Error,
        ) -> ErrorDecision {
            self.policy_attempts.lock().unwrap().push(attempt);
            match self.policy_delay {
                Some(d) => ErrorDecision::retry_after(d),
                None => ErrorDecision::give_up(),
            }
        }
    }

    struct Fixture {
        cache: Arc<ResourceCache>,
        queue: Arc<EventQueue>,
        controller: Arc<Recording>,
        pools: WorkerPools,
    }

    fn start(controller: Recording) -> Fixture {
        let labels = QueueLabels {
            operator: "test-op".into(),
            controller: "widget".into(),
            kind: "Widget".into(),
            group: "example.io".into(),
            version: "v1".into(),
        };
        let (queue, channels): (Arc<EventQueue>, QueueChannels) =
            EventQueue::new(labels, Duration::from_millis(10), Duration::from_secs(1));
        let cache = Arc::new(ResourceCache::new());
        let controller = Arc::new(controller);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&controller) as Arc<dyn Controller>,
            Arc::new(rudder_core::NoFinalizers),
            true,
            Vec::new(),
        ));
        let pools = WorkerPools::start(Arc::clone(&queue), channels, dispatcher, 2, 1);
        Fixture { cache, queue, controller, pools }
    }

    #[tokio::test]
    async fn added_event_reconciles_once_and_drains() {
        let fx = start(Recording::default());
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(fx.queue.depth(), 0);
        assert_eq!(fx.cache.len(), 1);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reconcile_retries_with_incremented_attempt() {
        let fx = start(Recording {
            fail_first: AtomicU32::new(2),
            policy_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        // two failures then success
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 3);
        assert_eq!(*fx.controller.policy_attempts.lock().unwrap(), vec![0, 1]);
        assert_eq!(fx.queue.depth(), 0);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn error_policy_can_drop() {
        let fx = start(Recording {
            fail_first: AtomicU32::new(1),
            policy_delay: None,
            ..Default::default()
        });
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(fx.queue.depth(), 0);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn status_only_change_skips_reconcile() {
        let fx = start(Recording::default());
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut v = obj("1");
        v["metadata"]["resourceVersion"] = json!("2");
        v["status"]["phase"] = json!("Ready");
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Modified,
            snap(v),
            ModifiedKind::StatusUpdate,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(fx.controller.status_calls.load(Ordering::SeqCst), 1);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn controller_requested_requeue_runs_again() {
        let fx = start(Recording {
            requeue_once: AtomicU32::new(1),
            ..Default::default()
        });
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 2);
        assert_eq!(fx.queue.depth(), 0);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn deleted_event_calls_deleted_and_evicts() {
        let fx = start(Recording::default());
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Deleted,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.controller.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.cache.len(), 0);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn forced_event_reconciles_despite_no_diff() {
        let fx = start(Recording::default());
        fx.queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.queue.enqueue(WatchEvent::forced(snap(obj("1"))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.controller.reconciles.load(Ordering::SeqCst), 2);
        fx.pools.shutdown().await;
    }

    #[tokio::test]
    async fn finalizing_event_runs_finalizers_not_reconcile() {
        struct CountingFinalizers(AtomicU32);
        #[async_trait]
        impl FinalizerRegistry for CountingFinalizers {
            async fn register_all(&self, _resource: &Snapshot) -> Result<()> {
                Ok(())
            }
            async fn finalize(&self, _resource: &Snapshot) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let labels = QueueLabels {
            operator: "test-op".into(),
            controller: "widget".into(),
            kind: "Widget".into(),
            group: "example.io".into(),
            version: "v1".into(),
        };
        let (queue, channels) =
            EventQueue::new(labels, Duration::from_millis(10), Duration::from_secs(1));
        let cache = Arc::new(ResourceCache::new());
        let controller = Arc::new(Recording::default());
        let finalizers = Arc::new(CountingFinalizers(AtomicU32::new(0)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&controller) as Arc<dyn Controller>,
            Arc::clone(&finalizers) as Arc<dyn FinalizerRegistry>,
            true,
            Vec::new(),
        ));
        let pools = WorkerPools::start(Arc::clone(&queue), channels, dispatcher, 2, 1);

        queue.enqueue(WatchEvent::new(
            WatchEventKind::Added,
            snap(obj("1")),
            ModifiedKind::Other,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut v = obj("1");
        v["metadata"]["resourceVersion"] = json!("2");
        v["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
        queue.enqueue(WatchEvent::new(
            WatchEventKind::Modified,
            snap(v),
            ModifiedKind::Finalizing,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finalizers.0.load(Ordering::SeqCst), 1);
        assert_eq!(controller.reconciles.load(Ordering::SeqCst), 1);
        pools.shutdown().await;
    }
}
