//! Rudder event queue: per-UID dedup with supersession, two bounded worker
//! pools fed by unbounded UID channels, and delayed requeue with capped
//! backoff.
//!
//! At most one live entry exists per UID. Inserting for an occupied UID is
//! rejected; callers supersede by dequeuing first, which cancels the prior
//! entry's token (most recent definition of work wins, stale retries are
//! abandoned).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::Label;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rudder_core::{uid_string, ModifiedKind, Uid, WatchEvent, WatchEventKind};

mod lock;
mod workers;

pub use lock::{KeyedGuard, KeyedMutex};
pub use workers::{EventHandler, WorkerPools};

/// Stable metric label set: {operator, controller, kind, group, version}.
#[derive(Debug, Clone)]
pub struct QueueLabels {
    pub operator: String,
    pub controller: String,
    pub kind: String,
    pub group: String,
    pub version: String,
}

impl QueueLabels {
    fn to_vec(&self) -> Vec<Label> {
        vec![
            Label::new("operator", self.operator.clone()),
            Label::new("controller", self.controller.clone()),
            Label::new("kind", self.kind.clone()),
            Label::new("group", self.group.clone()),
            Label::new("version", self.version.clone()),
        ]
    }
}

struct InFlight {
    event: WatchEvent,
    cancel: CancellationToken,
    /// False while a deferred requeue waits out its delay; [`EventQueue::take`]
    /// skips entries that are not yet due.
    ready: bool,
}

/// Receiver halves of the two UID channels, consumed by [`WorkerPools`].
pub struct QueueChannels {
    pub reconcile_rx: mpsc::UnboundedReceiver<Uid>,
    pub finalize_rx: mpsc::UnboundedReceiver<Uid>,
}

pub struct EventQueue {
    inflight: DashMap<Uid, InFlight>,
    reconcile_tx: mpsc::UnboundedSender<Uid>,
    finalize_tx: mpsc::UnboundedSender<Uid>,
    min_requeue: Duration,
    max_requeue: Duration,
    labels: QueueLabels,
}

impl EventQueue {
    pub fn new(
        labels: QueueLabels,
        min_requeue: Duration,
        max_requeue: Duration,
    ) -> (Arc<Self>, QueueChannels) {
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            inflight: DashMap::new(),
            reconcile_tx,
            finalize_tx,
            min_requeue,
            max_requeue,
            labels,
        });
        (queue, QueueChannels { reconcile_rx, finalize_rx })
    }

    /// Queued-or-scheduled entries (events handed to workers have left).
    pub fn depth(&self) -> usize {
        self.inflight.len()
    }

    /// Queue an event unless one is already tracked for the UID. Finalizing
    /// events route to the finalizer channel, everything else to reconcile.
    pub fn enqueue(&self, event: WatchEvent) -> bool {
        let uid = event.uid();
        match self.inflight.entry(uid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(uid = %uid_string(&uid), "event already queued; skipping enqueue");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let modified = event.modified;
                slot.insert(InFlight { event, cancel: CancellationToken::new(), ready: true });
                self.inc_adds();
                self.update_depth();
                self.dispatch(uid, modified);
                true
            }
        }
    }

    /// Cancel and remove the tracked entry; idempotent when absent.
    pub fn dequeue(&self, uid: &Uid) {
        if let Some((_, inflight)) = self.inflight.remove(uid) {
            inflight.cancel.cancel();
            self.update_depth();
        }
    }

    /// Supersede any tracked entry and schedule a retry pass. Without an
    /// explicit delay the attempt-scaled default applies; a zero delay
    /// re-enqueues immediately.
    pub fn requeue(
        self: &Arc<Self>,
        event: WatchEvent,
        delay: Option<Duration>,
        kind: Option<WatchEventKind>,
    ) {
        let uid = event.uid();
        let token = CancellationToken::new();
        // Single entry operation: a concurrent enqueue cannot land between a
        // removal and the insert, so no entry is ever orphaned uncancelled.
        // Supersession keeps the most recently created value.
        let (next, delay) = match self.inflight.entry(uid) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.get().cancel.cancel();
                let base = if slot.get().event.created_at > event.created_at {
                    slot.get().event.clone()
                } else {
                    event
                };
                let next = base.retry(base.attempt + 1, kind.unwrap_or(base.kind));
                let delay = delay.unwrap_or_else(|| self.backoff_delay(next.attempt));
                slot.insert(InFlight {
                    event: next.clone(),
                    cancel: token.clone(),
                    ready: delay.is_zero(),
                });
                (next, delay)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let next = event.retry(event.attempt + 1, kind.unwrap_or(event.kind));
                let delay = delay.unwrap_or_else(|| self.backoff_delay(next.attempt));
                slot.insert(InFlight {
                    event: next.clone(),
                    cancel: token.clone(),
                    ready: delay.is_zero(),
                });
                (next, delay)
            }
        };
        self.inc_retries();
        self.update_depth();

        let modified = next.modified;
        if delay.is_zero() {
            self.dispatch(uid, modified);
        } else {
            debug!(
                uid = %uid_string(&uid),
                delay_ms = delay.as_millis() as u64,
                "deferred requeue scheduled"
            );
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if !token.is_cancelled() {
                            queue.mark_ready(&uid);
                            queue.dispatch(uid, modified);
                        }
                    }
                }
            });
        }
    }

    fn mark_ready(&self, uid: &Uid) {
        if let Some(mut entry) = self.inflight.get_mut(uid) {
            entry.ready = true;
        }
    }

    /// Prune a queued-but-not-yet-run entry that a newer generation of the
    /// same resource has made stale.
    pub fn notify(&self, event: &WatchEvent) {
        let uid = event.uid();
        let stale = match self.inflight.get(&uid) {
            Some(entry) => match (entry.event.snapshot.generation, event.snapshot.generation) {
                (Some(queued), Some(seen)) => seen > queued,
                _ => {
                    entry.event.snapshot.resource_version != event.snapshot.resource_version
                        && event.created_at >= entry.event.created_at
                }
            },
            None => false,
        };
        if stale {
            debug!(uid = %uid_string(&uid), "pruning stale queued event");
            self.dequeue(&uid);
        }
    }

    /// Worker pickup: claim the live event for a UID. Entries superseded or
    /// cancelled between enqueue and pickup yield None and are skipped, and
    /// deferred retries still waiting out their delay are left in place.
    pub fn take(&self, uid: &Uid) -> Option<WatchEvent> {
        let (_, inflight) = self.inflight.remove_if(uid, |_, entry| entry.ready)?;
        self.update_depth();
        if inflight.cancel.is_cancelled() {
            return None;
        }
        self.observe_queue_wait(inflight.event.created_at.elapsed());
        Some(inflight.event)
    }

    /// Default error backoff: linear in attempt, capped at the configured
    /// maximum. Attempt 0 re-enqueues immediately.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.min_requeue.saturating_mul(attempt).min(self.max_requeue)
    }

    fn dispatch(&self, uid: Uid, modified: ModifiedKind) {
        let tx = if modified == ModifiedKind::Finalizing {
            &self.finalize_tx
        } else {
            &self.reconcile_tx
        };
        if tx.send(uid).is_err() {
            warn!(uid = %uid_string(&uid), "worker channel closed; dropping dispatch");
        }
    }

    fn inc_adds(&self) {
        metrics::counter!("workqueue_adds_total", 1, self.labels.to_vec());
    }

    fn inc_retries(&self) {
        metrics::counter!("workqueue_retries_total", 1, self.labels.to_vec());
    }

    fn update_depth(&self) {
        metrics::gauge!("workqueue_depth", self.inflight.len() as f64, self.labels.to_vec());
    }

    fn observe_queue_wait(&self, wait: Duration) {
        metrics::histogram!(
            "workqueue_queue_duration_seconds",
            wait.as_secs_f64(),
            self.labels.to_vec()
        );
    }

    pub(crate) fn observe_work(&self, took: Duration) {
        metrics::histogram!(
            "workqueue_work_duration_seconds",
            took.as_secs_f64(),
            self.labels.to_vec()
        );
    }

    pub(crate) fn record_running(&self, running: &DashMap<Uid, Instant>) {
        let mut sum = 0.0_f64;
        let mut longest = 0.0_f64;
        for item in running.iter() {
            let elapsed = item.value().elapsed().as_secs_f64();
            sum += elapsed;
            if elapsed > longest {
                longest = elapsed;
            }
        }
        let labels = self.labels.to_vec();
        metrics::gauge!("workqueue_unfinished_work_seconds", sum, labels.clone());
        metrics::gauge!("workqueue_longest_running_processor_seconds", longest, labels.clone());
        metrics::gauge!("workqueue_active_workers", running.len() as f64, labels);
    }

    pub(crate) fn record_max_workers(&self, total: usize) {
        metrics::gauge!("workqueue_max_active_workers", total as f64, self.labels.to_vec());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rudder_core::{ModifiedKind, Snapshot, WatchEvent, WatchEventKind};
    use serde_json::json;

    pub fn snapshot(uid: &str, rv: &str) -> Snapshot {
        Snapshot::from_json(
            "Widget",
            json!({
                "apiVersion": "example.io/v1",
                "kind": "Widget",
                "metadata": {
                    "uid": uid,
                    "name": "w1",
                    "namespace": "default",
                    "resourceVersion": rv,
                    "generation": rv.parse::<i64>().ok(),
                },
                "spec": {"size": 1}
            }),
        )
        .unwrap()
    }

    pub fn event(uid: &str, rv: &str) -> WatchEvent {
        WatchEvent::new(WatchEventKind::Modified, snapshot(uid, rv), ModifiedKind::Other)
    }

    pub fn finalizing_event(uid: &str, rv: &str) -> WatchEvent {
        WatchEvent::new(WatchEventKind::Modified, snapshot(uid, rv), ModifiedKind::Finalizing)
    }

    pub fn labels() -> super::QueueLabels {
        super::QueueLabels {
            operator: "test-op".into(),
            controller: "widget".into(),
            kind: "Widget".into(),
            group: "example.io".into(),
            version: "v1".into(),
        }
    }
}
