//! Bounded worker pools over the queue's UID channels. A supervisor task per
//! pool respawns workers that exit or panic; shutdown lets in-flight handler
//! calls run to completion before the pools wind down.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rudder_core::{Uid, WatchEvent};

use crate::{EventQueue, QueueChannels};

/// Sink for claimed events. Implementations must not panic under normal
/// operation; a panicking handler costs a worker restart, not the pool.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: WatchEvent);
}

pub struct WorkerPools {
    shutdown: CancellationToken,
    supervisors: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPools {
    /// Spawn both pools. `reconcile_workers` and `finalize_workers` bound the
    /// number of concurrently-running handler calls per channel.
    pub fn start<H: EventHandler>(
        queue: Arc<EventQueue>,
        channels: QueueChannels,
        handler: Arc<H>,
        reconcile_workers: usize,
        finalize_workers: usize,
    ) -> Self {
        queue.record_max_workers(reconcile_workers + finalize_workers);
        let shutdown = CancellationToken::new();
        let running: Arc<DashMap<Uid, Instant>> = Arc::new(DashMap::new());
        let supervisors = vec![
            tokio::spawn(supervise(
                "reconcile",
                Arc::clone(&queue),
                channels.reconcile_rx,
                Arc::clone(&handler),
                reconcile_workers.max(1),
                shutdown.clone(),
                Arc::clone(&running),
            )),
            tokio::spawn(supervise(
                "finalize",
                queue,
                channels.finalize_rx,
                handler,
                finalize_workers.max(1),
                shutdown.clone(),
                running,
            )),
        ];
        Self { shutdown, supervisors }
    }

    /// Stop accepting work and wait for in-flight handler calls to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.supervisors {
            if let Err(err) = task.await {
                warn!(error = %err, "worker pool supervisor join failed");
            }
        }
    }
}

async fn supervise<H: EventHandler>(
    pool: &'static str,
    queue: Arc<EventQueue>,
    rx: mpsc::UnboundedReceiver<Uid>,
    handler: Arc<H>,
    size: usize,
    shutdown: CancellationToken,
    running: Arc<DashMap<Uid, Instant>>,
) {
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..size {
        workers.spawn(worker_loop(
            Arc::clone(&queue),
            Arc::clone(&rx),
            Arc::clone(&handler),
            shutdown.clone(),
            Arc::clone(&running),
        ));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            exited = workers.join_next() => {
                let Some(exited) = exited else { break };
                if let Err(err) = exited {
                    if err.is_panic() {
                        error!(pool, "worker panicked; respawning");
                    }
                }
                if shutdown.is_cancelled() {
                    break;
                }
                workers.spawn(worker_loop(
                    Arc::clone(&queue),
                    Arc::clone(&rx),
                    Arc::clone(&handler),
                    shutdown.clone(),
                    Arc::clone(&running),
                ));
            }
        }
    }

    // Drain: workers see the cancelled token after their current call.
    while let Some(exited) = workers.join_next().await {
        if let Err(err) = exited {
            if err.is_panic() {
                error!(pool, "worker panicked during shutdown drain");
            }
        }
    }
    info!(pool, "worker pool stopped");
}

async fn worker_loop<H: EventHandler>(
    queue: Arc<EventQueue>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Uid>>>,
    handler: Arc<H>,
    shutdown: CancellationToken,
    running: Arc<DashMap<Uid, Instant>>,
) {
    loop {
        let uid = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                uid = rx.recv() => match uid {
                    Some(uid) => uid,
                    None => return,
                },
            }
        };
        // Superseded or cancelled between dispatch and pickup.
        let Some(event) = queue.take(&uid) else { continue };

        running.insert(uid, Instant::now());
        queue.record_running(&running);
        let started = Instant::now();
        handler.handle(event).await;
        queue.observe_work(started.elapsed());
        running.remove(&uid);
        queue.record_running(&running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const UID: &str = "bd8507f5-e761-4e70-b711-7e01ee33c71c";
    const UID2: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    struct Counting {
        calls: AtomicU32,
        last_rv: tokio::sync::Mutex<Option<String>>,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0), last_rv: tokio::sync::Mutex::new(None) })
        }
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, event: WatchEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_rv.lock().await = event.snapshot.resource_version.clone();
        }
    }

    struct PanicsOnce {
        panicked: AtomicU32,
        handled: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for PanicsOnce {
        async fn handle(&self, _event: WatchEvent) {
            if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Slow {
        finished: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Slow {
        async fn handle(&self, _event: WatchEvent) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn queue() -> (Arc<EventQueue>, QueueChannels) {
        EventQueue::new(labels(), Duration::from_secs(1), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn handler_sees_enqueued_events() {
        let (q, ch) = queue();
        let handler = Counting::new();
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 2, 1);

        q.enqueue(event(UID, "1"));
        q.enqueue(event(UID2, "7"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(q.depth(), 0);
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn dequeued_events_never_reach_the_handler() {
        let (q, ch) = queue();
        let ev = event(UID, "1");
        let uid = ev.uid();
        q.enqueue(ev);
        q.dequeue(&uid);

        let handler = Counting::new();
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 1, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn superseded_event_delivers_latest_value_once() {
        let (q, ch) = queue();
        let uid = event(UID, "1").uid();
        q.enqueue(event(UID, "1"));
        q.dequeue(&uid);
        q.enqueue(event(UID, "2"));

        let handler = Counting::new();
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 1, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_rv.lock().await.as_deref(), Some("2"));
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn pool_survives_a_panicking_handler() {
        let (q, ch) = queue();
        let handler =
            Arc::new(PanicsOnce { panicked: AtomicU32::new(0), handled: AtomicU32::new(0) });
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 1, 1);

        q.enqueue(event(UID, "1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        q.enqueue(event(UID2, "2"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn intake_cancellation_leaves_in_flight_work_and_pools_intact() {
        let (q, ch) = queue();
        let handler = Arc::new(Slow { finished: AtomicU32::new(0) });
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 1, 1);

        // Stand-in for a watch intake loop: feeds the queue, then exits when
        // its token is cancelled (leadership lost mid-reconcile).
        let watch_token = CancellationToken::new();
        let intake = tokio::spawn({
            let q = Arc::clone(&q);
            let token = watch_token.clone();
            async move {
                q.enqueue(event(UID, "1"));
                token.cancelled().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        watch_token.cancel();
        intake.await.unwrap();
        assert_eq!(
            handler.finished.load(Ordering::SeqCst),
            0,
            "handler still mid-flight when intake exits"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1, "in-flight call ran to completion");

        q.enqueue(event(UID2, "2"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handler.finished.load(Ordering::SeqCst),
            2,
            "pools keep serving after intake stops"
        );
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_work() {
        let (q, ch) = queue();
        let handler = Arc::new(Slow { finished: AtomicU32::new(0) });
        let pools = WorkerPools::start(Arc::clone(&q), ch, Arc::clone(&handler), 1, 1);

        q.enqueue(event(UID, "1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        pools.shutdown().await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    }
}
