//! Watch-stream plumbing: long-lived watch tasks per (type, namespace), the
//! enqueue-side callback that tags and supersedes queued work, and the
//! dependent-resource fan-out that re-triggers owners.
//!
//! Desync-class stream errors (expired resourceVersion, CRD recreated) are
//! not locally recoverable: the process logs critically and exits, and the
//! orchestrator restarts the watch from scratch.

use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rudder_cache::ResourceCache;
use rudder_core::{ModifiedKind, Snapshot, WatchEvent, WatchEventKind};
use rudder_queue::EventQueue;

/// How the watch loop should react to a stream error.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Expired resourceVersion or equivalent; restart the whole process.
    Desync,
    /// 403 on list/watch; RBAC cannot self-heal.
    Forbidden,
    Transient,
}

fn disposition(err: &watcher::Error) -> Disposition {
    match err {
        watcher::Error::WatchError(resp) if resp.code == 410 => Disposition::Desync,
        watcher::Error::InitialListFailed(kube::Error::Api(ae))
        | watcher::Error::WatchStartFailed(kube::Error::Api(ae))
        | watcher::Error::WatchFailed(kube::Error::Api(ae))
            if ae.code == 403 =>
        {
            Disposition::Forbidden
        }
        _ => Disposition::Transient,
    }
}

/// Enqueue-side callback for the primary watch: tag via a read-only compare,
/// then dequeue-then-enqueue so a queued resource is superseded by the
/// freshest version rather than processed twice.
pub(crate) fn admit_primary(
    cache: &ResourceCache,
    queue: &Arc<EventQueue>,
    raw_kind: WatchEventKind,
    snapshot: Snapshot,
) {
    let uid = snapshot.uid();
    let (kind, tag) = match raw_kind {
        WatchEventKind::Deleted => (WatchEventKind::Deleted, ModifiedKind::Other),
        _ => {
            let kind = if cache.contains(&uid) {
                WatchEventKind::Modified
            } else {
                WatchEventKind::Added
            };
            (kind, cache.compare(&snapshot))
        }
    };
    queue.dequeue(&uid);
    queue.enqueue(WatchEvent::new(kind, snapshot, tag));
}

/// Dependent watch callback: a real change to an owned object re-triggers a
/// synthetic forced Modified event for each controlling owner of our kind.
pub(crate) fn admit_dependent(
    owner_kind: &str,
    primary: &ResourceCache,
    dependents: &ResourceCache,
    queue: &Arc<EventQueue>,
    raw_kind: WatchEventKind,
    snapshot: Snapshot,
) {
    let changed = match raw_kind {
        WatchEventKind::Deleted => {
            dependents.remove(&snapshot.uid());
            true
        }
        _ => {
            let (_, kind) = dependents.upsert(snapshot.clone());
            !matches!(kind, ModifiedKind::NoChanges | ModifiedKind::FinalizerUpdate)
        }
    };
    if !changed {
        return;
    }
    for owner in snapshot
        .owners
        .iter()
        .filter(|o| o.controller && o.kind == owner_kind)
    {
        let Some(owner_snap) = primary.get(&owner.uid) else {
            debug!(
                dependent = %snapshot.id,
                owner = %owner.name,
                "owner not cached; skipping re-trigger"
            );
            continue;
        };
        debug!(dependent = %snapshot.id, owner = %owner_snap.id, "re-triggering owner");
        queue.dequeue(&owner.uid);
        queue.enqueue(WatchEvent::forced(owner_snap));
    }
}

fn fatal(reason: &str, detail: &str) -> ! {
    error!(%detail, "{reason}; exiting for orchestrator restart");
    std::process::exit(1);
}

async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Long-lived watch over the primary custom resource.
pub(crate) async fn run_primary_watch(
    api: Api<DynamicObject>,
    wc: watcher::Config,
    kind: String,
    cache: Arc<ResourceCache>,
    queue: Arc<EventQueue>,
    retry_delay: Duration,
    token: CancellationToken,
) {
    let stream = watcher(api, wc);
    pin_mut!(stream);
    info!(%kind, "primary watch started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(%kind, "primary watch stopped");
                return;
            }
            item = stream.next() => match item {
                None => fatal("primary watch stream ended", &kind),
                Some(Ok(event)) => handle_primary_event(&cache, &queue, &kind, event),
                Some(Err(err)) => match disposition(&err) {
                    Disposition::Desync => fatal("watch desynchronized", &err.to_string()),
                    Disposition::Forbidden => fatal(
                        "watch forbidden; grant list/watch via RBAC",
                        &err.to_string(),
                    ),
                    Disposition::Transient => {
                        warn!(%kind, error = %err, "transient watch error");
                        if !pause(&token, retry_delay).await {
                            return;
                        }
                    }
                },
            }
        }
    }
}

fn handle_primary_event(
    cache: &ResourceCache,
    queue: &Arc<EventQueue>,
    kind: &str,
    event: watcher::Event<DynamicObject>,
) {
    match event {
        watcher::Event::Applied(obj) => match Snapshot::from_dynamic(kind, &obj) {
            Ok(snapshot) => admit_primary(cache, queue, WatchEventKind::Modified, snapshot),
            Err(err) => warn!(%kind, error = %err, "unparseable watch object"),
        },
        watcher::Event::Deleted(obj) => match Snapshot::from_dynamic(kind, &obj) {
            Ok(snapshot) => admit_primary(cache, queue, WatchEventKind::Deleted, snapshot),
            Err(err) => warn!(%kind, error = %err, "unparseable watch object"),
        },
        watcher::Event::Restarted(objs) => {
            debug!(%kind, count = objs.len(), "watch relisted");
            for obj in objs {
                match Snapshot::from_dynamic(kind, &obj) {
                    Ok(snapshot) => {
                        admit_primary(cache, queue, WatchEventKind::Modified, snapshot)
                    }
                    Err(err) => warn!(%kind, error = %err, "unparseable watch object"),
                }
            }
        }
    }
}

/// Watch one declared dependent type and fan changes back onto owners.
pub(crate) async fn run_dependent_watch(
    api: Api<DynamicObject>,
    wc: watcher::Config,
    dependent_kind: String,
    owner_kind: String,
    primary: Arc<ResourceCache>,
    dependents: Arc<ResourceCache>,
    queue: Arc<EventQueue>,
    retry_delay: Duration,
    token: CancellationToken,
) {
    let stream = watcher(api, wc);
    pin_mut!(stream);
    info!(kind = %dependent_kind, "dependent watch started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(kind = %dependent_kind, "dependent watch stopped");
                return;
            }
            item = stream.next() => match item {
                None => fatal("dependent watch stream ended", &dependent_kind),
                Some(Ok(event)) => {
                    let pairs: Vec<(WatchEventKind, DynamicObject)> = match event {
                        watcher::Event::Applied(obj) => vec![(WatchEventKind::Modified, obj)],
                        watcher::Event::Deleted(obj) => vec![(WatchEventKind::Deleted, obj)],
                        watcher::Event::Restarted(objs) => {
                            objs.into_iter().map(|o| (WatchEventKind::Modified, o)).collect()
                        }
                    };
                    for (raw_kind, obj) in pairs {
                        match Snapshot::from_dynamic(&dependent_kind, &obj) {
                            Ok(snapshot) => admit_dependent(
                                &owner_kind,
                                &primary,
                                &dependents,
                                &queue,
                                raw_kind,
                                snapshot,
                            ),
                            Err(err) => {
                                debug!(kind = %dependent_kind, error = %err, "skipping object")
                            }
                        }
                    }
                }
                Some(Err(err)) => match disposition(&err) {
                    Disposition::Desync => fatal("watch desynchronized", &err.to_string()),
                    Disposition::Forbidden => fatal(
                        "dependent watch forbidden; grant list/watch via RBAC",
                        &err.to_string(),
                    ),
                    Disposition::Transient => {
                        warn!(kind = %dependent_kind, error = %err, "transient watch error");
                        if !pause(&token, retry_delay).await {
                            return;
                        }
                    }
                },
            }
        }
    }
}

/// Watch the CRD object itself. Deletion of the definition invalidates every
/// open watch and cached resourceVersion, so it is desync-fatal.
pub(crate) async fn run_crd_definition_watch(
    api: Api<CustomResourceDefinition>,
    crd_name: String,
    retry_delay: Duration,
    token: CancellationToken,
) {
    let wc = watcher::Config::default().fields(&format!("metadata.name={crd_name}"));
    let stream = watcher(api, wc);
    pin_mut!(stream);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            item = stream.next() => match item {
                None => fatal("crd definition watch ended", &crd_name),
                Some(Ok(watcher::Event::Deleted(_))) => {
                    fatal("custom resource definition deleted", &crd_name)
                }
                Some(Ok(_)) => debug!(crd = %crd_name, "definition event"),
                Some(Err(err)) => match disposition(&err) {
                    Disposition::Desync => fatal("watch desynchronized", &err.to_string()),
                    Disposition::Forbidden => {
                        // Reading CRDs is optional; degrade instead of dying.
                        warn!(crd = %crd_name, error = %err, "cannot watch definition");
                        return;
                    }
                    Disposition::Transient => {
                        warn!(crd = %crd_name, error = %err, "transient watch error");
                        if !pause(&token, retry_delay).await {
                            return;
                        }
                    }
                },
            }
        }
    }
}
