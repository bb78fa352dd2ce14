//! Per-entity-type orchestration: owns the cache, queue, worker pools and
//! elector for one managed CRD, and starts/stops watches on leadership
//! transitions.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use kube::{Api, Client};
use metrics::Label;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rudder_cache::ResourceCache;
use rudder_core::config::CrdDescriptor;
use rudder_core::{Controller, Error, FinalizerRegistry, OperatorConfig, Result};
use rudder_elect::{default_identity, ElectionHooks, LeaderElector};
use rudder_queue::{EventQueue, QueueLabels, WorkerPools};

use crate::handler::Dispatcher;
use crate::{builtin, preflight, watch};

pub struct ResourceManager {
    client: Client,
    config: OperatorConfig,
    crd: CrdDescriptor,
    controller: Arc<dyn Controller>,
    finalizers: Arc<dyn FinalizerRegistry>,
}

struct WatchHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared by the elector hooks and the run loop.
struct Inner {
    client: Client,
    config: OperatorConfig,
    crd: CrdDescriptor,
    controller: Arc<dyn Controller>,
    cache: Arc<ResourceCache>,
    dep_cache: Arc<ResourceCache>,
    queue: Arc<EventQueue>,
    watches: tokio::sync::Mutex<Option<WatchHandle>>,
}

impl ResourceManager {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        crd: CrdDescriptor,
        controller: Arc<dyn Controller>,
        finalizers: Arc<dyn FinalizerRegistry>,
    ) -> Self {
        Self { client, config, crd, controller, finalizers }
    }

    /// Run until the token cancels. Workers start immediately but stay idle;
    /// events only flow while this replica holds the lease.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let labels = QueueLabels {
            operator: self.config.operator_name.clone(),
            controller: self.crd.kind.to_lowercase(),
            kind: self.crd.kind.clone(),
            group: self.crd.group.clone(),
            version: self.crd.version.clone(),
        };
        let metric_labels: Vec<Label> = vec![
            Label::new("operator", labels.operator.clone()),
            Label::new("controller", labels.controller.clone()),
            Label::new("kind", labels.kind.clone()),
            Label::new("group", labels.group.clone()),
            Label::new("version", labels.version.clone()),
        ];
        let (queue, channels) = EventQueue::new(
            labels,
            self.config.error_requeue_min,
            self.config.error_requeue_max,
        );
        let cache = Arc::new(ResourceCache::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&self.controller),
            Arc::clone(&self.finalizers),
            self.config.auto_register_finalizers,
            metric_labels,
        ));
        let pools = WorkerPools::start(
            Arc::clone(&queue),
            channels,
            dispatcher,
            self.config.max_concurrent_reconciles,
            self.config.max_concurrent_finalizers,
        );

        let inner = Arc::new(Inner {
            client: self.client.clone(),
            config: self.config.clone(),
            crd: self.crd.clone(),
            controller: Arc::clone(&self.controller),
            cache,
            dep_cache: Arc::new(ResourceCache::new()),
            queue,
            watches: tokio::sync::Mutex::new(None),
        });

        let lease_name = self
            .config
            .lease
            .name
            .clone()
            .or_else(|| self.controller.lease_name())
            .unwrap_or_else(|| self.crd.crd_name());
        let elector = LeaderElector::new(
            self.client,
            lease_name,
            default_identity(),
            self.config.lease.clone(),
            Arc::new(LeadershipHooks { inner: Arc::clone(&inner) }),
            &self.config.operator_name,
        );
        let elector_task = tokio::spawn(elector.run(shutdown.child_token()));

        shutdown.cancelled().await;
        if let Err(err) = elector_task.await {
            warn!(error = %err, "elector task join failed");
        }
        inner.stop_watches().await;
        pools.shutdown().await;
        info!(kind = %self.crd.kind, "resource manager stopped");
        Ok(())
    }
}

struct LeadershipHooks {
    inner: Arc<Inner>,
}

#[async_trait]
impl ElectionHooks for LeadershipHooks {
    /// Promotion order: CRD registration, permission preflight, watches,
    /// controller notification. Any error aborts the term; the elector sits
    /// out a lease duration and restarts the campaign.
    async fn on_promotion(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.config.manage_crds {
            preflight::ensure_crd(&inner.client, &inner.crd).await?;
            for ns in inner.watch_namespaces() {
                if let Some(ns) = ns {
                    preflight::ensure_role(
                        &inner.client,
                        &ns,
                        &format!("{}-manager", inner.config.operator_name),
                        preflight::manager_rules(&inner.crd),
                    )
                    .await?;
                }
            }
        }
        for ns in inner.watch_namespaces() {
            match preflight::ensure_permissions(&inner.client, &inner.crd, ns.as_deref()).await {
                Ok(()) => {}
                Err(err @ Error::Permission { .. }) => {
                    // Misconfigured RBAC cannot self-heal; retrying forever
                    // would only hide it.
                    error!(error = %err, "startup permission check failed");
                    std::process::exit(1);
                }
                Err(err) => return Err(err),
            }
        }
        inner.start_watches().await;
        inner.controller.on_promotion().await
    }

    async fn on_demotion(&self) {
        self.inner.stop_watches().await;
        self.inner.controller.on_demotion().await;
    }

    async fn on_new_leader(&self, identity: &str) {
        self.inner.controller.on_new_leader(identity).await;
    }
}

impl Inner {
    /// Namespace list to scope watches and preflight by. `None` entries mean
    /// cluster-wide.
    fn watch_namespaces(&self) -> Vec<Option<String>> {
        if self.crd.namespaced() && !self.config.watch_namespaces.is_empty() {
            self.config.watch_namespaces.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }

    fn watch_config(&self) -> watcher::Config {
        let mut wc = watcher::Config::default();
        if let Some(fields) = self
            .controller
            .field_selector()
            .or_else(|| self.config.field_selector.clone())
        {
            wc = wc.fields(&fields);
        }
        if let Some(labels) = self
            .controller
            .label_selector()
            .or_else(|| self.config.label_selector.clone())
        {
            wc = wc.labels(&labels);
        }
        wc
    }

    async fn start_watches(&self) {
        let mut guard = self.watches.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        let ar = self.crd.api_resource();
        let retry = self.config.watch_retry_delay;

        let crd_api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        tasks.push(tokio::spawn(watch::run_crd_definition_watch(
            crd_api,
            self.crd.crd_name(),
            retry,
            token.child_token(),
        )));

        for ns in self.watch_namespaces() {
            let api: Api<DynamicObject> = match ns.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            };
            tasks.push(tokio::spawn(watch::run_primary_watch(
                api,
                self.watch_config(),
                self.crd.kind.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.queue),
                retry,
                token.child_token(),
            )));
        }

        for dep in &self.config.dependents {
            if builtin::is_primary(&dep.gvk_key, &self.crd) {
                warn!(gvk = %dep.gvk_key, "primary type declared as its own dependent; skipping");
                continue;
            }
            let Some((dep_ar, namespaced)) = builtin::resolve(dep) else {
                warn!(gvk = %dep.gvk_key, "unresolvable dependent type; missing plural? skipping");
                continue;
            };
            let scopes = if namespaced && !self.config.watch_namespaces.is_empty() {
                self.config.watch_namespaces.iter().cloned().map(Some).collect()
            } else {
                vec![None]
            };
            for ns in scopes {
                let api: Api<DynamicObject> = match ns.as_deref() {
                    Some(ns) => Api::namespaced_with(self.client.clone(), ns, &dep_ar),
                    None => Api::all_with(self.client.clone(), &dep_ar),
                };
                tasks.push(tokio::spawn(watch::run_dependent_watch(
                    api,
                    watcher::Config::default(),
                    dep_ar.kind.clone(),
                    self.crd.kind.clone(),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.dep_cache),
                    Arc::clone(&self.queue),
                    retry,
                    token.child_token(),
                )));
            }
        }

        info!(kind = %self.crd.kind, tasks = tasks.len(), "watches started");
        *guard = Some(WatchHandle { token, tasks });
    }

    /// Cancel the watch token and await each task's graceful exit. In-flight
    /// worker handler calls are unaffected; only event intake stops.
    async fn stop_watches(&self) {
        let handle = { self.watches.lock().await.take() };
        let Some(handle) = handle else { return };
        handle.token.cancel();
        for task in handle.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "watch task join failed");
            }
        }
        info!(kind = %self.crd.kind, "watches stopped");
    }
}
