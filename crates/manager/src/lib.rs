//! Rudder resource manager: ties caches, queues, leader election and watch
//! plumbing together around the operator author's controller implementations.
//!
//! Controllers are wired through an explicit [`Registry`] built at startup;
//! dispatch is a plain table lookup by GVK key, never reflection.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::error;

use rudder_core::config::CrdDescriptor;
use rudder_core::{Controller, FinalizerRegistry, NoFinalizers, OperatorConfig, Result};

pub mod builtin;
pub mod preflight;
pub mod telemetry;

mod handler;
mod manager;
mod watch;

pub use manager::ResourceManager;

pub struct Registration {
    pub crd: CrdDescriptor,
    controller: Arc<dyn Controller>,
    finalizers: Arc<dyn FinalizerRegistry>,
}

/// Startup-time dispatch table: one entry per managed entity type.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        crd: CrdDescriptor,
        controller: Arc<dyn Controller>,
        finalizers: Arc<dyn FinalizerRegistry>,
    ) -> &mut Self {
        self.entries.push(Registration { crd, controller, finalizers });
        self
    }

    /// Register a controller with no finalizers of its own.
    pub fn register_controller(
        &mut self,
        crd: CrdDescriptor,
        controller: Arc<dyn Controller>,
    ) -> &mut Self {
        self.register(crd, controller, Arc::new(NoFinalizers))
    }

    pub fn get(&self, gvk_key: &str) -> Option<&Registration> {
        self.entries.iter().find(|r| r.crd.gvk_key() == gvk_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one [`ResourceManager`] per registered entity type until the token
    /// cancels. Each manager holds its own lease, so leadership is decided
    /// per type.
    pub async fn run(self, client: Client, config: OperatorConfig, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = Vec::new();
        for entry in self.entries {
            let manager = ResourceManager::new(
                client.clone(),
                config.clone(),
                entry.crd.clone(),
                entry.controller,
                entry.finalizers,
            );
            let kind = entry.crd.kind;
            let shutdown = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = manager.run(shutdown).await {
                    error!(%kind, error = %err, "resource manager failed");
                }
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "resource manager join failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rudder_core::config::ResourceScope;
    use rudder_core::{Requeue, Snapshot};

    struct Noop;

    #[async_trait]
    impl Controller for Noop {
        async fn reconcile(&self, _resource: &Snapshot) -> Result<Option<Requeue>> {
            Ok(None)
        }
        async fn deleted(&self, _resource: &Snapshot) -> Result<()> {
            Ok(())
        }
    }

    fn crd(kind: &str, plural: &str) -> CrdDescriptor {
        CrdDescriptor {
            group: "example.io".into(),
            version: "v1".into(),
            kind: kind.into(),
            plural: plural.into(),
            scope: ResourceScope::Namespaced,
        }
    }

    #[test]
    fn registry_lookup_by_gvk_key() {
        let mut reg = Registry::new();
        reg.register_controller(crd("Widget", "widgets"), Arc::new(Noop));
        reg.register_controller(crd("Gadget", "gadgets"), Arc::new(Noop));
        assert_eq!(reg.len(), 2);
        assert!(reg.get("example.io/v1/Widget").is_some());
        assert!(reg.get("example.io/v1/Sprocket").is_none());
    }
}
