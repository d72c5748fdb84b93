//! Cloud backend abstraction
//!
//! One [`ClusterBackend`] implementation per provider, all speaking the
//! same lifecycle contract. Backends are looked up through a [`BackendSet`]
//! keyed by [`ClusterType`]; only providers whose settings are present get
//! registered, so a deployment without (say) GCP credentials never touches
//! GCP code paths.

pub mod cloudrun;
pub mod ecs;
pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::instance::{Instance, InstanceStatus};
use crate::{Error, Result};

/// Uniform lifecycle contract over one cloud provider.
///
/// All operations are best-effort against an eventually-consistent control
/// plane; none of them touch the workspace registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn cluster_type(&self) -> ClusterType;

    /// Status reported for a registered workspace the provider has no
    /// record of. ECS forgets stopped tasks entirely, so a missing task is
    /// a stopped workspace; for the other providers a missing resource
    /// means the workspace was lost.
    fn missing_status(&self) -> InstanceStatus;

    /// Provision the workload for a freshly registered workspace. May be a
    /// long multi-step operation; implementations honor `token` so callers
    /// can abandon the creation.
    async fn initialize(
        &self,
        config: &WorkspaceConfig,
        token: CancellationToken,
    ) -> Result<Instance>;

    /// Live instances as the provider reports them right now.
    async fn list(&self) -> Result<Vec<Instance>>;

    async fn get(&self, name: &str) -> Result<Option<Instance>> {
        Ok(self.list().await?.into_iter().find(|i| i.name == name))
    }

    /// Scale the workload down without touching any durable state.
    async fn stop(&self, config: &WorkspaceConfig) -> Result<()>;

    /// Recreate the workload from the persisted config.
    async fn resume(&self, config: &WorkspaceConfig) -> Result<()>;

    /// Remove all provider resources for the workspace.
    async fn teardown(&self, config: &WorkspaceConfig) -> Result<()>;

    /// Externally reachable URL, for providers that front workspaces with
    /// shared routing (Ingress path rules, reserved load-balancer IPs).
    async fn url(&self, _config: &WorkspaceConfig) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Registered backends, keyed by cluster type.
#[derive(Default)]
pub struct BackendSet {
    backends: HashMap<ClusterType, Arc<dyn ClusterBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ClusterBackend>) {
        let cluster_type = backend.cluster_type();
        if self.backends.insert(cluster_type, backend).is_some() {
            tracing::warn!(cluster_type = %cluster_type, "replacing registered backend");
        }
    }

    pub fn with(mut self, backend: Arc<dyn ClusterBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, cluster_type: ClusterType) -> Result<Arc<dyn ClusterBackend>> {
        self.backends
            .get(&cluster_type)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable(cluster_type.to_string()))
    }

    pub fn registered(&self) -> Vec<ClusterType> {
        let mut types: Vec<_> = self.backends.keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
