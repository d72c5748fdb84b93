//! Kubernetes backend
//!
//! One workspace maps to a StatefulSet (replicas=1, durable home-directory
//! claim) plus a Service labeled `dev-instance=1`. The API offers no atomic
//! two-phase create, so a Service failure takes the StatefulSet back down
//! before the error propagates. Listing joins Services and Pods by app
//! label; NodePort addresses are derived from the hosting node's
//! `ExternalIP` and the allocated node port.

mod api;
pub mod manifests;

pub use api::{KubeApi, KubeClient};

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::instance::{Instance, InstanceStatus};
use crate::{Error, Result};

use super::ClusterBackend;
use manifests::{workspace_port, DEV_INSTANCE_LABEL};

pub struct KubernetesBackend {
    api: Arc<dyn KubeApi>,
}

impl KubernetesBackend {
    pub fn new(api: Arc<dyn KubeApi>) -> Self {
        Self { api }
    }

    /// Connect through the ambient kubeconfig, scoped to one namespace.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Arc::new(KubeClient::connect(namespace).await?)))
    }

    fn app_label(service: &Service) -> Option<String> {
        service
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get("app").cloned())
            .or_else(|| service.metadata.name.clone())
    }

    fn pod_status(pod: &Pod) -> InstanceStatus {
        if pod.metadata.deletion_timestamp.is_some() {
            return InstanceStatus::Terminating;
        }
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => InstanceStatus::Running,
            _ => InstanceStatus::Unavailable,
        }
    }

    async fn resolve_ip(&self, service: &Service, pod: &Pod) -> Option<String> {
        let spec = service.spec.as_ref()?;
        match spec.type_.as_deref() {
            Some("LoadBalancer") => service
                .status
                .as_ref()?
                .load_balancer
                .as_ref()?
                .ingress
                .as_ref()?
                .first()?
                .ip
                .clone(),
            _ => {
                let node_port = spec.ports.as_ref()?.first()?.node_port?;
                let node_name = pod.spec.as_ref()?.node_name.clone()?;
                let node = self.api.get_node(&node_name).await.ok()?;
                let external_ip = node
                    .status?
                    .addresses?
                    .into_iter()
                    .find(|a| a.type_ == "ExternalIP")?
                    .address;
                Some(format!("{}:{}", external_ip, node_port))
            }
        }
    }

    /// Register the workspace's path route on the shared Ingress.
    pub async fn add_to_ingress(&self, config: &WorkspaceConfig) -> Result<()> {
        let settings = config.kubernetes()?;
        let Some(ingress_name) = settings.ingress_name.as_deref() else {
            return Ok(());
        };
        let mut ingress = self.api.get_ingress(ingress_name).await?;
        if manifests::append_ingress_path(&mut ingress, &config.name, workspace_port(settings))? {
            self.api.replace_ingress(ingress).await?;
        }
        Ok(())
    }

    pub async fn remove_from_ingress(&self, config: &WorkspaceConfig) -> Result<()> {
        let settings = config.kubernetes()?;
        let Some(ingress_name) = settings.ingress_name.as_deref() else {
            return Ok(());
        };
        let mut ingress = self.api.get_ingress(ingress_name).await?;
        if manifests::remove_ingress_path(&mut ingress, &config.name) {
            self.api.replace_ingress(ingress).await?;
        }
        Ok(())
    }

    /// Externally reachable URL of a workspace routed through the shared
    /// Ingress.
    pub async fn ingress_url(&self, config: &WorkspaceConfig) -> Result<String> {
        let settings = config.kubernetes()?;
        let ingress_name = settings.ingress_name.as_deref().ok_or_else(|| {
            Error::Config(format!("workspace {} has no shared ingress", config.name))
        })?;
        let ingress = self.api.get_ingress(ingress_name).await?;
        manifests::url_from_ingress(&ingress, &config.name)
    }
}

#[async_trait]
impl ClusterBackend for KubernetesBackend {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::K8s
    }

    fn missing_status(&self) -> InstanceStatus {
        InstanceStatus::Unavailable
    }

    async fn initialize(
        &self,
        config: &WorkspaceConfig,
        token: CancellationToken,
    ) -> Result<Instance> {
        let settings = config.kubernetes()?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let set = manifests::stateful_set(config, settings)?;
        self.api.create_stateful_set(set).await?;
        tracing::info!(workspace = %config.name, "stateful set created");

        let service = manifests::service(config, settings)?;
        if let Err(e) = self.api.create_service(service).await {
            // No atomic two-phase create: take the stateful set back down
            // before surfacing the Service failure.
            if let Err(cleanup) = self.api.delete_stateful_set(&config.name).await {
                tracing::error!(
                    workspace = %config.name,
                    error = %cleanup,
                    "stateful set cleanup after failed service create also failed"
                );
            }
            return Err(e);
        }
        tracing::info!(workspace = %config.name, "service created");

        self.add_to_ingress(config).await?;

        Ok(self
            .get(&config.name)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| {
                Instance::new(&config.name, InstanceStatus::Unavailable)
                    .with_handle(config.name.clone())
            }))
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let selector = format!("{}=1", DEV_INSTANCE_LABEL);
        let services = self.api.list_services(&selector).await?;
        let pods = self.api.list_pods().await?;

        let mut instances = Vec::new();
        for service in &services {
            let Some(app) = Self::app_label(service) else {
                continue;
            };
            let pod = pods.iter().find(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get("app"))
                    == Some(&app)
            });

            let instance = match pod {
                // Service with no matching pod: the workload is gone or
                // scaled away while the Service object survived.
                None => Instance::new(&app, InstanceStatus::Unavailable),
                Some(pod) => {
                    let status = Self::pod_status(pod);
                    let mut instance = Instance::new(&app, status)
                        .with_handle(pod.metadata.name.clone().unwrap_or_else(|| app.clone()));
                    if status == InstanceStatus::Running {
                        if let Some(ip) = self.resolve_ip(service, pod).await {
                            instance = instance.with_ip(ip);
                        }
                    }
                    instance
                }
            };
            instances.push(instance);
        }
        Ok(instances)
    }

    async fn stop(&self, config: &WorkspaceConfig) -> Result<()> {
        self.api.scale_stateful_set(&config.name, 0).await
    }

    async fn resume(&self, config: &WorkspaceConfig) -> Result<()> {
        self.api.scale_stateful_set(&config.name, 1).await
    }

    async fn teardown(&self, config: &WorkspaceConfig) -> Result<()> {
        if let Err(e) = self.remove_from_ingress(config).await {
            tracing::warn!(workspace = %config.name, error = %e, "ingress cleanup failed");
        }

        let set_result = self.api.delete_stateful_set(&config.name).await;
        let service_result = self.api.delete_service(&config.name).await;

        match (set_result, service_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(Error::provider(
                "delete-service",
                format!(
                    "stateful set for {} removed but service delete failed: {}",
                    config.name, e
                ),
            )),
            (Err(set_err), Err(svc_err)) => Err(Error::provider(
                "teardown",
                format!("stateful set: {}; service: {}", set_err, svc_err),
            )),
        }
    }

    async fn url(&self, config: &WorkspaceConfig) -> Result<Option<String>> {
        let settings = config.kubernetes()?;
        if settings.ingress_name.is_none() {
            return Ok(None);
        }
        self.ingress_url(config).await.map(Some)
    }
}
