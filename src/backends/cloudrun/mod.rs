//! GCP Cloud Run backend
//!
//! A workspace is a Cloud Run service with internal ingress, reachable
//! from outside through a manually assembled global load balancer (see
//! [`bringup`]). Cloud Run has no replica count to patch: stop deletes the
//! service while the load-balancer chain and the registry record survive,
//! resume deploys it again from the persisted config.

pub mod bringup;
mod client;

pub use bringup::BringupStore;
pub use client::{CloudRunApi, ForwardingRule, GcloudClient, LbResource, RunService, ServiceSpec};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::instance::{Instance, InstanceStatus};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

use super::ClusterBackend;
use bringup::Bringup;

const DEFAULT_SERVICE_IMAGE: &str = "gcr.io/cloudspace/workspace:latest";

pub struct CloudRunBackend {
    api: Arc<dyn CloudRunApi>,
    store: Arc<dyn BringupStore>,
    policy: RetryPolicy,
}

impl CloudRunBackend {
    pub fn new(api: Arc<dyn CloudRunApi>, store: Arc<dyn BringupStore>) -> Self {
        Self {
            api,
            store,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn service_spec(config: &WorkspaceConfig) -> Result<ServiceSpec> {
        let settings = config.cloud_run()?;
        let mut env: BTreeMap<String, String> = settings.env.clone();
        env.entry("PROJECT_UUID".to_string())
            .or_insert_with(|| config.project_uuid.clone());
        Ok(ServiceSpec {
            service_id: config.name.clone(),
            image: settings
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE_IMAGE.to_string()),
            env,
        })
    }

    async fn deploy_service(&self, config: &WorkspaceConfig) -> Result<()> {
        self.api.create_service(Self::service_spec(config)?).await?;
        self.api.set_invoker_policy(&config.name).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterBackend for CloudRunBackend {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::CloudRun
    }

    fn missing_status(&self) -> InstanceStatus {
        // stop() deletes the service, so a registered workspace without a
        // live service is a stopped one
        InstanceStatus::Stopped
    }

    async fn initialize(
        &self,
        config: &WorkspaceConfig,
        token: CancellationToken,
    ) -> Result<Instance> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.deploy_service(config).await?;
        tracing::info!(workspace = %config.name, "cloud run service deployed");

        let bringup = Bringup::new(self.api.as_ref(), self.store.as_ref(), self.policy.clone());
        let ip = bringup.run(&config.name, &token).await?;
        tracing::info!(workspace = %config.name, ip = %ip, "load balancer ready");

        Ok(Instance::new(&config.name, InstanceStatus::Running)
            .with_ip(ip)
            .with_handle(config.name.clone()))
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let services = self.api.list_services().await?;
        let rules = self.api.list_forwarding_rules().await?;

        // forwarding-rule name carries the service id; join to attach IPs
        let mut ips: BTreeMap<&str, &str> = BTreeMap::new();
        for rule in &rules {
            if let (Some(service_id), Some(ip)) = (
                bringup::service_id_from_rule(&rule.name),
                rule.ip_address.as_deref(),
            ) {
                ips.insert(service_id, ip);
            }
        }

        Ok(services
            .into_iter()
            .map(|service| {
                let status = if service.ready {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Unavailable
                };
                let mut instance =
                    Instance::new(&service.service_id, status).with_handle(service.service_id.clone());
                if let Some(ip) = ips.get(service.service_id.as_str()) {
                    instance = instance.with_ip(*ip);
                }
                instance
            })
            .collect())
    }

    async fn stop(&self, config: &WorkspaceConfig) -> Result<()> {
        self.api.delete_service(&config.name).await
    }

    async fn resume(&self, config: &WorkspaceConfig) -> Result<()> {
        self.deploy_service(config).await?;
        // complete any bring-up steps a crash left behind
        let bringup = Bringup::new(self.api.as_ref(), self.store.as_ref(), self.policy.clone());
        bringup.run(&config.name, &CancellationToken::new()).await?;
        Ok(())
    }

    async fn teardown(&self, config: &WorkspaceConfig) -> Result<()> {
        let mut failures = Vec::new();
        if let Err(e) = self.api.delete_service(&config.name).await {
            tracing::warn!(workspace = %config.name, error = %e, "service delete failed");
            failures.push(format!("service: {}", e));
        }

        let bringup = Bringup::new(self.api.as_ref(), self.store.as_ref(), self.policy.clone());
        if let Err(e) = bringup.teardown(&config.name).await {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::provider("cloud-run teardown", failures.join("; ")))
        }
    }

    async fn url(&self, config: &WorkspaceConfig) -> Result<Option<String>> {
        let settings = config.cloud_run()?;
        if settings.network_state != crate::config::NetworkState::Ready {
            return Ok(None);
        }
        let ip = self.api.address_ip(&bringup::address_name(&config.name)).await?;
        Ok(Some(format!("http://{}", ip)))
    }
}
