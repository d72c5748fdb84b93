//! AWS ECS backend
//!
//! Workspaces run as tagged one-off tasks. The run-task API demands an
//! explicit network configuration and the orchestrator has no independent
//! source for it, so provisioning copies subnets and security groups from a
//! running reference task that is *not* itself a dev instance. ECS keeps no
//! history for terminated tasks; a registered workspace with no live task
//! is therefore reported through the registry merge as `Stopped`.

mod client;

pub use client::{AwsCliClient, EcsApi, EcsTask, NetworkInterfaceInfo, RunTaskRequest, TargetGroupInfo};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::instance::{Instance, InstanceStatus};
use crate::{Error, Result};

use super::ClusterBackend;

/// Tag marking orchestrator-managed tasks
pub const DEV_INSTANCE_TAG: &str = "dev-instance";
/// Tag carrying the workspace name
pub const NAME_TAG: &str = "name";

const DEFAULT_LAUNCH_TYPE: &str = "FARGATE";

pub struct EcsBackend {
    api: Arc<dyn EcsApi>,
    /// Cluster scanned by `list`; per-workspace settings name the cluster
    /// used for mutations and are expected to match.
    cluster: String,
}

impl EcsBackend {
    pub fn new(api: Arc<dyn EcsApi>, cluster: impl Into<String>) -> Self {
        Self {
            api,
            cluster: cluster.into(),
        }
    }

    fn task_status(last_status: &str) -> InstanceStatus {
        match last_status {
            "RUNNING" => InstanceStatus::Running,
            "STOPPED" => InstanceStatus::Stopped,
            "DEACTIVATING" | "STOPPING" | "DEPROVISIONING" => InstanceStatus::Terminating,
            // PROVISIONING / PENDING / ACTIVATING: placed but not serving
            _ => InstanceStatus::Unavailable,
        }
    }

    /// A running task to copy network placement from; never a dev instance.
    fn reference_task(tasks: &[EcsTask]) -> Option<&EcsTask> {
        tasks
            .iter()
            .find(|t| t.last_status == "RUNNING" && t.tag(DEV_INSTANCE_TAG).is_none())
    }

    fn find_workspace_task<'a>(tasks: &'a [EcsTask], name: &str) -> Option<&'a EcsTask> {
        tasks
            .iter()
            .find(|t| t.tag(DEV_INSTANCE_TAG) == Some("1") && t.tag(NAME_TAG) == Some(name))
    }

    async fn run_from_config(&self, config: &WorkspaceConfig) -> Result<EcsTask> {
        let settings = config.ecs()?;
        let tasks = self.api.list_tasks(&settings.cluster).await?;

        let reference = Self::reference_task(&tasks).ok_or_else(|| {
            Error::provider(
                "ecs run-task",
                format!(
                    "no running reference task in cluster {} to copy network configuration from",
                    settings.cluster
                ),
            )
        })?;
        let eni_id = reference.eni_id.as_deref().ok_or_else(|| {
            Error::provider("ecs run-task", "reference task has no network interface")
        })?;
        let network = self.api.describe_network_interface(eni_id).await?;

        let mut tags = BTreeMap::new();
        tags.insert(NAME_TAG.to_string(), config.name.clone());
        tags.insert(DEV_INSTANCE_TAG.to_string(), "1".to_string());

        let request = RunTaskRequest {
            task_definition: settings.task_definition.clone(),
            launch_type: settings
                .launch_type
                .clone()
                .unwrap_or_else(|| DEFAULT_LAUNCH_TYPE.to_string()),
            subnets: vec![network.subnet_id],
            security_groups: network.security_groups,
            tags,
        };

        let task = self.api.run_task(&settings.cluster, request).await?;
        tracing::info!(workspace = %config.name, task_arn = %task.task_arn, "task started");
        Ok(task)
    }

    /// Front a workspace with the shared ALB: clone the reference target
    /// group and add a path rule on the given listener.
    pub async fn provision_alb_service(
        &self,
        config: &WorkspaceConfig,
        reference_target_group: &str,
        listener_arn: &str,
        priority: i64,
    ) -> Result<String> {
        let reference = self
            .api
            .describe_target_group(reference_target_group)
            .await?;
        let group_name = format!("{}-tg", config.name);
        let group_arn = self.api.create_target_group(&group_name, &reference).await?;
        self.api
            .create_listener_rule(
                listener_arn,
                priority,
                &format!("/{}*", config.name),
                &group_arn,
            )
            .await?;
        tracing::info!(workspace = %config.name, target_group = %group_arn, "dev service fronted by shared ALB");
        Ok(group_arn)
    }
}

#[async_trait]
impl ClusterBackend for EcsBackend {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Ecs
    }

    fn missing_status(&self) -> InstanceStatus {
        // A stopped task leaves no trace in the control plane.
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
        let task = self.run_from_config(config).await?;
        Ok(
            Instance::new(&config.name, Self::task_status(&task.last_status))
                .with_handle(task.task_arn),
        )
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let tasks = self.api.list_tasks(&self.cluster).await?;

        let mut instances = Vec::new();
        for task in &tasks {
            if task.tag(DEV_INSTANCE_TAG) != Some("1") {
                continue;
            }
            let Some(name) = task.tag(NAME_TAG) else {
                tracing::warn!(task_arn = %task.task_arn, "dev task is missing its name tag");
                continue;
            };
            let status = Self::task_status(&task.last_status);
            let mut instance = Instance::new(name, status).with_handle(task.task_arn.clone());

            if status == InstanceStatus::Running {
                if let Some(eni_id) = task.eni_id.as_deref() {
                    match self.api.describe_network_interface(eni_id).await {
                        Ok(network) => {
                            if let Some(ip) = network.public_ip {
                                instance = instance.with_ip(ip);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(task_arn = %task.task_arn, error = %e, "public IP lookup failed");
                        }
                    }
                }
            }
            instances.push(instance);
        }
        Ok(instances)
    }

    async fn stop(&self, config: &WorkspaceConfig) -> Result<()> {
        let settings = config.ecs()?;
        let tasks = self.api.list_tasks(&settings.cluster).await?;
        match Self::find_workspace_task(&tasks, &config.name) {
            Some(task) => self.api.stop_task(&settings.cluster, &task.task_arn).await,
            None => {
                tracing::debug!(workspace = %config.name, "no live task to stop");
                Ok(())
            }
        }
    }

    async fn resume(&self, config: &WorkspaceConfig) -> Result<()> {
        self.run_from_config(config).await?;
        Ok(())
    }

    async fn teardown(&self, config: &WorkspaceConfig) -> Result<()> {
        // Same as stop: once the task is gone there is nothing else to
        // delete, the registry record is the orchestrator's business.
        self.stop(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::client::MockEcsApi;
    use super::*;
    use crate::config::{EcsSettings, WorkspacePayload};
    use mockall::predicate::eq;

    fn ecs_config(name: &str) -> WorkspaceConfig {
        WorkspacePayload::builder()
            .name(name)
            .ecs(EcsSettings {
                cluster: "dev".into(),
                task_definition: "workspace:3".into(),
                container_name: "workspace".into(),
                launch_type: None,
            })
            .build()
            .into_config(ClusterType::Ecs, format!("uuid-{}", name))
    }

    fn task(arn: &str, status: &str, tags: &[(&str, &str)], eni: Option<&str>) -> EcsTask {
        EcsTask {
            task_arn: arn.to_string(),
            last_status: status.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            eni_id: eni.map(String::from),
        }
    }

    fn network(subnet: &str, public_ip: Option<&str>) -> NetworkInterfaceInfo {
        NetworkInterfaceInfo {
            subnet_id: subnet.to_string(),
            security_groups: vec!["sg-1".to_string()],
            public_ip: public_ip.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_initialize_copies_reference_network_config() {
        let mut api = MockEcsApi::new();
        api.expect_list_tasks().returning(|_| {
            Ok(vec![
                // dev instances must never be picked as the reference
                task("arn:dev", "RUNNING", &[("dev-instance", "1"), ("name", "other")], Some("eni-9")),
                task("arn:ref", "RUNNING", &[], Some("eni-1")),
            ])
        });
        api.expect_describe_network_interface()
            .with(eq("eni-1"))
            .returning(|_| Ok(network("subnet-7", None)));
        api.expect_run_task()
            .withf(|cluster, request| {
                cluster == "dev"
                    && request.subnets == ["subnet-7"]
                    && request.security_groups == ["sg-1"]
                    && request.tags.get("name").map(String::as_str) == Some("dev-alice")
                    && request.tags.get("dev-instance").map(String::as_str) == Some("1")
            })
            .returning(|_, _| {
                Ok(task(
                    "arn:new",
                    "PROVISIONING",
                    &[("dev-instance", "1"), ("name", "dev-alice")],
                    None,
                ))
            });

        let backend = EcsBackend::new(Arc::new(api), "dev");
        let instance = backend
            .initialize(&ecs_config("dev-alice"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Unavailable);
        assert_eq!(instance.handle.as_deref(), Some("arn:new"));
    }

    #[tokio::test]
    async fn test_initialize_without_reference_task_fails() {
        let mut api = MockEcsApi::new();
        api.expect_list_tasks().returning(|_| {
            Ok(vec![task(
                "arn:dev",
                "RUNNING",
                &[("dev-instance", "1"), ("name", "other")],
                None,
            )])
        });

        let backend = EcsBackend::new(Arc::new(api), "dev");
        let err = backend
            .initialize(&ecs_config("dev-alice"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reference task"));
    }

    #[tokio::test]
    async fn test_list_reports_only_tagged_tasks_with_public_ip() {
        let mut api = MockEcsApi::new();
        api.expect_list_tasks().returning(|_| {
            Ok(vec![
                task("arn:ref", "RUNNING", &[], Some("eni-1")),
                task(
                    "arn:alice",
                    "RUNNING",
                    &[("dev-instance", "1"), ("name", "dev-alice")],
                    Some("eni-2"),
                ),
            ])
        });
        api.expect_describe_network_interface()
            .with(eq("eni-2"))
            .returning(|_| Ok(network("subnet-7", Some("198.51.100.4"))));

        let backend = EcsBackend::new(Arc::new(api), "dev");
        let instances = backend.list().await.unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "dev-alice");
        assert_eq!(instances[0].ip.as_deref(), Some("198.51.100.4"));
    }

    #[tokio::test]
    async fn test_stop_resolves_arn_by_tag() {
        let mut api = MockEcsApi::new();
        api.expect_list_tasks().returning(|_| {
            Ok(vec![task(
                "arn:alice",
                "RUNNING",
                &[("dev-instance", "1"), ("name", "dev-alice")],
                None,
            )])
        });
        api.expect_stop_task()
            .with(eq("dev"), eq("arn:alice"))
            .times(1)
            .returning(|_, _| Ok(()));

        let backend = EcsBackend::new(Arc::new(api), "dev");
        backend.stop(&ecs_config("dev-alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_live_task_is_noop() {
        let mut api = MockEcsApi::new();
        api.expect_list_tasks().returning(|_| Ok(vec![]));

        let backend = EcsBackend::new(Arc::new(api), "dev");
        backend.stop(&ecs_config("dev-alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_alb_service_clones_reference_target_group() {
        let mut api = MockEcsApi::new();
        api.expect_describe_target_group()
            .with(eq("dev-shared"))
            .returning(|_| {
                Ok(TargetGroupInfo {
                    arn: "arn:tg/shared".into(),
                    port: 8080,
                    protocol: "HTTP".into(),
                    vpc_id: "vpc-1".into(),
                })
            });
        api.expect_create_target_group()
            .withf(|name, reference| name == "dev-alice-tg" && reference.vpc_id == "vpc-1")
            .returning(|_, _| Ok("arn:tg/dev-alice".to_string()));
        api.expect_create_listener_rule()
            .with(eq("arn:listener"), eq(40), eq("/dev-alice*"), eq("arn:tg/dev-alice"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let backend = EcsBackend::new(Arc::new(api), "dev");
        let arn = backend
            .provision_alb_service(&ecs_config("dev-alice"), "dev-shared", "arn:listener", 40)
            .await
            .unwrap();
        assert_eq!(arn, "arn:tg/dev-alice");
    }
}
