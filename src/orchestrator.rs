//! Workspace orchestrator façade
//!
//! The single entry point the resource layer talks to: `collection`,
//! `member`, `create`, `update`, `delete`, plus `stop`/`resume`. Owns the
//! registry and the backend set and enforces the ordering rules: registry
//! write before provisioning, provider teardown before registry deletion.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::access::AccessBinding;
use crate::backends::BackendSet;
use crate::config::{ClusterType, WorkspaceConfig, WorkspacePayload, WorkspaceUpdate};
use crate::instance::Instance;
use crate::registry::WorkspaceRegistry;
use crate::{Error, Result};

/// A workspace: durable config plus the provider-reported instance as of
/// the call that produced it. The instance is never cached.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    #[serde(flatten)]
    pub config: WorkspaceConfig,
    pub instance: Option<Instance>,
}

impl Workspace {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub struct Orchestrator {
    registry: Arc<WorkspaceRegistry>,
    backends: BackendSet,
    roles: AccessBinding,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkspaceRegistry>, backends: BackendSet) -> Self {
        Self {
            registry,
            backends,
            roles: AccessBinding::disabled(),
        }
    }

    pub fn with_access_binding(mut self, roles: AccessBinding) -> Self {
        self.roles = roles;
        self
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    pub fn registered_types(&self) -> Vec<ClusterType> {
        self.backends.registered()
    }

    /// Create a workspace: validates the payload, writes a provisional
    /// registry record with a fresh project UUID, grants roles, then
    /// provisions through the backend. A provisioning failure deletes the
    /// provisional record again; if that compensation also fails the
    /// combined inconsistency is surfaced, not swallowed.
    pub async fn create(
        &self,
        cluster_type: ClusterType,
        payload: WorkspacePayload,
    ) -> Result<Workspace> {
        self.create_with_token(cluster_type, payload, CancellationToken::new())
            .await
    }

    pub async fn create_with_token(
        &self,
        cluster_type: ClusterType,
        payload: WorkspacePayload,
        token: CancellationToken,
    ) -> Result<Workspace> {
        payload.validate(cluster_type)?;
        let backend = self.backends.get(cluster_type)?;

        let config = payload.into_config(cluster_type, uuid::Uuid::new_v4().to_string());
        let name = config.name.clone();
        self.registry.create(&config)?;
        tracing::info!(workspace = %name, cluster_type = %cluster_type, "workspace registered");

        if let Err(e) = self.roles.bind(&config) {
            return Err(self.compensate_create(&config, e).await);
        }

        match backend.initialize(&config, token).await {
            Ok(instance) => {
                tracing::info!(workspace = %name, "workspace provisioned");
                // provisioning may have checkpointed into the record
                let config = self.registry.get(&name).unwrap_or(config);
                Ok(Workspace {
                    config,
                    instance: Some(instance),
                })
            }
            Err(e) => {
                tracing::error!(workspace = %name, error = %e, "provisioning failed, rolling back registration");
                self.roles.unbind(&config);
                Err(self.compensate_create(&config, e).await)
            }
        }
    }

    /// Remove the provisional record and re-raise the original failure.
    async fn compensate_create(&self, config: &WorkspaceConfig, original: Error) -> Error {
        match self.registry.remove(&config.name) {
            Ok(()) => original,
            Err(cleanup) => Error::RegistryInconsistent {
                workspace: config.name.clone(),
                detail: format!(
                    "provisioning failed ({}) and provisional record cleanup also failed ({})",
                    original, cleanup
                ),
            },
        }
    }

    /// One workspace with its current provider state.
    pub async fn member(&self, name: &str) -> Result<Workspace> {
        let config = self.registry.get(name)?;
        let backend = self.backends.get(config.cluster_type)?;

        let instance = match backend.get(name).await {
            Ok(Some(instance)) => Some(instance),
            Ok(None) => Some(Instance::new(name, backend.missing_status())),
            Err(e) => {
                tracing::warn!(workspace = %name, error = %e, "provider state lookup failed");
                None
            }
        };
        Ok(Workspace { config, instance })
    }

    /// All registered workspaces of one provider, merged with the live
    /// provider listing. Registered names the provider does not report get
    /// the backend's missing status; unregistered provider instances are
    /// logged and skipped — the registry decides what exists.
    pub async fn collection(&self, cluster_type: ClusterType) -> Result<Vec<Workspace>> {
        let records = self.registry.list_by_type(cluster_type)?;
        let backend = self.backends.get(cluster_type)?;

        let mut live: HashMap<String, Instance> = backend
            .list()
            .await?
            .into_iter()
            .map(|instance| (instance.name.clone(), instance))
            .collect();

        let mut workspaces = Vec::with_capacity(records.len());
        for record in records {
            let instance = live
                .remove(&record.name)
                .unwrap_or_else(|| Instance::new(&record.name, backend.missing_status()));
            workspaces.push(Workspace {
                config: record,
                instance: Some(instance),
            });
        }
        for name in live.keys() {
            tracing::warn!(workspace = %name, cluster_type = %cluster_type, "provider instance has no registry record");
        }
        Ok(workspaces)
    }

    /// Update lifecycle/provider settings. Name, cluster type and project
    /// UUID are immutable.
    pub async fn update(&self, name: &str, update: WorkspaceUpdate) -> Result<Workspace> {
        let mut config = self.registry.get(name)?;
        update.apply(&mut config);
        self.registry.save(&config)?;
        tracing::info!(workspace = %name, "workspace updated");
        Ok(Workspace {
            config,
            instance: None,
        })
    }

    /// Tear provider resources down, then drop the registry record.
    /// Irrecoverable once the record is gone.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let config = self.registry.get(name)?;
        let backend = self.backends.get(config.cluster_type)?;

        backend.teardown(&config).await?;
        self.registry.remove(name)?;
        self.roles.unbind(&config);
        tracing::info!(workspace = %name, "workspace deleted");
        Ok(())
    }

    /// Scale the workload to zero. The registry record stays.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let config = self.registry.get(name)?;
        let backend = self.backends.get(config.cluster_type)?;
        backend.stop(&config).await?;
        tracing::info!(workspace = %name, "workspace stopped");
        Ok(())
    }

    /// Recreate the workload from the persisted config.
    pub async fn resume(&self, name: &str) -> Result<()> {
        let config = self.registry.get(name)?;
        let backend = self.backends.get(config.cluster_type)?;
        backend.resume(&config).await?;
        tracing::info!(workspace = %name, "workspace resumed");
        Ok(())
    }

    /// Externally reachable URL, when the provider fronts the workspace.
    pub async fn url(&self, name: &str) -> Result<Option<String>> {
        let config = self.registry.get(name)?;
        let backend = self.backends.get(config.cluster_type)?;
        backend.url(&config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockClusterBackend;
    use crate::config::EcsSettings;
    use crate::instance::InstanceStatus;
    use tempfile::TempDir;

    fn ecs_payload(name: &str) -> WorkspacePayload {
        WorkspacePayload::builder()
            .name(name)
            .ecs(EcsSettings {
                cluster: "dev".into(),
                task_definition: "workspace:3".into(),
                container_name: "workspace".into(),
                launch_type: None,
            })
            .build()
    }

    fn mock_backend() -> MockClusterBackend {
        let mut backend = MockClusterBackend::new();
        backend
            .expect_cluster_type()
            .return_const(ClusterType::Ecs);
        backend
            .expect_missing_status()
            .return_const(InstanceStatus::Stopped);
        backend
    }

    fn orchestrator(backend: MockClusterBackend) -> (Orchestrator, TempDir) {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(WorkspaceRegistry::open(temp.path()).unwrap());
        let backends = BackendSet::new().with(Arc::new(backend));
        (Orchestrator::new(registry, backends), temp)
    }

    #[tokio::test]
    async fn test_create_then_member_roundtrips_identity() {
        let mut backend = mock_backend();
        backend.expect_initialize().times(1).returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });
        backend
            .expect_get()
            .returning(|name| Ok(Some(Instance::new(name, InstanceStatus::Running))));

        let (orchestrator, _temp) = orchestrator(backend);
        let mut payload = ecs_payload("dev-alice");
        payload.lifecycle.termination_policy.enable_auto_termination = true;
        payload.lifecycle.termination_policy.max_idle_seconds = 3600;

        let created = orchestrator
            .create(ClusterType::Ecs, payload)
            .await
            .unwrap();
        let fetched = orchestrator.member("dev-alice").await.unwrap();

        assert_eq!(fetched.config.project_uuid, created.config.project_uuid);
        assert_eq!(
            fetched.config.lifecycle.termination_policy.max_idle_seconds,
            3600
        );
        assert_eq!(
            fetched.instance.as_ref().unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_makes_zero_provider_calls() {
        let mut backend = mock_backend();
        backend.expect_initialize().times(1).returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });

        let (orchestrator, _temp) = orchestrator(backend);
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();

        // times(1) above: a second initialize would fail the test
        let err = orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkspaceExists(_)));
    }

    #[tokio::test]
    async fn test_invalid_payload_never_touches_registry_or_provider() {
        let (orchestrator, _temp) = orchestrator(mock_backend());

        let err = orchestrator
            .create(ClusterType::Ecs, WorkspacePayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(orchestrator.registry().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_initialize_rolls_back_registration() {
        let mut backend = mock_backend();
        backend
            .expect_initialize()
            .returning(|_, _| Err(Error::provider("run-task", "quota exceeded")));

        let (orchestrator, _temp) = orchestrator(backend);
        let err = orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("quota exceeded"));
        assert!(matches!(
            orchestrator.member("dev-alice").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_record_after_teardown() {
        let mut backend = mock_backend();
        backend.expect_initialize().returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });
        backend.expect_teardown().times(1).returning(|_| Ok(()));

        let (orchestrator, _temp) = orchestrator(backend);
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();

        orchestrator.delete("dev-alice").await.unwrap();
        assert!(matches!(
            orchestrator.member("dev-alice").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_registry_record() {
        let mut backend = mock_backend();
        backend.expect_initialize().returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });
        backend
            .expect_teardown()
            .returning(|_| Err(Error::provider("teardown", "still terminating")));
        backend
            .expect_get()
            .returning(|name| Ok(Some(Instance::new(name, InstanceStatus::Running))));

        let (orchestrator, _temp) = orchestrator(backend);
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();

        assert!(orchestrator.delete("dev-alice").await.is_err());
        assert!(orchestrator.member("dev-alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_collection_merges_registry_only_names_as_missing() {
        let mut backend = mock_backend();
        backend.expect_initialize().returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });
        // only dev-alice is live; dev-bob exists solely in the registry
        backend.expect_list().returning(|| {
            Ok(vec![
                Instance::new("dev-alice", InstanceStatus::Running).with_ip("198.51.100.4")
            ])
        });

        let (orchestrator, _temp) = orchestrator(backend);
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-bob"))
            .await
            .unwrap();

        let workspaces = orchestrator.collection(ClusterType::Ecs).await.unwrap();
        assert_eq!(workspaces.len(), 2);

        let alice = workspaces.iter().find(|w| w.config.name == "dev-alice").unwrap();
        assert_eq!(alice.instance.as_ref().unwrap().status, InstanceStatus::Running);

        let bob = workspaces.iter().find(|w| w.config.name == "dev-bob").unwrap();
        assert_eq!(bob.instance.as_ref().unwrap().status, InstanceStatus::Stopped);

        // exactly one record per name
        let stopped = workspaces
            .iter()
            .filter(|w| w.instance.as_ref().unwrap().status == InstanceStatus::Stopped)
            .count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_update_keeps_project_uuid() {
        let mut backend = mock_backend();
        backend.expect_initialize().returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });

        let (orchestrator, _temp) = orchestrator(backend);
        let created = orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();

        let mut lifecycle = created.config.lifecycle.clone();
        lifecycle.termination_policy.max_idle_seconds = 900;
        let updated = orchestrator
            .update(
                "dev-alice",
                WorkspaceUpdate {
                    lifecycle: Some(lifecycle),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.config.project_uuid, created.config.project_uuid);
        assert_eq!(
            updated.config.lifecycle.termination_policy.max_idle_seconds,
            900
        );
    }

    #[tokio::test]
    async fn test_stop_does_not_touch_registry() {
        let mut backend = mock_backend();
        backend.expect_initialize().returning(|config, _| {
            Ok(Instance::new(&config.name, InstanceStatus::Running))
        });
        backend.expect_stop().times(1).returning(|_| Ok(()));

        let (orchestrator, _temp) = orchestrator(backend);
        orchestrator
            .create(ClusterType::Ecs, ecs_payload("dev-alice"))
            .await
            .unwrap();

        orchestrator.stop("dev-alice").await.unwrap();
        assert!(orchestrator.registry().exists("dev-alice"));
    }
}
