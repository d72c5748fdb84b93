//! End-to-end orchestrator tests against an in-memory fake cloud

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cloudspace::config::EcsSettings;
use cloudspace::{
    BackendSet, ClusterBackend, ClusterType, Error, Instance, InstanceStatus, Orchestrator, Result,
    WorkspaceConfig, WorkspacePayload, WorkspaceRegistry,
};

/// Shared fake provider state: live instances plus a call journal.
#[derive(Default)]
struct FakeCloud {
    instances: Mutex<HashMap<String, Instance>>,
    calls: Mutex<Vec<String>>,
    fail_initialize: bool,
}

impl FakeCloud {
    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

struct FakeBackend {
    cloud: Arc<FakeCloud>,
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Ecs
    }

    fn missing_status(&self) -> InstanceStatus {
        InstanceStatus::Stopped
    }

    async fn initialize(
        &self,
        config: &WorkspaceConfig,
        _token: CancellationToken,
    ) -> Result<Instance> {
        self.cloud.calls.lock().push(format!("initialize {}", config.name));
        if self.cloud.fail_initialize {
            return Err(Error::provider("run-task", "quota exceeded"));
        }
        let instance = Instance::new(&config.name, InstanceStatus::Running)
            .with_ip("198.51.100.4")
            .with_handle(format!("arn:task/{}", config.name));
        self.cloud
            .instances
            .lock()
            .insert(config.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        self.cloud.calls.lock().push("list".into());
        Ok(self.cloud.instances.lock().values().cloned().collect())
    }

    async fn stop(&self, config: &WorkspaceConfig) -> Result<()> {
        self.cloud.calls.lock().push(format!("stop {}", config.name));
        // a stopped task vanishes from the provider entirely
        self.cloud.instances.lock().remove(&config.name);
        Ok(())
    }

    async fn resume(&self, config: &WorkspaceConfig) -> Result<()> {
        self.cloud.calls.lock().push(format!("resume {}", config.name));
        self.cloud.instances.lock().insert(
            config.name.clone(),
            Instance::new(&config.name, InstanceStatus::Running),
        );
        Ok(())
    }

    async fn teardown(&self, config: &WorkspaceConfig) -> Result<()> {
        self.cloud.calls.lock().push(format!("teardown {}", config.name));
        self.cloud.instances.lock().remove(&config.name);
        Ok(())
    }
}

fn payload(name: &str) -> WorkspacePayload {
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

fn harness(fail_initialize: bool) -> (Orchestrator, Arc<FakeCloud>, TempDir) {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(WorkspaceRegistry::open(temp.path()).unwrap());
    let cloud = Arc::new(FakeCloud {
        fail_initialize,
        ..Default::default()
    });
    let backends = BackendSet::new().with(Arc::new(FakeBackend {
        cloud: cloud.clone(),
    }));
    (Orchestrator::new(registry, backends), cloud, temp)
}

#[tokio::test]
async fn test_create_then_get_round_trips_config() {
    let (orchestrator, _cloud, _temp) = harness(false);

    let mut request = payload("dev-alice");
    request.lifecycle.termination_policy.enable_auto_termination = true;
    request.lifecycle.termination_policy.max_idle_seconds = 3600;

    let created = orchestrator.create(ClusterType::Ecs, request).await.unwrap();
    let fetched = orchestrator.member("dev-alice").await.unwrap();

    assert_eq!(fetched.config.project_uuid, created.config.project_uuid);
    assert_eq!(fetched.config.lifecycle, created.config.lifecycle);
    assert_eq!(
        fetched.instance.as_ref().unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(fetched.instance.as_ref().unwrap().ip.as_deref(), Some("198.51.100.4"));
}

#[tokio::test]
async fn test_duplicate_create_issues_zero_provider_calls() {
    let (orchestrator, cloud, _temp) = harness(false);

    orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap();
    let calls_after_first = cloud.call_count();

    let err = orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WorkspaceExists(_)));
    assert_eq!(cloud.call_count(), calls_after_first);
}

#[tokio::test]
async fn test_delete_removes_registry_record() {
    let (orchestrator, cloud, _temp) = harness(false);

    orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap();
    orchestrator.delete("dev-alice").await.unwrap();

    assert!(matches!(
        orchestrator.member("dev-alice").await,
        Err(Error::NotFound(_))
    ));
    assert!(cloud.instances.lock().is_empty());
    // teardown ran before the record was dropped
    assert!(cloud
        .calls
        .lock()
        .iter()
        .any(|c| c == "teardown dev-alice"));
}

#[tokio::test]
async fn test_failed_provisioning_leaves_no_partial_workspace() {
    let (orchestrator, _cloud, _temp) = harness(true);

    let err = orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("quota exceeded"));
    assert!(matches!(
        orchestrator.member("dev-alice").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stopped_workspace_reported_from_registry_merge() {
    let (orchestrator, _cloud, _temp) = harness(false);

    orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap();
    orchestrator
        .create(ClusterType::Ecs, payload("dev-bob"))
        .await
        .unwrap();
    orchestrator.stop("dev-bob").await.unwrap();

    let workspaces = orchestrator.collection(ClusterType::Ecs).await.unwrap();
    assert_eq!(workspaces.len(), 2);

    let by_name = |name: &str| {
        workspaces
            .iter()
            .find(|w| w.config.name == name)
            .unwrap()
            .instance
            .as_ref()
            .unwrap()
            .status
    };
    assert_eq!(by_name("dev-alice"), InstanceStatus::Running);
    // gone from the provider, still registered: reported exactly once as stopped
    assert_eq!(by_name("dev-bob"), InstanceStatus::Stopped);
    assert_eq!(
        workspaces
            .iter()
            .filter(|w| w.config.name == "dev-bob")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_stop_resume_cycle_preserves_registration() {
    let (orchestrator, _cloud, _temp) = harness(false);

    orchestrator
        .create(ClusterType::Ecs, payload("dev-alice"))
        .await
        .unwrap();
    orchestrator.stop("dev-alice").await.unwrap();

    let stopped = orchestrator.member("dev-alice").await.unwrap();
    assert_eq!(
        stopped.instance.as_ref().unwrap().status,
        InstanceStatus::Stopped
    );

    orchestrator.resume("dev-alice").await.unwrap();
    let resumed = orchestrator.member("dev-alice").await.unwrap();
    assert_eq!(
        resumed.instance.as_ref().unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(resumed.config.project_uuid, stopped.config.project_uuid);
}
