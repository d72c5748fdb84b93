//! Workspace configuration schema
//!
//! [`WorkspaceConfig`] is both the in-memory configuration of a workspace
//! and the registry record persisted under `projects/`. Creation requests
//! arrive as a [`WorkspacePayload`] and are promoted to a config once the
//! orchestrator has assigned a `project_uuid`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which cloud backend manages a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    K8s,
    Ecs,
    CloudRun,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterType::K8s => write!(f, "k8s"),
            ClusterType::Ecs => write!(f, "ecs"),
            ClusterType::CloudRun => write!(f, "cloud_run"),
        }
    }
}

impl std::str::FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "k8s" => Ok(ClusterType::K8s),
            "ecs" => Ok(ClusterType::Ecs),
            "cloud_run" => Ok(ClusterType::CloudRun),
            other => Err(Error::Config(format!("unknown cluster type: {}", other))),
        }
    }
}

/// Idle auto-termination policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    pub enable_auto_termination: bool,
    pub max_idle_seconds: i64,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            enable_auto_termination: false,
            max_idle_seconds: 0,
        }
    }
}

/// Command run inside the workspace after startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_path: Option<String>,
}

/// Lifecycle policy persisted with every workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_start_script_path: Option<String>,
    #[serde(default)]
    pub post_start: PostStart,
}

/// How the Kubernetes Service for a workspace is exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceExposure {
    #[default]
    NodePort,
    LoadBalancer,
}

/// Container-level overrides merged into the workspace pod/task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Optional database-proxy sidecar injected next to the workspace container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbProxySidecar {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub service_exposure: ServiceExposure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default = "default_storage_request")]
    pub storage_request: String,
    #[serde(default)]
    pub container: ContainerOverrides,
    /// Secret holding database connection settings, injected as env vars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_proxy: Option<DbProxySidecar>,
    /// Shared Ingress object carrying per-workspace path routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_name: Option<String>,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_exposure: ServiceExposure::default(),
            storage_class: None,
            storage_request: default_storage_request(),
            container: ContainerOverrides::default(),
            db_secret_name: None,
            db_proxy: None,
            ingress_name: None,
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_storage_request() -> String {
    "2Gi".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcsSettings {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_type: Option<String>,
}

/// Persisted progress of the Cloud Run load-balancer bring-up.
///
/// Checkpointed after every completed step so a crashed sequence resumes
/// at the step that failed instead of restarting from scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    #[default]
    NotStarted,
    NegCreated,
    BackendCreated,
    IpReserved,
    UrlMapCreated,
    ProxyCreated,
    ForwardingCreated,
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRunSettings {
    pub project_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub network_state: NetworkState,
}

/// The durable half of a workspace: persisted at creation, one YAML record
/// per workspace in the registry. `project_uuid` is assigned exactly once
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    pub cluster_type: ClusterType,
    pub project_uuid: String,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecs: Option<EcsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_run: Option<CloudRunSettings>,
}

impl WorkspaceConfig {
    pub fn kubernetes(&self) -> Result<&KubernetesSettings> {
        self.kubernetes
            .as_ref()
            .ok_or_else(|| Error::Config(format!("workspace {} has no Kubernetes settings", self.name)))
    }

    pub fn ecs(&self) -> Result<&EcsSettings> {
        self.ecs
            .as_ref()
            .ok_or_else(|| Error::Config(format!("workspace {} has no ECS settings", self.name)))
    }

    pub fn cloud_run(&self) -> Result<&CloudRunSettings> {
        self.cloud_run
            .as_ref()
            .ok_or_else(|| Error::Config(format!("workspace {} has no Cloud Run settings", self.name)))
    }
}

/// Mutable creation payload; promoted to a [`WorkspaceConfig`] once the
/// orchestrator assigns the project UUID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspacePayload {
    pub name: String,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecs: Option<EcsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_run: Option<CloudRunSettings>,
}

impl WorkspacePayload {
    pub fn builder() -> WorkspacePayloadBuilder {
        WorkspacePayloadBuilder::default()
    }

    /// Validate the payload for the target cluster type. Raised before any
    /// cloud call is attempted.
    pub fn validate(&self, cluster_type: ClusterType) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("workspace name cannot be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Config(format!(
                "workspace name {:?} may only contain alphanumerics and dashes",
                self.name
            )));
        }
        match cluster_type {
            ClusterType::K8s => {
                let k8s = self.kubernetes.clone().unwrap_or_default();
                if k8s.namespace.is_empty() {
                    return Err(Error::Config("kubernetes.namespace cannot be empty".into()));
                }
            }
            ClusterType::Ecs => {
                let ecs = self
                    .ecs
                    .as_ref()
                    .ok_or_else(|| Error::Config("ecs settings are required".into()))?;
                if ecs.cluster.is_empty() || ecs.task_definition.is_empty() {
                    return Err(Error::Config(
                        "ecs.cluster and ecs.task_definition are required".into(),
                    ));
                }
                if ecs.container_name.is_empty() {
                    return Err(Error::Config("ecs.container_name is required".into()));
                }
            }
            ClusterType::CloudRun => {
                let run = self
                    .cloud_run
                    .as_ref()
                    .ok_or_else(|| Error::Config("cloud_run settings are required".into()))?;
                if run.project_id.is_empty() || run.region.is_empty() {
                    return Err(Error::Config(
                        "cloud_run.project_id and cloud_run.region are required".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Promote to a persisted config. Defaults the Kubernetes bag when the
    /// target is K8s so namespace/service defaults always materialize.
    pub fn into_config(self, cluster_type: ClusterType, project_uuid: String) -> WorkspaceConfig {
        let kubernetes = match cluster_type {
            ClusterType::K8s => Some(self.kubernetes.unwrap_or_default()),
            _ => self.kubernetes,
        };
        WorkspaceConfig {
            name: self.name,
            cluster_type,
            project_uuid,
            lifecycle: self.lifecycle,
            kubernetes,
            ecs: self.ecs,
            cloud_run: self.cloud_run,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkspacePayloadBuilder {
    payload: WorkspacePayload,
}

impl WorkspacePayloadBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.payload.name = name.into();
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.payload.lifecycle = lifecycle;
        self
    }

    pub fn kubernetes(mut self, settings: KubernetesSettings) -> Self {
        self.payload.kubernetes = Some(settings);
        self
    }

    pub fn ecs(mut self, settings: EcsSettings) -> Self {
        self.payload.ecs = Some(settings);
        self
    }

    pub fn cloud_run(mut self, settings: CloudRunSettings) -> Self {
        self.payload.cloud_run = Some(settings);
        self
    }

    pub fn build(self) -> WorkspacePayload {
        self.payload
    }
}

/// Partial update applied to an existing workspace. The name, cluster type
/// and project UUID are immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecs: Option<EcsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_run: Option<CloudRunSettings>,
}

impl WorkspaceUpdate {
    pub fn apply(self, config: &mut WorkspaceConfig) {
        if let Some(lifecycle) = self.lifecycle {
            config.lifecycle = lifecycle;
        }
        if let Some(k8s) = self.kubernetes {
            config.kubernetes = Some(k8s);
        }
        if let Some(ecs) = self.ecs {
            config.ecs = Some(ecs);
        }
        if let Some(run) = self.cloud_run {
            // bring-up progress is owned by the backend, not the caller
            let state = config
                .cloud_run
                .as_ref()
                .map(|c| c.network_state)
                .unwrap_or_default();
            config.cloud_run = Some(CloudRunSettings {
                network_state: state,
                ..run
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecs_payload() -> WorkspacePayload {
        WorkspacePayload::builder()
            .name("dev-alice")
            .ecs(EcsSettings {
                cluster: "dev".into(),
                task_definition: "workspace:3".into(),
                container_name: "workspace".into(),
                launch_type: None,
            })
            .build()
    }

    #[test]
    fn test_validate_empty_name() {
        let payload = WorkspacePayload::default();
        let err = payload.validate(ClusterType::K8s).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_characters() {
        let payload = WorkspacePayload::builder().name("alice/../etc").build();
        assert!(payload.validate(ClusterType::K8s).is_err());
    }

    #[test]
    fn test_validate_requires_provider_bag() {
        let payload = WorkspacePayload::builder().name("dev-alice").build();
        assert!(payload.validate(ClusterType::Ecs).is_err());
        assert!(payload.validate(ClusterType::CloudRun).is_err());
        // K8s falls back to defaults
        assert!(payload.validate(ClusterType::K8s).is_ok());
    }

    #[test]
    fn test_into_config_assigns_identity() {
        let config = ecs_payload().into_config(ClusterType::Ecs, "uuid-1".into());
        assert_eq!(config.cluster_type, ClusterType::Ecs);
        assert_eq!(config.project_uuid, "uuid-1");
        assert_eq!(config.ecs().unwrap().cluster, "dev");
    }

    #[test]
    fn test_update_preserves_network_state() {
        let mut config = WorkspacePayload::builder()
            .name("dev-bob")
            .cloud_run(CloudRunSettings {
                project_id: "proj".into(),
                region: "us-central1".into(),
                network_state: NetworkState::IpReserved,
                ..Default::default()
            })
            .build()
            .into_config(ClusterType::CloudRun, "uuid-2".into());

        WorkspaceUpdate {
            cloud_run: Some(CloudRunSettings {
                project_id: "proj".into(),
                region: "us-central1".into(),
                image: Some("gcr.io/proj/dev:2".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
        .apply(&mut config);

        let run = config.cloud_run().unwrap();
        assert_eq!(run.image.as_deref(), Some("gcr.io/proj/dev:2"));
        assert_eq!(run.network_state, NetworkState::IpReserved);
    }

    #[test]
    fn test_record_yaml_roundtrip() {
        let config = ecs_payload().into_config(ClusterType::Ecs, "uuid-3".into());
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: WorkspaceConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_cluster_type_parse() {
        assert_eq!("cloud_run".parse::<ClusterType>().unwrap(), ClusterType::CloudRun);
        assert!("gke".parse::<ClusterType>().is_err());
    }
}
