//! Cloudspace — workspace lifecycle orchestrator
//!
//! Provisions, monitors, idles-out and tears down per-user ephemeral dev
//! workspaces across three cloud backends (Kubernetes, AWS ECS, GCP Cloud
//! Run) behind one lifecycle contract.
//!
//! # Key pieces
//!
//! - **Registry**: one persisted YAML record per workspace; its existence
//!   is the source of truth for whether a workspace exists, independent of
//!   provider state.
//! - **Backends**: one [`backends::ClusterBackend`] per provider, each
//!   wrapping that cloud's provisioning, listing, scaling and teardown.
//! - **Orchestrator**: the façade gluing registry and backends together
//!   with compensation on failed creates.
//! - **LifecycleController**: the idle-detection loop stopping workspaces
//!   that exceeded their idle budget.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudspace::backends::ecs::{AwsCliClient, EcsBackend};
//! use cloudspace::config::EcsSettings;
//! use cloudspace::{BackendSet, ClusterType, Orchestrator, WorkspacePayload, WorkspaceRegistry};
//!
//! # async fn run() -> cloudspace::Result<()> {
//! let registry = Arc::new(WorkspaceRegistry::open("/var/lib/cloudspace")?);
//! let backends = BackendSet::new().with(Arc::new(EcsBackend::new(
//!     Arc::new(AwsCliClient::new()),
//!     "dev-cluster",
//! )));
//! let orchestrator = Orchestrator::new(registry, backends);
//!
//! let payload = WorkspacePayload::builder()
//!     .name("dev-alice")
//!     .ecs(EcsSettings {
//!         cluster: "dev-cluster".into(),
//!         task_definition: "workspace:3".into(),
//!         container_name: "workspace".into(),
//!         launch_type: None,
//!     })
//!     .build();
//! let workspace = orchestrator.create(ClusterType::Ecs, payload).await?;
//! println!("{}", workspace.config.project_uuid);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod backends;
pub mod config;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod retry;

pub use access::{AccessBinding, RoleStore};
pub use backends::{BackendSet, ClusterBackend};
pub use config::{ClusterType, LifecycleConfig, WorkspaceConfig, WorkspacePayload, WorkspaceUpdate};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceStatus};
pub use lifecycle::{ActivityProbe, HttpActivityProbe, LifecycleController};
pub use orchestrator::{Orchestrator, Workspace};
pub use registry::WorkspaceRegistry;
