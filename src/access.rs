//! Role-system glue
//!
//! Workspaces own a `project_uuid`; the external role/permission system
//! keys grants on it. [`AccessBinding`] is the thin attachment layer the
//! orchestrator invokes at create and delete time.

use std::sync::Arc;

use crate::config::WorkspaceConfig;
use crate::Result;

/// External role/permission store.
pub trait RoleStore: Send + Sync {
    fn grant(&self, workspace: &str, project_uuid: &str) -> Result<()>;
    fn revoke(&self, workspace: &str, project_uuid: &str) -> Result<()>;
}

/// Default wiring when no role system is attached.
pub struct NoopRoleStore;

impl RoleStore for NoopRoleStore {
    fn grant(&self, _workspace: &str, _project_uuid: &str) -> Result<()> {
        Ok(())
    }

    fn revoke(&self, _workspace: &str, _project_uuid: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct AccessBinding {
    store: Arc<dyn RoleStore>,
}

impl AccessBinding {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopRoleStore))
    }

    /// Attach the workspace's project to the role system. Failures abort
    /// workspace creation.
    pub fn bind(&self, config: &WorkspaceConfig) -> Result<()> {
        self.store.grant(&config.name, &config.project_uuid)?;
        tracing::debug!(workspace = %config.name, project_uuid = %config.project_uuid, "roles granted");
        Ok(())
    }

    /// Detach the project. Best effort: deletion proceeds either way.
    pub fn unbind(&self, config: &WorkspaceConfig) {
        if let Err(e) = self.store.revoke(&config.name, &config.project_uuid) {
            tracing::warn!(workspace = %config.name, error = %e, "role revocation failed");
        }
    }
}
