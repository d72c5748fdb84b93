//! Error types for the workspace orchestrator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("workspace already exists: {0}")]
    WorkspaceExists(String),

    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider operation failed: {0}")]
    Provider(String),

    #[error("no backend registered for cluster type: {0}")]
    BackendUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("registry inconsistent for {workspace}: {detail}")]
    RegistryInconsistent { workspace: String, detail: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error came from a cloud provider call rather than
    /// local validation or registry state.
    pub fn is_provider_error(&self) -> bool {
        matches!(self, Error::Provider(_) | Error::Kube(_))
    }

    /// Wrap a provider failure with the operation that produced it.
    pub fn provider(op: &str, detail: impl std::fmt::Display) -> Self {
        Error::Provider(format!("{}: {}", op, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_classification() {
        assert!(Error::provider("run-task", "throttled").is_provider_error());
        assert!(!Error::Config("empty name".into()).is_provider_error());
        assert!(!Error::WorkspaceExists("dev".into()).is_provider_error());
    }

    #[test]
    fn test_provider_message_carries_operation() {
        let err = Error::provider("create-neg", "not visible yet");
        assert_eq!(
            err.to_string(),
            "provider operation failed: create-neg: not visible yet"
        );
    }
}
