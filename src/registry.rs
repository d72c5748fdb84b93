//! Persisted workspace registry
//!
//! One YAML record per workspace under `<data_dir>/projects/`. Registry
//! existence is the source of truth for whether a workspace exists; the
//! provider-reported instance is transient and never stored here.
//!
//! Every mutation runs as a read-modify-write under an exclusive advisory
//! lock on a sibling lock file, so concurrent create/delete of the same
//! name cannot interleave between the existence check and the write.

use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::{Error, Result};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// File-backed registry of workspace records
pub struct WorkspaceRegistry {
    projects_dir: PathBuf,
    lock_path: PathBuf,
}

impl WorkspaceRegistry {
    /// Open (or initialize) the registry under a data directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let projects_dir = data_dir.as_ref().join("projects");
        fs::create_dir_all(&projects_dir)?;
        let lock_path = projects_dir.join(".registry.lock");
        Ok(Self {
            projects_dir,
            lock_path,
        })
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        // Names come validated from the payload layer, but the registry is
        // also reachable with raw strings (lookups, CLI): never let a name
        // escape the projects directory.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(self.projects_dir.join(format!("{}.yaml", name)))
    }

    /// Run `f` while holding the exclusive registry lock.
    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        let started = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if started.elapsed() < LOCK_TIMEOUT => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("timed out waiting for registry lock: {}", e),
                    )))
                }
            }
        }

        let result = f();
        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            tracing::warn!(error = %e, "failed to release registry lock");
        }
        result
    }

    /// Persist a new record. Fails with [`Error::WorkspaceExists`] when the
    /// name is already registered; the check and the write happen under the
    /// same lock.
    pub fn create(&self, config: &WorkspaceConfig) -> Result<()> {
        let path = self.record_path(&config.name)?;
        self.with_lock(|| {
            if path.exists() {
                return Err(Error::WorkspaceExists(config.name.clone()));
            }
            write_record(&path, config)
        })
    }

    /// Overwrite an existing record (updates, bring-up checkpoints).
    pub fn save(&self, config: &WorkspaceConfig) -> Result<()> {
        let path = self.record_path(&config.name)?;
        self.with_lock(|| {
            if !path.exists() {
                return Err(Error::NotFound(config.name.clone()));
            }
            write_record(&path, config)
        })
    }

    pub fn get(&self, name: &str) -> Result<WorkspaceConfig> {
        let path = self.record_path(name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Delete a record. Irrecoverable; callers tear provider resources down
    /// first.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name)?;
        self.with_lock(|| {
            if !path.exists() {
                return Err(Error::NotFound(name.to_string()));
            }
            fs::remove_file(&path)?;
            Ok(())
        })
    }

    /// All registered workspaces, sorted by name.
    pub fn list(&self) -> Result<Vec<WorkspaceConfig>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.projects_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match serde_yaml::from_str::<WorkspaceConfig>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable registry record");
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn list_by_type(&self, cluster_type: ClusterType) -> Result<Vec<WorkspaceConfig>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.cluster_type == cluster_type)
            .collect())
    }
}

fn write_record(path: &Path, config: &WorkspaceConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    // Write-then-rename keeps a crashed write from leaving a half record.
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, yaml)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EcsSettings, WorkspacePayload};
    use tempfile::TempDir;

    fn test_registry() -> (WorkspaceRegistry, TempDir) {
        let temp = TempDir::new().unwrap();
        let registry = WorkspaceRegistry::open(temp.path()).unwrap();
        (registry, temp)
    }

    fn record(name: &str, cluster_type: ClusterType) -> WorkspaceConfig {
        WorkspacePayload::builder()
            .name(name)
            .ecs(EcsSettings {
                cluster: "dev".into(),
                task_definition: "workspace:1".into(),
                container_name: "workspace".into(),
                launch_type: None,
            })
            .build()
            .into_config(cluster_type, format!("uuid-{}", name))
    }

    #[test]
    fn test_create_and_get_roundtrip() {
        let (registry, _temp) = test_registry();
        let config = record("dev-alice", ClusterType::Ecs);

        registry.create(&config).unwrap();
        let loaded = registry.get("dev-alice").unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let (registry, _temp) = test_registry();
        registry.create(&record("dev-alice", ClusterType::Ecs)).unwrap();

        let err = registry.create(&record("dev-alice", ClusterType::Ecs)).unwrap_err();
        assert!(matches!(err, Error::WorkspaceExists(_)));
    }

    #[test]
    fn test_remove_then_get_not_found() {
        let (registry, _temp) = test_registry();
        registry.create(&record("dev-alice", ClusterType::Ecs)).unwrap();

        registry.remove("dev-alice").unwrap();
        assert!(matches!(registry.get("dev-alice"), Err(Error::NotFound(_))));
        assert!(matches!(registry.remove("dev-alice"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_save_requires_existing_record() {
        let (registry, _temp) = test_registry();
        let config = record("dev-alice", ClusterType::Ecs);
        assert!(matches!(registry.save(&config), Err(Error::NotFound(_))));

        registry.create(&config).unwrap();
        let mut updated = config;
        updated.lifecycle.termination_policy.max_idle_seconds = 600;
        registry.save(&updated).unwrap();
        assert_eq!(
            registry.get("dev-alice").unwrap().lifecycle.termination_policy.max_idle_seconds,
            600
        );
    }

    #[test]
    fn test_list_by_type_filters() {
        let (registry, _temp) = test_registry();
        registry.create(&record("a", ClusterType::Ecs)).unwrap();
        registry.create(&record("b", ClusterType::K8s)).unwrap();
        registry.create(&record("c", ClusterType::Ecs)).unwrap();

        let ecs = registry.list_by_type(ClusterType::Ecs).unwrap();
        assert_eq!(
            ecs.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(registry.list().unwrap().len(), 3);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let (registry, _temp) = test_registry();
        assert!(matches!(registry.get("../outside"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let (registry, _temp) = test_registry();
        let registry = std::sync::Arc::new(registry);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.create(&record("dev-race", ClusterType::Ecs)))
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        assert!(outcomes
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(Error::WorkspaceExists(_)))));
    }
}
