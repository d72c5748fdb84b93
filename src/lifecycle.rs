//! Idle-detection control loop
//!
//! Scans every registered workspace of a provider, pulls its activity
//! signals from the external activity endpoint and stops the ones that
//! have been idle past their policy. Best effort: there are no
//! transactional guarantees from the providers, and one failing workspace
//! never aborts the scan of the rest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterType, WorkspaceConfig};
use crate::orchestrator::Orchestrator;
use crate::{Error, Result};

/// Activity signals for one workspace, as reported by the external
/// activity-status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityReport {
    pub active_pipeline_run_count: u32,
    pub last_user_request: DateTime<Utc>,
    #[serde(default)]
    pub last_scheduler_activity: Option<DateTime<Utc>>,
}

impl ActivityReport {
    pub fn latest_activity(&self) -> DateTime<Utc> {
        match self.last_scheduler_activity {
            Some(scheduler) => self.last_user_request.max(scheduler),
            None => self.last_user_request,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    async fn activity(&self, workspace: &str) -> Result<ActivityReport>;
}

/// Probe polling the activity-status endpoint over HTTP.
pub struct HttpActivityProbe {
    base_url: String,
    client: reqwest::Client,
}

impl HttpActivityProbe {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ActivityProbe for HttpActivityProbe {
    async fn activity(&self, workspace: &str) -> Result<ActivityReport> {
        let url = format!(
            "{}/api/workspaces/{}/activity",
            self.base_url.trim_end_matches('/'),
            workspace
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::provider("activity-endpoint", e))?;
        response
            .json::<ActivityReport>()
            .await
            .map_err(|e| Error::provider("activity-endpoint", e))
    }
}

pub struct LifecycleController {
    orchestrator: Arc<Orchestrator>,
    probe: Arc<dyn ActivityProbe>,
    /// Scan cadence for [`run`](Self::run); injected, never inferred.
    poll_interval: Duration,
}

impl LifecycleController {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        probe: Arc<dyn ActivityProbe>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            poll_interval,
        }
    }

    /// One scan over all workspaces of a provider. Returns how many were
    /// stopped.
    pub async fn check_auto_termination(&self, cluster_type: ClusterType) -> Result<usize> {
        let records = self.orchestrator.registry().list_by_type(cluster_type)?;
        let mut stopped = 0;

        for record in records {
            match self.check_workspace(&record).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(workspace = %record.name, error = %e, "idle check failed");
                }
            }
        }
        Ok(stopped)
    }

    async fn check_workspace(&self, config: &WorkspaceConfig) -> Result<bool> {
        let policy = &config.lifecycle.termination_policy;
        if !policy.enable_auto_termination || policy.max_idle_seconds <= 0 {
            return Ok(false);
        }

        let report = self.probe.activity(&config.name).await?;
        if report.active_pipeline_run_count > 0 {
            return Ok(false);
        }

        let idle_seconds = (Utc::now() - report.latest_activity()).num_seconds();
        if idle_seconds <= policy.max_idle_seconds {
            return Ok(false);
        }

        tracing::info!(
            workspace = %config.name,
            idle_seconds = idle_seconds,
            max_idle_seconds = policy.max_idle_seconds,
            "workspace idle past policy, stopping"
        );
        self.orchestrator.stop(&config.name).await?;
        Ok(true)
    }

    /// Scan every registered provider on the configured interval until the
    /// token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            for cluster_type in self.orchestrator.registered_types() {
                match self.check_auto_termination(cluster_type).await {
                    Ok(stopped) if stopped > 0 => {
                        tracing::info!(cluster_type = %cluster_type, stopped = stopped, "idle scan complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(cluster_type = %cluster_type, error = %e, "idle scan failed");
                    }
                }
            }
        }
    }
}
