//! Load-balancer bring-up state machine
//!
//! Fronting a Cloud Run service takes five global Compute Engine objects
//! created in sequence: serverless NEG → backend service → reserved
//! address → URL map → target HTTP proxy → forwarding rule. Every step
//! after the NEG may reference an object the API cannot see yet, so each
//! one runs under a fixed-delay bounded retry.
//!
//! Progress is checkpointed through a [`BringupStore`] after every
//! completed step. A crash mid-sequence resumes at the failed step; there
//! is no automatic rollback — teardown deletes whatever the checkpoint
//! says exists, in reverse order.

use tokio_util::sync::CancellationToken;

use crate::config::NetworkState;
use crate::registry::WorkspaceRegistry;
use crate::retry::{retry_fixed, RetryPolicy};
use crate::{Error, Result};

use super::client::{CloudRunApi, LbResource};

/// Suffix on forwarding-rule names; `list` strips it to recover the
/// service id a rule belongs to.
pub const FORWARDING_RULE_SUFFIX: &str = "-cs-fr";

pub fn neg_name(service_id: &str) -> String {
    format!("{}-cs-neg", service_id)
}

pub fn backend_service_name(service_id: &str) -> String {
    format!("{}-cs-backend", service_id)
}

pub fn address_name(service_id: &str) -> String {
    format!("{}-cs-ip", service_id)
}

pub fn url_map_name(service_id: &str) -> String {
    format!("{}-cs-urlmap", service_id)
}

pub fn target_proxy_name(service_id: &str) -> String {
    format!("{}-cs-proxy", service_id)
}

pub fn forwarding_rule_name(service_id: &str) -> String {
    format!("{}{}", service_id, FORWARDING_RULE_SUFFIX)
}

/// Recover the service id from a forwarding-rule name, if it is ours.
pub fn service_id_from_rule(rule_name: &str) -> Option<&str> {
    rule_name.strip_suffix(FORWARDING_RULE_SUFFIX)
}

/// Durable checkpoint storage for bring-up progress.
pub trait BringupStore: Send + Sync {
    fn load_state(&self, workspace: &str) -> Result<NetworkState>;
    fn save_state(&self, workspace: &str, state: NetworkState) -> Result<()>;
}

impl BringupStore for WorkspaceRegistry {
    fn load_state(&self, workspace: &str) -> Result<NetworkState> {
        Ok(self
            .get(workspace)?
            .cloud_run
            .as_ref()
            .map(|settings| settings.network_state)
            .unwrap_or_default())
    }

    fn save_state(&self, workspace: &str, state: NetworkState) -> Result<()> {
        let mut record = self.get(workspace)?;
        match record.cloud_run.as_mut() {
            Some(settings) => settings.network_state = state,
            None => {
                return Err(Error::Config(format!(
                    "workspace {} has no Cloud Run settings",
                    workspace
                )))
            }
        }
        self.save(&record)
    }
}

pub struct Bringup<'a> {
    api: &'a dyn CloudRunApi,
    store: &'a dyn BringupStore,
    policy: RetryPolicy,
}

impl<'a> Bringup<'a> {
    pub fn new(api: &'a dyn CloudRunApi, store: &'a dyn BringupStore, policy: RetryPolicy) -> Self {
        Self { api, store, policy }
    }

    /// Drive the sequence from the persisted state to `Ready` and return
    /// the reserved external IP. Already-completed steps are skipped.
    pub async fn run(&self, service_id: &str, token: &CancellationToken) -> Result<String> {
        let mut state = self.store.load_state(service_id)?;
        tracing::info!(service = %service_id, state = ?state, "starting load-balancer bring-up");

        while state != NetworkState::Ready {
            let next = self.advance(service_id, state, token).await?;
            self.store.save_state(service_id, next)?;
            tracing::debug!(service = %service_id, state = ?next, "bring-up checkpoint");
            state = next;
        }

        let address = address_name(service_id);
        retry_fixed(&self.policy, "address-ip", token, || {
            self.api.address_ip(&address)
        })
        .await
    }

    async fn advance(
        &self,
        service_id: &str,
        state: NetworkState,
        token: &CancellationToken,
    ) -> Result<NetworkState> {
        let neg = neg_name(service_id);
        let backend = backend_service_name(service_id);
        let address = address_name(service_id);
        let url_map = url_map_name(service_id);
        let proxy = target_proxy_name(service_id);
        let rule = forwarding_rule_name(service_id);

        match state {
            NetworkState::NotStarted => {
                retry_fixed(&self.policy, "create-neg", token, || {
                    self.api.create_serverless_neg(&neg, service_id)
                })
                .await?;
                Ok(NetworkState::NegCreated)
            }
            NetworkState::NegCreated => {
                retry_fixed(&self.policy, "create-backend-service", token, || {
                    self.api.create_backend_service(&backend, &neg)
                })
                .await?;
                Ok(NetworkState::BackendCreated)
            }
            NetworkState::BackendCreated => {
                retry_fixed(&self.policy, "reserve-address", token, || {
                    self.api.reserve_address(&address)
                })
                .await?;
                Ok(NetworkState::IpReserved)
            }
            NetworkState::IpReserved => {
                retry_fixed(&self.policy, "create-url-map", token, || {
                    self.api.create_url_map(&url_map, &backend)
                })
                .await?;
                Ok(NetworkState::UrlMapCreated)
            }
            NetworkState::UrlMapCreated => {
                retry_fixed(&self.policy, "create-target-proxy", token, || {
                    self.api.create_target_proxy(&proxy, &url_map)
                })
                .await?;
                Ok(NetworkState::ProxyCreated)
            }
            NetworkState::ProxyCreated => {
                retry_fixed(&self.policy, "create-forwarding-rule", token, || {
                    self.api.create_forwarding_rule(&rule, &proxy, &address)
                })
                .await?;
                Ok(NetworkState::ForwardingCreated)
            }
            NetworkState::ForwardingCreated => Ok(NetworkState::Ready),
            NetworkState::Ready => Ok(NetworkState::Ready),
        }
    }

    /// Delete the objects the checkpoint says exist, newest first. Every
    /// object is attempted; failures are combined and surfaced at the end.
    pub async fn teardown(&self, service_id: &str) -> Result<()> {
        let state = self.store.load_state(service_id)?;
        let steps: [(NetworkState, LbResource, String); 6] = [
            (
                NetworkState::ForwardingCreated,
                LbResource::ForwardingRule,
                forwarding_rule_name(service_id),
            ),
            (
                NetworkState::ProxyCreated,
                LbResource::TargetProxy,
                target_proxy_name(service_id),
            ),
            (
                NetworkState::UrlMapCreated,
                LbResource::UrlMap,
                url_map_name(service_id),
            ),
            (
                NetworkState::IpReserved,
                LbResource::Address,
                address_name(service_id),
            ),
            (
                NetworkState::BackendCreated,
                LbResource::BackendService,
                backend_service_name(service_id),
            ),
            (
                NetworkState::NegCreated,
                LbResource::ServerlessNeg,
                neg_name(service_id),
            ),
        ];

        let mut failures = Vec::new();
        for (created_at, resource, name) in steps {
            if state < created_at {
                continue;
            }
            if let Err(e) = self.api.delete_lb_resource(resource, &name).await {
                tracing::warn!(service = %service_id, object = %name, error = %e, "load-balancer object delete failed");
                failures.push(format!("{}: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::provider("lb-teardown", failures.join("; ")))
        }
    }
}
