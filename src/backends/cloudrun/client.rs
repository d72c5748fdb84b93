//! Cloud Run / Compute Engine client surface
//!
//! Production shells out to `gcloud` with `--format=json`; the load
//! balancer bring-up uses the global Compute Engine resources, the service
//! itself the Cloud Run API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result};

/// A live Cloud Run service, reduced to what the orchestrator reads.
#[derive(Debug, Clone)]
pub struct RunService {
    pub service_id: String,
    pub uri: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub name: String,
    pub ip_address: Option<String>,
}

/// Creation request for the workspace service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub service_id: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
}

/// Global load-balancer objects created by the bring-up, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbResource {
    ServerlessNeg,
    BackendService,
    Address,
    UrlMap,
    TargetProxy,
    ForwardingRule,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudRunApi: Send + Sync {
    async fn create_service(&self, spec: ServiceSpec) -> Result<()>;
    async fn delete_service(&self, service_id: &str) -> Result<()>;
    async fn list_services(&self) -> Result<Vec<RunService>>;
    /// Bind `roles/run.invoker` for all callers. Required even for
    /// internal-ingress services.
    async fn set_invoker_policy(&self, service_id: &str) -> Result<()>;

    async fn create_serverless_neg(&self, name: &str, service_id: &str) -> Result<()>;
    async fn create_backend_service(&self, name: &str, neg_name: &str) -> Result<()>;
    async fn reserve_address(&self, name: &str) -> Result<()>;
    async fn address_ip(&self, name: &str) -> Result<String>;
    async fn create_url_map(&self, name: &str, backend_service: &str) -> Result<()>;
    async fn create_target_proxy(&self, name: &str, url_map: &str) -> Result<()>;
    async fn create_forwarding_rule(
        &self,
        name: &str,
        target_proxy: &str,
        address_name: &str,
    ) -> Result<()>;
    async fn list_forwarding_rules(&self) -> Result<Vec<ForwardingRule>>;
    async fn delete_lb_resource(&self, resource: LbResource, name: &str) -> Result<()>;
}

/// `gcloud` CLI-backed client scoped to one project and region.
#[derive(Debug, Clone)]
pub struct GcloudClient {
    project_id: String,
    region: String,
}

impl GcloudClient {
    pub fn new(project_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Value> {
        let mut full_args = args;
        full_args.push("--project".into());
        full_args.push(self.project_id.clone());
        full_args.push("--quiet".into());
        full_args.push("--format".into());
        full_args.push("json".into());

        let op = full_args
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let output = tokio::task::spawn_blocking(move || {
            duct::cmd("gcloud", &full_args)
                .stdout_capture()
                .stderr_capture()
                .unchecked()
                .run()
        })
        .await
        .map_err(|e| Error::provider("gcloud", e))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider(&format!("gcloud {}", op), stderr.trim()));
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).or(Ok(Value::Null))
    }

    fn region_flag(&self) -> String {
        format!("--region={}", self.region)
    }
}

#[async_trait]
impl CloudRunApi for GcloudClient {
    async fn create_service(&self, spec: ServiceSpec) -> Result<()> {
        let mut args = vec![
            "run".into(),
            "deploy".into(),
            spec.service_id.clone(),
            format!("--image={}", spec.image),
            self.region_flag(),
            "--ingress=internal".into(),
            "--no-allow-unauthenticated".into(),
        ];
        if !spec.env.is_empty() {
            let pairs: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            args.push(format!("--set-env-vars={}", pairs.join(",")));
        }
        self.run(args).await?;
        Ok(())
    }

    async fn delete_service(&self, service_id: &str) -> Result<()> {
        self.run(vec![
            "run".into(),
            "services".into(),
            "delete".into(),
            service_id.into(),
            self.region_flag(),
        ])
        .await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<RunService>> {
        let response = self
            .run(vec![
                "run".into(),
                "services".into(),
                "list".into(),
                self.region_flag(),
            ])
            .await?;

        Ok(response
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|service| {
                let service_id = service["metadata"]["name"].as_str()?.to_string();
                let uri = service["status"]["url"].as_str().map(String::from);
                let ready = service["status"]["conditions"]
                    .as_array()
                    .unwrap_or(&Vec::new())
                    .iter()
                    .any(|c| {
                        c["type"].as_str() == Some("Ready") && c["status"].as_str() == Some("True")
                    });
                Some(RunService {
                    service_id,
                    uri,
                    ready,
                })
            })
            .collect())
    }

    async fn set_invoker_policy(&self, service_id: &str) -> Result<()> {
        self.run(vec![
            "run".into(),
            "services".into(),
            "add-iam-policy-binding".into(),
            service_id.into(),
            "--member=allUsers".into(),
            "--role=roles/run.invoker".into(),
            self.region_flag(),
        ])
        .await?;
        Ok(())
    }

    async fn create_serverless_neg(&self, name: &str, service_id: &str) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "network-endpoint-groups".into(),
            "create".into(),
            name.into(),
            self.region_flag(),
            "--network-endpoint-type=serverless".into(),
            format!("--cloud-run-service={}", service_id),
        ])
        .await?;
        Ok(())
    }

    async fn create_backend_service(&self, name: &str, neg_name: &str) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "backend-services".into(),
            "create".into(),
            name.into(),
            "--global".into(),
            "--load-balancing-scheme=EXTERNAL_MANAGED".into(),
        ])
        .await?;
        self.run(vec![
            "compute".into(),
            "backend-services".into(),
            "add-backend".into(),
            name.into(),
            "--global".into(),
            format!("--network-endpoint-group={}", neg_name),
            format!("--network-endpoint-group-region={}", self.region),
        ])
        .await?;
        Ok(())
    }

    async fn reserve_address(&self, name: &str) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "addresses".into(),
            "create".into(),
            name.into(),
            "--global".into(),
        ])
        .await?;
        Ok(())
    }

    async fn address_ip(&self, name: &str) -> Result<String> {
        let response = self
            .run(vec![
                "compute".into(),
                "addresses".into(),
                "describe".into(),
                name.into(),
                "--global".into(),
            ])
            .await?;
        response["address"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| Error::provider("gcloud compute addresses", "reserved address has no IP"))
    }

    async fn create_url_map(&self, name: &str, backend_service: &str) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "url-maps".into(),
            "create".into(),
            name.into(),
            format!("--default-service={}", backend_service),
        ])
        .await?;
        Ok(())
    }

    async fn create_target_proxy(&self, name: &str, url_map: &str) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "target-http-proxies".into(),
            "create".into(),
            name.into(),
            format!("--url-map={}", url_map),
        ])
        .await?;
        Ok(())
    }

    async fn create_forwarding_rule(
        &self,
        name: &str,
        target_proxy: &str,
        address_name: &str,
    ) -> Result<()> {
        self.run(vec![
            "compute".into(),
            "forwarding-rules".into(),
            "create".into(),
            name.into(),
            "--global".into(),
            format!("--target-http-proxy={}", target_proxy),
            format!("--address={}", address_name),
            "--ports=80".into(),
        ])
        .await?;
        Ok(())
    }

    async fn list_forwarding_rules(&self) -> Result<Vec<ForwardingRule>> {
        let response = self
            .run(vec![
                "compute".into(),
                "forwarding-rules".into(),
                "list".into(),
                "--global".into(),
            ])
            .await?;
        Ok(response
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|rule| {
                Some(ForwardingRule {
                    name: rule["name"].as_str()?.to_string(),
                    ip_address: rule["IPAddress"].as_str().map(String::from),
                })
            })
            .collect())
    }

    async fn delete_lb_resource(&self, resource: LbResource, name: &str) -> Result<()> {
        let args: Vec<String> = match resource {
            LbResource::ServerlessNeg => vec![
                "compute".into(),
                "network-endpoint-groups".into(),
                "delete".into(),
                name.into(),
                self.region_flag(),
            ],
            LbResource::BackendService => vec![
                "compute".into(),
                "backend-services".into(),
                "delete".into(),
                name.into(),
                "--global".into(),
            ],
            LbResource::Address => vec![
                "compute".into(),
                "addresses".into(),
                "delete".into(),
                name.into(),
                "--global".into(),
            ],
            LbResource::UrlMap => vec![
                "compute".into(),
                "url-maps".into(),
                "delete".into(),
                name.into(),
            ],
            LbResource::TargetProxy => vec![
                "compute".into(),
                "target-http-proxies".into(),
                "delete".into(),
                name.into(),
            ],
            LbResource::ForwardingRule => vec![
                "compute".into(),
                "forwarding-rules".into(),
                "delete".into(),
                name.into(),
                "--global".into(),
            ],
        };
        self.run(args).await?;
        Ok(())
    }
}
