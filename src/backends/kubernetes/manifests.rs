//! Manifest construction for workspace workloads
//!
//! Manifests are templated as JSON and deserialized into the typed API
//! objects, so the shape stays readable next to the equivalent YAML.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, ServiceBackendPort,
};
use serde_json::json;

use crate::config::{KubernetesSettings, ServiceExposure, WorkspaceConfig};
use crate::{Error, Result};

/// Label marking every object managed by this orchestrator
pub const DEV_INSTANCE_LABEL: &str = "dev-instance";

pub const DEFAULT_WORKSPACE_IMAGE: &str = "cloudspace/workspace:latest";
pub const DEFAULT_WORKSPACE_PORT: u16 = 8080;

/// Volume name of the per-workspace home directory claim
const HOME_VOLUME: &str = "home";
const HOME_MOUNT_PATH: &str = "/home/workspace";

pub fn workspace_port(settings: &KubernetesSettings) -> u16 {
    settings.container.port.unwrap_or(DEFAULT_WORKSPACE_PORT)
}

pub fn stateful_set(config: &WorkspaceConfig, settings: &KubernetesSettings) -> Result<StatefulSet> {
    let name = &config.name;
    let port = workspace_port(settings);
    let image = settings
        .container
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_WORKSPACE_IMAGE.to_string());

    let mut env: Vec<serde_json::Value> = vec![json!({
        "name": "PROJECT_UUID",
        "value": config.project_uuid,
    })];
    for (key, value) in &settings.container.env {
        env.push(json!({ "name": key, "value": value }));
    }

    let mut workspace_container = json!({
        "name": "workspace",
        "image": image,
        "ports": [{ "containerPort": port }],
        "env": env,
        "volumeMounts": [{ "name": HOME_VOLUME, "mountPath": HOME_MOUNT_PATH }],
    });
    if let Some(secret) = &settings.db_secret_name {
        workspace_container["envFrom"] = json!([{ "secretRef": { "name": secret } }]);
    }
    if let Some(command) = &config.lifecycle.post_start.command {
        workspace_container["lifecycle"] = json!({
            "postStart": { "exec": { "command": command } }
        });
    }

    let mut containers = vec![workspace_container];
    if let Some(proxy) = &settings.db_proxy {
        let mut sidecar = json!({ "name": "db-proxy", "image": proxy.image });
        if let Some(command) = &proxy.command {
            sidecar["command"] = json!(command);
        }
        containers.push(sidecar);
    }

    let mut claim_spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": settings.storage_request } },
    });
    if let Some(class) = &settings.storage_class {
        claim_spec["storageClassName"] = json!(class);
    }

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": { "app": name, DEV_INSTANCE_LABEL: "1" },
        },
        "spec": {
            "replicas": 1,
            "serviceName": name,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": {
                    "labels": { "app": name, DEV_INSTANCE_LABEL: "1" },
                },
                "spec": { "containers": containers },
            },
            "volumeClaimTemplates": [{
                "metadata": { "name": HOME_VOLUME },
                "spec": claim_spec,
            }],
        },
    });

    Ok(serde_json::from_value(manifest)?)
}

pub fn service(config: &WorkspaceConfig, settings: &KubernetesSettings) -> Result<Service> {
    let name = &config.name;
    let port = workspace_port(settings);
    let service_type = match settings.service_exposure {
        ServiceExposure::NodePort => "NodePort",
        ServiceExposure::LoadBalancer => "LoadBalancer",
    };

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": { "app": name, DEV_INSTANCE_LABEL: "1" },
        },
        "spec": {
            "type": service_type,
            "selector": { "app": name },
            "ports": [{
                "name": "http",
                "protocol": "TCP",
                "port": port,
                "targetPort": port,
            }],
        },
    });

    Ok(serde_json::from_value(manifest)?)
}

fn path_for(workspace: &str) -> String {
    format!("/{}", workspace)
}

/// Append a path-based routing rule for the workspace onto the shared
/// Ingress. Returns `false` when the rule already exists.
pub fn append_ingress_path(ingress: &mut Ingress, workspace: &str, port: u16) -> Result<bool> {
    let spec = ingress
        .spec
        .as_mut()
        .ok_or_else(|| Error::Config("shared ingress has no spec".into()))?;
    let rules = spec.rules.get_or_insert_with(Vec::new);
    if rules.is_empty() {
        rules.push(IngressRule {
            host: None,
            http: Some(HTTPIngressRuleValue { paths: Vec::new() }),
        });
    }
    let http = rules[0]
        .http
        .get_or_insert_with(|| HTTPIngressRuleValue { paths: Vec::new() });

    let path = path_for(workspace);
    if http.paths.iter().any(|p| p.path.as_deref() == Some(&path)) {
        return Ok(false);
    }

    http.paths.push(HTTPIngressPath {
        path: Some(path),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            resource: None,
            service: Some(IngressServiceBackend {
                name: workspace.to_string(),
                port: Some(ServiceBackendPort {
                    name: None,
                    number: Some(i32::from(port)),
                }),
            }),
        },
    });
    Ok(true)
}

/// Drop the workspace's routing rule from the shared Ingress. Returns
/// `false` when no rule was present.
pub fn remove_ingress_path(ingress: &mut Ingress, workspace: &str) -> bool {
    let path = path_for(workspace);
    let Some(rules) = ingress.spec.as_mut().and_then(|s| s.rules.as_mut()) else {
        return false;
    };
    let mut removed = false;
    for rule in rules.iter_mut() {
        if let Some(http) = rule.http.as_mut() {
            let before = http.paths.len();
            http.paths.retain(|p| p.path.as_deref() != Some(&path));
            removed |= http.paths.len() != before;
        }
    }
    removed
}

/// Reconstruct the externally reachable URL for a workspace routed through
/// the shared Ingress: `scheme://host/path`, https when a TLS entry covers
/// the host.
pub fn url_from_ingress(ingress: &Ingress, workspace: &str) -> Result<String> {
    let path = path_for(workspace);
    let spec = ingress
        .spec
        .as_ref()
        .ok_or_else(|| Error::Config("shared ingress has no spec".into()))?;
    let rules = spec.rules.as_deref().unwrap_or_default();

    for rule in rules {
        let Some(http) = &rule.http else { continue };
        if !http.paths.iter().any(|p| p.path.as_deref() == Some(&path)) {
            continue;
        }
        let host = rule
            .host
            .clone()
            .ok_or_else(|| Error::Config("ingress rule has no host".into()))?;
        let tls_hosts = spec
            .tls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .flat_map(|t| t.hosts.as_deref().unwrap_or_default())
            .any(|h| *h == host);
        let scheme = if tls_hosts { "https" } else { "http" };
        return Ok(format!("{}://{}{}", scheme, host, path));
    }

    Err(Error::NotFound(format!(
        "workspace {} has no ingress rule",
        workspace
    )))
}
