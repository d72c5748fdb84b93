//! Thin typed wrapper over the Kubernetes API
//!
//! The backend logic talks to this trait; production wires it to a
//! [`kube::Client`], tests substitute a mock.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};

use crate::{Error, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_stateful_set(&self, set: StatefulSet) -> Result<()>;
    async fn delete_stateful_set(&self, name: &str) -> Result<()>;
    async fn scale_stateful_set(&self, name: &str, replicas: i32) -> Result<()>;
    async fn create_service(&self, service: Service) -> Result<()>;
    async fn delete_service(&self, name: &str) -> Result<()>;
    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>>;
    async fn list_pods(&self) -> Result<Vec<Pod>>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn get_ingress(&self, name: &str) -> Result<Ingress>;
    async fn replace_ingress(&self, ingress: Ingress) -> Result<()>;
}

/// Production client bound to one namespace.
pub struct KubeClient {
    client: kube::Client,
    namespace: String,
}

impl KubeClient {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    fn stateful_sets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn ingresses(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn create_stateful_set(&self, set: StatefulSet) -> Result<()> {
        self.stateful_sets()
            .create(&PostParams::default(), &set)
            .await?;
        Ok(())
    }

    async fn delete_stateful_set(&self, name: &str) -> Result<()> {
        self.stateful_sets()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn scale_stateful_set(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.stateful_sets()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn create_service(&self, service: Service) -> Result<()> {
        self.services()
            .create(&PostParams::default(), &service)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.services()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.services().list(&params).await?.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods().list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(self.nodes().get(name).await?)
    }

    async fn get_ingress(&self, name: &str) -> Result<Ingress> {
        Ok(self.ingresses().get(name).await?)
    }

    async fn replace_ingress(&self, ingress: Ingress) -> Result<()> {
        let name = ingress
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Config("ingress object has no name".into()))?;
        self.ingresses()
            .replace(&name, &PostParams::default(), &ingress)
            .await?;
        Ok(())
    }
}
