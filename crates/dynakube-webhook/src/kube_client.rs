//! Kubernetes reads of the admission path

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use dynakube_common::crd::DynaKube;
use dynakube_common::Error;

/// Trait abstracting the Kubernetes reads of the webhooks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookKubeClient: Send + Sync {
    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Get a DynaKube by name and namespace
    async fn get_dynakube(&self, name: &str, namespace: &str) -> Result<Option<DynaKube>, Error>;

    /// Get a secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Owner references of an arbitrary namespaced object, `None` if it is gone
    async fn owner_references(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Vec<OwnerReference>>, Error>;
}

/// Real Kubernetes client implementation
pub struct WebhookKubeClientImpl {
    client: Client,
}

impl WebhookKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Split `group/version` (or a bare core `version`) into a GVK
fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    GroupVersionKind::gvk(group, version, kind)
}

#[async_trait]
impl WebhookKubeClient for WebhookKubeClientImpl {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_dynakube(&self, name: &str, namespace: &str) -> Result<Option<DynaKube>, Error> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn owner_references(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Vec<OwnerReference>>, Error> {
        let resource = ApiResource::from_gvk(&gvk_of(api_version, kind));
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let object = api.get_opt(name).await?;
        Ok(object.map(|o| o.metadata.owner_references.unwrap_or_default()))
    }
}
