//! Kubernetes access for namespace mapping and secret generation
//!
//! Everything the mapper and the secret generator read or write goes through
//! [`InjectionKubeClient`] so both can be exercised without an API server.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dynakube_common::crd::DynaKube;
use dynakube_common::{Error, FIELD_MANAGER, INSTANCE_LABEL, UPDATED_VIA_OPERATOR_ANNOTATION};

const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Trait abstracting the Kubernetes operations of the injection pipeline
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InjectionKubeClient: Send + Sync {
    /// List all namespaces
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, Error>;

    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Set or remove the instance label of a namespace.
    ///
    /// The write is conditional on `resource_version` and always marks the
    /// namespace with the updated-via-operator annotation.
    async fn patch_namespace_instance(
        &self,
        name: &str,
        instance: Option<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// List DynaKubes in a namespace
    async fn list_dynakubes(&self, namespace: &str) -> Result<Vec<DynaKube>, Error>;

    /// Get a DynaKube by name and namespace
    async fn get_dynakube(&self, name: &str, namespace: &str) -> Result<Option<DynaKube>, Error>;

    /// Get a secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// List secrets in all namespaces carrying the instance label `instance`
    async fn list_instance_secrets(&self, instance: &str) -> Result<Vec<Secret>, Error>;

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace a secret; fails with a 409 if its resourceVersion is stale
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Delete a secret, ignoring a missing one
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a ConfigMap by name and namespace
    async fn get_config_map(&self, name: &str, namespace: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// UID of the `kube-system` namespace, used as cluster identity
    async fn kube_system_uid(&self) -> Result<String, Error>;

    /// Whether a DaemonSet exists
    async fn daemonset_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct InjectionKubeClientImpl {
    client: Client,
}

impl InjectionKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl InjectionKubeClient for InjectionKubeClientImpl {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        get_opt(Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn patch_namespace_instance(
        &self,
        name: &str,
        instance: Option<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut patch = serde_json::json!({
            "metadata": {
                "labels": { (INSTANCE_LABEL): instance },
                "annotations": { (UPDATED_VIA_OPERATOR_ANNOTATION): "true" }
            }
        });
        if let Some(rv) = resource_version {
            patch["metadata"]["resourceVersion"] = serde_json::Value::String(rv);
        }
        api.patch(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace = %name, instance = ?instance, "patched namespace instance label");
        Ok(())
    }

    async fn list_dynakubes(&self, namespace: &str) -> Result<Vec<DynaKube>, Error> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_dynakube(&self, name: &str, namespace: &str) -> Result<Option<DynaKube>, Error> {
        get_opt(Api::<DynaKube>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        get_opt(Api::<Secret>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn list_instance_secrets(&self, instance: &str) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!("{INSTANCE_LABEL}={instance}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        get_opt(Api::<ConfigMap>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn kube_system_uid(&self) -> Result<String, Error> {
        let ns = self
            .get_namespace(KUBE_SYSTEM_NAMESPACE)
            .await?
            .ok_or_else(|| Error::not_found("Namespace", KUBE_SYSTEM_NAMESPACE))?;
        ns.metadata
            .uid
            .ok_or_else(|| Error::internal_with_context("kube_client", "kube-system has no uid"))
    }

    async fn daemonset_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let ds = get_opt(Api::<DaemonSet>::namespaced(self.client.clone(), namespace), name).await?;
        Ok(ds.is_some())
    }
}
