//! Kubernetes operations of the DynaKube controller

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dynakube_common::crd::{DynaKube, DynaKubeStatus};
use dynakube_common::kube_utils::patch_resource_status;
use dynakube_common::{Error, FIELD_MANAGER};

/// Trait abstracting the controller's Kubernetes writes and lookups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperatorKubeClient: Send + Sync {
    /// Replace the status of a DynaKube
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DynaKubeStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a DynaKube if missing
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a DynaKube
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Whether a DaemonSet exists
    async fn daemonset_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// UID of the `kube-system` namespace
    async fn kube_system_uid(&self) -> Result<String, Error>;
}

/// Real Kubernetes client implementation
pub struct OperatorKubeClientImpl {
    client: Client,
}

impl OperatorKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn set_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OperatorKubeClient for OperatorKubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DynaKubeStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<DynaKube>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        let dk = api.get(name).await?;
        let mut finalizers = dk.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.set_finalizers(name, namespace, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        let dk = match api.get(name).await {
            Ok(dk) => dk,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(dynakube = %name, "DynaKube already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = dk
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.set_finalizers(name, namespace, finalizers).await
    }

    async fn daemonset_exists(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn kube_system_uid(&self) -> Result<String, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get("kube-system").await?;
        ns.metadata
            .uid
            .ok_or_else(|| Error::internal_with_context("kube_client", "kube-system has no uid"))
    }
}
