//! Mutating admission webhooks for the DynaKube operator
//!
//! Two webhooks share one HTTPS server:
//!
//! - `/inject` mutates pods on CREATE: it adds the install-oneagent init
//!   container, the shared volumes and the per-container mounts and env
//!   that load the code modules and the enrichment files. Pods that were
//!   injected before only get containers added since then.
//! - `/label-ns` keeps the instance label of namespaces on CREATE/UPDATE in
//!   line with the DynaKube selectors.

#![deny(missing_docs)]

pub mod error;
pub mod kube_client;
pub mod namespace;
pub mod pod;
pub mod server;
pub mod workload;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use dynakube_common::{EventPublisher, DEFAULT_CSI_DRIVER_NAME, DEFAULT_OPERATOR_NAMESPACE};
use dynakube_injection::{NamespaceMapper, SecretGenerator};

pub use error::WebhookError;
pub use kube_client::{WebhookKubeClient, WebhookKubeClientImpl};
pub use server::{router, serve, ServerConfig};
pub use workload::WorkloadInfo;

/// Static settings of the webhook server
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Namespace of the operator and the DynaKubes
    pub operator_namespace: String,
    /// Default image of the install-oneagent init container
    pub installer_image: String,
    /// CSI driver providing the code-module volume
    pub csi_driver_name: String,
    /// UID of the `kube-system` namespace
    pub cluster_id: String,
    /// Human-readable cluster name, if configured
    pub cluster_name: Option<String>,
    /// Operator version reported in the deployment metadata
    pub version: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            installer_image: String::new(),
            csi_driver_name: DEFAULT_CSI_DRIVER_NAME.to_string(),
            cluster_id: String::new(),
            cluster_name: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Shared state of the webhook handlers
pub struct WebhookState {
    /// Static settings
    pub config: WebhookConfig,
    /// Reads namespaces, DynaKubes, secrets and pod owners
    pub kube: Arc<dyn WebhookKubeClient>,
    /// Creates missing init and endpoint secrets on first use
    pub secrets: Arc<dyn SecretGenerator>,
    /// Resolves the DynaKube owning a namespace
    pub mapper: Arc<NamespaceMapper>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}
