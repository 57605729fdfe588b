//! Payload of the per-namespace init secret
//!
//! Written by the init-secret generator, read by the install-oneagent init
//! container from `/mnt/config/config`. Field names are part of the contract
//! between operator and init container and must stay stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::NO_HOST_TENANT;

/// Sentinel for "initial connect retry not configured"
pub const INITIAL_CONNECT_RETRY_UNSET: i64 = -1;

/// Connection and host-assignment settings for the code modules
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    /// Tenant API URL, ending in `/api`
    pub api_url: String,
    /// API token
    pub api_token: String,
    /// PaaS token used for downloads (falls back to the API token)
    pub paas_token: String,
    /// Proxy URL, empty if none
    #[serde(default)]
    pub proxy: String,
    /// `no-proxy` feature flag value
    #[serde(default)]
    pub no_proxy: String,
    /// No-proxy list handed to the code modules
    #[serde(default)]
    pub one_agent_no_proxy: String,
    /// Network zone, empty if none
    #[serde(default)]
    pub network_zone: String,
    /// Tenant UUID from the connection info
    #[serde(rename = "tenantUUID")]
    pub tenant_uuid: String,
    /// Host group, empty if none
    #[serde(default)]
    pub host_group: String,
    /// Initial connect retry in milliseconds, -1 when unset
    #[serde(default = "default_initial_connect_retry")]
    pub initial_connect_retry: i64,
    /// Skip TLS verification towards the tenant
    #[serde(default)]
    pub skip_cert_check: bool,
    /// A host agent runs on the nodes (cloud-native full stack)
    #[serde(default)]
    pub has_host: bool,
    /// Host tenant is always the DynaKube tenant
    #[serde(default)]
    pub enforcement_mode: bool,
    /// Code modules come from the CSI driver
    #[serde(default)]
    pub csi_mode: bool,
    /// The CSI volume is mounted read-only
    #[serde(rename = "readOnlyCSIDriver", default)]
    pub read_only_csi_driver: bool,
    /// Node name to tenant UUID, `-` for nodes without host agent
    #[serde(default)]
    pub monitoring_nodes: BTreeMap<String, String>,
}

fn default_initial_connect_retry() -> i64 {
    INITIAL_CONNECT_RETRY_UNSET
}

impl SecretConfig {
    /// Tenant the code modules on `node` report their host to.
    ///
    /// Returns `None` when the node must have a host agent but the node map
    /// does not know it.
    pub fn host_tenant(&self, node: &str) -> Option<String> {
        if !self.has_host {
            return Some(NO_HOST_TENANT.to_string());
        }
        if self.enforcement_mode {
            return Some(self.tenant_uuid.clone());
        }
        self.monitoring_nodes.get(node).cloned()
    }

    /// Whether the initial connect retry is configured
    pub fn has_initial_connect_retry(&self) -> bool {
        self.initial_connect_retry >= 0
    }
}
