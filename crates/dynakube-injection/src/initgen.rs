//! Per-namespace secret generation
//!
//! Every namespace a DynaKube owns gets two secrets:
//!
//! - the init secret, read by the install-oneagent init container: tenant
//!   connection settings, tokens, the node-to-tenant map and trust bundles
//! - the endpoint secret, mounted into user containers: metrics ingest URL
//!   and token as a properties file
//!
//! All secrets of one reconcile are rendered from one [`SecretSnapshot`] so
//! every namespace sees the same tokens and tenant. Secrets are written only
//! when a field differs byte for byte from what is stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use dynakube_common::crd::{
    DynaKube, PROXY_SECRET_KEY, TOKEN_API, TOKEN_DATA_INGEST, TOKEN_PAAS, TRUSTED_CAS_KEY,
};
use dynakube_common::kube_utils::{
    node_state_unknown, retry_on_conflict_once, secret_bytes, secret_data, secret_string,
};
use dynakube_common::metrics::SECRET_WRITES;
use dynakube_common::{
    Error, SecretConfig, ENDPOINT_PROPERTIES_FIELD, ENDPOINT_SECRET_NAME, INIT_SECRET_AG_CERTS_FIELD,
    INIT_SECRET_CONFIG_FIELD, INIT_SECRET_NAME, INIT_SECRET_PROXY_FIELD,
    INIT_SECRET_TRUSTED_CAS_FIELD, INSTANCE_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    METRICS_INGEST_TOKEN_KEY, METRICS_INGEST_URL_KEY, NO_HOST_TENANT,
};
use dynakube_dtclient::{ClientOptions, ConnectionInfo, DynatraceClientBuilder};

#[cfg(test)]
use mockall::automock;

use crate::kube_client::InjectionKubeClient;
use crate::mapper::instance_of;

/// Key of the ActiveGate certificate in its TLS secret
pub const AG_CERT_KEY: &str = "server.crt";

const METRICS_INGEST_PATH: &str = "v2/metrics/ingest";

/// Tokens read from the DynaKube's tokens secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Tokens {
    api: String,
    paas: String,
    data_ingest: String,
}

/// Rendered secret data for one DynaKube
#[derive(Clone, Debug, PartialEq, Eq)]
struct Payload {
    init: BTreeMap<String, Vec<u8>>,
    endpoint: BTreeMap<String, Vec<u8>>,
}

/// Everything needed to render the secrets of one DynaKube, read once per
/// reconcile
#[derive(Clone, Debug)]
pub struct SecretSnapshot {
    dynakube: String,
    connection: Option<ConnectionInfo>,
    payload: Result<Payload, String>,
}

impl SecretSnapshot {
    /// Name of the DynaKube the snapshot was taken for
    pub fn dynakube(&self) -> &str {
        &self.dynakube
    }

    /// Connection info from the tenant probe, if it succeeded
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    /// The init secret `config` blob, if the snapshot could be rendered
    pub fn init_config(&self) -> Option<SecretConfig> {
        self.payload
            .as_ref()
            .ok()
            .and_then(|p| p.init.get(INIT_SECRET_CONFIG_FIELD))
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    /// Body of the endpoint properties file, if the snapshot could be rendered
    pub fn endpoint_properties(&self) -> Option<&[u8]> {
        self.payload
            .as_ref()
            .ok()
            .and_then(|p| p.endpoint.get(ENDPOINT_PROPERTIES_FIELD))
            .map(Vec::as_slice)
    }
}

/// Render the endpoint properties file
pub fn endpoint_properties(url: &str, token: &str) -> String {
    format!("{METRICS_INGEST_URL_KEY}={url}\n{METRICS_INGEST_TOKEN_KEY}={token}\n")
}

/// Metrics ingest URL, through the in-cluster ActiveGate when it serves
/// metrics ingest
pub fn metrics_ingest_url(dk: &DynaKube, tenant_uuid: &str) -> String {
    if dk.has_metrics_ingest_active_gate() {
        format!(
            "http://{}/e/{tenant_uuid}/api/{METRICS_INGEST_PATH}",
            dk.active_gate_service_host()
        )
    } else {
        format!("{}/{METRICS_INGEST_PATH}", dk.api_url())
    }
}

/// Node name to tenant map of a DynaKube whose code modules are grouped to
/// a host agent. Nodes outside the host agent's node selector map to `-`.
pub fn monitoring_nodes(dk: &DynaKube, nodes: &[Node], tenant_uuid: &str) -> BTreeMap<String, String> {
    if !dk.needs_host_assignment() {
        return BTreeMap::new();
    }
    let selector = dk.host_node_selector();
    let keep_unknown = dk.feature_flags().ignore_unknown_state();

    nodes
        .iter()
        .filter(|node| keep_unknown || !node_state_unknown(node))
        .map(|node| {
            let labels = node.metadata.labels.clone().unwrap_or_default();
            let hosted = selector.iter().all(|(k, v)| labels.get(k) == Some(v));
            let tenant = if hosted { tenant_uuid } else { NO_HOST_TENANT };
            (node.name_any(), tenant.to_string())
        })
        .collect()
}

fn managed_labels(dynakube: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), dynakube.to_string()),
    ])
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

/// Secret generation as seen by the pod webhook, which creates missing
/// secrets of a namespace on demand
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretGenerator: Send + Sync {
    /// Generate the init and endpoint secrets of one namespace
    async fn generate_for_namespace(&self, dk: &DynaKube, namespace: &str) -> Result<bool, Error>;
}

#[async_trait]
impl SecretGenerator for InitGenerator {
    async fn generate_for_namespace(&self, dk: &DynaKube, namespace: &str) -> Result<bool, Error> {
        InitGenerator::generate_for_namespace(self, dk, namespace).await
    }
}

/// Generates and garbage-collects the per-namespace secrets
pub struct InitGenerator {
    kube: Arc<dyn InjectionKubeClient>,
    clients: Arc<dyn DynatraceClientBuilder>,
    operator_namespace: String,
}

impl InitGenerator {
    /// Create a generator for DynaKubes living in `operator_namespace`
    pub fn new(
        kube: Arc<dyn InjectionKubeClient>,
        clients: Arc<dyn DynatraceClientBuilder>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            clients,
            operator_namespace: operator_namespace.into(),
        }
    }

    /// Generate the secrets of one namespace.
    ///
    /// Returns whether anything was written.
    pub async fn generate_for_namespace(&self, dk: &DynaKube, namespace: &str) -> Result<bool, Error> {
        let snapshot = self.snapshot(dk).await?;
        self.apply_to_namespace(&snapshot, namespace).await
    }

    /// Generate the secrets of every namespace labelled for `dk`.
    ///
    /// Returns whether anything was written.
    pub async fn generate_for_dynakube(&self, dk: &DynaKube) -> Result<bool, Error> {
        let name = dk.name_any();
        let mut namespaces: Vec<String> = self
            .kube
            .list_namespaces()
            .await?
            .iter()
            .filter(|ns| instance_of(ns) == Some(name.as_str()))
            .map(|ns| ns.name_any())
            .collect();
        namespaces.sort();

        let snapshot = self.snapshot(dk).await?;
        self.apply(&snapshot, &namespaces).await
    }

    /// Write the snapshot into each namespace.
    ///
    /// A failing namespace does not stop the others; the first error is
    /// returned once all namespaces were attempted.
    pub async fn apply(&self, snapshot: &SecretSnapshot, namespaces: &[String]) -> Result<bool, Error> {
        let mut updated = false;
        let mut first_error = None;
        for namespace in namespaces {
            match self.apply_to_namespace(snapshot, namespace).await {
                Ok(written) => updated |= written,
                Err(e) => {
                    warn!(dynakube = %snapshot.dynakube, namespace = %namespace, error = %e, "failed to generate secrets");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(dynakube = %snapshot.dynakube, namespaces = namespaces.len(), updated, "generated secrets");
                Ok(updated)
            }
        }
    }

    /// Delete init and endpoint secrets of `dynakube` outside `keep`.
    ///
    /// Returns the number of deleted secrets.
    pub async fn cleanup_for_namespaces(&self, dynakube: &str, keep: &[String]) -> Result<usize, Error> {
        let mut deleted = 0;
        for secret in self.kube.list_instance_secrets(dynakube).await? {
            let name = secret.name_any();
            let namespace = secret.namespace().unwrap_or_default();
            if name != INIT_SECRET_NAME && name != ENDPOINT_SECRET_NAME {
                continue;
            }
            if keep.iter().any(|k| *k == namespace) {
                continue;
            }
            self.kube.delete_secret(&name, &namespace).await?;
            debug!(dynakube, namespace = %namespace, secret = %name, "deleted secret");
            deleted += 1;
        }
        if deleted > 0 {
            info!(dynakube, deleted, "cleaned up secrets");
        }
        Ok(deleted)
    }

    /// Read tokens, proxy, trust bundles and the tenant probe for `dk`.
    ///
    /// A missing tokens secret is an error. A failed tenant probe is kept in
    /// the snapshot: namespaces that already have secrets keep them, new
    /// namespaces fail.
    pub async fn snapshot(&self, dk: &DynaKube) -> Result<SecretSnapshot, Error> {
        let name = dk.name_any();
        let tokens = self.read_tokens(dk).await?;
        let proxy = self.read_proxy(dk).await?;
        let trusted_cas = self.read_trusted_cas(dk).await?;
        let ag_certs = self.read_ag_certs(dk).await?;
        let flags = dk.feature_flags();

        let mut options = ClientOptions::new(dk.api_url(), tokens.paas.clone());
        options.proxy = non_empty(proxy.clone());
        options.no_proxy = non_empty(flags.no_proxy());
        options.trusted_certs = (!trusted_cas.is_empty()).then(|| trusted_cas.clone());
        options.skip_cert_check = dk.spec.skip_cert_check;
        options.network_zone = dk.spec.network_zone.clone().and_then(non_empty);
        let client = self.clients.build(options)?;

        let connection = match client.connection_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(dynakube = %name, error = %e, "tenant probe failed");
                return Ok(SecretSnapshot {
                    dynakube: name,
                    connection: None,
                    payload: Err(e.to_string()),
                });
            }
        };

        let nodes = if dk.needs_host_assignment() {
            self.kube.list_nodes().await?
        } else {
            Vec::new()
        };

        let mut one_agent_no_proxy = flags.no_proxy();
        if dk.has_active_gate() {
            if !one_agent_no_proxy.is_empty() {
                one_agent_no_proxy.push(',');
            }
            one_agent_no_proxy.push_str(&dk.active_gate_service_host());
        }

        let config = SecretConfig {
            api_url: dk.api_url().to_string(),
            api_token: tokens.api.clone(),
            paas_token: tokens.paas.clone(),
            proxy,
            no_proxy: flags.no_proxy(),
            one_agent_no_proxy,
            network_zone: dk.spec.network_zone.clone().unwrap_or_default(),
            tenant_uuid: connection.tenant_uuid.clone(),
            host_group: dk.host_group().unwrap_or_default(),
            initial_connect_retry: flags.initial_connect_retry_ms(),
            skip_cert_check: dk.spec.skip_cert_check,
            has_host: dk.needs_host_assignment(),
            enforcement_mode: flags.enforcement_mode(),
            csi_mode: dk.needs_csi(),
            read_only_csi_driver: flags.readonly_csi_volume(),
            monitoring_nodes: monitoring_nodes(dk, &nodes, &connection.tenant_uuid),
        };

        let mut init = BTreeMap::new();
        init.insert(INIT_SECRET_CONFIG_FIELD.to_string(), serde_json::to_vec(&config)?);
        if !config.proxy.is_empty() {
            init.insert(INIT_SECRET_PROXY_FIELD.to_string(), config.proxy.clone().into_bytes());
        }
        if !trusted_cas.is_empty() {
            init.insert(INIT_SECRET_TRUSTED_CAS_FIELD.to_string(), trusted_cas);
        }
        if !ag_certs.is_empty() {
            init.insert(INIT_SECRET_AG_CERTS_FIELD.to_string(), ag_certs);
        }

        let properties = endpoint_properties(
            &metrics_ingest_url(dk, &connection.tenant_uuid),
            &tokens.data_ingest,
        );
        let endpoint = BTreeMap::from([(
            ENDPOINT_PROPERTIES_FIELD.to_string(),
            properties.into_bytes(),
        )]);

        Ok(SecretSnapshot {
            dynakube: name,
            connection: Some(connection),
            payload: Ok(Payload { init, endpoint }),
        })
    }

    /// Write both secrets of one namespace from the snapshot
    pub async fn apply_to_namespace(&self, snapshot: &SecretSnapshot, namespace: &str) -> Result<bool, Error> {
        let payload = match &snapshot.payload {
            Ok(payload) => payload,
            Err(probe_error) => {
                let mut missing = Vec::new();
                for name in [INIT_SECRET_NAME, ENDPOINT_SECRET_NAME] {
                    if self.kube.get_secret(name, namespace).await?.is_none() {
                        missing.push(name);
                    }
                }
                if missing.is_empty() {
                    warn!(
                        dynakube = %snapshot.dynakube,
                        namespace,
                        "tenant unreachable, keeping existing secrets"
                    );
                    return Ok(false);
                }
                return Err(Error::backend(format!(
                    "cannot generate {} for namespace '{namespace}': {probe_error}",
                    missing.join(", ")
                )));
            }
        };

        let init = self
            .ensure_secret(namespace, INIT_SECRET_NAME, &snapshot.dynakube, &payload.init)
            .await?;
        let endpoint = self
            .ensure_secret(namespace, ENDPOINT_SECRET_NAME, &snapshot.dynakube, &payload.endpoint)
            .await?;
        Ok(init || endpoint)
    }

    /// Create or update one secret, writing only on a byte difference
    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        dynakube: &str,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<bool, Error> {
        let desired = secret_data(data.clone());
        let labels = managed_labels(dynakube);

        let written = retry_on_conflict_once("write secret", || {
            let desired = desired.clone();
            let labels = labels.clone();
            async move {
                let Some(mut existing) = self.kube.get_secret(name, namespace).await? else {
                    let secret = Secret {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            namespace: Some(namespace.to_string()),
                            labels: Some(labels),
                            ..Default::default()
                        },
                        type_: Some("Opaque".to_string()),
                        data: Some(desired),
                        ..Default::default()
                    };
                    self.kube.create_secret(namespace, &secret).await?;
                    return Ok(true);
                };

                let current_labels = existing.metadata.labels.clone().unwrap_or_default();
                let labels_current = labels.iter().all(|(k, v)| current_labels.get(k) == Some(v));
                if existing.data.as_ref() == Some(&desired) && labels_current {
                    return Ok(false);
                }

                existing.data = Some(desired);
                existing.string_data = None;
                existing.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
                self.kube.replace_secret(namespace, &existing).await?;
                Ok(true)
            }
        })
        .await?;

        if written {
            let kind = if name == INIT_SECRET_NAME { "init" } else { "endpoint" };
            SECRET_WRITES.add(1, &[KeyValue::new("secret", kind)]);
            debug!(namespace, secret = name, dynakube, "wrote secret");
        }
        Ok(written)
    }

    async fn read_tokens(&self, dk: &DynaKube) -> Result<Tokens, Error> {
        let secret_name = dk.tokens_secret_name();
        let secret = self
            .kube
            .get_secret(&secret_name, &self.operator_namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("Secret", format!("{}/{secret_name}", self.operator_namespace))
            })?;

        let api = secret_string(&secret, TOKEN_API)
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::validation_for_field(
                    dk.name_any(),
                    "spec.tokens",
                    format!("tokens secret '{secret_name}' has no {TOKEN_API}"),
                )
            })?;
        let paas = secret_string(&secret, TOKEN_PAAS)
            .and_then(non_empty)
            .unwrap_or_else(|| api.clone());
        let data_ingest = secret_string(&secret, TOKEN_DATA_INGEST).unwrap_or_default();

        Ok(Tokens {
            api,
            paas,
            data_ingest,
        })
    }

    async fn read_proxy(&self, dk: &DynaKube) -> Result<String, Error> {
        let Some(proxy) = &dk.spec.proxy else {
            return Ok(String::new());
        };
        if let Some(value) = proxy.value.clone().and_then(non_empty) {
            return Ok(value);
        }
        let Some(secret_name) = proxy.value_from.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(String::new());
        };
        let secret = self
            .kube
            .get_secret(secret_name, &self.operator_namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("Secret", format!("{}/{secret_name}", self.operator_namespace))
            })?;
        Ok(secret_string(&secret, PROXY_SECRET_KEY).unwrap_or_default())
    }

    async fn read_trusted_cas(&self, dk: &DynaKube) -> Result<Vec<u8>, Error> {
        let Some(cm_name) = dk.spec.trusted_cas.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(Vec::new());
        };
        let cm = self
            .kube
            .get_config_map(cm_name, &self.operator_namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("ConfigMap", format!("{}/{cm_name}", self.operator_namespace))
            })?;
        Ok(cm
            .data
            .as_ref()
            .and_then(|d| d.get(TRUSTED_CAS_KEY))
            .map(|certs| certs.as_bytes().to_vec())
            .unwrap_or_default())
    }

    async fn read_ag_certs(&self, dk: &DynaKube) -> Result<Vec<u8>, Error> {
        if !dk.has_active_gate() {
            return Ok(Vec::new());
        }
        let Some(secret_name) = dk.active_gate_tls_secret() else {
            return Ok(Vec::new());
        };
        let secret = self
            .kube
            .get_secret(secret_name, &self.operator_namespace)
            .await?
            .ok_or_else(|| {
                Error::not_found("Secret", format!("{}/{secret_name}", self.operator_namespace))
            })?;
        Ok(secret_bytes(&secret, AG_CERT_KEY)
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }
}
