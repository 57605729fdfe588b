//! DynaKube CRD
//!
//! A DynaKube connects the cluster to one Dynatrace tenant. It selects the
//! OneAgent deployment mode, the namespaces that receive code-module
//! injection, and the optional in-cluster ActiveGate.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::feature_flags::FeatureFlags;
use super::types::Condition;
use crate::kube_utils::validate_selector;
use crate::Error;

/// Example value shipped in the sample manifests; never a real tenant
pub const PLACEHOLDER_API_URL: &str = "https://ENVIRONMENTID.live.dynatrace.com/api";

/// Tokens secret key of the API token
pub const TOKEN_API: &str = "apiToken";
/// Tokens secret key of the PaaS token
pub const TOKEN_PAAS: &str = "paasToken";
/// Tokens secret key of the data-ingest token
pub const TOKEN_DATA_INGEST: &str = "dataIngestToken";

/// Key of the proxy URL inside a `proxy.valueFrom` secret
pub const PROXY_SECRET_KEY: &str = "proxy";

/// Key of the CA bundle inside the `trustedCAs` configmap
pub const TRUSTED_CAS_KEY: &str = "certs";

/// ActiveGate capability that serves the metrics ingest API
pub const CAPABILITY_METRICS_INGEST: &str = "metrics-ingest";

/// Every ActiveGate capability the operator knows how to configure
pub const ACTIVE_GATE_CAPABILITIES: [&str; 4] = [
    "routing",
    "kubernetes-monitoring",
    CAPABILITY_METRICS_INGEST,
    "dynatrace-api",
];

const HOST_GROUP_ARG: &str = "--set-host-group=";

/// DynaKube describes how one Dynatrace tenant is rolled out to the cluster.
///
/// Example:
/// ```yaml
/// apiVersion: dynatrace.com/v1beta1
/// kind: DynaKube
/// metadata:
///   name: dynakube
///   namespace: dynatrace
/// spec:
///   apiUrl: https://abc123.live.dynatrace.com/api
///   namespaceSelector:
///     matchLabels:
///       app: test
///   oneAgent:
///     applicationMonitoring:
///       useCSIDriver: false
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    namespaced,
    status = "DynaKubeStatus",
    shortname = "dk",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Tokens","type":"string","jsonPath":".spec.tokens"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Tenant API URL, e.g. `https://abc123.live.dynatrace.com/api`
    pub api_url: String,

    /// Secret in the operator namespace holding `apiToken`, `paasToken` and
    /// optionally `dataIngestToken`. Defaults to the DynaKube name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    /// ConfigMap in the operator namespace holding a PEM bundle under `certs`
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "trustedCAs")]
    pub trusted_cas: Option<String>,

    /// Proxy used towards the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Network zone for the code modules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Disable TLS verification towards the tenant
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_cert_check: bool,

    /// Namespaces that receive injection; empty selects every namespace
    #[serde(default)]
    pub namespace_selector: NamespaceSelector,

    /// Feature flags (bare keys, e.g. `webhook-reinvocation-policy`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_flags: BTreeMap<String, String>,

    /// OneAgent deployment mode; exactly one block must be set
    #[serde(default)]
    pub one_agent: OneAgentSpec,

    /// In-cluster ActiveGate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_gate: Option<ActiveGateSpec>,
}

/// Inline proxy value or a reference to a secret holding it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Secret in the operator namespace with the URL under `proxy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// Label selector over namespace labels
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Labels that must all be present with the given value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// One set-based selector requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Label key
    pub key: String,
    /// `In`, `NotIn`, `Exists` or `DoesNotExist`
    pub operator: String,
    /// Values for `In` / `NotIn`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl NamespaceSelector {
    /// Convert to the Kubernetes API type
    pub fn to_label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: (!self.match_labels.is_empty()).then(|| self.match_labels.clone()),
            match_expressions: (!self.match_expressions.is_empty()).then(|| {
                self.match_expressions
                    .iter()
                    .map(|r| LabelSelectorRequirement {
                        key: r.key.clone(),
                        operator: r.operator.clone(),
                        values: (!r.values.is_empty()).then(|| r.values.clone()),
                    })
                    .collect()
            }),
        }
    }

    /// Whether the selector matches the given labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        crate::kube_utils::selector_matches(&self.to_label_selector(), labels)
    }

    /// True when the selector has no constraints
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// OneAgent mode blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Full-stack host agent that also instruments every process on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classic_full_stack: Option<HostInjectSpec>,

    /// Host agent only, no application monitoring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_monitoring: Option<HostInjectSpec>,

    /// Host agent plus code-module injection through the CSI driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<CloudNativeFullStackSpec>,

    /// Code-module injection without host agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<ApplicationMonitoringSpec>,
}

/// Settings of modes that run a host agent DaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostInjectSpec {
    /// Nodes the host agent runs on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations of the host agent pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<TolerationSpec>,

    /// Installer arguments, e.g. `--set-host-group=prod`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment of the host agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,
}

/// Settings of modes that inject code modules into pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppInjectionSpec {
    /// Resources of the install-oneagent init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirementsSpec>,

    /// Image providing the code modules to the CSI driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules_image: Option<String>,

    /// Code-module version to download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `cloudNativeFullStack` mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudNativeFullStackSpec {
    /// Host agent settings
    #[serde(flatten)]
    pub host: HostInjectSpec,
    /// Injection settings
    #[serde(flatten)]
    pub app: AppInjectionSpec,
}

/// `applicationMonitoring` mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMonitoringSpec {
    /// Injection settings
    #[serde(flatten)]
    pub app: AppInjectionSpec,

    /// Provide code modules through the CSI driver (default false)
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "useCSIDriver")]
    pub use_csi_driver: Option<bool>,
}

/// Pod toleration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    /// Taint key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `Exists` or `Equal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// Plain environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVarSpec {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Resource limits and requests as quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirementsSpec {
    /// Limits, e.g. `cpu: 100m`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    /// Requests, e.g. `memory: 64Mi`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// In-cluster ActiveGate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateSpec {
    /// Enabled capabilities, e.g. `routing`, `metrics-ingest`
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Secret with the ActiveGate TLS certificate under `server.crt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    /// ActiveGate pod resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,
}

/// DynaKube status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase
    #[serde(default)]
    pub phase: DynaKubePhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Tenant UUID reported by the connection info endpoint
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "tenantUUID")]
    pub tenant_uuid: Option<String>,

    /// Tenant communication endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub communication_endpoints: Vec<String>,

    /// UID of the kube-system namespace, used as cluster identifier
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "kubeSystemUUID")]
    pub kube_system_uuid: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Namespaces carrying this DynaKube's instance label
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces_claimed: Vec<String>,

    /// Time of the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl DynaKubeStatus {
    /// Condition of the given type, if reported
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition, keeping its transition time when unchanged
    pub fn set_condition(&mut self, condition: Condition) {
        let previous = self.condition(&condition.type_).cloned();
        let condition = condition.carry_transition_time(previous.as_ref());
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }
}

/// DynaKube phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DynaKubePhase {
    /// Reconcile in progress
    #[default]
    Deploying,
    /// Namespaces mapped and secrets in place
    Running,
    /// Last reconcile failed
    Error,
}

impl std::fmt::Display for DynaKubePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploying => write!(f, "Deploying"),
            Self::Running => write!(f, "Running"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Which OneAgent mode block is set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeKind {
    /// `classicFullStack`
    ClassicFullStack,
    /// `hostMonitoring`
    HostMonitoring,
    /// `cloudNativeFullStack`
    CloudNativeFullStack,
    /// `applicationMonitoring`
    ApplicationMonitoring,
}

impl ModeKind {
    /// Deployment type string reported in `DT_DEPLOYMENT_METADATA`
    pub fn deployment_type(&self) -> &'static str {
        match self {
            Self::ClassicFullStack => "classic_fullstack",
            Self::HostMonitoring => "host_monitoring",
            Self::CloudNativeFullStack => "cloud_native_fullstack",
            Self::ApplicationMonitoring => "application_monitoring",
        }
    }
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.deployment_type())
    }
}

impl OneAgentSpec {
    fn set_modes(&self) -> Vec<ModeKind> {
        let mut modes = Vec::new();
        if self.classic_full_stack.is_some() {
            modes.push(ModeKind::ClassicFullStack);
        }
        if self.host_monitoring.is_some() {
            modes.push(ModeKind::HostMonitoring);
        }
        if self.cloud_native_full_stack.is_some() {
            modes.push(ModeKind::CloudNativeFullStack);
        }
        if self.application_monitoring.is_some() {
            modes.push(ModeKind::ApplicationMonitoring);
        }
        modes
    }

    fn host_spec(&self) -> Option<&HostInjectSpec> {
        self.classic_full_stack
            .as_ref()
            .or(self.host_monitoring.as_ref())
            .or(self.cloud_native_full_stack.as_ref().map(|c| &c.host))
    }

    fn app_spec(&self) -> Option<&AppInjectionSpec> {
        self.cloud_native_full_stack
            .as_ref()
            .map(|c| &c.app)
            .or(self.application_monitoring.as_ref().map(|a| &a.app))
    }
}

impl DynaKube {
    /// The configured mode, if any
    pub fn mode_kind(&self) -> Option<ModeKind> {
        self.spec.one_agent.set_modes().first().copied()
    }

    /// True when pods in claimed namespaces get code modules injected
    pub fn needs_app_injection(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
            || self.spec.one_agent.application_monitoring.is_some()
    }

    /// True when injected processes must be grouped to a host agent on the node
    pub fn needs_host_assignment(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
    }

    /// True when code modules come from the CSI driver
    pub fn needs_csi(&self) -> bool {
        if self.spec.one_agent.cloud_native_full_stack.is_some() {
            return true;
        }
        self.spec
            .one_agent
            .application_monitoring
            .as_ref()
            .and_then(|a| a.use_csi_driver)
            .unwrap_or(false)
    }

    /// Resources of the install-oneagent init container
    pub fn init_resources(&self) -> Option<&ResourceRequirementsSpec> {
        self.spec
            .one_agent
            .app_spec()
            .and_then(|a| a.init_resources.as_ref())
    }

    /// Image the CSI driver provisions code modules from
    pub fn code_modules_image(&self) -> Option<&str> {
        self.spec
            .one_agent
            .app_spec()
            .and_then(|a| a.code_modules_image.as_deref())
    }

    /// Node selector of the host agent
    pub fn host_node_selector(&self) -> BTreeMap<String, String> {
        self.spec
            .one_agent
            .host_spec()
            .map(|h| h.node_selector.clone())
            .unwrap_or_default()
    }

    /// Name of the tokens secret
    pub fn tokens_secret_name(&self) -> String {
        self.spec
            .tokens
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// Host group from a `--set-host-group=<group>` host agent argument
    pub fn host_group(&self) -> Option<String> {
        self.spec
            .one_agent
            .host_spec()?
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix(HOST_GROUP_ARG))
            .map(str::to_string)
            .filter(|g| !g.is_empty())
    }

    /// True when an ActiveGate with at least one capability is configured
    pub fn has_active_gate(&self) -> bool {
        self.spec
            .active_gate
            .as_ref()
            .is_some_and(|ag| !ag.capabilities.is_empty())
    }

    /// True when the ActiveGate serves the metrics ingest API
    pub fn has_metrics_ingest_active_gate(&self) -> bool {
        self.spec
            .active_gate
            .as_ref()
            .is_some_and(|ag| ag.capabilities.iter().any(|c| c == CAPABILITY_METRICS_INGEST))
    }

    /// In-cluster ActiveGate service host, `<name>-activegate.<namespace>`
    pub fn active_gate_service_host(&self) -> String {
        format!(
            "{}-activegate.{}",
            self.name_any(),
            self.namespace().unwrap_or_default()
        )
    }

    /// ActiveGate TLS secret name, if configured
    pub fn active_gate_tls_secret(&self) -> Option<&str> {
        self.spec
            .active_gate
            .as_ref()
            .and_then(|ag| ag.tls_secret_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Tenant API URL without trailing slash
    pub fn api_url(&self) -> &str {
        self.spec.api_url.trim_end_matches('/')
    }

    /// Tenant UUID from the last successful connection-info probe
    pub fn tenant_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tenant_uuid.as_deref())
            .filter(|t| !t.is_empty())
    }

    /// Effective feature flags from annotations and `spec.featureFlags`
    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags::from_dynakube(self)
    }

    /// Validate the DynaKube
    pub fn validate(&self) -> Result<(), Error> {
        let name = self.name_any();

        let modes = self.spec.one_agent.set_modes();
        if modes.len() != 1 {
            return Err(Error::validation_for_field(
                &name,
                "spec.oneAgent",
                format!("exactly one OneAgent mode must be set, found {}", modes.len()),
            ));
        }

        let api_url = self.spec.api_url.trim();
        if api_url.is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.apiUrl",
                "apiUrl must not be empty",
            ));
        }
        if api_url == PLACEHOLDER_API_URL {
            return Err(Error::validation_for_field(
                &name,
                "spec.apiUrl",
                "apiUrl still contains the example placeholder ENVIRONMENTID",
            ));
        }
        if !(api_url.starts_with("https://") || api_url.starts_with("http://")) {
            return Err(Error::validation_for_field(
                &name,
                "spec.apiUrl",
                "apiUrl must be an absolute http(s) URL",
            ));
        }
        if !api_url.trim_end_matches('/').ends_with("/api") {
            return Err(Error::validation_for_field(
                &name,
                "spec.apiUrl",
                "apiUrl must end with /api",
            ));
        }

        if let Some(ag) = &self.spec.active_gate {
            let mut seen = HashSet::new();
            for cap in &ag.capabilities {
                if !ACTIVE_GATE_CAPABILITIES.contains(&cap.as_str()) {
                    return Err(Error::validation_for_field(
                        &name,
                        "spec.activeGate.capabilities",
                        format!("unknown capability '{cap}'"),
                    ));
                }
                if !seen.insert(cap.as_str()) {
                    return Err(Error::validation_for_field(
                        &name,
                        "spec.activeGate.capabilities",
                        format!("duplicate capability '{cap}'"),
                    ));
                }
            }
        }

        validate_selector(&self.spec.namespace_selector.to_label_selector()).map_err(|msg| {
            Error::validation_for_field(&name, "spec.namespaceSelector", msg)
        })?;

        Ok(())
    }
}
