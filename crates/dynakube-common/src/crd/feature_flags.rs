//! DynaKube feature flags
//!
//! Flags are read from DynaKube annotations (`feature.dynatrace.com/<key>`,
//! or the deprecated `alpha.operator.dynatrace.com/feature-<key>`) and then
//! overlaid by `spec.featureFlags`, which uses the bare key.

use std::collections::BTreeMap;

use tracing::warn;

use super::dynakube::DynaKube;

/// Annotation prefix of feature flags
pub const FEATURE_PREFIX: &str = "feature.dynatrace.com/";

/// Deprecated annotation prefix of feature flags
pub const DEPRECATED_FEATURE_PREFIX: &str = "alpha.operator.dynatrace.com/feature-";

const WEBHOOK_REINVOCATION_POLICY: &str = "webhook-reinvocation-policy";
const DISABLE_WEBHOOK_REINVOCATION_POLICY: &str = "disable-webhook-reinvocation-policy";
const IGNORED_NAMESPACES: &str = "ignored-namespaces";
const IGNORE_UNKNOWN_STATE: &str = "ignore-unknown-state";
const ONEAGENT_MAX_UNAVAILABLE: &str = "oneagent-max-unavailable";
const NO_PROXY: &str = "no-proxy";
const ONEAGENT_INITIAL_CONNECT_RETRY: &str = "oneagent-initial-connect-retry-ms";
const INJECTION_READONLY_VOLUME: &str = "injection-readonly-volume";
const LABEL_VERSION_DETECTION: &str = "label-version-detection";
const INJECTION_FAILURE_POLICY: &str = "injection-failure-policy";
const METADATA_ENRICHMENT: &str = "metadata-enrichment";
const DISABLE_METADATA_ENRICHMENT: &str = "disable-metadata-enrichment";
const AUTOMATIC_INJECTION: &str = "automatic-injection";
const ENFORCEMENT_MODE: &str = "enforcement-mode";

/// What the install-oneagent init container does when a step fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Exit non-zero so the pod does not start
    Fail,
    /// Log and exit zero so the pod starts uninstrumented
    #[default]
    Silent,
}

impl FailurePolicy {
    /// Parse a policy value; `force` is the legacy spelling of `fail` and
    /// anything unrecognised is `silent`
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "fail" | "force" => Self::Fail,
            _ => Self::Silent,
        }
    }

    /// Canonical value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Silent => "silent",
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective feature flags of one DynaKube, keyed by bare flag name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    raw: BTreeMap<String, String>,
}

impl FeatureFlags {
    /// Collect flags from the DynaKube's annotations and spec
    pub fn from_dynakube(dk: &DynaKube) -> Self {
        let mut raw = BTreeMap::new();
        if let Some(annotations) = &dk.metadata.annotations {
            // deprecated prefix first so the current one wins
            for prefix in [DEPRECATED_FEATURE_PREFIX, FEATURE_PREFIX] {
                for (key, value) in annotations {
                    if let Some(flag) = key.strip_prefix(prefix) {
                        raw.insert(flag.to_string(), value.clone());
                    }
                }
            }
        }
        for (key, value) in &dk.spec.feature_flags {
            raw.insert(key.clone(), value.clone());
        }
        Self { raw }
    }

    /// Build from bare keys
    pub fn from_map(raw: BTreeMap<String, String>) -> Self {
        Self { raw }
    }

    /// Raw value of a flag, if set and non-empty
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.raw
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn is_true(&self, key: &str) -> bool {
        self.raw(key) == Some("true")
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    /// Enabled unless `key=false`, or the deprecated inverse is `true` while
    /// `key` is unset
    fn enabled_with_deprecated_inverse(&self, key: &str, disable_key: &str) -> bool {
        match self.raw(key) {
            Some("false") => false,
            Some(_) => true,
            None => !self.is_true(disable_key),
        }
    }

    fn int_or(&self, key: &str, default: i64) -> i64 {
        match self.raw(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!(flag = key, value = v, "feature flag is not an integer, using default");
                default
            }),
            None => default,
        }
    }

    /// Reinvocation of the pod webhook adds containers appended by later mutators
    pub fn webhook_reinvocation_policy(&self) -> bool {
        self.enabled_with_deprecated_inverse(
            WEBHOOK_REINVOCATION_POLICY,
            DISABLE_WEBHOOK_REINVOCATION_POLICY,
        )
    }

    /// Regular expressions of namespaces never claimed by this DynaKube.
    ///
    /// Defaults to the DynaKube's own namespace, `kube-*` and `openshift(-*)`.
    pub fn ignored_namespaces(&self, operator_namespace: &str) -> Vec<String> {
        let defaults = || {
            vec![
                format!("^{operator_namespace}$"),
                "^kube-.*".to_string(),
                "^openshift(-.*)?".to_string(),
            ]
        };
        match self.raw(IGNORED_NAMESPACES) {
            Some(v) => serde_json::from_str(v).unwrap_or_else(|e| {
                warn!(error = %e, "ignored-namespaces is not a JSON list, using defaults");
                defaults()
            }),
            None => defaults(),
        }
    }

    /// Keep nodes whose `Ready` condition is `Unknown` in the node map
    pub fn ignore_unknown_state(&self) -> bool {
        self.is_true(IGNORE_UNKNOWN_STATE)
    }

    /// `maxUnavailable` of the host agent DaemonSet rollout
    pub fn oneagent_max_unavailable(&self) -> i64 {
        self.int_or(ONEAGENT_MAX_UNAVAILABLE, 1)
    }

    /// Hosts that bypass the proxy
    pub fn no_proxy(&self) -> String {
        self.raw(NO_PROXY).unwrap_or_default().to_string()
    }

    /// Initial connect retry of the code modules in ms, -1 when unset
    pub fn initial_connect_retry_ms(&self) -> i64 {
        self.int_or(ONEAGENT_INITIAL_CONNECT_RETRY, -1)
    }

    /// Mount the CSI volume read-only and give `agent/conf` its own volume
    pub fn readonly_csi_volume(&self) -> bool {
        self.is_true(INJECTION_READONLY_VOLUME)
    }

    /// Expose `app.kubernetes.io/version` / `part-of` labels as release env
    pub fn label_version_detection(&self) -> bool {
        self.is_true(LABEL_VERSION_DETECTION)
    }

    /// Failure policy of the init container
    pub fn injection_failure_policy(&self) -> FailurePolicy {
        self.raw(INJECTION_FAILURE_POLICY)
            .map(FailurePolicy::parse)
            .unwrap_or_default()
    }

    /// Metadata enrichment next to code-module injection
    pub fn metadata_enrichment(&self) -> bool {
        self.enabled_with_deprecated_inverse(METADATA_ENRICHMENT, DISABLE_METADATA_ENRICHMENT)
    }

    /// Inject every pod unless it opts out; when false, pods must opt in
    pub fn automatic_injection(&self) -> bool {
        self.bool_or(AUTOMATIC_INJECTION, true)
    }

    /// Group injected processes to the DynaKube tenant regardless of node map
    pub fn enforcement_mode(&self) -> bool {
        self.bool_or(ENFORCEMENT_MODE, true)
    }
}
