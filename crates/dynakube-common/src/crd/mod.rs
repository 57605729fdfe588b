//! Custom Resource Definitions for the DynaKube operator

mod dynakube;
mod feature_flags;
mod types;

pub use dynakube::{
    ActiveGateSpec, AppInjectionSpec, ApplicationMonitoringSpec, CloudNativeFullStackSpec,
    DynaKube, DynaKubePhase, DynaKubeSpec, DynaKubeStatus, EnvVarSpec, HostInjectSpec, ModeKind,
    NamespaceSelector, OneAgentSpec, ProxySpec, ResourceRequirementsSpec, SelectorRequirement,
    TolerationSpec, ACTIVE_GATE_CAPABILITIES, CAPABILITY_METRICS_INGEST, PLACEHOLDER_API_URL,
    PROXY_SECRET_KEY, TOKEN_API, TOKEN_DATA_INGEST, TOKEN_PAAS, TRUSTED_CAS_KEY,
};
pub use feature_flags::{FailurePolicy, FeatureFlags, DEPRECATED_FEATURE_PREFIX, FEATURE_PREFIX};
pub use types::{Condition, ConditionStatus};

/// `apiVersion` of the DynaKube CRD
pub const DYNAKUBE_API_VERSION: &str = "dynatrace.com/v1beta1";

/// `kind` of the DynaKube CRD
pub const DYNAKUBE_KIND: &str = "DynaKube";
