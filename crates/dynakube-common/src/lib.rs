//! Common types for the DynaKube operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod secret_config;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use secret_config::SecretConfig;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator runs in when `POD_NAMESPACE` is not set
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "dynatrace";

/// Default port for the admission webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Name of the CSI driver that provisions the shared code-module volume
pub const DEFAULT_CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

/// Name of the CSI driver DaemonSet in the operator namespace
pub const CSI_DAEMONSET_NAME: &str = "dynatrace-oneagent-csi-driver";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "dynakube-operator";

// =============================================================================
// Labels and annotations
// =============================================================================

/// Namespace label naming the DynaKube that claims the namespace
pub const INSTANCE_LABEL: &str = "dynakube.internal.dynatrace.com/instance";

/// Namespace annotation marking a label write made by the operator itself
pub const UPDATED_VIA_OPERATOR_ANNOTATION: &str =
    "dynakube.internal.dynatrace.com/updated-via-operator";

/// Label placed on every object the operator creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "dynakube-operator";

/// Finalizer guarding namespace cleanup when a DynaKube is deleted
pub const CLEANUP_FINALIZER: &str = "dynatrace.com/namespace-cleanup";

/// Pod annotations consumed and written by the pod mutator
pub mod annotations {
    /// Global opt-out: `dynatrace.com/inject=false` skips all injection
    pub const INJECT: &str = "dynatrace.com/inject";
    /// OneAgent opt-in/opt-out
    pub const ONEAGENT_INJECT: &str = "oneagent.dynatrace.com/inject";
    /// Set by the operator once the pod was injected
    pub const ONEAGENT_INJECTED: &str = "oneagent.dynatrace.com/injected";
    /// Custom installer image
    pub const IMAGE: &str = "oneagent.dynatrace.com/image";
    /// Code-module technologies to download
    pub const TECHNOLOGIES: &str = "oneagent.dynatrace.com/technologies";
    /// Install path of the code modules inside the user containers
    pub const INSTALL_PATH: &str = "oneagent.dynatrace.com/install-path";
    /// Download URL overriding the tenant download endpoint
    pub const INSTALLER_URL: &str = "oneagent.dynatrace.com/installer-url";
    /// Failure policy of the init container (`fail` or `silent`)
    pub const FAILURE_POLICY: &str = "oneagent.dynatrace.com/failure-policy";
    /// Installer flavor (`default`, `musl`, `multidistro`)
    pub const FLAVOR: &str = "oneagent.dynatrace.com/flavor";
    /// Data-ingest (metadata enrichment) opt-out
    pub const DATA_INGEST_INJECT: &str = "data-ingest.dynatrace.com/inject";
    /// Set by the operator once metadata enrichment was injected
    pub const DATA_INGEST_INJECTED: &str = "data-ingest.dynatrace.com/injected";
}

// =============================================================================
// Per-namespace secrets
// =============================================================================

/// Name of the init secret in every claimed namespace
pub const INIT_SECRET_NAME: &str = "dynatrace-dynakube-config";

/// Init secret key holding the serialized [`SecretConfig`]
pub const INIT_SECRET_CONFIG_FIELD: &str = "config";

/// Init secret key holding the trusted CA bundle
pub const INIT_SECRET_TRUSTED_CAS_FIELD: &str = "trustedcas";

/// Init secret key holding the ActiveGate certificate
pub const INIT_SECRET_AG_CERTS_FIELD: &str = "agcerts";

/// Init secret key holding the proxy URL, referenced by `DT_PROXY`
pub const INIT_SECRET_PROXY_FIELD: &str = "proxy";

/// Name of the data-ingest endpoint secret in every claimed namespace
pub const ENDPOINT_SECRET_NAME: &str = "dynatrace-data-ingest-endpoint";

/// Endpoint secret key holding the properties file
pub const ENDPOINT_PROPERTIES_FIELD: &str = "endpoint.properties";

/// Property key of the metrics ingest URL
pub const METRICS_INGEST_URL_KEY: &str = "DT_METRICS_INGEST_URL";

/// Property key of the metrics ingest token
pub const METRICS_INGEST_TOKEN_KEY: &str = "DT_METRICS_INGEST_API_TOKEN";

/// Host tenant value meaning "no host agent on this node"
pub const NO_HOST_TENANT: &str = "-";

// =============================================================================
// Environment of the install-oneagent init container
// =============================================================================

/// Environment variables the pod mutator sets and the init runner reads
pub mod env {
    /// `installer` (download) or `provisioned` (CSI volume)
    pub const MODE: &str = "MODE";
    /// Failure policy of the init runner
    pub const FAILURE_POLICY: &str = "FAILURE_POLICY";
    /// Optional download URL overriding the tenant endpoint
    pub const INSTALLER_URL: &str = "INSTALLER_URL";
    /// Installer flavor
    pub const FLAVOR: &str = "FLAVOR";
    /// Optional code-module version
    pub const VERSION: &str = "VERSION";
    /// Comma-separated, URL-encoded technology list
    pub const TECHNOLOGIES: &str = "TECHNOLOGIES";
    /// Install path inside the user containers
    pub const INSTALL_PATH: &str = "INSTALLPATH";
    /// Number of `CONTAINER_<i>_*` pairs
    pub const CONTAINERS_COUNT: &str = "CONTAINERS_COUNT";
    /// Node name (downward API)
    pub const K8S_NODE_NAME: &str = "K8S_NODE_NAME";
    /// Pod name (downward API)
    pub const K8S_POD_NAME: &str = "K8S_PODNAME";
    /// Pod UID (downward API)
    pub const K8S_POD_UID: &str = "K8S_PODUID";
    /// Pod name without the generated suffix
    pub const K8S_BASE_POD_NAME: &str = "K8S_BASEPODNAME";
    /// Pod namespace (downward API)
    pub const K8S_NAMESPACE: &str = "K8S_NAMESPACE";
    /// UID of the `kube-system` namespace
    pub const K8S_CLUSTER_ID: &str = "K8S_CLUSTER_ID";
    /// Optional human-readable cluster name
    pub const K8S_CLUSTER_NAME: &str = "K8S_CLUSTER_NAME";
    /// Kind of the pod's root owner
    pub const WORKLOAD_KIND: &str = "DT_WORKLOAD_KIND";
    /// Name of the pod's root owner
    pub const WORKLOAD_NAME: &str = "DT_WORKLOAD_NAME";
    /// Whether code modules are injected
    pub const ONEAGENT_INJECTED: &str = "ONEAGENT_INJECTED";
    /// Whether metadata enrichment is injected
    pub const ENRICHMENT_INJECTED: &str = "METADATA_ENRICHMENT_INJECTED";
    /// Whether the CSI volume is mounted read-only
    pub const READ_ONLY_CSI: &str = "ONEAGENT_READ_ONLY_CSI";
    /// Workload kind/name placeholder when the owner lookup failed
    pub const UNKNOWN_WORKLOAD: &str = "UNKNOWN";

    /// `MODE` value when code modules come from the CSI driver
    pub const MODE_PROVISIONED: &str = "provisioned";
    /// `MODE` value when the init container downloads the code modules
    pub const MODE_INSTALLER: &str = "installer";

    /// `CONTAINER_<i>_NAME` for the 1-based index `i`
    pub fn container_name(index: usize) -> String {
        format!("CONTAINER_{index}_NAME")
    }

    /// `CONTAINER_<i>_IMAGE` for the 1-based index `i`
    pub fn container_image(index: usize) -> String {
        format!("CONTAINER_{index}_IMAGE")
    }

    /// Preloaded agent library in user containers
    pub const LD_PRELOAD: &str = "LD_PRELOAD";
    /// Deployment metadata reported by the code modules
    pub const DEPLOYMENT_METADATA: &str = "DT_DEPLOYMENT_METADATA";
    /// Proxy for the code modules
    pub const PROXY: &str = "DT_PROXY";
    /// Network zone for the code modules
    pub const NETWORK_ZONE: &str = "DT_NETWORK_ZONE";
    /// Release version taken from the pod's version label
    pub const RELEASE_VERSION: &str = "DT_RELEASE_VERSION";
    /// Release product taken from the pod's part-of label
    pub const RELEASE_PRODUCT: &str = "DT_RELEASE_PRODUCT";
}

// =============================================================================
// Mount points shared by the mutator and the init runner
// =============================================================================

/// Mount paths inside the install-oneagent init container and user containers
pub mod paths {
    /// Code-module binaries inside the init container
    pub const BIN_MOUNT: &str = "/mnt/bin";
    /// Shared config files written by the init container
    pub const SHARE_MOUNT: &str = "/mnt/share";
    /// Init secret inside the init container
    pub const CONFIG_MOUNT: &str = "/mnt/config";
    /// Writable copy of `agent/conf` when the CSI volume is read-only
    pub const AGENT_CONF_MOUNT: &str = "/mnt/agent-conf";
    /// Enrichment directory (both init and user containers)
    pub const ENRICHMENT_MOUNT: &str = "/var/lib/dynatrace/enrichment";
    /// Endpoint properties inside user containers
    pub const ENRICHMENT_ENDPOINT_MOUNT: &str = "/var/lib/dynatrace/enrichment/endpoint";
    /// Default code-module install path inside user containers
    pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";
    /// Preload file location inside user containers
    pub const LD_PRELOAD_MOUNT: &str = "/etc/ld.so.preload";
    /// Container configuration inside user containers
    pub const CONTAINER_CONF_MOUNT: &str =
        "/var/lib/dynatrace/oneagent/agent/config/container.conf";
    /// Custom certificates inside user containers
    pub const CUSTOM_CERTS_MOUNT: &str = "/var/lib/dynatrace/oneagent/agent/customkeys/custom.pem";

    /// Preload file name in the share volume
    pub const LD_PRELOAD_FILENAME: &str = "ld.so.preload";
    /// Curl options file name in the share volume
    pub const CURL_OPTIONS_FILENAME: &str = "curl_options.conf";
    /// Combined CA bundle file name in the share volume
    pub const CUSTOM_CERTS_FILENAME: &str = "custom.pem";
    /// Proxy CA bundle file name in the share volume
    pub const CUSTOM_PROXY_CERTS_FILENAME: &str = "custom_proxy.pem";
    /// Enrichment JSON file name
    pub const ENRICHMENT_JSON_FILENAME: &str = "dt_metadata.json";
    /// Enrichment properties file name
    pub const ENRICHMENT_PROPERTIES_FILENAME: &str = "dt_metadata.properties";
    /// Shared library preloaded into user processes, relative to the install path
    pub const LIB_ONEAGENT_PROC: &str = "agent/lib64/liboneagentproc.so";

    /// Per-container configuration file name in the share volume
    pub fn container_conf_filename(container: &str) -> String {
        format!("container_{container}.conf")
    }

    /// Absolute preload library path for the given install path
    pub fn preload_library(install_path: &str) -> String {
        format!("{}/{}", install_path.trim_end_matches('/'), LIB_ONEAGENT_PROC)
    }
}
