//! Pod transformation for code-module injection and metadata enrichment

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    Pod, ResourceRequirements, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use dynakube_common::crd::{DynaKube, FailurePolicy, ModeKind, ResourceRequirementsSpec};
use dynakube_common::env;
use dynakube_common::paths;
use dynakube_common::{
    annotations, ENDPOINT_SECRET_NAME, INIT_SECRET_NAME, INIT_SECRET_PROXY_FIELD,
    METRICS_INGEST_TOKEN_KEY, METRICS_INGEST_URL_KEY,
};

use crate::workload::WorkloadInfo;
use crate::WebhookConfig;

/// Name of the init container that installs the code modules
pub const INSTALL_CONTAINER_NAME: &str = "install-oneagent";
/// Code-module binaries (CSI or EmptyDir)
pub const BIN_VOLUME: &str = "oneagent-bin";
/// Files written by the init container for the user containers
pub const SHARE_VOLUME: &str = "oneagent-share";
/// Projection of the init secret
pub const CONFIG_VOLUME: &str = "oneagent-config";
/// Projection of the endpoint secret
pub const ENDPOINT_VOLUME: &str = "data-ingest-endpoint";
/// Enrichment files written by the init container
pub const ENRICHMENT_VOLUME: &str = "data-ingest-enrichment";
/// Writable `agent/conf` when the CSI volume is read-only
pub const AGENT_CONF_VOLUME: &str = "oneagent-agent-conf";

const CSI_MODE_ATTRIBUTE: &str = "mode";
const CSI_APP_MODE: &str = "app";
const CSI_DYNAKUBE_ATTRIBUTE: &str = "dynakube";

const DEFAULT_FLAVOR: &str = "multidistro";
const DEFAULT_TECHNOLOGIES: &str = "all";
const IMAGE_PULL_IF_NOT_PRESENT: &str = "IfNotPresent";
const INIT_ARG: &str = "init";

const VERSION_LABEL: &str = "app.kubernetes.io/version";
const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Which parts of the injection apply to a pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InjectionParts {
    /// Code modules (LD_PRELOAD, container.conf)
    pub oneagent: bool,
    /// Metadata enrichment (endpoint secret, dt_metadata files)
    pub enrichment: bool,
}

impl InjectionParts {
    /// True when at least one part applies
    pub fn any(&self) -> bool {
        self.oneagent || self.enrichment
    }
}

/// Metrics ingest endpoint read from the endpoint secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestEndpoint {
    /// Value of `DT_METRICS_INGEST_URL`
    pub url: String,
    /// Value of `DT_METRICS_INGEST_API_TOKEN`, possibly empty
    pub token: String,
}

impl IngestEndpoint {
    /// Parse the `KEY=value` lines of `endpoint.properties`
    pub fn parse(properties: &str) -> Self {
        let mut endpoint = Self::default();
        for line in properties.lines() {
            match line.split_once('=') {
                Some((METRICS_INGEST_URL_KEY, url)) => endpoint.url = url.trim().to_string(),
                Some((METRICS_INGEST_TOKEN_KEY, token)) => {
                    endpoint.token = token.trim().to_string()
                }
                _ => {}
            }
        }
        endpoint
    }
}

/// Per-pod settings from annotations, falling back to DynaKube defaults
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSettings {
    /// Image of the init container
    pub image: String,
    /// Installer flavor
    pub flavor: String,
    /// URL-encoded technology list
    pub technologies: String,
    /// Code-module install path in the user containers
    pub install_path: String,
    /// Download URL override
    pub installer_url: String,
    /// `fail` or `silent`
    pub failure_policy: String,
}

pub(crate) fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

impl PodSettings {
    /// Read the per-pod overrides of `pod`
    pub fn from_pod(pod: &Pod, dk: &DynaKube, config: &WebhookConfig) -> Self {
        let technologies = annotation(pod, annotations::TECHNOLOGIES).unwrap_or(DEFAULT_TECHNOLOGIES);
        let failure_policy = annotation(pod, annotations::FAILURE_POLICY)
            .map(FailurePolicy::parse)
            .unwrap_or_else(|| dk.feature_flags().injection_failure_policy());
        Self {
            image: annotation(pod, annotations::IMAGE)
                .unwrap_or(config.installer_image.as_str())
                .to_string(),
            flavor: annotation(pod, annotations::FLAVOR)
                .unwrap_or(DEFAULT_FLAVOR)
                .to_string(),
            technologies: url::form_urlencoded::byte_serialize(technologies.as_bytes()).collect(),
            install_path: annotation(pod, annotations::INSTALL_PATH)
                .unwrap_or(paths::DEFAULT_INSTALL_PATH)
                .to_string(),
            installer_url: annotation(pod, annotations::INSTALLER_URL)
                .unwrap_or_default()
                .to_string(),
            failure_policy: failure_policy.as_str().to_string(),
        }
    }
}

/// Pod name prefix shared by all replicas of a workload.
///
/// Uses `generateName` when set, else the name, and drops everything from
/// the last `-` on.
pub fn base_pod_name(pod: &Pod) -> String {
    let name = pod
        .metadata
        .generate_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(pod.metadata.name.as_deref())
        .unwrap_or_default();
    match name.rfind('-') {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether `container` has an env var named `name`
pub fn has_env(container: &Container, name: &str) -> bool {
    container
        .env
        .as_ref()
        .is_some_and(|env| env.iter().any(|e| e.name == name))
}

/// Whether `container` mounts the volume `volume`
pub fn has_mount(container: &Container, volume: &str) -> bool {
    container
        .volume_mounts
        .as_ref()
        .is_some_and(|mounts| mounts.iter().any(|m| m.name == volume))
}

fn push_env(container: &mut Container, var: EnvVar) {
    container.env.get_or_insert_with(Vec::new).push(var);
}

fn push_env_if_missing(container: &mut Container, var: EnvVar) {
    if !has_env(container, &var.name) {
        push_env(container, var);
    }
}

fn push_mount(container: &mut Container, volume_mount: VolumeMount) {
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(volume_mount);
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!map.is_empty()).then(|| {
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}

fn resources(spec: Option<&ResourceRequirementsSpec>) -> Option<ResourceRequirements> {
    spec.map(|r| ResourceRequirements {
        limits: quantities(&r.limits),
        requests: quantities(&r.requests),
        ..Default::default()
    })
}

/// Set the `CONTAINER_<i>_*` pair of `index` and raise `CONTAINERS_COUNT`
pub fn add_container_entry(install: &mut Container, index: usize, container: &Container) {
    push_env(install, env_value(&env::container_name(index), container.name.clone()));
    push_env(
        install,
        env_value(
            &env::container_image(index),
            container.image.clone().unwrap_or_default(),
        ),
    );
    let count = index.to_string();
    match install
        .env
        .as_mut()
        .and_then(|vars| vars.iter_mut().find(|e| e.name == env::CONTAINERS_COUNT))
    {
        Some(var) => var.value = Some(count),
        None => push_env(install, env_value(env::CONTAINERS_COUNT, count)),
    }
}

/// Container names already listed in the install container
pub fn listed_containers(install: &Container) -> Vec<String> {
    let vars = install.env.as_deref().unwrap_or_default();
    (1..)
        .map_while(|i| {
            let key = env::container_name(i);
            vars.iter()
                .find(|e| e.name == key)
                .map(|e| e.value.clone().unwrap_or_default())
        })
        .collect()
}

/// Everything needed to inject one pod
pub struct PodInjector<'a> {
    /// Owning DynaKube
    pub dynakube: &'a DynaKube,
    /// Webhook settings
    pub config: &'a WebhookConfig,
    /// Parts that apply to the pod
    pub parts: InjectionParts,
    /// Root owner of the pod, only resolved for enrichment
    pub workload: Option<WorkloadInfo>,
    /// Metrics ingest endpoint for enrichment
    pub ingest: IngestEndpoint,
    /// Init secret carries a trust bundle or ActiveGate certificate
    pub has_custom_certs: bool,
}

impl PodInjector<'_> {
    fn mode(&self) -> ModeKind {
        self.dynakube
            .mode_kind()
            .unwrap_or(ModeKind::ApplicationMonitoring)
    }

    fn read_only_csi(&self) -> bool {
        self.dynakube.needs_csi() && self.dynakube.feature_flags().readonly_csi_volume()
    }

    /// `DT_DEPLOYMENT_METADATA` value
    pub fn deployment_metadata(&self) -> String {
        format!(
            "orchestration_tech=Operator-{};script_version={};orchestrator_id={}",
            self.mode().deployment_type(),
            self.config.version,
            self.config.cluster_id
        )
    }

    fn bin_volume(&self) -> Volume {
        if !self.dynakube.needs_csi() {
            return empty_dir(BIN_VOLUME);
        }
        Volume {
            name: BIN_VOLUME.to_string(),
            csi: Some(CSIVolumeSource {
                driver: self.config.csi_driver_name.clone(),
                read_only: self.read_only_csi().then_some(true),
                volume_attributes: Some(BTreeMap::from([
                    (CSI_MODE_ATTRIBUTE.to_string(), CSI_APP_MODE.to_string()),
                    (CSI_DYNAKUBE_ATTRIBUTE.to_string(), self.dynakube.name_any()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(super) fn volumes(&self) -> Vec<Volume> {
        let mut volumes = Vec::new();
        if self.parts.oneagent {
            volumes.push(self.bin_volume());
            volumes.push(empty_dir(SHARE_VOLUME));
        }
        volumes.push(secret_volume(CONFIG_VOLUME, INIT_SECRET_NAME));
        if self.parts.enrichment {
            volumes.push(secret_volume(ENDPOINT_VOLUME, ENDPOINT_SECRET_NAME));
            volumes.push(empty_dir(ENRICHMENT_VOLUME));
        }
        if self.parts.oneagent && self.read_only_csi() {
            volumes.push(empty_dir(AGENT_CONF_VOLUME));
        }
        volumes
    }

    fn install_container(&self, pod: &Pod, settings: &PodSettings) -> Container {
        let mut env_vars = vec![
            env_value(env::FAILURE_POLICY, settings.failure_policy.clone()),
            env_value(env::CONTAINERS_COUNT, "0"),
            env_field(env::K8S_POD_NAME, "metadata.name"),
            env_field(env::K8S_POD_UID, "metadata.uid"),
            env_value(env::K8S_BASE_POD_NAME, base_pod_name(pod)),
            env_field(env::K8S_NAMESPACE, "metadata.namespace"),
            env_field(env::K8S_NODE_NAME, "spec.nodeName"),
            env_value(env::K8S_CLUSTER_ID, self.config.cluster_id.clone()),
        ];
        if let Some(cluster_name) = &self.config.cluster_name {
            env_vars.push(env_value(env::K8S_CLUSTER_NAME, cluster_name.clone()));
        }
        let mut mounts = vec![mount(CONFIG_VOLUME, paths::CONFIG_MOUNT, None)];

        if self.parts.oneagent {
            let mode = if self.dynakube.needs_csi() {
                env::MODE_PROVISIONED
            } else {
                env::MODE_INSTALLER
            };
            env_vars.extend([
                env_value(env::MODE, mode),
                env_value(env::INSTALLER_URL, settings.installer_url.clone()),
                env_value(env::FLAVOR, settings.flavor.clone()),
                env_value(env::TECHNOLOGIES, settings.technologies.clone()),
                env_value(env::INSTALL_PATH, settings.install_path.clone()),
                env_value(env::ONEAGENT_INJECTED, "true"),
            ]);
            mounts.push(mount(BIN_VOLUME, paths::BIN_MOUNT, None));
            mounts.push(mount(SHARE_VOLUME, paths::SHARE_MOUNT, None));
            if self.read_only_csi() {
                env_vars.push(env_value(env::READ_ONLY_CSI, "true"));
                mounts.push(mount(AGENT_CONF_VOLUME, paths::AGENT_CONF_MOUNT, None));
            }
        } else {
            env_vars.push(env_value(env::ONEAGENT_INJECTED, "false"));
        }

        if self.parts.enrichment {
            let workload = self.workload.clone().unwrap_or_else(WorkloadInfo::unknown);
            env_vars.extend([
                env_value(env::WORKLOAD_KIND, workload.kind),
                env_value(env::WORKLOAD_NAME, workload.name),
                env_value(env::ENRICHMENT_INJECTED, "true"),
            ]);
            mounts.push(mount(ENRICHMENT_VOLUME, paths::ENRICHMENT_MOUNT, None));
        } else {
            env_vars.push(env_value(env::ENRICHMENT_INJECTED, "false"));
        }

        Container {
            name: INSTALL_CONTAINER_NAME.to_string(),
            image: Some(settings.image.clone()),
            image_pull_policy: Some(IMAGE_PULL_IF_NOT_PRESENT.to_string()),
            args: Some(vec![INIT_ARG.to_string()]),
            env: Some(env_vars),
            volume_mounts: Some(mounts),
            security_context: pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .and_then(|c| c.security_context.clone()),
            resources: resources(self.dynakube.init_resources()),
            ..Default::default()
        }
    }

    /// Add the code-module mounts and env to a user container
    pub fn inject_oneagent(&self, container: &mut Container, settings: &PodSettings) {
        let conf_file = paths::container_conf_filename(&container.name);
        push_mount(
            container,
            mount(
                SHARE_VOLUME,
                paths::LD_PRELOAD_MOUNT,
                Some(paths::LD_PRELOAD_FILENAME),
            ),
        );
        push_mount(container, mount(BIN_VOLUME, &settings.install_path, None));
        push_mount(
            container,
            mount(SHARE_VOLUME, paths::CONTAINER_CONF_MOUNT, Some(&conf_file)),
        );
        if self.has_custom_certs {
            push_mount(
                container,
                mount(
                    SHARE_VOLUME,
                    paths::CUSTOM_CERTS_MOUNT,
                    Some(paths::CUSTOM_CERTS_FILENAME),
                ),
            );
        }
        if self.read_only_csi() {
            let conf_dir = format!("{}/agent/conf", settings.install_path.trim_end_matches('/'));
            push_mount(container, mount(AGENT_CONF_VOLUME, &conf_dir, None));
        }

        push_env_if_missing(container, env_value(env::DEPLOYMENT_METADATA, self.deployment_metadata()));
        push_env(
            container,
            env_value(env::LD_PRELOAD, paths::preload_library(&settings.install_path)),
        );

        let has_proxy = self.dynakube.spec.proxy.as_ref().is_some_and(|p| {
            p.value.as_deref().is_some_and(|v| !v.is_empty())
                || p.value_from.as_deref().is_some_and(|v| !v.is_empty())
        });
        if has_proxy {
            push_env_if_missing(
                container,
                EnvVar {
                    name: env::PROXY.to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: INIT_SECRET_NAME.to_string(),
                            key: INIT_SECRET_PROXY_FIELD.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
        }
        if let Some(zone) = self.dynakube.spec.network_zone.as_deref().filter(|z| !z.is_empty()) {
            push_env_if_missing(container, env_value(env::NETWORK_ZONE, zone));
        }
        if self.dynakube.feature_flags().label_version_detection() {
            push_env_if_missing(
                container,
                env_field(env::RELEASE_VERSION, &format!("metadata.labels['{VERSION_LABEL}']")),
            );
            push_env_if_missing(
                container,
                env_field(env::RELEASE_PRODUCT, &format!("metadata.labels['{PART_OF_LABEL}']")),
            );
        }
    }

    /// Add the enrichment mounts and ingest env to a user container
    pub fn inject_enrichment(&self, container: &mut Container) {
        let sub_path = container.name.clone();
        push_mount(
            container,
            mount(ENRICHMENT_VOLUME, paths::ENRICHMENT_MOUNT, Some(&sub_path)),
        );
        push_mount(
            container,
            mount(ENDPOINT_VOLUME, paths::ENRICHMENT_ENDPOINT_MOUNT, None),
        );

        push_env_if_missing(container, env_value(env::DEPLOYMENT_METADATA, self.deployment_metadata()));
        push_env_if_missing(
            container,
            env_value(METRICS_INGEST_URL_KEY, self.ingest.url.clone()),
        );
        if !self.ingest.token.is_empty() {
            push_env_if_missing(
                container,
                env_value(METRICS_INGEST_TOKEN_KEY, self.ingest.token.clone()),
            );
        }
    }

    /// Apply the full injection to a pod that was not injected before
    pub fn inject(&self, pod: &mut Pod) {
        let settings = PodSettings::from_pod(pod, self.dynakube, self.config);
        let mut install = self.install_container(pod, &settings);
        let volumes = self.volumes();

        let Some(spec) = pod.spec.as_mut() else {
            return;
        };
        spec.volumes.get_or_insert_with(Vec::new).extend(volumes);
        for (idx, container) in spec.containers.iter_mut().enumerate() {
            add_container_entry(&mut install, idx + 1, container);
            if self.parts.oneagent {
                self.inject_oneagent(container, &settings);
            }
            if self.parts.enrichment {
                self.inject_enrichment(container);
            }
        }
        spec.init_containers.get_or_insert_with(Vec::new).push(install);

        let pod_annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if self.parts.oneagent {
            pod_annotations.insert(annotations::ONEAGENT_INJECTED.to_string(), "true".to_string());
        }
        if self.parts.enrichment {
            pod_annotations.insert(annotations::DATA_INGEST_INJECTED.to_string(), "true".to_string());
        }
    }
}
