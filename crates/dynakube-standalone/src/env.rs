//! Environment contract between the pod mutator and the init runner
//!
//! Every value the runner needs is passed through the environment of the
//! install-oneagent init container. Missing variables are collected and
//! reported together so a broken pod spec is diagnosed in one go.

use std::collections::BTreeMap;

use dynakube_common::crd::FailurePolicy;
use dynakube_common::env;
use tracing::warn;

use crate::error::RunnerError;

const DEFAULT_FLAVOR: &str = "default";

/// Upper bound for `CONTAINERS_COUNT`
pub const MAX_CONTAINERS: usize = 256;

/// Source of environment variables
pub trait EnvSource: Send + Sync {
    /// Value of `key`, `None` when unset
    fn get(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// How the code modules reach the pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallMode {
    /// Downloaded from the tenant by the init container
    Installer,
    /// Already present on the CSI volume
    Provisioned,
}

impl InstallMode {
    fn parse(value: &str) -> Result<Self, RunnerError> {
        match value {
            env::MODE_INSTALLER => Ok(Self::Installer),
            env::MODE_PROVISIONED => Ok(Self::Provisioned),
            other => Err(RunnerError::InvalidEnv {
                name: env::MODE.to_string(),
                reason: format!("unknown mode '{other}'"),
            }),
        }
    }
}

/// A user container the init runner prepares files for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Container image
    pub image: String,
}

/// OneAgent-specific settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OneAgentEnv {
    /// Install mode
    pub mode: InstallMode,
    /// Explicit installer URL, bypassing the tenant download
    pub installer_url: Option<String>,
    /// Installer flavor
    pub flavor: String,
    /// Code-module version, latest when `None`
    pub version: Option<String>,
    /// Technologies to download
    pub technologies: Vec<String>,
    /// Install path inside user containers
    pub install_path: String,
    /// Node the pod is scheduled on
    pub node_name: String,
    /// Pod name without the generated suffix
    pub base_pod_name: String,
    /// The CSI volume is mounted read-only
    pub read_only_csi: bool,
}

/// Enrichment-specific settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentEnv {
    /// Owning workload kind, empty when unknown
    pub workload_kind: String,
    /// Owning workload name, empty when unknown
    pub workload_name: String,
}

/// Parsed init-container environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerEnv {
    /// Failure policy
    pub failure_policy: FailurePolicy,
    /// Pod name
    pub pod_name: String,
    /// Pod UID
    pub pod_uid: String,
    /// Pod namespace
    pub namespace: String,
    /// UID of the kube-system namespace
    pub cluster_id: String,
    /// Cluster display name
    pub cluster_name: Option<String>,
    /// User containers, in pod order
    pub containers: Vec<ContainerInfo>,
    /// Set when code modules are injected
    pub one_agent: Option<OneAgentEnv>,
    /// Set when metadata enrichment is injected
    pub enrichment: Option<EnrichmentEnv>,
}

/// Failure policy from the environment; `silent` when unset.
///
/// Read on its own so it applies even when the rest of the environment
/// cannot be parsed.
pub fn failure_policy(source: &dyn EnvSource) -> FailurePolicy {
    source
        .get(env::FAILURE_POLICY)
        .map(|value| FailurePolicy::parse(&value))
        .unwrap_or_default()
}

struct Reader<'a> {
    source: &'a dyn EnvSource,
    missing: Vec<String>,
}

impl<'a> Reader<'a> {
    fn new(source: &'a dyn EnvSource) -> Self {
        Self {
            source,
            missing: Vec::new(),
        }
    }

    fn required(&mut self, key: &str) -> String {
        match self.source.get(key) {
            Some(value) => value,
            None => {
                if !self.missing.iter().any(|m| m == key) {
                    warn!(variable = %key, "environment variable missing");
                    self.missing.push(key.to_string());
                }
                String::new()
            }
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.source.get(key).filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.source.get(key).is_some_and(|v| v == "true")
    }

    fn containers(&mut self) -> Result<Vec<ContainerInfo>, RunnerError> {
        let count = self.required(env::CONTAINERS_COUNT);
        if count.is_empty() {
            return Ok(Vec::new());
        }
        let count: usize = count.parse().map_err(|_| RunnerError::InvalidEnv {
            name: env::CONTAINERS_COUNT.to_string(),
            reason: format!("'{count}' is not a number"),
        })?;
        if count > MAX_CONTAINERS {
            return Err(RunnerError::InvalidEnv {
                name: env::CONTAINERS_COUNT.to_string(),
                reason: format!("{count} exceeds the limit of {MAX_CONTAINERS} containers"),
            });
        }
        Ok((1..=count)
            .map(|i| ContainerInfo {
                name: self.required(&env::container_name(i)),
                image: self.required(&env::container_image(i)),
            })
            .collect())
    }
}

/// Decoded, comma-separated technology list
fn technologies(raw: &str) -> Vec<String> {
    let decoded: String = url::form_urlencoded::parse(format!("t={raw}").as_bytes())
        .map(|(_, v)| v.into_owned())
        .next()
        .unwrap_or_default();
    decoded
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn workload_part(value: String) -> String {
    if value == env::UNKNOWN_WORKLOAD {
        String::new()
    } else {
        value
    }
}

impl RunnerEnv {
    /// Parse the environment, collecting every missing variable
    pub fn from_source(source: &dyn EnvSource) -> Result<Self, RunnerError> {
        let mut reader = Reader::new(source);

        let failure_policy = FailurePolicy::parse(&reader.required(env::FAILURE_POLICY));
        let one_agent_injected = reader.flag(env::ONEAGENT_INJECTED);
        let enrichment_injected = reader.flag(env::ENRICHMENT_INJECTED);

        let pod_name = reader.required(env::K8S_POD_NAME);
        let pod_uid = reader.required(env::K8S_POD_UID);
        let namespace = reader.required(env::K8S_NAMESPACE);
        let cluster_id = reader.required(env::K8S_CLUSTER_ID);
        let cluster_name = reader.optional(env::K8S_CLUSTER_NAME);
        let containers = reader.containers()?;

        let one_agent = if one_agent_injected {
            let mode = reader.required(env::MODE);
            let technologies = technologies(&reader.required(env::TECHNOLOGIES));
            let install_path = reader.required(env::INSTALL_PATH);
            let node_name = reader.required(env::K8S_NODE_NAME);
            let base_pod_name = reader.required(env::K8S_BASE_POD_NAME);
            Some((mode, technologies, install_path, node_name, base_pod_name))
        } else {
            None
        };

        let enrichment = if enrichment_injected {
            Some(EnrichmentEnv {
                workload_kind: workload_part(reader.required(env::WORKLOAD_KIND)),
                workload_name: workload_part(reader.required(env::WORKLOAD_NAME)),
            })
        } else {
            None
        };

        if !reader.missing.is_empty() {
            return Err(RunnerError::MissingEnv(reader.missing));
        }

        let one_agent = match one_agent {
            Some((mode, technologies, install_path, node_name, base_pod_name)) => {
                Some(OneAgentEnv {
                    mode: InstallMode::parse(&mode)?,
                    installer_url: reader.optional(env::INSTALLER_URL),
                    flavor: reader
                        .optional(env::FLAVOR)
                        .unwrap_or_else(|| DEFAULT_FLAVOR.to_string()),
                    version: reader.optional(env::VERSION),
                    technologies,
                    install_path,
                    node_name,
                    base_pod_name,
                    read_only_csi: reader.flag(env::READ_ONLY_CSI),
                })
            }
            None => None,
        };

        Ok(Self {
            failure_policy,
            pod_name,
            pod_uid,
            namespace,
            cluster_id,
            cluster_name,
            containers,
            one_agent,
            enrichment,
        })
    }
}
