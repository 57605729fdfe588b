//! Volume layout and the mounted init secret

use std::path::PathBuf;

use dynakube_common::{paths, Error, SecretConfig};
use dynakube_common::{
    INIT_SECRET_AG_CERTS_FIELD, INIT_SECRET_CONFIG_FIELD, INIT_SECRET_TRUSTED_CAS_FIELD,
};

use crate::fs::read_optional;

/// Directories the init runner reads from and writes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerPaths {
    /// Mounted init secret
    pub config_dir: PathBuf,
    /// Files shared with the user containers
    pub share_dir: PathBuf,
    /// Code-module binaries
    pub bin_dir: PathBuf,
    /// Writable copy of `agent/conf` for read-only CSI volumes
    pub agent_conf_dir: PathBuf,
    /// Enrichment files
    pub enrichment_dir: PathBuf,
}

impl Default for RunnerPaths {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(paths::CONFIG_MOUNT),
            share_dir: PathBuf::from(paths::SHARE_MOUNT),
            bin_dir: PathBuf::from(paths::BIN_MOUNT),
            agent_conf_dir: PathBuf::from(paths::AGENT_CONF_MOUNT),
            enrichment_dir: PathBuf::from(paths::ENRICHMENT_MOUNT),
        }
    }
}

impl RunnerPaths {
    /// All directories below `root`, for tests and local runs
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            config_dir: root.join("config"),
            share_dir: root.join("share"),
            bin_dir: root.join("bin"),
            agent_conf_dir: root.join("agent-conf"),
            enrichment_dir: root.join("enrichment"),
        }
    }
}

/// The init secret as mounted into the init container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountedSecret {
    /// Connection settings
    pub config: SecretConfig,
    /// Trusted CA bundle, if configured
    pub trusted_cas: Option<Vec<u8>>,
    /// ActiveGate certificate, if configured
    pub ag_certs: Option<Vec<u8>>,
}

impl MountedSecret {
    /// Load the secret from `config_dir`
    pub fn load(paths: &RunnerPaths) -> Result<Self, Error> {
        let config_path = paths.config_dir.join(INIT_SECRET_CONFIG_FIELD);
        let raw = read_optional(&config_path)?.ok_or_else(|| {
            Error::io(config_path.display().to_string(), "init secret is not mounted")
        })?;
        let config: SecretConfig = serde_json::from_slice(&raw).map_err(|e| {
            Error::serialization_for_kind("SecretConfig", e.to_string())
        })?;

        Ok(Self {
            config,
            trusted_cas: non_empty(read_optional(
                &paths.config_dir.join(INIT_SECRET_TRUSTED_CAS_FIELD),
            )?),
            ag_certs: non_empty(read_optional(&paths.config_dir.join(INIT_SECRET_AG_CERTS_FIELD))?),
        })
    }
}

fn non_empty(bytes: Option<Vec<u8>>) -> Option<Vec<u8>> {
    bytes.filter(|b| !b.iter().all(u8::is_ascii_whitespace))
}
