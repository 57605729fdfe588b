//! Code-module installation for the installer mode
//!
//! Downloads the agent archive from the tenant (or an explicit installer
//! URL), unpacks it into the bin volume, and merges the tenant's
//! process-module config into `ruxitagentproc.conf`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use dynakube_common::{paths, Error};
use dynakube_dtclient::{merge_conf, AgentRequest, DynatraceClient, ProcessModuleConfig};

use crate::fs::{read_optional, write_atomic};

/// Process-module config, relative to the install root
pub const RUXIT_CONF: &str = "agent/conf/ruxitagentproc.conf";
/// Pristine copy of [`RUXIT_CONF`] every merge starts from
pub const RUXIT_CONF_BACKUP: &str = "agent/conf/_ruxitagentproc.conf";

/// Installs code modules into a directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the code modules into `target`.
    ///
    /// Returns `false` when `target` already holds an installation.
    async fn install_agent(&self, target: &Path) -> Result<bool, Error>;

    /// Merge `config` into the process-module config below `target`
    async fn update_process_module_config(
        &self,
        target: &Path,
        config: &ProcessModuleConfig,
    ) -> Result<(), Error>;
}

/// Architecture name used by the download endpoint
pub fn agent_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm",
        "s390x" => "s390",
        "powerpc64" => "ppcle",
        _ => "x86",
    }
}

/// Installer downloading from the tenant
pub struct TenantInstaller {
    client: Arc<dyn DynatraceClient>,
    request: AgentRequest,
    installer_url: Option<String>,
}

impl TenantInstaller {
    /// Installer for `request`, preferring `installer_url` when set
    pub fn new(
        client: Arc<dyn DynatraceClient>,
        request: AgentRequest,
        installer_url: Option<String>,
    ) -> Self {
        Self {
            client,
            request,
            installer_url,
        }
    }

    async fn download(&self, dest: &Path) -> Result<u64, Error> {
        match &self.installer_url {
            Some(url) => {
                info!("downloading code modules from installer url");
                self.client.download_agent_from_url(url, dest).await
            }
            None => {
                info!(
                    flavor = %self.request.flavor,
                    arch = %self.request.arch,
                    technologies = %self.request.technologies,
                    version = ?self.request.version,
                    "downloading code modules from tenant"
                );
                self.client.download_agent(&self.request, dest).await
            }
        }
    }
}

fn unpack(archive: PathBuf, target: PathBuf) -> Result<(), Error> {
    let file = File::open(&archive)
        .map_err(|e| Error::io(archive.display().to_string(), e.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive
        .unpack(&target)
        .map_err(|e| Error::io(target.display().to_string(), format!("failed to unpack agent: {e}")))
}

#[async_trait]
impl Installer for TenantInstaller {
    async fn install_agent(&self, target: &Path) -> Result<bool, Error> {
        if target.join(paths::LIB_ONEAGENT_PROC).exists() {
            info!(target = %target.display(), "code modules already present, skipping download");
            return Ok(false);
        }
        std::fs::create_dir_all(target)
            .map_err(|e| Error::io(target.display().to_string(), e.to_string()))?;

        let archive = tempfile::Builder::new()
            .prefix(".agent-")
            .suffix(".tar.gz")
            .tempfile_in(target)
            .map_err(|e| Error::io(target.display().to_string(), e.to_string()))?;
        let size = self.download(archive.path()).await?;
        debug!(bytes = size, "downloaded agent archive");

        let (from, to) = (archive.path().to_path_buf(), target.to_path_buf());
        tokio::task::spawn_blocking(move || unpack(from, to))
            .await
            .map_err(|e| Error::internal_with_context("installer", e.to_string()))??;

        if !target.join(paths::LIB_ONEAGENT_PROC).exists() {
            return Err(Error::io(
                target.display().to_string(),
                format!("archive does not contain {}", paths::LIB_ONEAGENT_PROC),
            ));
        }
        info!(target = %target.display(), "code modules installed");
        Ok(true)
    }

    async fn update_process_module_config(
        &self,
        target: &Path,
        config: &ProcessModuleConfig,
    ) -> Result<(), Error> {
        let conf = target.join(RUXIT_CONF);
        let backup = target.join(RUXIT_CONF_BACKUP);

        let source = match read_optional(&backup)? {
            Some(source) => source,
            None => {
                let source = read_optional(&conf)?.ok_or_else(|| {
                    Error::io(conf.display().to_string(), "process-module config missing")
                })?;
                write_atomic(&backup, &source, false)?;
                source
            }
        };
        let source = String::from_utf8_lossy(&source);
        write_atomic(&conf, merge_conf(&source, config).as_bytes(), false)?;
        info!(properties = config.properties.len(), "process-module config updated");
        Ok(())
    }
}
