//! Init runner for the install-oneagent init container
//!
//! Runs once per pod before the user containers start. Reads the init secret
//! mounted at `/mnt/config` and the environment the pod mutator set, then:
//!
//! - installs the code modules into `/mnt/bin` (installer mode only)
//! - writes `container_<name>.conf`, `ld.so.preload`, `curl_options.conf`
//!   and certificate bundles into `/mnt/share`
//! - writes per-container enrichment metadata
//!
//! Whether a failure stops the pod is decided by the `FAILURE_POLICY`
//! environment variable.

#![deny(missing_docs)]

pub mod config;
pub mod env;
pub mod error;
pub mod fs;
pub mod installer;
pub mod runner;

#[cfg(test)]
mod testing;

pub use config::{MountedSecret, RunnerPaths};
pub use env::{EnvSource, ProcessEnv, RunnerEnv};
pub use error::RunnerError;
pub use installer::{Installer, TenantInstaller};
pub use runner::Runner;

use dynakube_common::crd::FailurePolicy;
use dynakube_dtclient::DynatraceClientBuilder;
use tracing::{error, info};

async fn run(
    paths: RunnerPaths,
    source: &dyn EnvSource,
    clients: &dyn DynatraceClientBuilder,
) -> Result<(), RunnerError> {
    let env = RunnerEnv::from_source(source)?;
    info!(
        pod = %env.pod_name,
        namespace = %env.namespace,
        oneagent = env.one_agent.is_some(),
        enrichment = env.enrichment.is_some(),
        "starting init runner"
    );
    Runner::new(env, paths, clients)?.run().await
}

/// Run the init container.
///
/// With the `silent` failure policy every error is logged and swallowed so
/// the pod starts without instrumentation.
pub async fn execute(
    paths: RunnerPaths,
    source: &dyn EnvSource,
    clients: &dyn DynatraceClientBuilder,
) -> Result<(), RunnerError> {
    let policy = env::failure_policy(source);
    match run(paths, source, clients).await {
        Ok(()) => {
            info!("init runner finished");
            Ok(())
        }
        Err(e) if policy == FailurePolicy::Silent => {
            error!(error = %e, "init runner failed, starting pod without instrumentation");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::testing::MockBuilder;

    fn broken_env(policy: &str) -> BTreeMap<String, String> {
        let mut vars = env::tests::base_env();
        vars.insert(dynakube_common::env::FAILURE_POLICY.to_string(), policy.to_string());
        vars.remove(dynakube_common::env::K8S_POD_UID);
        vars
    }

    /// Story: a silent pod starts even though the init runner failed
    #[tokio::test]
    async fn story_silent_policy_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            RunnerPaths::under(dir.path()),
            &broken_env("silent"),
            &MockBuilder::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    /// Story: a pod with failure policy `fail` does not start
    #[tokio::test]
    async fn story_fail_policy_surfaces_failures() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            RunnerPaths::under(dir.path()),
            &broken_env("fail"),
            &MockBuilder::new(),
        )
        .await;
        assert!(matches!(result, Err(RunnerError::MissingEnv(_))));
    }

    #[tokio::test]
    async fn legacy_force_policy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            RunnerPaths::under(dir.path()),
            &broken_env("force"),
            &MockBuilder::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn step_failures_honour_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = env::tests::base_env();
        vars.insert(dynakube_common::env::FAILURE_POLICY.to_string(), "fail".to_string());

        let result = execute(RunnerPaths::under(dir.path()), &vars, &MockBuilder::new()).await;
        assert!(matches!(result, Err(RunnerError::Step { .. })));
    }
}
