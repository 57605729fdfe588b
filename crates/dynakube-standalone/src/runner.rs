//! The init runner proper
//!
//! Turns the parsed environment and the mounted init secret into the files
//! user containers mount: per-container agent config, the preload file,
//! curl options, certificates, and the enrichment metadata.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use dynakube_common::{paths, Error, NO_HOST_TENANT};
use dynakube_dtclient::{
    AgentRequest, ClientOptions, DynatraceClient, DynatraceClientBuilder, ProcessModuleConfig,
};

use crate::config::{MountedSecret, RunnerPaths};
use crate::env::{ContainerInfo, EnrichmentEnv, InstallMode, OneAgentEnv, RunnerEnv};
use crate::error::{RunnerError, StepContext};
use crate::fs::{copy_dir, write_atomic};
use crate::installer::{agent_arch, Installer, TenantInstaller};

/// Everything the code-module part of a run needs
pub(crate) struct OneAgentSetup {
    pub(crate) env: OneAgentEnv,
    pub(crate) secret: MountedSecret,
    pub(crate) client: Option<Arc<dyn DynatraceClient>>,
    pub(crate) installer: Option<Box<dyn Installer>>,
}

/// One run of the init container
pub struct Runner {
    env: RunnerEnv,
    paths: RunnerPaths,
    pub(crate) one_agent: Option<OneAgentSetup>,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Tenant client settings taken from the init secret
pub fn client_options(secret: &MountedSecret) -> ClientOptions {
    let config = &secret.config;
    let mut options = ClientOptions::new(&config.api_url, &config.paas_token);
    options.proxy = non_empty(&config.proxy);
    options.no_proxy = non_empty(&config.no_proxy);
    options.trusted_certs = secret.trusted_cas.clone();
    options.skip_cert_check = config.skip_cert_check;
    options.network_zone = non_empty(&config.network_zone);
    options.host_group = non_empty(&config.host_group);
    options
}

impl Runner {
    /// Prepare a run; loads the init secret and builds the tenant client
    /// when code modules are injected
    pub fn new(
        env: RunnerEnv,
        paths: RunnerPaths,
        clients: &dyn DynatraceClientBuilder,
    ) -> Result<Self, RunnerError> {
        let one_agent = match &env.one_agent {
            Some(one_agent) => {
                let secret = MountedSecret::load(&paths).step("load init secret")?;
                let (client, installer) = if one_agent.mode == InstallMode::Installer {
                    let client = clients
                        .build(client_options(&secret))
                        .step("create tenant client")?;
                    let request = AgentRequest {
                        flavor: one_agent.flavor.clone(),
                        arch: agent_arch().to_string(),
                        technologies: one_agent.technologies.join(","),
                        version: one_agent.version.clone(),
                    };
                    let installer: Box<dyn Installer> = Box::new(TenantInstaller::new(
                        client.clone(),
                        request,
                        one_agent.installer_url.clone(),
                    ));
                    (Some(client), Some(installer))
                } else {
                    (None, None)
                };
                Some(OneAgentSetup {
                    env: one_agent.clone(),
                    secret,
                    client,
                    installer,
                })
            }
            None => None,
        };

        Ok(Self {
            env,
            paths,
            one_agent,
        })
    }

    /// Execute every step for the injected parts
    pub async fn run(&self) -> Result<(), RunnerError> {
        if let Some(setup) = &self.one_agent {
            let host_tenant = host_tenant(setup)?;
            debug!(host_tenant = %host_tenant, "resolved host tenant");

            if let (Some(installer), Some(client)) = (&setup.installer, &setup.client) {
                self.install(setup, installer.as_ref(), client.as_ref()).await?;
            }
            if setup.env.read_only_csi {
                let source = self.paths.bin_dir.join("agent/conf");
                copy_dir(&source, &self.paths.agent_conf_dir).step("copy agent config")?;
            }

            self.write_container_confs(setup, &host_tenant)
                .step("write container config")?;
            self.write_share_files(setup).step("write shared files")?;
            info!(containers = self.env.containers.len(), "code-module files prepared");
        }

        if let Some(enrichment) = &self.env.enrichment {
            self.write_enrichment(enrichment).step("write enrichment files")?;
            info!(containers = self.env.containers.len(), "enrichment files prepared");
        }
        Ok(())
    }

    async fn install(
        &self,
        setup: &OneAgentSetup,
        installer: &dyn Installer,
        client: &dyn DynatraceClient,
    ) -> Result<(), RunnerError> {
        let target = self.paths.bin_dir.as_path();
        installer.install_agent(target).await.step("install code modules")?;

        let mut pmc = client
            .process_module_config(0)
            .await
            .step("fetch process-module config")?
            .unwrap_or_default();
        apply_overrides(&mut pmc, setup);
        installer
            .update_process_module_config(target, &pmc)
            .await
            .step("update process-module config")?;
        Ok(())
    }

    fn write_container_confs(&self, setup: &OneAgentSetup, host_tenant: &str) -> Result<(), Error> {
        let full_stack = host_tenant != NO_HOST_TENANT && setup.secret.config.tenant_uuid == host_tenant;
        for container in &self.env.containers {
            let conf = self.container_conf(container, setup, full_stack.then_some(host_tenant));
            let path = self
                .paths
                .share_dir
                .join(paths::container_conf_filename(&container.name));
            write_atomic(&path, conf.as_bytes(), true)?;
        }
        Ok(())
    }

    fn container_conf(
        &self,
        container: &ContainerInfo,
        setup: &OneAgentSetup,
        host_tenant: Option<&str>,
    ) -> String {
        let mut conf = format!(
            "[container]\n\
             containerName {name}\n\
             imageName {image}\n\
             k8s_fullpodname {pod}\n\
             k8s_poduid {uid}\n\
             k8s_containername {name}\n\
             k8s_basepodname {base}\n\
             k8s_namespace {namespace}\n\
             k8s_cluster_id {cluster}\n",
            name = container.name,
            image = container.image,
            pod = self.env.pod_name,
            uid = self.env.pod_uid,
            base = setup.env.base_pod_name,
            namespace = self.env.namespace,
            cluster = self.env.cluster_id,
        );
        if let Some(tenant) = host_tenant {
            conf.push_str(&format!(
                "k8s_node_name {}\n[host]\ntenant {tenant}\nisCloudNativeFullStack true\n",
                setup.env.node_name
            ));
        }
        conf
    }

    fn write_share_files(&self, setup: &OneAgentSetup) -> Result<(), Error> {
        let share = self.paths.share_dir.as_path();
        let preload = format!("{}\n", paths::preload_library(&setup.env.install_path));
        write_atomic(&share.join(paths::LD_PRELOAD_FILENAME), preload.as_bytes(), false)?;

        let config = &setup.secret.config;
        if config.has_initial_connect_retry() {
            let curl = format!("initialConnectRetryMs {}\n", config.initial_connect_retry);
            write_atomic(&share.join(paths::CURL_OPTIONS_FILENAME), curl.as_bytes(), false)?;
        }

        write_certificates(share, &setup.secret)
    }

    fn write_enrichment(&self, enrichment: &EnrichmentEnv) -> Result<(), Error> {
        for container in &self.env.containers {
            let metadata = self.enrichment_metadata(enrichment, &container.name);
            let dir = self.paths.enrichment_dir.join(&container.name);

            let json = serde_json::to_vec_pretty(&metadata)
                .map_err(|e| Error::serialization_for_kind("enrichment metadata", e.to_string()))?;
            write_atomic(&dir.join(paths::ENRICHMENT_JSON_FILENAME), &json, false)?;

            let properties: String = metadata
                .iter()
                .map(|(k, v)| format!("{k}={v}\n"))
                .collect();
            write_atomic(
                &dir.join(paths::ENRICHMENT_PROPERTIES_FILENAME),
                properties.as_bytes(),
                false,
            )?;
        }
        Ok(())
    }

    fn enrichment_metadata(
        &self,
        enrichment: &EnrichmentEnv,
        container: &str,
    ) -> BTreeMap<&'static str, String> {
        let env = &self.env;
        let mut metadata = BTreeMap::from([
            ("k8s.pod.uid", env.pod_uid.clone()),
            ("k8s.pod.name", env.pod_name.clone()),
            ("k8s.namespace.name", env.namespace.clone()),
            ("k8s.container.name", container.to_string()),
            ("k8s.workload.kind", enrichment.workload_kind.clone()),
            ("k8s.workload.name", enrichment.workload_name.clone()),
            ("k8s.cluster.uid", env.cluster_id.clone()),
            ("dt.kubernetes.workload.kind", enrichment.workload_kind.clone()),
            ("dt.kubernetes.workload.name", enrichment.workload_name.clone()),
            ("dt.kubernetes.cluster.id", env.cluster_id.clone()),
            ("dt.entity.kubernetes_cluster", env.cluster_id.clone()),
        ]);
        if let Some(name) = &env.cluster_name {
            metadata.insert("k8s.cluster.name", name.clone());
        }
        metadata
    }
}

fn host_tenant(setup: &OneAgentSetup) -> Result<String, RunnerError> {
    setup
        .secret
        .config
        .host_tenant(&setup.env.node_name)
        .ok_or_else(|| RunnerError::UnknownNode(setup.env.node_name.clone()))
}

fn apply_overrides(pmc: &mut ProcessModuleConfig, setup: &OneAgentSetup) {
    let config = &setup.secret.config;
    if !config.proxy.is_empty() {
        pmc.add_proxy(&config.proxy);
    }
    if !config.one_agent_no_proxy.is_empty() {
        pmc.add_no_proxy(&config.one_agent_no_proxy);
    }
    pmc.add_host_group(&config.host_group);
}

fn write_certificates(share: &Path, secret: &MountedSecret) -> Result<(), Error> {
    let bundle: Vec<u8> = [secret.trusted_cas.as_deref(), secret.ag_certs.as_deref()]
        .into_iter()
        .flatten()
        .fold(Vec::new(), |mut acc, pem| {
            if !acc.is_empty() && !acc.ends_with(b"\n") {
                acc.push(b'\n');
            }
            acc.extend_from_slice(pem);
            acc
        });
    if !bundle.is_empty() {
        write_atomic(&share.join(paths::CUSTOM_CERTS_FILENAME), &bundle, false)?;
    }
    if let Some(cas) = &secret.trusted_cas {
        write_atomic(&share.join(paths::CUSTOM_PROXY_CERTS_FILENAME), cas, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use dynakube_common::env;
    use mockall::predicate::*;

    use crate::env::tests::base_env;
    use crate::installer::MockInstaller;
    use crate::testing::{downloading_client, minimal_agent, MockBuilder, MockClient};

    const SECRET: &str = r#"{
        "apiUrl": "https://t.example/api",
        "apiToken": "api",
        "paasToken": "paas",
        "tenantUUID": "abc123",
        "hostGroup": "blue",
        "initialConnectRetry": 6000,
        "hasHost": true,
        "monitoringNodes": {"node-a": "abc123", "node-b": "other"}
    }"#;

    fn layout(secret: &str) -> (tempfile::TempDir, RunnerPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunnerPaths::under(dir.path());
        fs::create_dir_all(&paths.config_dir).unwrap();
        fs::write(paths.config_dir.join("config"), secret).unwrap();
        (dir, paths)
    }

    fn builder(client: MockClient) -> MockBuilder {
        let client: Arc<dyn DynatraceClient> = Arc::new(client);
        let mut builder = MockBuilder::new();
        builder
            .expect_build()
            .returning(move |_| Ok(client.clone()));
        builder
    }

    fn tenant_client() -> MockClient {
        let mut client = downloading_client(minimal_agent());
        client
            .expect_process_module_config()
            .with(eq(0))
            .returning(|_| Ok(None));
        client
    }

    fn parse(vars: &BTreeMap<String, String>) -> RunnerEnv {
        RunnerEnv::from_source(vars).unwrap()
    }

    fn provisioned_env() -> BTreeMap<String, String> {
        let mut vars = base_env();
        vars.insert(env::MODE.to_string(), "provisioned".to_string());
        vars
    }

    fn read(path: std::path::PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    /// Story: installer mode downloads the agent and prepares every file
    #[tokio::test]
    async fn story_installer_mode_prepares_the_pod() {
        let (_dir, paths) = layout(SECRET);
        let runner = Runner::new(parse(&base_env()), paths.clone(), &builder(tenant_client())).unwrap();

        runner.run().await.unwrap();

        assert!(paths.bin_dir.join(paths::LIB_ONEAGENT_PROC).exists());
        let ruxit = read(paths.bin_dir.join("agent/conf/ruxitagentproc.conf"));
        assert!(ruxit.contains("hostGroup blue"));

        let conf = read(paths.share_dir.join("container_app.conf"));
        assert!(conf.starts_with("[container]\ncontainerName app\nimageName registry.example/app:1.0\n"));
        assert!(conf.contains("k8s_basepodname web\n"));
        assert!(conf.ends_with("k8s_node_name node-a\n[host]\ntenant abc123\nisCloudNativeFullStack true\n"));
        assert!(paths.share_dir.join("container_sidecar.conf").exists());

        assert_eq!(
            read(paths.share_dir.join("ld.so.preload")),
            "/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so\n"
        );
        assert_eq!(
            read(paths.share_dir.join("curl_options.conf")),
            "initialConnectRetryMs 6000\n"
        );
        assert!(!paths.share_dir.join("custom.pem").exists());
    }

    /// Story: the CSI driver already provides the agent, nothing is downloaded
    #[tokio::test]
    async fn story_provisioned_mode_needs_no_tenant() {
        let (_dir, paths) = layout(SECRET);
        let mut clients = MockBuilder::new();
        clients.expect_build().never();

        let runner = Runner::new(parse(&provisioned_env()), paths.clone(), &clients).unwrap();
        runner.run().await.unwrap();

        assert!(!paths.bin_dir.join(paths::LIB_ONEAGENT_PROC).exists());
        assert!(paths.share_dir.join("container_app.conf").exists());
    }

    #[tokio::test]
    async fn read_only_csi_copies_agent_config() {
        let (_dir, paths) = layout(SECRET);
        fs::create_dir_all(paths.bin_dir.join("agent/conf")).unwrap();
        fs::write(paths.bin_dir.join("agent/conf/ruxitagentproc.conf"), "[general]\n").unwrap();
        let mut vars = provisioned_env();
        vars.insert(env::READ_ONLY_CSI.to_string(), "true".to_string());

        let runner = Runner::new(parse(&vars), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        assert_eq!(read(paths.agent_conf_dir.join("ruxitagentproc.conf")), "[general]\n");
    }

    #[tokio::test]
    async fn other_host_tenant_omits_host_stanza() {
        let (_dir, paths) = layout(SECRET);
        let mut vars = provisioned_env();
        vars.insert(env::K8S_NODE_NAME.to_string(), "node-b".to_string());

        let runner = Runner::new(parse(&vars), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        let conf = read(paths.share_dir.join("container_app.conf"));
        assert!(conf.ends_with("k8s_cluster_id kube-system-uid\n"));
        assert!(!conf.contains("[host]"));
    }

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let (_dir, paths) = layout(SECRET);
        let mut vars = provisioned_env();
        vars.insert(env::K8S_NODE_NAME.to_string(), "node-z".to_string());

        let runner = Runner::new(parse(&vars), paths, &MockBuilder::new()).unwrap();
        assert!(matches!(
            runner.run().await,
            Err(RunnerError::UnknownNode(node)) if node == "node-z"
        ));
    }

    #[tokio::test]
    async fn enforcement_mode_uses_the_tenant() {
        let (_dir, paths) = layout(
            r#"{"apiUrl":"u","apiToken":"a","paasToken":"p","tenantUUID":"abc123",
                "hasHost":true,"enforcementMode":true}"#,
        );
        let mut vars = provisioned_env();
        vars.insert(env::K8S_NODE_NAME.to_string(), "node-z".to_string());

        let runner = Runner::new(parse(&vars), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        assert!(read(paths.share_dir.join("container_app.conf")).contains("tenant abc123\n"));
    }

    #[tokio::test]
    async fn certificates_are_shared() {
        let (_dir, paths) = layout(SECRET);
        fs::write(paths.config_dir.join("trustedcas"), "CA\n").unwrap();
        fs::write(paths.config_dir.join("agcerts"), "AG").unwrap();

        let runner = Runner::new(parse(&provisioned_env()), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        assert_eq!(read(paths.share_dir.join("custom.pem")), "CA\nAG");
        assert_eq!(read(paths.share_dir.join("custom_proxy.pem")), "CA\n");
    }

    #[tokio::test]
    async fn install_failures_stop_the_run() {
        let (_dir, paths) = layout(SECRET);
        let mut runner = Runner::new(parse(&base_env()), paths.clone(), &builder(MockClient::new())).unwrap();
        let mut installer = MockInstaller::new();
        installer
            .expect_install_agent()
            .returning(|_| Err(Error::backend("401 Unauthorized")));
        if let Some(setup) = runner.one_agent.as_mut() {
            setup.installer = Some(Box::new(installer));
        }

        let err = runner.run().await.unwrap_err();
        assert!(err.to_string().starts_with("install code modules: "));
        assert!(!paths.share_dir.join("container_app.conf").exists());
    }

    #[tokio::test]
    async fn tenant_proxy_settings_reach_the_process_module_config() {
        let (_dir, paths) = layout(
            r#"{"apiUrl":"u","apiToken":"a","paasToken":"p","tenantUUID":"abc123",
                "proxy":"http://proxy:3128","oneAgentNoProxy":"10.0.0.1","hostGroup":"blue"}"#,
        );
        let mut runner = Runner::new(parse(&base_env()), paths, &builder(tenant_client())).unwrap();
        let mut installer = MockInstaller::new();
        installer.expect_install_agent().returning(|_| Ok(true));
        installer
            .expect_update_process_module_config()
            .withf(|_, pmc| {
                let map = pmc.to_map();
                let general = &map["general"];
                general["proxy"] == "http://proxy:3128"
                    && general["noProxy"] == "10.0.0.1"
                    && general["hostGroup"] == "blue"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        if let Some(setup) = runner.one_agent.as_mut() {
            setup.installer = Some(Box::new(installer));
        }

        runner.run().await.unwrap();
    }

    #[tokio::test]
    async fn client_settings_come_from_the_secret() {
        let (_dir, paths) = layout(
            r#"{"apiUrl":"https://t.example/api","apiToken":"a","paasToken":"paas","tenantUUID":"t",
                "proxy":"http://proxy:3128","networkZone":"eu","skipCertCheck":true}"#,
        );
        fs::write(paths.config_dir.join("trustedcas"), "CA").unwrap();
        let mut clients = MockBuilder::new();
        clients
            .expect_build()
            .withf(|o| {
                o.api_url == "https://t.example/api"
                    && o.token == "paas"
                    && o.proxy.as_deref() == Some("http://proxy:3128")
                    && o.network_zone.as_deref() == Some("eu")
                    && o.skip_cert_check
                    && o.trusted_certs.as_deref() == Some(b"CA".as_slice())
                    && o.host_group.is_none()
            })
            .times(1)
            .returning(|_| Ok(Arc::new(MockClient::new()) as Arc<dyn DynatraceClient>));

        Runner::new(parse(&base_env()), paths, &clients).unwrap();
    }

    /// Story: a pod with only metadata enrichment gets per-container metadata
    #[tokio::test]
    async fn story_enrichment_only() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunnerPaths::under(dir.path());
        let mut vars = base_env();
        vars.insert(env::ONEAGENT_INJECTED.to_string(), "false".to_string());
        vars.insert(env::K8S_CLUSTER_NAME.to_string(), "prod-eu".to_string());

        let runner = Runner::new(parse(&vars), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&read(paths.enrichment_dir.join("app/dt_metadata.json"))).unwrap();
        assert_eq!(json["k8s.pod.uid"], "0f1e2d3c");
        assert_eq!(json["k8s.workload.kind"], "Deployment");
        assert_eq!(json["k8s.container.name"], "app");
        assert_eq!(json["k8s.cluster.name"], "prod-eu");
        assert_eq!(json["dt.entity.kubernetes_cluster"], "kube-system-uid");

        let properties = read(paths.enrichment_dir.join("sidecar/dt_metadata.properties"));
        assert!(properties.contains("k8s.container.name=sidecar\n"));
        assert!(properties.contains("dt.kubernetes.workload.name=web\n"));
        assert!(!paths.share_dir.join("ld.so.preload").exists());
    }

    #[tokio::test]
    async fn cluster_name_is_omitted_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunnerPaths::under(dir.path());
        let mut vars = base_env();
        vars.insert(env::ONEAGENT_INJECTED.to_string(), "false".to_string());

        let runner = Runner::new(parse(&vars), paths.clone(), &MockBuilder::new()).unwrap();
        runner.run().await.unwrap();

        let properties = read(paths.enrichment_dir.join("app/dt_metadata.properties"));
        assert!(!properties.contains("k8s.cluster.name"));
    }

    #[tokio::test]
    async fn repeated_runs_produce_identical_files() {
        let snapshot = |root: &Path| -> BTreeMap<String, Vec<u8>> {
            let mut files = BTreeMap::new();
            for dir in ["share", "enrichment/app", "enrichment/sidecar"] {
                for entry in fs::read_dir(root.join(dir)).unwrap() {
                    let entry = entry.unwrap();
                    if entry.file_type().unwrap().is_file() {
                        files.insert(
                            format!("{dir}/{}", entry.file_name().to_string_lossy()),
                            fs::read(entry.path()).unwrap(),
                        );
                    }
                }
            }
            files
        };

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let (dir, paths) = layout(SECRET);
            let runner = Runner::new(parse(&provisioned_env()), paths, &MockBuilder::new()).unwrap();
            runner.run().await.unwrap();
            outputs.push(snapshot(dir.path()));
        }
        assert!(!outputs[0].is_empty());
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn missing_secret_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let result = Runner::new(parse(&base_env()), RunnerPaths::under(dir.path()), &MockBuilder::new());
        assert!(matches!(result, Err(RunnerError::Step { step: "load init secret", .. })));
    }
}
