//! DynaKube Operator - code-module injection for Kubernetes workloads

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use dynakube_common::telemetry::{init_telemetry, TelemetryConfig};
use dynakube_common::{
    KubeEventPublisher, DEFAULT_CSI_DRIVER_NAME, DEFAULT_OPERATOR_NAMESPACE, DEFAULT_WEBHOOK_PORT,
    FIELD_MANAGER,
};
use dynakube_dtclient::HttpDynatraceClientBuilder;
use dynakube_injection::{InitGenerator, InjectionKubeClientImpl, NamespaceMapper};
use dynakube_operator::crds::{crd_yaml, ensure_crds_installed};
use dynakube_operator::kube_client::{OperatorKubeClient, OperatorKubeClientImpl};
use dynakube_operator::run_dynakube_controller;
use dynakube_standalone::{ProcessEnv, RunnerPaths};
use dynakube_webhook::{
    serve, ServerConfig, WebhookConfig, WebhookKubeClientImpl, WebhookState,
};

/// DynaKube - injects monitoring code modules into pods of claimed namespaces
#[derive(Parser, Debug)]
#[command(name = "dynakube-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace of the operator and its DynaKubes
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE, global = true)]
    operator_namespace: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the DynaKube controller (default mode)
    Operator,

    /// Serve the pod and namespace admission webhooks
    Webhook(WebhookArgs),

    /// Run the install-oneagent init container
    Init,
}

#[derive(clap::Args, Debug)]
struct WebhookArgs {
    /// Port of the HTTPS server
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Serving certificate (PEM)
    #[arg(long, env = "DYNAKUBE_TLS_CERT", default_value = "/tmp/webhook-certs/tls.crt")]
    tls_cert: PathBuf,

    /// Serving key (PEM)
    #[arg(long, env = "DYNAKUBE_TLS_KEY", default_value = "/tmp/webhook-certs/tls.key")]
    tls_key: PathBuf,

    /// Image of the install-oneagent init container
    #[arg(long, env = "DYNAKUBE_INSTALLER_IMAGE")]
    installer_image: String,

    /// CSI driver providing the code-module volume
    #[arg(long, default_value = DEFAULT_CSI_DRIVER_NAME)]
    csi_driver_name: String,

    /// Human-readable cluster name reported to injected pods
    #[arg(long, env = "DYNAKUBE_CLUSTER_NAME")]
    cluster_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    match cli.command {
        Some(Commands::Init) => run_init().await,
        Some(Commands::Webhook(args)) => run_webhook(cli.operator_namespace, args).await,
        Some(Commands::Operator) | None => run_operator(cli.operator_namespace).await,
    }
}

fn init_logging(service: &str, plain: bool) -> anyhow::Result<()> {
    let config = TelemetryConfig::for_service(service);
    let config = if plain { config.plain() } else { config };
    init_telemetry(config).map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))
}

async fn run_operator(operator_namespace: String) -> anyhow::Result<()> {
    init_logging("dynakube-operator", false)?;
    tracing::info!(namespace = %operator_namespace, "Starting DynaKube operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;
    run_dynakube_controller(client, operator_namespace).await;

    tracing::info!("DynaKube operator shut down");
    Ok(())
}

async fn run_webhook(operator_namespace: String, args: WebhookArgs) -> anyhow::Result<()> {
    init_logging("dynakube-webhook", false)?;

    let cert_pem = std::fs::read_to_string(&args.tls_cert)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.tls_cert.display(), e))?;
    let key_pem = std::fs::read_to_string(&args.tls_key)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.tls_key.display(), e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cluster_id = OperatorKubeClientImpl::new(client.clone())
        .kube_system_uid()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read cluster id: {}", e))?;

    let injection = Arc::new(InjectionKubeClientImpl::new(client.clone()));
    let state = WebhookState {
        config: WebhookConfig {
            operator_namespace: operator_namespace.clone(),
            installer_image: args.installer_image,
            csi_driver_name: args.csi_driver_name,
            cluster_id,
            cluster_name: args.cluster_name,
            ..Default::default()
        },
        kube: Arc::new(WebhookKubeClientImpl::new(client.clone())),
        secrets: Arc::new(InitGenerator::new(
            injection.clone(),
            Arc::new(HttpDynatraceClientBuilder),
            operator_namespace.as_str(),
        )),
        mapper: Arc::new(NamespaceMapper::new(injection, operator_namespace.as_str())),
        events: Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    serve(
        ServerConfig {
            addr,
            cert_pem,
            key_pem,
        },
        Arc::new(state),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Webhook server failed: {}", e))
}

async fn run_init() -> anyhow::Result<()> {
    init_logging("dynakube-init", true)?;

    dynakube_standalone::execute(RunnerPaths::default(), &ProcessEnv, &HttpDynatraceClientBuilder)
        .await
        .map_err(|e| anyhow::anyhow!("init runner failed: {}", e))
}
