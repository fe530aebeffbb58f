//! Agent injector - mutating admission webhook for pod instrumentation

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent_injector::config::{WebhookConfig, DEFAULT_RESOLVE_TIMEOUT};
use agent_injector::crd::DynaKube;
use agent_injector::events::KubeEventPublisher;
use agent_injector::mutation::default_mutators;
use agent_injector::webhook::pipeline::InjectionPipeline;
use agent_injector::webhook::resolve::KubeConfigResolver;
use agent_injector::webhook::{start_server, WebhookState};
use agent_injector::{COMPONENT_NAME, DEFAULT_CERT_DIR, DEFAULT_WEBHOOK_PORT};

/// Agent injector - injects monitoring agents into pods at admission time
#[derive(Parser, Debug)]
#[command(name = "agent-injector", version, about, long_about = None)]
struct Cli {
    /// Generate the DynaKube CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Name of the webhook pod
    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,

    /// Namespace of the webhook and its DynaKubes
    #[arg(long, env = "POD_NAMESPACE", default_value = "dynatrace")]
    namespace: String,

    /// Image used for the install init container; read from the webhook pod when unset
    #[arg(long, env = "WEBHOOK_IMAGE")]
    webhook_image: Option<String>,

    /// Cluster identifier; the kube-system namespace UID when unset
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Installed through OLM; unlabelled namespaces are skipped instead of reported
    #[arg(long, env = "DEPLOYED_VIA_OLM")]
    deployed_via_olm: bool,

    /// Directory holding tls.crt and tls.key
    #[arg(long, env = "WEBHOOK_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    cert_dir: PathBuf,

    /// HTTPS port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// Timeout for resolving a pod's configuration, in milliseconds
    #[arg(long, env = "RESOLVE_TIMEOUT_MS", default_value_t = DEFAULT_RESOLVE_TIMEOUT.as_millis() as u64)]
    resolve_timeout_ms: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The webhook cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    }

    if cli.crd {
        let crd = serde_yaml::to_string(&DynaKube::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_webhook(cli).await
}

/// Resolve configuration and serve admission requests until shutdown
async fn run_webhook(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = WebhookConfig::discover(
        client.clone(),
        WebhookConfig {
            webhook_image: cli.webhook_image.unwrap_or_default(),
            cluster_id: cli.cluster_id.unwrap_or_default(),
            webhook_namespace: cli.namespace,
            pod_name: cli.pod_name,
            deployed_via_olm: cli.deployed_via_olm,
            resolve_timeout: Duration::from_millis(cli.resolve_timeout_ms),
        },
    )
    .await?;
    let config = Arc::new(config);

    let pipeline = Arc::new(InjectionPipeline::new(config.clone(), default_mutators()));
    let resolver = Arc::new(KubeConfigResolver::new(
        client.clone(),
        config.webhook_namespace.clone(),
        config.deployed_via_olm,
    ));
    let instance = (!config.pod_name.is_empty()).then(|| config.pod_name.clone());
    let publisher = Arc::new(KubeEventPublisher::new(client, COMPONENT_NAME, instance));
    let state = Arc::new(WebhookState::new(config, pipeline, resolver, publisher));

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    tokio::select! {
        result = start_server(addr, &cli.cert_dir, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }
    Ok(())
}
