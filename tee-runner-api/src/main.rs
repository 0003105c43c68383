use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tee_runner_api::{
    clients::{
        attestation::BinaryQuoteRunner,
        azure::{ArmAzureClient, AzureClient},
    },
    config::Config,
    repositories::deployment::InMemoryDeploymentRepository,
    routes::{AppState, Services, build_router},
    services::{
        attestation::{AttestationServiceArgs, DefaultAttestationService},
        deployment::{DefaultDeploymentService, DeploymentDefaults, DeploymentServiceArgs},
    },
    workers::provisioner::{ProvisionerArgs, ProvisionerSettings, ProvisionerWorker},
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// The path to the config file.
    #[clap(short, long)]
    config_path: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let Cli { config_path } = Cli::parse();
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(endpoint) = config.server.metrics_bind_endpoint {
        PrometheusBuilder::new()
            .with_http_listener(endpoint)
            .install()
            .expect("failed to install metrics exporter");
    }

    let azure: Arc<dyn AzureClient> = match ArmAzureClient::new(config.azure.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create Azure client: {e:#}");
            std::process::exit(1);
        }
    };
    let repository = Arc::new(InMemoryDeploymentRepository::default());
    let provisioner = ProvisionerWorker::spawn(ProvisionerArgs {
        azure: azure.clone(),
        repository: repository.clone(),
        settings: ProvisionerSettings::from_config(&config),
    });

    let defaults = DeploymentDefaults {
        size: config.vm.size.clone(),
        image: config.vm.image.clone(),
        security_type: config.vm.security_type.clone(),
        resource_group: config.azure.resource_group.clone(),
        location: config.azure.location.clone(),
    };
    let deployment = DefaultDeploymentService::new(DeploymentServiceArgs {
        repository: repository.clone(),
        azure: azure.clone(),
        provisioner: Arc::new(provisioner),
        defaults,
    });
    let attestation = DefaultAttestationService::new(AttestationServiceArgs {
        azure: azure.clone(),
        runner: Arc::new(BinaryQuoteRunner::new(config.attestation.clone())),
        config: config.attestation.clone(),
    });

    let services = Services { deployment: Arc::new(deployment), attestation: Arc::new(attestation) };
    let router = build_router(AppState { services }, config.server.api_token.clone());

    let bind_endpoint = config.server.bind_endpoint;
    info!("Running server on {bind_endpoint}");
    let listener = TcpListener::bind(bind_endpoint).await.expect("failed to bind");
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await.expect("failed to run");
}
