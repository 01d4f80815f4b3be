//! vigil operator - MetricsTrait controller for OAM applications

use clap::Parser;

use vigil_common::kube_utils::create_client;
use vigil_common::telemetry::init_telemetry;
use vigil_operator::config::{Command, OperatorConfig};
use vigil_operator::controller_runner::build_metrics_trait_controller;
use vigil_operator::startup::{crd_yaml, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = OperatorConfig::parse();

    match cli.command() {
        Command::Crd => {
            println!("{}", crd_yaml()?);
            Ok(())
        }
        Command::Controller => run_controller(cli).await,
    }
}

async fn run_controller(cli: OperatorConfig) -> anyhow::Result<()> {
    init_telemetry(cli.telemetry_config())?;

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;

    tracing::info!("Starting vigil controllers...");
    build_metrics_trait_controller(client, cli.controller_config()).await;
    tracing::info!("Shutting down");
    Ok(())
}
