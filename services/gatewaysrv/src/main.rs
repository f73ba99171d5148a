//! Gateway service entry point

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gatewaysrv::args::Args;
use gatewaysrv::config::GatewayConfig;
use gatewaysrv::{logging, run_gateway, shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config).context("Invalid command-line override")?;

    if args.validate {
        print!("{}", config.to_yaml()?);
        println!("# configuration OK");
        return Ok(());
    }

    let _log_guard = logging::init_logging(&config.logging.level, config.logging.dir.as_deref())
        .context("Failed to initialize logging")?;

    info!(
        "Starting {} v{}",
        gatewaysrv::SERVICE_NAME,
        env!("CARGO_PKG_VERSION")
    );

    let token = CancellationToken::new();
    let signal_task = shutdown::cancel_on_signal(token.clone());

    let result = run_gateway(config, token.clone()).await;
    token.cancel();
    let _ = signal_task.await;

    result.context("Gateway terminated with error")
}
