mod cli;
mod commands;
mod logging;

use std::time::Duration;

use bridge::client::ClientConfig;
use bridge::launcher::LauncherConfig;
use bridge::{BridgeConfig, BridgeContext};
use clap::Parser;
use tracing::{debug, warn};

use crate::cli::{Cli, ConnectionArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet)?;
    debug!(?cli, "parsed arguments");

    let mut context = BridgeContext::new(bridge_config(&cli.connection));
    let outcome = commands::execute(&mut context, cli.command).await;
    if let Err(err) = context.stop_server().await {
        warn!(error = %err, "failed to stop the engine server");
    }

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn bridge_config(args: &ConnectionArgs) -> BridgeConfig {
    let client = ClientConfig::new(args.port)
        .with_address(args.address.clone())
        .with_startup_timeout(Duration::from_secs(args.startup_timeout))
        .with_request_timeout(Duration::from_secs(args.request_timeout));
    let config = BridgeConfig::new(client);
    match &args.server {
        Some(program) => {
            let launcher = args
                .server_args
                .iter()
                .fold(LauncherConfig::new(program), |launcher, arg| {
                    launcher.with_arg(arg)
                });
            config.with_launcher(launcher)
        }
        None => config,
    }
}
