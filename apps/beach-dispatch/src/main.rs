use anyhow::Result;
use beach_dispatch::{
    agent,
    config::{Cli, Command, ServerConfig},
    server,
    telemetry::{Telemetry, TelemetryOptions},
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let telemetry = Telemetry::init(&TelemetryOptions::server())?;
            let config = ServerConfig::try_from(args)?;
            info!(
                listen_addr = %config.listen_addr,
                store = ?config.store,
                auth_bypass = config.auth.bypass,
                "starting beach-dispatch server"
            );
            server::run(config, telemetry.metrics_handle()).await
        }
        Command::Agent(args) => {
            let _telemetry = Telemetry::init(&TelemetryOptions::agent())?;
            agent::run(args).await
        }
    }
}
