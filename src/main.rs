use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;

mod app;
mod cli;

use cli::Role;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::CliArgs::parse();
    tracing_subscriber::registry()
        .with(args.log_level)
        .with(tracing_subscriber::fmt::layer())
        .init();
    // Both ring and aws-lc may be linked in; pick one explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match args.role {
        Role::Server(args) => {
            let config = app::ServerConfig::from_cli_args(&args)?;
            let port = config.port;
            app::ServerService::bind(config)
                .await
                .with_context(|| format!("failed to listen on 127.0.0.1:{}", port))?
                .serve()
                .await
        }
        Role::Client(args) => {
            let config = app::ClientConfig::from_cli_args(&args)?;
            let connector = app::WsConnector::from_config(&config)
                .context("failed to set up tunnel connector")?;
            app::ClientService::bind(&config, connector)
                .await
                .with_context(|| format!("failed to listen on {}", config.listen))?
                .serve()
                .await
        }
    }
}
