use std::net::SocketAddr;

use anyhow::Context;
use args::Args;
use clap::Parser;
use config::Config;
use server::ServeConfig;
use tokio_util::sync::CancellationToken;

mod args;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    server::logger::init(&args.log)?;

    let config = if args.config.exists() {
        Config::load(&args.config).with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        log::warn!("{} not found, starting with the default configuration", args.config.display());
        Config::default()
    };

    let listen_address = match args.listen_address.or(config.server.listen_address) {
        Some(address) => address,
        None => DEFAULT_LISTEN_ADDRESS.parse::<SocketAddr>()?,
    };

    let shutdown_signal = CancellationToken::new();
    let on_ctrl_c = shutdown_signal.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received Ctrl+C, shutting down");
                on_ctrl_c.cancel();
            }
            Err(e) => log::error!("Failed to listen for Ctrl+C: {e}"),
        }
    });

    server::serve(ServeConfig {
        listen_address,
        config,
        shutdown_signal,
    })
    .await?;

    Ok(())
}
