use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gateway", version, about = "Multi-protocol LLM gateway with provider fallback")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "./gateway.toml")]
    pub config: PathBuf,

    /// Address to listen on. Overrides `server.listen_address`.
    #[arg(short, long, env = "GATEWAY_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `llm=debug,server=info`.
    #[arg(long, env = "GATEWAY_LOG", default_value = "info")]
    pub log: String,
}
