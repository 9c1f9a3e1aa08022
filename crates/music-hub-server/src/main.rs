mod acquisition;
mod api;
mod asset_store;
mod assets;
mod bridge_transport;
mod config;
mod control_bridge;
mod error;
mod events;
mod openapi;
mod reclamation;
mod resolver;
mod session;
mod session_registry;
mod source_id;
mod startup;
mod state;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "music-hub-server")]
pub(crate) struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:8080
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Directory for cached audio assets
    #[arg(long)]
    asset_dir: Option<PathBuf>,

    /// Server config file (TOML); defaults to config.toml beside the binary
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,music_hub_server=info")
        }))
        .init();

    startup::run(args).await
}
