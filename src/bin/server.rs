use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ws_roulette::{config::RouletteConfig, server::App};

#[derive(Debug, Parser)]
#[command(name = "roulette-server", about = "Presence and random matchmaking server")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the config
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = RouletteConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app = App::new(config);
    app.run().await?;

    Ok(())
}
