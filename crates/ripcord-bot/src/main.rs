use clap::Parser;
use tracing::info;

use ripcord_bot::{AppConfig, Application};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-user exit execution service")]
struct Args {
    /// Path to config file (can also be set via RIPCORD_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ripcord_ws::init_crypto();
    ripcord_telemetry::init_logging()?;

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting ripcord");

    let config = match args.config {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::load()?,
    };

    let app = Application::new(config)?;
    app.run().await?;

    Ok(())
}
