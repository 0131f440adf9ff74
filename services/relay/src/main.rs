use clap::Parser;
use relay::config::{Options, RelayConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting debug relay");

    let options = Options::parse();
    let config = RelayConfig::from_options(options)?;

    relay::server::run(config).await
}
