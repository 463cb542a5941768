#![deny(clippy::unwrap_used)]

use krypton_core::config::KryptonConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = KryptonConfig::load(&KryptonConfig::default_path())?;

    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    krypton_core::krypton_main(config).await?;

    Ok(())
}
