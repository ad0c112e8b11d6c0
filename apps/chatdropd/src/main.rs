//! chatdrop upload daemon entry point.
//!
//! Usage: `chatdropd [CONFIG_PATH]`

mod app;
mod config;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting chatdrop daemon"
    );

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::Config::load(path)?;
    tracing::info!(
        storage = %config.storage_root.display(),
        port = config.listen_port,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("daemon shut down cleanly");
    Ok(())
}
