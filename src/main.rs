use anyhow::{Context, Result};
use relayd::config::Config;
use relayd::server::Server;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("-c") | Some("--config") => args.next(),
        Some(path) => Some(path.to_string()),
        None => None,
    }
}

async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for SIGINT")?;
        Ok("SIGINT")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match config_path() {
        Some(path) => Config::load(&path).with_context(|| format!("Loading {path}"))?,
        None => Config::default(),
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting relayd (revision {})", env!("GIT_REVISION"));

    let server = Server::new(config);
    server.start().await.context("Failed to start server")?;

    let signal_name = wait_for_signal().await?;
    info!("Received {signal_name}, initiating graceful shutdown...");
    server.stop().await?;
    info!("Graceful shutdown completed");

    Ok(())
}
