use chatdigest::config::Config;
use chatdigest::listener::{EventSource, Listener};
use chatdigest::telegram::BotApiSource;
use chatdigest::Services;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let services = Services::new(config)?;
    let source = BotApiSource::new(&services.config);
    let listener = Listener::new(services.db.clone(), &services.config);

    info!("Starting capture...");
    tokio::select! {
        _ = listener.run(&source) => warn!("Event stream closed"),
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested, disconnecting..."),
    }

    source.disconnect().await;
    Ok(())
}
