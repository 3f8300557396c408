pub mod config;
pub mod console;
pub mod mqtt;

use crate::config::AppConfig;
use crate::console::Console;
use crate::mqtt::mqtt_handler::SessionManager;
use crate::mqtt::transport::RumqttcTransport;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let app_config = load_config().await?;
    setup_logging_env(app_config.log_level()?);

    let session_config = app_config.session_config();
    info!("Broker configured as {}", session_config);

    let manager = SessionManager::spawn(
        Arc::new(RumqttcTransport::default()),
        session_config,
        app_config.session.message_log_capacity,
    );

    Console::new(manager).run().await?;

    info!("Bye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn load_config() -> Result<AppConfig> {
    let path = AppConfig::default_path()?;

    AppConfig::ensure_default_config(&path)
        .await
        .map_err(|e| eyre!("Failed to prepare settings file: {}", e))?;

    let mut config = AppConfig::load(&path)
        .await
        .map_err(|e| eyre!("Failed to load settings: {}", e))?;
    config.apply_env_overrides();

    Ok(config)
}
