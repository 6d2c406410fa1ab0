pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod weather;

use crate::bridge::event_bridge::AppEvent;
use crate::config::AppConfig;
use crate::persistence::weather_cache::WeatherCache;
use crate::session::session_manager::SessionManager;
use crate::weather::api::OpenWeatherMap;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = AppConfig::default_path()?;
    let config = AppConfig::load_or_create(&config_path).await?;

    let cache = Arc::new(WeatherCache::open(&config.cache.directory(), config.cache.validity()).await);
    let source = Arc::new(
        OpenWeatherMap::new(&config.weather_api)
            .map_err(|e| eyre!("Failed to set up weather client: {}", e))?,
    );

    info!("Starting weather station session");
    let session = SessionManager::new(
        config.mqtt.clone(),
        config.scheduler.interval(),
        cache,
        source,
    );

    let mut events = session.subscribe();
    let mut connection = session.watch_connection();

    if config.mqtt.auto_connect {
        tokio::select! {
            _ = auto_connect(&session, &config) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C during startup");
                // A connect still retrying is dropped with the runtime
                if session.status() {
                    session.shutdown().await;
                }
                return Ok(());
            }
        }
    } else {
        info!("Auto-connect disabled, waiting for shutdown");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
            event = events.recv() => match event {
                Some(AppEvent::SensorReading(reading)) => debug!(
                    "UI event: sensor reading {}°C at {}",
                    reading.temperature, reading.timestamp
                ),
                Some(AppEvent::WeatherPublished(record)) => debug!(
                    "UI event: weather for {} sent to station",
                    record.location
                ),
                None => {
                    warn!("Event stream closed");
                    break;
                }
            },
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!("Connection state: {:?}", state);
            }
        }
    }

    session.shutdown().await;
    info!("Session closed");
    Ok(())
}

async fn auto_connect(session: &SessionManager, config: &AppConfig) {
    let mqtt = &config.mqtt;
    match session.connect(&mqtt.broker_host, mqtt.broker_port).await {
        Ok(status) => info!("{}", status),
        Err(e) => {
            error!("Auto-connect failed: {}", e);
            return;
        }
    }

    let api = &config.weather_api;
    if config.scheduler.auto_start {
        match session.start_scheduler(api.latitude, api.longitude).await {
            Ok(status) => info!("{}", status),
            Err(e) => error!("Could not start automated publishing: {}", e),
        }
    } else {
        match session.fetch_weather_cached(api.latitude, api.longitude).await {
            Ok(record) => info!(
                "Current weather at {}: {}°C, {}",
                record.location, record.current_temp, record.condition
            ),
            Err(e) => warn!("Initial weather fetch failed: {}", e),
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
