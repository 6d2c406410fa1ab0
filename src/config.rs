//! Application settings persisted as TOML in the user's config directory.
//!
//! Only the fields the session engine consumes live here. A missing file is
//! created with defaults; a broken one is ignored with a warning so the
//! application always starts.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::config::MqttSettings;

pub const APP_DIR: &str = "weather-station-desktop";
const CONFIG_FILE: &str = "config.toml";
const API_KEY_ENV: &str = "WEATHER_API_KEY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttSettings,
    pub weather_api: WeatherApiSettings,
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherApiSettings {
    pub api_key: String,
    pub base_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub request_timeout_secs: u64,
}

impl Default for WeatherApiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openweathermap.org/data/3.0/onecall".to_string(),
            latitude: 48.7758,
            longitude: 9.1829,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub publish_interval_secs: u64,
    /// Start republishing right after an automatic connect
    pub auto_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            publish_interval_secs: 5,
            auto_start: false,
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub validity_hours: u32,
    /// Overrides the platform data directory
    pub directory: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            validity_hours: 24,
            directory: None,
        }
    }
}

impl CacheSettings {
    pub fn validity(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.validity_hours))
    }

    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| eyre!("Could not find config directory"))?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Loads the settings file, writing defaults first if it does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        let mut config = if exists {
            match Self::read(path).await {
                Ok(config) => {
                    info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to load config: {}, using defaults", e);
                    AppConfig::default()
                }
            }
        } else {
            let config = AppConfig::default();
            config.save(path).await?;
            info!("Created default config file at {:?}", path);
            config
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            debug!("Using weather API key from {}", API_KEY_ENV);
            config.weather_api.api_key = key;
        }
        if config.weather_api.api_key.is_empty() {
            warn!("No weather API key configured, API fetches will be rejected");
        }

        Ok(config)
    }

    async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}
