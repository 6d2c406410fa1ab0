//! # Weather Data Model
//!
//! Shared payload types exchanged between the weather API, the on-disk cache,
//! the MQTT broker and the UI layer. Every type here is serialized as JSON on
//! the wire, so field names follow the station firmware's expectations rather
//! than Rust naming preferences.
//!
//! ```text
//! weather/
//! ├── mod.rs  - WeatherRecord, SensorReading, AlertMessage, Coordinates
//! └── api.rs  - WeatherSource trait and the OpenWeatherMap client
//! ```

pub mod api;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum per-axis difference (degrees) for two coordinate pairs to count as
/// the same location.
pub const COORDINATE_TOLERANCE: f64 = 0.001;

fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Latitude/longitude pair used to key weather lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn matches(&self, other: &Coordinates) -> bool {
        (self.lat - other.lat).abs() < COORDINATE_TOLERANCE
            && (self.lon - other.lon).abs() < COORDINATE_TOLERANCE
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat, self.lon)
    }
}

/// Complete weather snapshot as published on `weather/data`.
///
/// Built once per API fetch and never mutated afterwards; a refresh replaces
/// the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub location: String,
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub condition: String,
    pub current_icon: String,
    pub wind_speed: f64,
    pub wind_direction: String,
    pub current_temp: f64,
    pub humidity: i32,
    pub pressure: i32,
    pub forecast: Vec<ForecastDay>,
    pub history: Vec<HistoryDay>,
    #[serde(default = "now_utc")]
    pub timestamp: DateTime<Utc>,
}

impl WeatherRecord {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.gps_lat, self.gps_lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub day: String,
    pub date: String,
    pub temp: f64,
    pub humidity: i32,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDay {
    pub day: String,
    pub date: String,
    pub temp: f64,
    pub humidity: i32,
}

/// Reading reported by the station's own sensors on `weather/sensor_data`.
///
/// The M5Stack firmware prefixes its field names with `sensor_`; both spellings
/// are accepted. Devices without a clock may omit the timestamp, in which case
/// the receive time is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(alias = "sensor_temp")]
    pub temperature: f64,
    #[serde(alias = "sensor_humidity")]
    pub humidity: f64,
    #[serde(alias = "sensor_pressure")]
    pub pressure: f64,
    #[serde(default = "now_utc")]
    pub timestamp: DateTime<Utc>,
}

/// Severity of an alert pushed to the station display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Emergency,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Emergency => "emergency",
        };
        write!(f, "{}", name)
    }
}

/// Alert published on `weather/alert_trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub message: String,
    #[serde(default)]
    pub level: AlertLevel,
    #[serde(default = "now_utc")]
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    /// Stamps the alert with the current time.
    pub fn new(message: impl Into<String>, level: AlertLevel) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: Utc::now(),
        }
    }
}
