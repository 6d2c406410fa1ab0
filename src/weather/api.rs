//! External weather source.
//!
//! The session engine only needs "give me a record for these coordinates or
//! fail", expressed by [`WeatherSource`]. [`OpenWeatherMap`] is the production
//! implementation on top of the One Call 3.0 endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{Coordinates, ForecastDay, HistoryDay, WeatherRecord};
use crate::config::WeatherApiSettings;

const FORECAST_DAYS: usize = 6;
const HISTORY_DAYS: i64 = 7;

// The history endpoint needs a paid plan; past days use this fixed pattern.
const HISTORY_TEMP_PATTERN: [f64; 7] = [32.0, 31.0, 34.0, 28.0, 32.0, 27.0, 30.0];
const HISTORY_HUMIDITY_PATTERN: [i32; 7] = [85, 72, 68, 91, 76, 82, 79];

const COMPASS_POINTS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Weather API unreachable: {0}")]
    Unreachable(String),

    #[error("Weather API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed weather API response: {0}")]
    Malformed(String),
}

/// Anything able to produce a fresh [`WeatherRecord`] for a location.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, coordinates: Coordinates) -> Result<WeatherRecord, FetchError>;
}

pub struct OpenWeatherMap {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherMap {
    pub fn new(settings: &WeatherApiSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| FetchError::Unreachable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherMap {
    async fn fetch(&self, coordinates: Coordinates) -> Result<WeatherRecord, FetchError> {
        info!("Fetching weather from API for {}", coordinates);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", coordinates.lat.to_string()),
                ("lon", coordinates.lon.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
                ("exclude", "minutely,hourly,alerts".to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        debug!("Weather API responded with {}", status);
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Weather API request failed with {}: {}", status, body);
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        let parsed: OneCallResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        let record = build_record(parsed, coordinates, Utc::now());
        info!(
            "Weather fetched: {}°C, {}, {} forecast days",
            record.current_temp,
            record.condition,
            record.forecast.len()
        );
        Ok(record)
    }
}

#[derive(Debug, Deserialize)]
struct OneCallResponse {
    current: CurrentBlock,
    daily: Vec<DailyBlock>,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    #[serde(default)]
    temp: f64,
    #[serde(default)]
    humidity: i32,
    #[serde(default)]
    pressure: i32,
    #[serde(default)]
    wind_speed: f64,
    #[serde(default)]
    wind_deg: f64,
    #[serde(default)]
    weather: Vec<ConditionBlock>,
}

#[derive(Debug, Deserialize)]
struct ConditionBlock {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    icon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    #[serde(default)]
    dt: i64,
    #[serde(default)]
    temp: DailyTemp,
    #[serde(default)]
    humidity: i32,
    #[serde(default)]
    weather: Vec<ConditionBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct DailyTemp {
    #[serde(default)]
    max: f64,
}

fn build_record(response: OneCallResponse, coordinates: Coordinates, now: DateTime<Utc>) -> WeatherRecord {
    let today = now.date_naive();
    let current = response.current;
    let primary = current.weather.first();

    let condition = primary
        .and_then(|w| w.description.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let current_icon = primary
        .and_then(|w| w.icon.clone())
        .unwrap_or_else(|| "unknown".to_string());

    WeatherRecord {
        location: format!("LAT: {:.4}, LON: {:.4}", coordinates.lat, coordinates.lon),
        gps_lat: coordinates.lat,
        gps_lon: coordinates.lon,
        condition,
        current_icon,
        wind_speed: current.wind_speed,
        wind_direction: compass_direction(current.wind_deg).to_string(),
        current_temp: current.temp,
        humidity: current.humidity,
        pressure: current.pressure,
        forecast: forecast_days(&response.daily, today),
        history: history_days(current.temp, current.humidity, today),
        timestamp: now,
    }
}

fn forecast_days(daily: &[DailyBlock], today: NaiveDate) -> Vec<ForecastDay> {
    daily
        .iter()
        .take(FORECAST_DAYS)
        .enumerate()
        .map(|(i, day)| {
            let (label, date) = match DateTime::from_timestamp(day.dt, 0).filter(|_| day.dt > 0) {
                Some(at) => (day_label(at.date_naive(), today), at.format("%d/%m").to_string()),
                None => (format!("DAY{}", i + 1), String::new()),
            };
            let icon = day
                .weather
                .first()
                .and_then(|w| w.icon.clone())
                .unwrap_or_else(|| "unknown".to_string());

            ForecastDay {
                day: label,
                date,
                temp: day.temp.max,
                humidity: day.humidity,
                icon,
            }
        })
        .collect()
}

fn history_days(current_temp: f64, current_humidity: i32, today: NaiveDate) -> Vec<HistoryDay> {
    (0..HISTORY_DAYS)
        .rev()
        .map(|days_back| {
            let date = today - ChronoDuration::days(days_back);
            let slot = (HISTORY_DAYS - 1 - days_back) as usize % HISTORY_TEMP_PATTERN.len();
            let (temp, humidity) = if days_back == 0 {
                (current_temp, current_humidity)
            } else {
                (HISTORY_TEMP_PATTERN[slot], HISTORY_HUMIDITY_PATTERN[slot])
            };

            HistoryDay {
                day: day_label(date, today),
                date: date.format("%d/%m").to_string(),
                temp,
                humidity,
            }
        })
        .collect()
}

fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "TODAY".to_string()
    } else {
        date.format("%a").to_string().to_uppercase()
    }
}

fn compass_direction(degrees: f64) -> &'static str {
    let index = ((degrees.rem_euclid(360.0) + 11.25) / 22.5) as usize % COMPASS_POINTS.len();
    COMPASS_POINTS[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_body() -> serde_json::Value {
        // 2026-10-18 and the following day, noon UTC
        serde_json::json!({
            "current": {
                "temp": 17.4,
                "humidity": 81,
                "pressure": 1009,
                "wind_speed": 3.6,
                "wind_deg": 250.0,
                "weather": [{ "description": "light rain", "icon": "10d" }]
            },
            "daily": [
                { "dt": 1792324800, "temp": { "max": 18.2 }, "humidity": 77, "weather": [{ "icon": "10d" }] },
                { "dt": 1792411200, "temp": { "max": 15.0 }, "humidity": 70, "weather": [{ "icon": "04d" }] }
            ]
        })
    }

    fn settings_for(base_url: String) -> WeatherApiSettings {
        WeatherApiSettings {
            api_key: "test-key".to_string(),
            base_url,
            ..WeatherApiSettings::default()
        }
    }

    #[test]
    fn compass_covers_all_quadrants() {
        assert_eq!(compass_direction(0.0), "N");
        assert_eq!(compass_direction(11.3), "NNE");
        assert_eq!(compass_direction(90.0), "E");
        assert_eq!(compass_direction(250.0), "WSW");
        assert_eq!(compass_direction(355.0), "N");
    }

    #[test]
    fn record_labels_today_and_weekdays() {
        let parsed: OneCallResponse = serde_json::from_value(sample_body()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let record = build_record(parsed, Coordinates::new(48.7758, 9.1829), now);

        assert_eq!(record.location, "LAT: 48.7758, LON: 9.1829");
        assert_eq!(record.condition, "light rain");
        assert_eq!(record.wind_direction, "WSW");
        assert_eq!(record.forecast.len(), 2);
        assert_eq!(record.forecast[0].day, "TODAY");
        assert_eq!(record.forecast[0].date, "18/10");
        assert_eq!(record.forecast[1].day, "MON");
        assert_eq!(record.forecast[1].temp, 15.0);
    }

    #[test]
    fn history_window_ends_with_current_values() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let history = history_days(17.4, 81, today);

        assert_eq!(history.len(), 7);
        assert_eq!(history[0].date, "12/10");
        assert_eq!(history[0].temp, 32.0);
        let last = history.last().unwrap();
        assert_eq!(last.day, "TODAY");
        assert_eq!(last.temp, 17.4);
        assert_eq!(last.humidity, 81);
    }

    #[test]
    fn forecast_without_timestamp_falls_back_to_day_index() {
        let daily = vec![DailyBlock {
            dt: 0,
            temp: DailyTemp { max: 10.0 },
            humidity: 50,
            weather: Vec::new(),
        }];
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let forecast = forecast_days(&daily, today);
        assert_eq!(forecast[0].day, "DAY1");
        assert_eq!(forecast[0].date, "");
        assert_eq!(forecast[0].icon, "unknown");
    }

    #[tokio::test]
    async fn fetch_parses_successful_response() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/data/3.0/onecall"))
            .and(wiremock::matchers::query_param("appid", "test-key"))
            .and(wiremock::matchers::query_param("units", "metric"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(sample_body()))
            .expect(1)
            .mount(&server)
            .await;

        let source =
            OpenWeatherMap::new(&settings_for(format!("{}/data/3.0/onecall", server.uri()))).unwrap();
        let record = source.fetch(Coordinates::new(48.7758, 9.1829)).await.unwrap();

        assert_eq!(record.current_temp, 17.4);
        assert_eq!(record.pressure, 1009);
        assert_eq!(record.history.len(), 7);
    }

    #[tokio::test]
    async fn fetch_reports_non_success_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(401).set_body_string("Invalid API key"))
            .mount(&server)
            .await;

        let source = OpenWeatherMap::new(&settings_for(server.uri())).unwrap();
        let err = source.fetch(Coordinates::new(1.0, 2.0)).await.unwrap_err();

        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Invalid API key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fetch_rejects_body_without_current_block() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({ "daily": [] })),
            )
            .mount(&server)
            .await;

        let source = OpenWeatherMap::new(&settings_for(server.uri())).unwrap();
        let err = source.fetch(Coordinates::new(1.0, 2.0)).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }
}
