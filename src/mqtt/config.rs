use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings as stored in `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Connect on startup using `broker_host`/`broker_port`
    pub auto_connect: bool,
    pub keep_alive_secs: u64,
    /// 0 = at most once, 1 = at least once, 2 = exactly once
    pub qos: u8,
    /// Handshake attempts before a connect is reported as failed
    pub connect_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt
    pub connect_backoff_ms: u64,
    /// Upper bound for a single handshake, publish or teardown
    pub io_timeout_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_host: "192.168.137.1".to_string(),
            broker_port: 1883,
            username: None,
            password: None,
            client_id: format!("weather-desktop-{}", chrono::Utc::now().timestamp()),
            auto_connect: true,
            keep_alive_secs: 30,
            qos: 1,
            connect_attempts: 3,
            connect_backoff_ms: 1000,
            io_timeout_secs: 10,
        }
    }
}

impl MqttSettings {
    /// Client id handed to the broker; a blank setting gets a generated id.
    pub fn client_id(&self) -> String {
        let trimmed = self.client_id.trim();
        if trimmed.is_empty() {
            format!("weather-desktop-{}", chrono::Utc::now().timestamp())
        } else {
            trimmed.to_string()
        }
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        // rumqttc rejects keep-alives below one second
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.connect_backoff_ms.saturating_mul(factor))
    }
}
