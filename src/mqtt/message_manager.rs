use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::mpsc;

use super::{DATA_REQUEST_TOPIC, SENSOR_DATA_TOPIC};
use crate::weather::SensorReading;

/// Typed payload of a message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SensorReading(SensorReading),
    /// The station asked for a fresh weather snapshot.
    DataRequest { received_at: DateTime<Utc> },
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InboundMessage::SensorReading(reading) => write!(
                f,
                "sensor reading {}°C, {}%, {} hPa at {}",
                reading.temperature, reading.humidity, reading.pressure, reading.timestamp
            ),
            InboundMessage::DataRequest { received_at } => {
                write!(f, "data request at {}", received_at)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message on unexpected topic {0}")]
    UnknownTopic(String),

    #[error("Malformed payload on {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundMessage {
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        match topic {
            SENSOR_DATA_TOPIC => serde_json::from_slice::<SensorReading>(payload)
                .map(InboundMessage::SensorReading)
                .map_err(|source| DecodeError::Malformed {
                    topic: topic.to_string(),
                    source,
                }),
            // The payload is a bare trigger; whatever the device sends is ignored.
            DATA_REQUEST_TOPIC => Ok(InboundMessage::DataRequest {
                received_at: Utc::now(),
            }),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }
}

/// Ordered queue between the MQTT event loop and the event bridge.
pub fn inbound_channel(capacity: usize) -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sensor_reading() {
        let payload = br#"{"temperature": 21.5, "humidity": 44.0, "pressure": 1013.2, "timestamp": "2026-10-18T10:00:00Z"}"#;
        let message = InboundMessage::decode(SENSOR_DATA_TOPIC, payload).unwrap();
        match message {
            InboundMessage::SensorReading(reading) => assert_eq!(reading.temperature, 21.5),
            other => panic!("unexpected message: {other}"),
        }
    }

    #[test]
    fn data_request_ignores_payload() {
        let message = InboundMessage::decode(DATA_REQUEST_TOPIC, b"").unwrap();
        assert!(matches!(message, InboundMessage::DataRequest { .. }));
    }

    #[test]
    fn malformed_sensor_payload_is_rejected() {
        let err = InboundMessage::decode(SENSOR_DATA_TOPIC, b"{\"temperature\": \"hot\"}").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = InboundMessage::decode("weather/other", b"{}").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTopic(topic) if topic == "weather/other"));
    }
}
