//! # MQTT Transport
//!
//! Everything that touches the broker lives here: connection lifecycle, the
//! inbound event loop, and decoding of device payloads.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings, QoS and retry policy
//! ├── message_manager.rs  - Inbound payload decoding per topic
//! └── mqtt_handler.rs     - TransportSession: connect/disconnect/publish + event loop
//! ```
//!
//! The station firmware speaks on four fixed topics. The desktop side
//! publishes weather snapshots and alerts and listens for sensor readings and
//! data requests:
//!
//! | Topic                   | Direction | Payload        |
//! |-------------------------|-----------|----------------|
//! | `weather/data`          | publish   | WeatherRecord  |
//! | `weather/sensor_data`   | subscribe | SensorReading  |
//! | `weather/alert_trigger` | publish   | AlertMessage   |
//! | `weather/data_request`  | subscribe | empty trigger  |

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub const WEATHER_DATA_TOPIC: &str = "weather/data";
pub const SENSOR_DATA_TOPIC: &str = "weather/sensor_data";
pub const ALERT_TOPIC: &str = "weather/alert_trigger";
pub const DATA_REQUEST_TOPIC: &str = "weather/data_request";

/// Topics subscribed as part of every successful connect.
pub const SUBSCRIBED_TOPICS: [&str; 2] = [SENSOR_DATA_TOPIC, DATA_REQUEST_TOPIC];
