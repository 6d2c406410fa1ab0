//! Inbound side of the session: turns decoded MQTT messages into events the
//! UI layer can subscribe to.
//!
//! ```text
//! TransportSession ─[InboundMessage, mpsc]→ EventBridge ─[AppEvent, broadcast]→ UI subscribers
//!                                               └─[DataRequest, mpsc]→ SessionManager
//! ```

pub mod event_bridge;
