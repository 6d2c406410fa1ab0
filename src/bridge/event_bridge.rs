use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mqtt::message_manager::InboundMessage;
use crate::weather::{SensorReading, WeatherRecord};

const EVENT_CAPACITY: usize = 64;

/// Event delivered to UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    SensorReading(SensorReading),
    /// A scheduled publish delivered this record to the station.
    WeatherPublished(WeatherRecord),
}

/// Device asked for the current weather snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRequest {
    pub received_at: DateTime<Utc>,
}

/// Cloneable access to the bridge's outputs.
#[derive(Clone)]
pub struct BridgeHandle {
    events: broadcast::Sender<AppEvent>,
    latest_sensor: watch::Receiver<Option<SensorReading>>,
}

impl BridgeHandle {
    /// Starts receiving events from now on; earlier events are not replayed.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.events.subscribe(),
        }
    }

    pub fn latest_sensor(&self) -> Option<SensorReading> {
        self.latest_sensor.borrow().clone()
    }

    /// Sender for events raised outside the bridge loop.
    pub fn emitter(&self) -> broadcast::Sender<AppEvent> {
        self.events.clone()
    }

    pub fn watch_sensor(&self) -> watch::Receiver<Option<SensorReading>> {
        self.latest_sensor.clone()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<AppEvent>,
}

impl EventSubscription {
    /// Next event in arrival order, or `None` once the bridge has shut down.
    ///
    /// A subscriber that falls behind loses the overflowed events rather than
    /// receiving them twice.
    pub async fn recv(&mut self) -> Option<AppEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("UI subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub struct EventBridge {
    inbound: mpsc::Receiver<InboundMessage>,
    events: broadcast::Sender<AppEvent>,
    latest_sensor: watch::Sender<Option<SensorReading>>,
    data_requests: mpsc::Sender<DataRequest>,
}

impl EventBridge {
    pub fn spawn(
        inbound: mpsc::Receiver<InboundMessage>,
        data_requests: mpsc::Sender<DataRequest>,
    ) -> (BridgeHandle, JoinHandle<()>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (latest_sensor, latest_rx) = watch::channel(None);

        let handle = BridgeHandle {
            events: events.clone(),
            latest_sensor: latest_rx,
        };
        let bridge = EventBridge {
            inbound,
            events,
            latest_sensor,
            data_requests,
        };
        (handle, tokio::spawn(bridge.run()))
    }

    async fn run(mut self) {
        info!("Event bridge started");
        while let Some(message) = self.inbound.recv().await {
            match message {
                InboundMessage::SensorReading(reading) => {
                    info!(
                        "Sensor data: {}°C, {}%, {} hPa",
                        reading.temperature, reading.humidity, reading.pressure
                    );
                    self.latest_sensor.send_replace(Some(reading.clone()));
                    // no subscribers is not an error
                    let delivered = self
                        .events
                        .send(AppEvent::SensorReading(reading))
                        .unwrap_or(0);
                    debug!("Sensor event delivered to {} subscribers", delivered);
                }
                InboundMessage::DataRequest { received_at } => {
                    debug!("Device requested weather data at {}", received_at);
                    if let Err(e) = self.data_requests.try_send(DataRequest { received_at }) {
                        warn!("Dropping device data request: {}", e);
                    }
                }
            }
        }
        info!("Event bridge stopped, inbound channel closed");
    }
}
