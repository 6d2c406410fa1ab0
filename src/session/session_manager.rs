use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::session_worker::{spawn_worker, SessionCommand, SessionCore};
use super::SessionError;
use crate::bridge::event_bridge::{BridgeHandle, EventBridge, EventSubscription};
use crate::mqtt::config::MqttSettings;
use crate::mqtt::message_manager::inbound_channel;
use crate::mqtt::mqtt_handler::{ConnectionState, TransportSession};
use crate::persistence::weather_cache::WeatherCache;
use crate::scheduler::publish_scheduler::PublishScheduler;
use crate::status::StatusMessage;
use crate::weather::api::WeatherSource;
use crate::weather::{AlertLevel, Coordinates, SensorReading, WeatherRecord};

const COMMAND_CAPACITY: usize = 32;
const INBOUND_CAPACITY: usize = 64;
const DATA_REQUEST_CAPACITY: usize = 8;

pub struct SessionManager {
    core: Arc<SessionCore>,
    commands: mpsc::Sender<SessionCommand>,
    bridge: BridgeHandle,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    bridge_handle: JoinHandle<()>,
}

impl SessionManager {
    /// Wires up transport, bridge, scheduler and worker. Must be called from
    /// within a tokio runtime.
    pub fn new(
        mqtt: MqttSettings,
        publish_interval: Duration,
        cache: Arc<WeatherCache>,
        source: Arc<dyn WeatherSource>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = inbound_channel(INBOUND_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(DATA_REQUEST_CAPACITY);
        let (bridge, bridge_handle) = EventBridge::spawn(inbound_rx, request_tx);

        let transport = Arc::new(TransportSession::new(mqtt, inbound_tx));
        let scheduler = PublishScheduler::new(
            transport.clone(),
            cache.clone(),
            bridge.emitter(),
            publish_interval,
        );
        let core = Arc::new(SessionCore {
            transport,
            cache,
            scheduler,
            source,
        });

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = spawn_worker(core.clone(), command_rx, request_rx);

        Self {
            core,
            commands,
            bridge,
            worker_handle: Mutex::new(Some(worker)),
            bridge_handle,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(command(response_tx))
            .await
            .map_err(|_| SessionError::WorkerStopped)?;
        response_rx.await.map_err(|_| SessionError::WorkerStopped)?
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<StatusMessage, SessionError> {
        let host = host.to_string();
        self.request(|response_tx| SessionCommand::Connect {
            host,
            port,
            response_tx,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<StatusMessage, SessionError> {
        self.request(|response_tx| SessionCommand::Disconnect { response_tx })
            .await
    }

    /// `true` while the broker link is up.
    pub fn status(&self) -> bool {
        self.core.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.transport.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.core.transport.watch_status()
    }

    pub async fn publish_weather(&self, record: &WeatherRecord) -> Result<StatusMessage, SessionError> {
        self.core.publish_weather(record).await
    }

    /// Cached record regardless of its age.
    pub fn get_latest_weather(&self) -> Option<WeatherRecord> {
        self.core.cache.get()
    }

    pub fn get_sensor_data(&self) -> Option<SensorReading> {
        self.bridge.latest_sensor()
    }

    pub async fn send_alert(&self, message: &str, level: AlertLevel) -> Result<StatusMessage, SessionError> {
        self.core.send_alert(message, level).await
    }

    /// Always asks the weather API; the cache is left untouched.
    pub async fn fetch_weather(&self, lat: f64, lon: f64) -> Result<WeatherRecord, SessionError> {
        self.core.fetch(Coordinates::new(lat, lon)).await
    }

    pub async fn fetch_weather_cached(&self, lat: f64, lon: f64) -> Result<WeatherRecord, SessionError> {
        let coordinates = Coordinates::new(lat, lon);
        self.request(|response_tx| SessionCommand::FetchCached {
            coordinates,
            response_tx,
        })
        .await
    }

    pub async fn start_scheduler(&self, lat: f64, lon: f64) -> Result<StatusMessage, SessionError> {
        let coordinates = Coordinates::new(lat, lon);
        self.request(|response_tx| SessionCommand::StartScheduler {
            coordinates,
            response_tx,
        })
        .await
    }

    pub async fn stop_scheduler(&self) -> Result<StatusMessage, SessionError> {
        self.request(|response_tx| SessionCommand::StopScheduler { response_tx })
            .await
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.core.scheduler.is_running()
    }

    pub async fn force_refresh_cache(&self, lat: f64, lon: f64) -> Result<StatusMessage, SessionError> {
        let coordinates = Coordinates::new(lat, lon);
        self.request(|response_tx| SessionCommand::ForceRefresh {
            coordinates,
            response_tx,
        })
        .await
    }

    /// Sensor and publish events raised from now on.
    pub fn subscribe(&self) -> EventSubscription {
        self.bridge.subscribe()
    }

    /// Stops publishing, disconnects and ends the worker. Commands issued
    /// afterwards fail with [`SessionError::WorkerStopped`].
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker_handle.lock().await.take() else {
            debug!("Session already shut down");
            return;
        };

        info!("Shutting down session");
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Shutdown { response_tx })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
        if let Err(e) = worker.await {
            error!("Session worker ended abnormally: {}", e);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.bridge_handle.abort();
    }
}
