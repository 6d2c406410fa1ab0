use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SessionError;
use crate::bridge::event_bridge::DataRequest;
use crate::mqtt::mqtt_handler::{ConnectionState, TransportSession};
use crate::mqtt::{ALERT_TOPIC, WEATHER_DATA_TOPIC};
use crate::persistence::weather_cache::WeatherCache;
use crate::scheduler::publish_scheduler::{PublishScheduler, SchedulerError, SchedulerStatus};
use crate::status::StatusMessage;
use crate::weather::api::WeatherSource;
use crate::weather::{AlertLevel, AlertMessage, Coordinates, WeatherRecord};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if let Err(_) = $response_tx.send($action.await) {
            error!("Failed to send response, caller went away");
        }
    };
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

#[derive(Debug)]
pub(super) enum SessionCommand {
    Connect {
        host: String,
        port: u16,
        response_tx: Reply<StatusMessage>,
    },
    Disconnect {
        response_tx: Reply<StatusMessage>,
    },
    StartScheduler {
        coordinates: Coordinates,
        response_tx: Reply<StatusMessage>,
    },
    StopScheduler {
        response_tx: Reply<StatusMessage>,
    },
    FetchCached {
        coordinates: Coordinates,
        response_tx: Reply<WeatherRecord>,
    },
    ForceRefresh {
        coordinates: Coordinates,
        response_tx: Reply<StatusMessage>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Components shared by the worker and the read paths of the façade.
pub(super) struct SessionCore {
    pub transport: Arc<TransportSession>,
    pub cache: Arc<WeatherCache>,
    pub scheduler: PublishScheduler,
    pub source: Arc<dyn WeatherSource>,
}

impl SessionCore {
    pub fn is_connected(&self) -> bool {
        self.transport.status() == ConnectionState::Connected
    }

    async fn connect(&self, host: String, port: u16) -> Result<StatusMessage, SessionError> {
        Ok(self.transport.connect(&host, port).await?)
    }

    /// An explicit disconnect also ends automated publishing.
    async fn disconnect(&self) -> Result<StatusMessage, SessionError> {
        if self.scheduler.is_running() {
            self.scheduler.stop().await;
        }
        Ok(self.transport.disconnect().await?)
    }

    async fn start_scheduler(&self, coordinates: Coordinates) -> Result<StatusMessage, SessionError> {
        if !self.is_connected() {
            return Err(SchedulerError::NotConnected.into());
        }
        if self.scheduler.is_running() {
            return Ok(StatusMessage::SchedulerAlreadyRunning);
        }

        if let Err(e) = self.fetch_cached(coordinates).await {
            warn!("Could not warm weather cache before publishing: {}", e);
        }

        match self.scheduler.start(coordinates).await? {
            SchedulerStatus::AlreadyRunning => Ok(StatusMessage::SchedulerAlreadyRunning),
            _ => Ok(StatusMessage::SchedulerStarted),
        }
    }

    async fn stop_scheduler(&self) -> Result<StatusMessage, SessionError> {
        match self.scheduler.stop().await {
            SchedulerStatus::Stopped => Ok(StatusMessage::SchedulerStopped),
            _ => Ok(StatusMessage::SchedulerNotRunning),
        }
    }

    /// Serves the cached record when it is fresh and for the same location,
    /// otherwise fetches and caches a new one.
    ///
    /// A failed cache write does not fail the fetch; the fetched record is
    /// still returned.
    async fn fetch_cached(&self, coordinates: Coordinates) -> Result<WeatherRecord, SessionError> {
        if let Some(record) = self.cache.valid_for(&coordinates) {
            debug!("Serving weather for {} from cache", coordinates);
            return Ok(record);
        }

        info!("Weather cache miss for {}, fetching", coordinates);
        let record = self.source.fetch(coordinates).await?;
        if let Err(e) = self.cache.store(record.clone()).await {
            debug!("Serving fetched weather without a durable cache copy: {}", e);
        }
        Ok(record)
    }

    async fn force_refresh(&self, coordinates: Coordinates) -> Result<StatusMessage, SessionError> {
        info!("Forcing weather refresh for {}", coordinates);
        let record = self.source.fetch(coordinates).await?;
        self.cache.store(record).await?;
        Ok(StatusMessage::CacheRefreshed)
    }

    pub async fn fetch(&self, coordinates: Coordinates) -> Result<WeatherRecord, SessionError> {
        Ok(self.source.fetch(coordinates).await?)
    }

    pub async fn publish_weather(&self, record: &WeatherRecord) -> Result<StatusMessage, SessionError> {
        self.transport.publish_json(WEATHER_DATA_TOPIC, record).await?;
        info!("Weather data published for {}", record.location);
        Ok(StatusMessage::WeatherPublished)
    }

    pub async fn send_alert(&self, message: &str, level: AlertLevel) -> Result<StatusMessage, SessionError> {
        let alert = AlertMessage::new(message, level);
        self.transport.publish_json(ALERT_TOPIC, &alert).await?;
        info!("Alert sent ({}): {}", alert.level, alert.message);
        Ok(StatusMessage::AlertSent)
    }

    async fn answer_data_request(&self, request: DataRequest) {
        let Some(record) = self.cache.get() else {
            warn!("Device requested weather data but the cache is empty");
            return;
        };
        match self.transport.publish_json(WEATHER_DATA_TOPIC, &record).await {
            Ok(()) => info!("Answered device data request from {}", request.received_at),
            Err(e) => warn!("Could not answer device data request: {}", e),
        }
    }

    async fn shutdown(&self) {
        if self.scheduler.is_running() {
            self.scheduler.stop().await;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect during shutdown failed: {}", e);
        }
    }
}

pub(super) fn spawn_worker(
    core: Arc<SessionCore>,
    mut commands: Receiver<SessionCommand>,
    mut data_requests: Receiver<DataRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Session worker started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { response_tx }) => {
                        core.shutdown().await;
                        let _ = response_tx.send(());
                        break;
                    }
                    Some(command) => dispatch(&core, command).await,
                    None => {
                        debug!("All session handles dropped");
                        core.shutdown().await;
                        break;
                    }
                },
                Some(request) = data_requests.recv() => core.answer_data_request(request).await,
            }
        }
        info!("Session worker stopped");
    })
}

async fn dispatch(core: &SessionCore, command: SessionCommand) {
    match command {
        SessionCommand::Connect {
            host,
            port,
            response_tx,
        } => {
            handle_action!(core.connect(host, port), response_tx);
        }
        SessionCommand::Disconnect { response_tx } => {
            handle_action!(core.disconnect(), response_tx);
        }
        SessionCommand::StartScheduler {
            coordinates,
            response_tx,
        } => {
            handle_action!(core.start_scheduler(coordinates), response_tx);
        }
        SessionCommand::StopScheduler { response_tx } => {
            handle_action!(core.stop_scheduler(), response_tx);
        }
        SessionCommand::FetchCached {
            coordinates,
            response_tx,
        } => {
            handle_action!(core.fetch_cached(coordinates), response_tx);
        }
        SessionCommand::ForceRefresh {
            coordinates,
            response_tx,
        } => {
            handle_action!(core.force_refresh(coordinates), response_tx);
        }
        SessionCommand::Shutdown { response_tx } => {
            // handled by the worker loop before dispatch
            let _ = response_tx.send(());
        }
    }
}
