use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::event_bridge::AppEvent;
use crate::mqtt::mqtt_handler::{PublishError, Publisher};
use crate::mqtt::WEATHER_DATA_TOPIC;
use crate::persistence::weather_cache::WeatherCache;
use crate::weather::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Cannot start publishing: MQTT client not connected")]
    NotConnected,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    coordinates: Coordinates,
}

/// Republishes whatever the cache holds every `period`.
///
/// At most one timer task exists at a time. The scheduler only reads the
/// cache; fetching is the session's job. Every delivered record is also
/// announced to UI subscribers as [`AppEvent::WeatherPublished`].
pub struct PublishScheduler {
    publisher: Arc<dyn Publisher>,
    cache: Arc<WeatherCache>,
    events: broadcast::Sender<AppEvent>,
    period: Duration,
    task: Mutex<Option<RunningTask>>,
    running: watch::Sender<bool>,
}

impl PublishScheduler {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        cache: Arc<WeatherCache>,
        events: broadcast::Sender<AppEvent>,
        period: Duration,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            publisher,
            cache,
            events,
            period,
            task: Mutex::new(None),
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub async fn start(&self, coordinates: Coordinates) -> Result<SchedulerStatus, SchedulerError> {
        if !self.publisher.is_connected() {
            return Err(SchedulerError::NotConnected);
        }

        let mut slot = self.task.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                debug!("Publisher already running for {}", task.coordinates);
                return Ok(SchedulerStatus::AlreadyRunning);
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticks(
            Tick {
                publisher: self.publisher.clone(),
                cache: self.cache.clone(),
                events: self.events.clone(),
            },
            self.period,
            cancel.clone(),
        ));
        *slot = Some(RunningTask {
            cancel,
            handle,
            coordinates,
        });
        self.running.send_replace(true);

        info!(
            "Automated weather publishing started for {} every {:?}",
            coordinates, self.period
        );
        Ok(SchedulerStatus::Started)
    }

    /// Returns once the timer task has finished, so nothing is published
    /// after this call completes. A publish still waiting on the broker is
    /// abandoned.
    pub async fn stop(&self) -> SchedulerStatus {
        let mut slot = self.task.lock().await;
        let Some(task) = slot.take() else {
            return SchedulerStatus::NotRunning;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!("Publish task ended abnormally: {}", e);
        }
        self.running.send_replace(false);

        info!("Automated weather publishing stopped");
        SchedulerStatus::Stopped
    }
}

struct Tick {
    publisher: Arc<dyn Publisher>,
    cache: Arc<WeatherCache>,
    events: broadcast::Sender<AppEvent>,
}

async fn run_ticks(tick: Tick, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Scheduled publish abandoned on stop");
                break;
            }
            _ = tick.publish_cached() => {}
        }
    }
    debug!("Publish task finished");
}

impl Tick {
    async fn publish_cached(&self) {
        let Some(record) = self.cache.get() else {
            debug!("No cached weather yet, skipping scheduled publish");
            return;
        };

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode cached weather: {}", e);
                return;
            }
        };

        match self.publisher.publish(WEATHER_DATA_TOPIC, payload).await {
            Ok(()) => {
                info!("Scheduled weather publish: {}°C, {}", record.current_temp, record.condition);
                // no subscribers is not an error
                let _ = self.events.send(AppEvent::WeatherPublished(record));
            }
            Err(PublishError::NotConnected) => warn!("Scheduled publish skipped: MQTT client not connected"),
            Err(e) => error!("Scheduled publish failed: {}", e),
        }
    }
}
