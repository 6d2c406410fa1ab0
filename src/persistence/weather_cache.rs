//! Single-slot weather cache with durable backing file.
//!
//! Readers take cheap snapshots out of a `watch` channel and never wait on a
//! writer. Writers are serialized, persist the entry as
//! `{ "record": ..., "fetchedAt": ... }` through a temp file + rename, and
//! then publish the new snapshot. A failed write still updates memory so the
//! session keeps working without durability.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::weather::{Coordinates, WeatherRecord};

pub const CACHE_FILE_NAME: &str = "weather_cache.json";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to write weather cache {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode weather cache: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub record: WeatherRecord,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(record: WeatherRecord, fetched_at: DateTime<Utc>) -> Self {
        Self { record, fetched_at }
    }

    /// An entry exactly `validity` old is already stale.
    pub fn is_valid_at(&self, now: DateTime<Utc>, validity: Duration) -> bool {
        now.signed_duration_since(self.fetched_at) < validity
    }
}

pub struct WeatherCache {
    path: PathBuf,
    validity: Duration,
    slot: watch::Sender<Option<Arc<CacheEntry>>>,
    write_gate: Mutex<()>,
}

impl WeatherCache {
    /// Creates an empty cache backed by `<directory>/weather_cache.json`.
    ///
    /// Nothing is read until [`WeatherCache::load_or_init`] runs.
    pub fn new(directory: &Path, validity: Duration) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            path: directory.join(CACHE_FILE_NAME),
            validity,
            slot,
            write_gate: Mutex::new(()),
        }
    }

    /// Creates the cache and loads whatever is on disk.
    pub async fn open(directory: &Path, validity: Duration) -> Self {
        let cache = Self::new(directory, validity);
        cache.load_or_init().await;
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted entry. A missing or unreadable file leaves the
    /// cache empty, which makes the next cache-first lookup hit the API.
    pub async fn load_or_init(&self) {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No weather cache at {:?}, starting empty", self.path);
                self.slot.send_replace(None);
                return;
            }
            Err(e) => {
                warn!("Failed to read weather cache {:?}: {}", self.path, e);
                self.slot.send_replace(None);
                return;
            }
        };

        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => {
                info!(
                    "Loaded weather cache for {} fetched at {}",
                    entry.record.coordinates(),
                    entry.fetched_at
                );
                self.slot.send_replace(Some(Arc::new(entry)));
            }
            Err(e) => {
                warn!("Ignoring corrupt weather cache {:?}: {}", self.path, e);
                self.slot.send_replace(None);
            }
        }
    }

    /// Current record regardless of its age.
    pub fn get(&self) -> Option<WeatherRecord> {
        self.entry().map(|entry| entry.record.clone())
    }

    pub fn entry(&self) -> Option<Arc<CacheEntry>> {
        self.slot.borrow().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.entry()
            .is_some_and(|entry| entry.is_valid_at(now, self.validity))
    }

    /// Record for `coordinates` if it is still inside the validity window.
    pub fn valid_for(&self, coordinates: &Coordinates) -> Option<WeatherRecord> {
        let now = Utc::now();
        self.entry()
            .filter(|entry| entry.is_valid_at(now, self.validity))
            .filter(|entry| entry.record.coordinates().matches(coordinates))
            .map(|entry| entry.record.clone())
    }

    /// Replaces the cached record, stamped with the current time.
    pub async fn store(&self, record: WeatherRecord) -> Result<(), CacheError> {
        self.store_entry(CacheEntry::new(record, Utc::now())).await
    }

    pub async fn store_entry(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let _gate = self.write_gate.lock().await;

        let persisted = self.persist(&entry).await;
        if let Err(e) = &persisted {
            warn!("Weather cache kept in memory only: {}", e);
        }

        debug!("Weather cache replaced, fetched at {}", entry.fetched_at);
        self.slot.send_replace(Some(Arc::new(entry)));
        persisted
    }

    async fn persist(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let content = serde_json::to_string_pretty(entry)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, &content).await.map_err(io_error)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(io_error)?;

        debug!("Persisted weather cache ({} bytes)", content.len());
        Ok(())
    }
}
