//! # Session Module
//!
//! The façade the UI talks to. [`session_manager::SessionManager`] wires the
//! transport, cache, scheduler and event bridge together and exposes the
//! command surface.
//!
//! ```text
//! session/
//! ├── session_manager.rs  - public handle: commands, queries, subscriptions
//! └── session_worker.rs   - single worker task executing control commands in order
//! ```
//!
//! Control commands (connect, disconnect, scheduler start/stop, cache
//! refreshes) are queued to one worker so each acts on the state left by the
//! previous one. Queries read snapshots and never wait behind the queue.

pub mod session_manager;
mod session_worker;

use crate::mqtt::mqtt_handler::{ConnectError, DisconnectError, PublishError};
use crate::persistence::weather_cache::CacheError;
use crate::scheduler::publish_scheduler::SchedulerError;
use crate::weather::api::FetchError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Disconnect(#[from] DisconnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Weather fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Session worker is not running")]
    WorkerStopped,
}
