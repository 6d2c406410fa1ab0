//! Periodic republishing of the cached weather snapshot.
//!
//! ```text
//! scheduler/
//! └── publish_scheduler.rs  - cancellable interval task: WeatherCache → weather/data
//! ```

pub mod publish_scheduler;
