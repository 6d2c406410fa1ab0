//! # Persistence Module
//!
//! Durable state of the session engine. Only the most recent weather snapshot
//! is kept across restarts; settings live in [`crate::config`].
//!
//! ## Error Handling Strategy
//! Storage problems never stop the engine. A missing or corrupt cache file
//! degrades to an empty cache, and a failed write keeps the new entry in
//! memory while the error is reported to the caller.

pub mod weather_cache;
