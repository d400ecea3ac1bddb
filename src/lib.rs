//! Clanwatch - a rate-limited Clash of Clans API client that turns polled
//! snapshots into change events.
//!
//! # Architecture
//!
//! - [`rest`] - Request pipeline: throttling, caching, key rotation and provisioning, typed endpoints
//! - [`events`] - Polling loops, snapshot diffing and the event stream
//! - [`config`] - YAML configuration with environment variable overrides
//! - [`watcher`] - Wires the configuration to the engine for the binary
//! - [`utils`] - Tag normalization

pub mod config;
pub mod events;
pub mod rest;
pub mod utils;
pub mod watcher;
