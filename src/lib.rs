//! `sensorhub-ingest`: MQTT ingestion pipeline for hub/sensor readings.
//!
//! Stages, in data-flow order:
//! - [`broker`] – MQTT session, reconnect/backoff, hands raw messages to [`queue`]
//! - [`parser`] – topic + JSON payload validation into a [`Reading`]
//! - [`identity`] – stable (hub, sensor) identities, cached over [`store`]
//! - [`scheduler`] – per-sensor sampling interval (Admit / Defer)
//! - [`store`] – idempotent, durable SQLite persistence and range queries
//!
//! [`pipeline`] wires the per-message stages into a sharded worker pool and
//! [`routes`] exposes the read-only query surface over HTTP.

pub mod broker;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use config::Config;
pub use error::{ConfigError, ConnectionError, ParseError, StorageError};
pub use models::{HubIdentity, Reading, SensorIdentity};
