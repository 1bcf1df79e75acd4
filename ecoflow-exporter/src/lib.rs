//! EcoFlow exporter - republishes the EcoFlow developer MQTT quota stream as Prometheus metrics
//!
//! - `auth`: signed certification request, yields broker credentials
//! - `mqtt`: TLS session to the broker, pushes raw payloads onto the queue
//! - `watchdog`: replaces the session when the stream goes quiet
//! - `worker`: periodic liveness check + payload drain into `metrics`
//! - `http`: `/metrics` and health routes

pub mod auth;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod queue;
pub mod watchdog;
pub mod worker;
