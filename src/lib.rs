//! # Icarus GCS Library
//!
//! Ground control station core for the Icarus balloon telemetry tracker.
//!
//! This library receives live telemetry from a tracked payload over a serial
//! radio link or an MQTT broker, keeps the latest known state of every device,
//! and reports connectivity for a presentation layer to render.

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod serial;
pub mod supervisor;
pub mod telemetry;
