//! # Telemetry Module
//!
//! Device telemetry model.
//!
//! This module handles:
//! - The fixed telemetry schema and per-device records
//! - Derived views (location, orientation, movement, environment)
//! - The store of all tracked devices, with optional staleness eviction
//! - Decoding inbound serial frames and broker payloads
//! - Map markers and trails as JSON

pub mod decoder;
pub mod map;
pub mod record;
pub mod store;

pub use map::MapUpdate;
pub use record::{DeviceId, TelemetryField, TelemetryRecord, TelemetryUpdate};
pub use store::TelemetryStore;
