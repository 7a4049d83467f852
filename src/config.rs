//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and key is optional; an empty file yields the defaults.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::broker::client::BrokerTarget;
use crate::error::{IcarusError, Result};

/// Deepest zoom level the map tiles provide
pub const MAX_MAP_ZOOM: u8 = 20;

/// Longest accepted stale timeout (one year)
pub const MAX_STALE_TIMEOUT_S: u64 = 365 * 24 * 60 * 60;

/// Most positions kept per device trail
pub const MAX_TRAIL_LENGTH: usize = 10_000;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub map: MapConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Initial map view
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MapConfig {
    #[serde(default = "default_center_latitude")]
    pub center_latitude: f64,

    #[serde(default = "default_center_longitude")]
    pub center_longitude: f64,

    #[serde(default = "default_zoom")]
    pub zoom: u8,

    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,

    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
}

/// Serial radio link
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SerialConfig {
    /// Device path; empty means the operator picks one
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default)]
    pub auto_connect: bool,
}

/// MQTT broker link
#[derive(Clone, Deserialize, PartialEq)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_tls")]
    pub tls: bool,

    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    #[serde(default)]
    pub auto_connect: bool,
}

/// Internet reachability probe
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_probe_address")]
    pub probe_address: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Telemetry store housekeeping
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Seconds of silence before a device is dropped; 0 keeps devices forever
    #[serde(default)]
    pub stale_timeout_s: u64,

    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,

    /// Positions kept per device for its map trail; 0 disables trails
    #[serde(default = "default_trail_length")]
    pub trail_length: usize,
}

/// Log output
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily-rolling log files go here when set
    #[serde(default)]
    pub directory: String,
}

// Default value functions
fn default_center_latitude() -> f64 { 37.70 }
fn default_center_longitude() -> f64 { -122.50 }
fn default_zoom() -> u8 { 12 }
fn default_min_zoom() -> u8 { 1 }
fn default_max_zoom() -> u8 { 18 }

fn default_baud_rate() -> u32 { crate::serial::DEFAULT_BAUD_RATE }

fn default_mqtt_host() -> String { "broker.outoftolerance.com".to_string() }
fn default_mqtt_port() -> u16 { 8883 }
fn default_keep_alive_s() -> u64 { 30 }
fn default_connect_timeout_ms() -> u64 { 10000 }
fn default_tls() -> bool { true }
fn default_topics() -> Vec<String> { vec!["icarus/#".to_string()] }

fn default_probe_address() -> String {
    crate::supervisor::reachability::DEFAULT_PROBE_ADDRESS.to_string()
}
fn default_probe_interval_ms() -> u64 { 5000 }
fn default_probe_timeout_ms() -> u64 { 2000 }

fn default_sweep_interval_s() -> u64 { 60 }
fn default_trail_length() -> usize { crate::telemetry::record::DEFAULT_TRAIL_LENGTH }

fn default_log_level() -> String { "info".to_string() }

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            center_latitude: default_center_latitude(),
            center_longitude: default_center_longitude(),
            zoom: default_zoom(),
            min_zoom: default_min_zoom(),
            max_zoom: default_max_zoom(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            auto_connect: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            keep_alive_s: default_keep_alive_s(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tls: default_tls(),
            topics: default_topics(),
            auto_connect: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_address: default_probe_address(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stale_timeout_s: 0,
            sweep_interval_s: default_sweep_interval_s(),
            trail_length: default_trail_length(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
        }
    }
}

// Keep the password out of logs
impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("keep_alive_s", &self.keep_alive_s)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("tls", &self.tls)
            .field("topics", &self.topics)
            .field("auto_connect", &self.auto_connect)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    /// Broker connection parameters
    pub fn target(&self) -> BrokerTarget {
        let mut target = BrokerTarget::new(self.host.as_str(), self.port)
            .with_credentials(self.username.as_str(), self.password.as_str());
        target.keep_alive = Duration::from_secs(self.keep_alive_s);
        target.tls = self.tls;
        target
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use icarus_gcs::config::Config;
    ///
    /// let config = Config::load("config/icarus.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Map view
        if !(-90.0..=90.0).contains(&self.map.center_latitude) {
            return Err(invalid("map center_latitude must be between -90 and 90"));
        }

        if !(-180.0..=180.0).contains(&self.map.center_longitude) {
            return Err(invalid("map center_longitude must be between -180 and 180"));
        }

        if self.map.max_zoom > MAX_MAP_ZOOM {
            return Err(invalid("map max_zoom must be at most 20"));
        }

        if self.map.min_zoom > self.map.max_zoom {
            return Err(invalid("map min_zoom cannot exceed max_zoom"));
        }

        if !(self.map.min_zoom..=self.map.max_zoom).contains(&self.map.zoom) {
            return Err(invalid("map zoom must be between min_zoom and max_zoom"));
        }

        // Serial link
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial baud_rate must be greater than 0"));
        }

        if self.serial.auto_connect && self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty when auto_connect is set"));
        }

        // Broker link
        if self.mqtt.host.is_empty() {
            return Err(invalid("mqtt host cannot be empty"));
        }

        if self.mqtt.port == 0 {
            return Err(invalid("mqtt port must be greater than 0"));
        }

        if self.mqtt.keep_alive_s < 5 {
            return Err(invalid("mqtt keep_alive_s must be at least 5"));
        }

        if self.mqtt.connect_timeout_ms == 0 {
            return Err(invalid("mqtt connect_timeout_ms must be greater than 0"));
        }

        if self.mqtt.topics.iter().any(String::is_empty) {
            return Err(invalid("mqtt topics cannot contain an empty topic"));
        }

        // Reachability probe
        if self.network.probe_address.is_empty() {
            return Err(invalid("network probe_address cannot be empty"));
        }

        if self.network.probe_interval_ms == 0 {
            return Err(invalid("network probe_interval_ms must be greater than 0"));
        }

        if self.network.probe_timeout_ms == 0 {
            return Err(invalid("network probe_timeout_ms must be greater than 0"));
        }

        if self.network.probe_timeout_ms >= self.network.probe_interval_ms {
            return Err(invalid(
                "network probe_timeout_ms must be less than probe_interval_ms",
            ));
        }

        // Telemetry housekeeping
        if self.telemetry.stale_timeout_s > MAX_STALE_TIMEOUT_S {
            return Err(invalid("telemetry stale_timeout_s must be at most one year"));
        }

        if self.telemetry.sweep_interval_s == 0 {
            return Err(invalid("telemetry sweep_interval_s must be greater than 0"));
        }

        if self.telemetry.trail_length > MAX_TRAIL_LENGTH {
            return Err(invalid("telemetry trail_length must be at most 10000"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> IcarusError {
    IcarusError::Config(toml::de::Error::custom(message))
}
