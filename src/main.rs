//! # Icarus GCS
//!
//! Ground control station for the Icarus balloon telemetry tracker.
//!
//! Usage: `icarus-gcs [config.toml]`
//!
//! Loads the configuration (default `config/icarus.toml`), lists the serial
//! ports on this machine, starts the connection supervisor and logs
//! connectivity and device positions as they change.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use icarus_gcs::broker::client::RumqttConnector;
use icarus_gcs::config::{Config, LoggingConfig};
use icarus_gcs::serial::{self, port_trait::TokioSerialOpener};
use icarus_gcs::supervisor::{Command, Snapshot, Status, Supervisor, SupervisorSettings};
use icarus_gcs::telemetry::record::Location;
use icarus_gcs::telemetry::DeviceId;

/// Configuration used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/icarus.toml";

/// Operator commands buffered ahead of the supervisor
const COMMAND_QUEUE_SIZE: usize = 32;

/// Main entry point for Icarus GCS
///
/// # Control Flow
///
/// 1. Load configuration and set up logging
/// 2. Log available serial ports and the initial map view
/// 3. Start the supervisor and issue any auto-connect commands
/// 4. Log snapshots until Ctrl+C, then shut the transports down
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let (config, using_defaults) = load_config(&config_path)?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Icarus GCS v{} starting...", env!("CARGO_PKG_VERSION"));
    if using_defaults {
        warn!("No configuration at {}, using defaults", config_path.display());
    } else {
        info!("Loaded configuration from {}", config_path.display());
    }

    info!(
        "Map center {:.4}, {:.4} at zoom {} (limits {}-{})",
        config.map.center_latitude,
        config.map.center_longitude,
        config.map.zoom,
        config.map.min_zoom,
        config.map.max_zoom
    );

    match serial::list_ports() {
        Ok(ports) if ports.is_empty() => info!("No serial ports found"),
        Ok(ports) => {
            for port in ports {
                info!("Serial port: {}", port);
            }
        }
        Err(e) => warn!("{}", e),
    }

    let settings = SupervisorSettings::from_config(&config);
    let (supervisor, queues) = Supervisor::new(
        settings,
        Arc::new(TokioSerialOpener),
        Box::new(RumqttConnector),
    );
    let snapshots = supervisor.subscribe();
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

    let supervisor_task = tokio::spawn(supervisor.run(queues, command_rx));
    let presenter_task = tokio::spawn(present(snapshots));

    for command in startup_commands(&config) {
        commands
            .send(command)
            .await
            .context("Supervisor stopped before startup finished")?;
    }

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Received Ctrl+C, shutting down...");
    if commands.send(Command::Shutdown).await.is_err() {
        warn!("Supervisor already stopped");
    }

    supervisor_task.await.context("Supervisor task failed")??;
    presenter_task.await.context("Presenter task failed")?;
    Ok(())
}

/// Load the configuration, falling back to defaults if the file is missing
///
/// # Returns
///
/// * `Result<(Config, bool)>` - Configuration, and whether defaults were used
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if !path.exists() {
        return Ok((Config::default(), true));
    }

    let config = Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Ok((config, false))
}

/// Install console logging, plus daily-rolling files if a directory is set
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// must be held for the life of the program so buffered lines are flushed.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level: {}", logging.level))?;

    if logging.directory.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&logging.directory, "icarus-gcs.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}

/// Commands issued at startup for transports marked `auto_connect`
fn startup_commands(config: &Config) -> Vec<Command> {
    let mut commands = Vec::new();

    if config.serial.auto_connect {
        commands.push(Command::ConnectSerial {
            path: config.serial.port.clone(),
            baud_rate: config.serial.baud_rate,
        });
    }
    if config.mqtt.auto_connect {
        commands.push(Command::ConnectBroker(config.mqtt.target()));
    }

    commands
}

async fn present(mut snapshots: watch::Receiver<Snapshot>) {
    let mut presenter = Presenter::default();

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        presenter.show(&snapshot);
    }
}

/// Logs connectivity changes and device movement
///
/// Whenever a device moves, the map markers and trails are logged as JSON at
/// debug level.
#[derive(Default)]
struct Presenter {
    status: Option<Status>,
    positions: HashMap<DeviceId, Location>,
}

impl Presenter {
    /// Log whatever differs from the previous snapshot
    ///
    /// # Returns
    ///
    /// * `usize` - Number of lines logged
    fn show(&mut self, snapshot: &Snapshot) -> usize {
        let mut lines = 0;
        let mut moved = false;

        // Heartbeat age changes on every snapshot
        let status = Status {
            last_heartbeat_age: None,
            ..snapshot.status.clone()
        };
        if self.status.as_ref() != Some(&status) {
            info!("Status: {}", status);
            if !status.subscriptions.is_empty() {
                info!("Subscribed: {}", status.subscriptions.join(", "));
            }
            self.status = Some(status);
            lines += 1;
        }

        for record in snapshot.records.iter().filter(|record| record.location_set()) {
            let location = record.location();
            if self.positions.get(record.id()) == Some(&location) {
                continue;
            }

            info!(
                "{} at {:.6}, {:.6}, {:.1} m",
                record.id(),
                location.latitude,
                location.longitude,
                location.altitude
            );
            self.positions.insert(record.id().clone(), location);
            moved = true;
            lines += 1;
        }

        if moved {
            match snapshot.map_update().to_json() {
                Ok(json) => debug!("Map update: {}", json),
                Err(e) => warn!("Failed to encode map update: {}", e),
            }
        }

        self.positions
            .retain(|id, _| snapshot.records.iter().any(|record| record.id() == id));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icarus_gcs::connection::ConnectionState;
    use icarus_gcs::telemetry::{TelemetryField, TelemetryRecord, TelemetryUpdate};

    #[test]
    fn test_no_startup_commands_by_default() {
        assert!(startup_commands(&Config::default()).is_empty());
    }

    #[test]
    fn test_auto_connect_commands() {
        let mut config = Config::default();
        config.serial.auto_connect = true;
        config.serial.port = "/dev/ttyUSB0".to_string();
        config.mqtt.auto_connect = true;

        let commands = startup_commands(&config);
        assert_eq!(
            commands,
            vec![
                Command::ConnectSerial {
                    path: "/dev/ttyUSB0".to_string(),
                    baud_rate: 115_200,
                },
                Command::ConnectBroker(config.mqtt.target()),
            ]
        );
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let (config, using_defaults) = load_config(Path::new("/nonexistent/icarus.toml")).unwrap();
        assert!(using_defaults);
        assert_eq!(config, Config::default());
    }

    fn located(id: &str, latitude: f64) -> TelemetryRecord {
        let mut record = TelemetryRecord::new(id);
        record.apply(&TelemetryUpdate::new().with(TelemetryField::Latitude, latitude));
        record
    }

    #[test]
    fn test_presenter_logs_only_changes() {
        let mut presenter = Presenter::default();
        let mut snapshot = Snapshot {
            records: vec![located("B1", 37.7), TelemetryRecord::new("B2")],
            ..Snapshot::default()
        };

        // Status plus the one located device
        assert_eq!(presenter.show(&snapshot), 2);
        assert_eq!(presenter.show(&snapshot), 0);

        snapshot.records[0] = located("B1", 37.8);
        assert_eq!(presenter.show(&snapshot), 1);

        snapshot.status.serial.state = ConnectionState::Connecting;
        assert_eq!(presenter.show(&snapshot), 1);
    }

    #[test]
    fn test_presenter_ignores_heartbeat_age() {
        let mut presenter = Presenter::default();
        let mut snapshot = Snapshot::default();
        presenter.show(&snapshot);

        snapshot.status.last_heartbeat_age = Some(chrono::Duration::seconds(3));
        assert_eq!(presenter.show(&snapshot), 0);
    }
}
