//! Read-only views handed to the presentation layer

use chrono::Duration;
use std::fmt;

use crate::connection::ConnectionState;
use crate::telemetry::{MapUpdate, TelemetryRecord};

/// State of one transport as shown to the operator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportStatus {
    pub state: ConnectionState,
    /// Port or broker address of the current or last attempt
    pub target: Option<String>,
    pub last_error: Option<String>,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} ({})", self.state, target),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Aggregated connectivity
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Status {
    pub internet_reachable: bool,
    pub broker: TransportStatus,
    pub serial: TransportStatus,
    /// Topics confirmed by the broker
    pub subscriptions: Vec<String>,
    /// Age of the most recent contact from any device
    pub last_heartbeat_age: Option<Duration>,
    /// Most recent failure, for display next to the connection controls
    pub last_message: Option<String>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "internet: {}, broker: {}, serial: {}",
            if self.internet_reachable { "up" } else { "down" },
            self.broker,
            self.serial
        )?;

        if let Some(age) = self.last_heartbeat_age {
            write!(f, ", last contact {}s ago", age.num_seconds())?;
        }
        Ok(())
    }
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub status: Status,
    /// Every known device, ordered by id
    pub records: Vec<TelemetryRecord>,
}

impl Snapshot {
    /// Markers and trails for the map view
    pub fn map_update(&self) -> MapUpdate {
        MapUpdate::from_records(&self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = Status {
            internet_reachable: true,
            broker: TransportStatus {
                state: ConnectionState::Connected,
                target: Some("broker.example.com:8883".to_string()),
                last_error: None,
            },
            serial: TransportStatus::default(),
            subscriptions: vec!["icarus/#".to_string()],
            last_heartbeat_age: Some(Duration::seconds(12)),
            last_message: None,
        };

        assert_eq!(
            status.to_string(),
            "internet: up, broker: connected (broker.example.com:8883), \
             serial: disconnected, last contact 12s ago"
        );
    }

    #[test]
    fn test_default_snapshot_is_empty() {
        let snapshot = Snapshot::default();
        assert!(!snapshot.status.internet_reachable);
        assert_eq!(snapshot.status.serial.state, ConnectionState::Disconnected);
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.map_update(), MapUpdate::default());
    }
}
