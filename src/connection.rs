//! # Connection State
//!
//! Lifecycle types shared by the serial and broker transports.

use std::fmt;

/// Which transport a state or error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Serial,
    Broker,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Broker => write!(f, "broker"),
        }
    }
}

/// Lifecycle of a single transport
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
///                      |             |
///                      +--> Failed <-+
/// ```
///
/// `Failed` behaves like `Disconnected` for the purpose of starting a new
/// attempt; it only keeps the reason around for display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl ConnectionState {
    /// True only for a confirmed connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True when a new connect attempt may start
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Event tagged with the connection attempt that produced it
///
/// Each connect attempt bumps the transport's session counter, so events from
/// a cancelled or superseded attempt can be told apart and dropped.
#[derive(Debug)]
pub struct SessionEvent<E> {
    pub session: u64,
    pub event: E,
}

impl<E> SessionEvent<E> {
    pub fn new(session: u64, event: E) -> Self {
        Self { session, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_idle_states() {
        assert!(ConnectionState::Disconnected.is_idle());
        assert!(ConnectionState::Failed("timeout".into()).is_idle());
        assert!(!ConnectionState::Connecting.is_idle());
        assert!(!ConnectionState::Connected.is_idle());
        assert!(!ConnectionState::Disconnecting.is_idle());
    }

    #[test]
    fn test_only_connected_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Failed("x".into()).is_connected());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Failed("timeout".into()).to_string(), "failed (timeout)");
        assert_eq!(TransportKind::Broker.to_string(), "broker");
    }
}
