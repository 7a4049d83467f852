//! # Broker Client
//!
//! Seam between the broker state machine and the MQTT library.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, MqttOptions, QoS, Transport};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::event::{return_code, BrokerEvent};
use crate::connection::SessionEvent;
use crate::error::{IcarusError, Result};

/// Outstanding requests buffered between client and event loop
const REQUEST_CAPACITY: usize = 10;

pub type BrokerEventSender = mpsc::UnboundedSender<SessionEvent<BrokerEvent>>;

/// Where and how to reach the broker
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub tls: bool,
}

impl BrokerTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(30),
            tls: false,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Keep-alive is whole seconds on the wire; zero turns it off
    pub fn has_valid_keep_alive(&self) -> bool {
        self.keep_alive.is_zero() || self.keep_alive >= Duration::from_secs(1)
    }
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Keep the password out of logs
impl fmt::Debug for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Requests against a broker session
///
/// Completion of each request is reported later as a [`BrokerEvent`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()>;

    /// Request a clean disconnect
    async fn disconnect(&mut self) -> Result<()>;

    /// Drop the session immediately, without telling the broker
    fn abort(&mut self);
}

/// Starts broker sessions
#[cfg_attr(test, mockall::automock)]
pub trait BrokerConnector: Send + Sync {
    /// Begin a non-blocking connect
    ///
    /// Events for the session must be sent on `events`, tagged with `session`.
    fn connect(
        &self,
        target: &BrokerTarget,
        session: u64,
        events: BrokerEventSender,
    ) -> Result<Box<dyn BrokerClient>>;
}

/// rumqttc-backed connector
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl BrokerConnector for RumqttConnector {
    fn connect(
        &self,
        target: &BrokerTarget,
        session: u64,
        events: BrokerEventSender,
    ) -> Result<Box<dyn BrokerClient>> {
        if !target.has_valid_keep_alive() {
            return Err(IcarusError::Broker(format!(
                "Keep-alive of {:?} is below one second",
                target.keep_alive
            )));
        }

        let client_id = format!("icarus-gcs-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, target.host.as_str(), target.port);
        options.set_keep_alive(target.keep_alive);

        if !target.username.is_empty() {
            options.set_credentials(target.username.as_str(), target.password.as_str());
        }
        if target.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let worker = tokio::spawn(poll_events(eventloop, session, events));

        info!("Connecting to MQTT broker at {}", target);
        Ok(Box::new(RumqttClient { client, worker }))
    }
}

/// Live rumqttc session
pub struct RumqttClient {
    client: AsyncClient,
    worker: JoinHandle<()>,
}

#[async_trait]
impl BrokerClient for RumqttClient {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| IcarusError::Broker(format!("Failed to subscribe to {}: {}", topic, e)))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| {
                IcarusError::Broker(format!("Failed to unsubscribe from {}: {}", topic, e))
            })
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| IcarusError::Broker(format!("Failed to publish to {}: {}", topic, e)))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| IcarusError::Broker(format!("Failed to disconnect: {}", e)))
    }

    fn abort(&mut self) {
        self.worker.abort();
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Drive the rumqttc event loop until the session ends
///
/// Stops after the first connection error instead of letting rumqttc
/// reconnect; reconnecting is the operator's call.
async fn poll_events(mut eventloop: EventLoop, session: u64, events: BrokerEventSender) {
    loop {
        let (event, last) = match eventloop.poll().await {
            Ok(event) => {
                let event = BrokerEvent::from_mqtt(event);
                let last = matches!(event, BrokerEvent::Disconnected { .. });
                (event, last)
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                (BrokerEvent::ConnAck { code: return_code(code) }, true)
            }
            Err(e) => (
                BrokerEvent::Disconnected {
                    reason: Some(e.to_string()),
                },
                true,
            ),
        };

        if events.send(SessionEvent::new(session, event)).is_err() {
            debug!("Broker event queue closed, stopping session {}", session);
            break;
        }
        if last {
            break;
        }
    }
}
