//! # Broker Module
//!
//! MQTT broker link.
//!
//! This module handles:
//! - Non-blocking connect with a bounded wait for CONNACK
//! - Disconnect that completes only when the client confirms it
//! - Subscribe/unsubscribe bookkeeping, correlated by packet id
//! - Handing application messages to the supervisor
//!
//! ## Request correlation
//!
//! Packet ids are assigned by the client's event loop, so a request is first
//! queued by topic, receives its id when the outgoing packet is observed, and
//! is resolved when the matching acknowledgement arrives. Requests leave in
//! issue order, which is what ties the queue to the ids.

pub mod client;
pub mod event;

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, SessionEvent, TransportKind};
use crate::error::{IcarusError, Result};
use client::{BrokerClient, BrokerConnector, BrokerEventSender, BrokerTarget};
use event::{describe_return_code, BrokerEvent};

/// Default wait for CONNACK
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Requests of one kind awaiting acknowledgement
#[derive(Debug, Default)]
struct PendingRequests {
    /// Sent to the client, packet id not yet known
    issued: VecDeque<String>,
    /// Packet id → topic
    in_flight: HashMap<u16, String>,
}

impl PendingRequests {
    fn issue(&mut self, topic: &str) {
        self.issued.push_back(topic.to_string());
    }

    fn assign(&mut self, pkid: u16) -> Option<&str> {
        let topic = self.issued.pop_front()?;
        self.in_flight.insert(pkid, topic);
        self.in_flight.get(&pkid).map(String::as_str)
    }

    fn resolve(&mut self, pkid: u16) -> Option<String> {
        self.in_flight.remove(&pkid)
    }

    fn len(&self) -> usize {
        self.issued.len() + self.in_flight.len()
    }

    fn clear(&mut self) {
        self.issued.clear();
        self.in_flight.clear();
    }
}

/// Broker link state machine
pub struct BrokerConnection {
    state: ConnectionState,
    target: Option<BrokerTarget>,
    session: u64,
    client: Option<Box<dyn BrokerClient>>,
    events: BrokerEventSender,
    connect_timeout: Duration,
    connect_deadline: Option<Instant>,
    subscriptions: BTreeSet<String>,
    subscribes: PendingRequests,
    unsubscribes: PendingRequests,
    last_error: Option<String>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("state", &self.state)
            .field("target", &self.target)
            .field("session", &self.session)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl BrokerConnection {
    pub fn new(events: BrokerEventSender, connect_timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target: None,
            session: 0,
            client: None,
            events,
            connect_timeout,
            connect_deadline: None,
            subscriptions: BTreeSet::new(),
            subscribes: PendingRequests::default(),
            unsubscribes: PendingRequests::default(),
            last_error: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Target of the current or last attempted connection
    pub fn target(&self) -> Option<&BrokerTarget> {
        self.target.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Topics the broker has confirmed
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Subscribe and unsubscribe requests not yet acknowledged
    pub fn pending_requests(&self) -> usize {
        self.subscribes.len() + self.unsubscribes.len()
    }

    /// Start connecting; the link is `Connected` only once CONNACK arrives
    ///
    /// # Errors
    ///
    /// - `AlreadyConnecting`: an attempt or a disconnect is in flight
    /// - `AlreadyConnected`: the link is up
    /// - `Broker`: no host given, a sub-second keep-alive, or the client
    ///   could not be created
    pub fn connect(
        &mut self,
        connector: &dyn BrokerConnector,
        target: BrokerTarget,
        now: Instant,
    ) -> Result<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(IcarusError::AlreadyConnecting(TransportKind::Broker));
            }
            ConnectionState::Connected => {
                return Err(IcarusError::AlreadyConnected(TransportKind::Broker));
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
        }

        if target.host.is_empty() {
            return Err(IcarusError::Broker("No broker host given".to_string()));
        }

        if !target.has_valid_keep_alive() {
            return Err(IcarusError::Broker(format!(
                "Keep-alive of {:?} is below one second",
                target.keep_alive
            )));
        }

        self.session += 1;
        self.last_error = None;

        match connector.connect(&target, self.session, self.events.clone()) {
            Ok(client) => {
                self.client = Some(client);
                self.state = ConnectionState::Connecting;
                self.connect_deadline = Some(now + self.connect_timeout);
                self.target = Some(target);
                Ok(self.session)
            }
            Err(e) => {
                warn!("Failed to connect to MQTT broker at {}: {}", target, e);
                self.target = Some(target);
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Fail a connect attempt that has outlived its timeout
    ///
    /// # Errors
    ///
    /// Returns `BrokerTimeout` when the attempt was abandoned
    pub fn check_timeout(&mut self, now: Instant) -> Result<()> {
        let expired = self.state == ConnectionState::Connecting
            && self.connect_deadline.is_some_and(|deadline| now >= deadline);
        if !expired {
            return Ok(());
        }

        warn!(
            "MQTT broker at {} did not answer within {:?}",
            self.target_label(),
            self.connect_timeout
        );
        self.fail("timeout".to_string());
        Err(IcarusError::BrokerTimeout(self.connect_timeout))
    }

    /// Request a disconnect, or cancel an attempt in flight
    ///
    /// A connected link moves to `Disconnecting` and reaches `Disconnected`
    /// when the client confirms. A pending attempt is dropped on the spot.
    ///
    /// # Errors
    ///
    /// - `NotConnected`: nothing to disconnect
    /// - `Broker`: the request could not be queued; state is unchanged
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connecting => {
                info!("Cancelling connect to MQTT broker at {}", self.target_label());
                self.teardown(ConnectionState::Disconnected);
                Ok(())
            }
            ConnectionState::Connected => {
                let client = self
                    .client
                    .as_mut()
                    .ok_or(IcarusError::NotConnected(TransportKind::Broker))?;
                client.disconnect().await?;
                self.state = ConnectionState::Disconnecting;
                debug!("Disconnect requested from MQTT broker at {}", self.target_label());
                Ok(())
            }
            _ => Err(IcarusError::NotConnected(TransportKind::Broker)),
        }
    }

    /// Request a subscription; it is active once SUBACK arrives
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let client = self.connected_client()?;
        client.subscribe(topic).await?;
        self.subscribes.issue(topic);
        debug!("Subscribe requested for {}", topic);
        Ok(())
    }

    /// Request removal of a subscription; it is dropped once UNSUBACK arrives
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let client = self.connected_client()?;
        client.unsubscribe(topic).await?;
        self.unsubscribes.issue(topic);
        debug!("Unsubscribe requested for {}", topic);
        Ok(())
    }

    pub async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let client = self.connected_client()?;
        client.publish(topic, payload).await
    }

    /// Apply an event reported by the client
    ///
    /// # Returns
    ///
    /// * `Result<Option<InboundMessage>>` - Application message, if the event carried one
    ///
    /// # Errors
    ///
    /// - `BrokerConnect`: CONNACK carried a non-zero code; the link is `Failed`
    /// - `Broker`: the link dropped or could not be established
    /// - `UnknownSubscriptionAck`: ack for a packet id with no pending request
    /// - `SubscriptionRejected`: the broker refused a subscription; the link stays up
    pub fn handle_event(
        &mut self,
        event: SessionEvent<BrokerEvent>,
    ) -> Result<Option<InboundMessage>> {
        let SessionEvent { session, event } = event;

        if session != self.session || self.client.is_none() {
            debug!("Ignoring broker event from stale session {}", session);
            return Ok(None);
        }

        match event {
            BrokerEvent::ConnAck { code } => self.on_connack(code).map(|_| None),
            BrokerEvent::SubscribeSent { pkid } => {
                match self.subscribes.assign(pkid) {
                    Some(topic) => debug!("SUBSCRIBE {} sent as packet {}", topic, pkid),
                    None => warn!("SUBSCRIBE packet {} has no matching request", pkid),
                }
                Ok(None)
            }
            BrokerEvent::SubAck { pkid, granted } => {
                let topic = self
                    .subscribes
                    .resolve(pkid)
                    .ok_or(IcarusError::UnknownSubscriptionAck { kind: "subscribe", pkid })?;

                if granted {
                    info!("Subscribed to {}", topic);
                    self.subscriptions.insert(topic);
                    Ok(None)
                } else {
                    warn!("Broker rejected subscription to {}", topic);
                    Err(IcarusError::SubscriptionRejected(topic))
                }
            }
            BrokerEvent::UnsubscribeSent { pkid } => {
                match self.unsubscribes.assign(pkid) {
                    Some(topic) => debug!("UNSUBSCRIBE {} sent as packet {}", topic, pkid),
                    None => warn!("UNSUBSCRIBE packet {} has no matching request", pkid),
                }
                Ok(None)
            }
            BrokerEvent::UnsubAck { pkid } => {
                let topic = self
                    .unsubscribes
                    .resolve(pkid)
                    .ok_or(IcarusError::UnknownSubscriptionAck { kind: "unsubscribe", pkid })?;

                info!("Unsubscribed from {}", topic);
                self.subscriptions.remove(&topic);
                Ok(None)
            }
            BrokerEvent::PublishSent { pkid } => {
                debug!("PUBLISH sent as packet {}", pkid);
                Ok(None)
            }
            BrokerEvent::PubAck { pkid } => {
                debug!("PUBLISH packet {} acknowledged", pkid);
                Ok(None)
            }
            BrokerEvent::Message { topic, payload } => {
                if !self.state.is_connected() {
                    debug!("Dropping message on {} received while {}", topic, self.state);
                    return Ok(None);
                }
                debug!("Message on {} ({} bytes)", topic, payload.len());
                Ok(Some(InboundMessage { topic, payload }))
            }
            BrokerEvent::Log { message } => {
                debug!("MQTT: {}", message);
                Ok(None)
            }
            BrokerEvent::Disconnected { reason } => self.on_disconnected(reason).map(|_| None),
        }
    }

    fn on_connack(&mut self, code: u8) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring CONNACK while {}", self.state);
            return Ok(());
        }

        if code == 0 {
            self.state = ConnectionState::Connected;
            self.connect_deadline = None;
            info!("Connected to MQTT broker at {}", self.target_label());
            return Ok(());
        }

        let reason = describe_return_code(code).to_string();
        warn!(
            "Failed to connect to MQTT broker at {}: {} (code {})",
            self.target_label(),
            reason,
            code
        );
        self.fail(format!("refused (code {}): {}", code, reason));
        Err(IcarusError::BrokerConnect { code, reason })
    }

    fn on_disconnected(&mut self, reason: Option<String>) -> Result<()> {
        match (self.state.clone(), reason) {
            (ConnectionState::Disconnecting, reason) => {
                match reason {
                    None => info!("Disconnected from MQTT broker"),
                    Some(r) => warn!("Failed to cleanly disconnect from MQTT broker: {}", r),
                }
                self.teardown(ConnectionState::Disconnected);
                Ok(())
            }
            (ConnectionState::Connecting, reason) => {
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                warn!(
                    "Failed to connect to MQTT broker at {}: {}",
                    self.target_label(),
                    reason
                );
                self.fail(reason.clone());
                Err(IcarusError::Broker(reason))
            }
            (ConnectionState::Connected, Some(reason)) => {
                warn!("Lost connection to MQTT broker: {}", reason);
                self.fail(reason.clone());
                Err(IcarusError::Broker(reason))
            }
            (ConnectionState::Connected, None) => {
                info!("Disconnected from MQTT broker");
                self.teardown(ConnectionState::Disconnected);
                Ok(())
            }
            (state, _) => {
                debug!("Ignoring disconnect while {}", state);
                Ok(())
            }
        }
    }

    fn connected_client(&mut self) -> Result<&mut Box<dyn BrokerClient>> {
        match (&self.state, self.client.as_mut()) {
            (ConnectionState::Connected, Some(client)) => Ok(client),
            _ => Err(IcarusError::NotConnected(TransportKind::Broker)),
        }
    }

    fn target_label(&self) -> String {
        self.target
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn fail(&mut self, reason: String) {
        self.last_error = Some(reason.clone());
        self.teardown(ConnectionState::Failed(reason));
    }

    /// Release the client and forget session bookkeeping
    ///
    /// The session counter moves on so anything the old worker still emits
    /// is ignored.
    fn teardown(&mut self, state: ConnectionState) {
        if let Some(mut client) = self.client.take() {
            client.abort();
        }
        self.session += 1;
        self.connect_deadline = None;
        self.subscriptions.clear();
        self.subscribes.clear();
        self.unsubscribes.clear();
        self.state = state;
    }
}
