//! # Supervisor Module
//!
//! Owns both transports and the telemetry store, and is the only place either
//! is mutated.
//!
//! This module handles:
//! - Operator commands (connect, disconnect, subscribe, publish, shutdown)
//! - Events from the serial reader and the broker worker, queued onto one loop
//! - Decoding inbound payloads into telemetry store updates
//! - Periodic internet reachability probes, connect timeouts and stale sweeps
//! - Publishing a [`Snapshot`] after every command or event
//!
//! Nothing is retried. Failures are logged and shown in the snapshot; the
//! operator decides whether to try again.

pub mod reachability;
pub mod status;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::client::{BrokerConnector, BrokerTarget};
use crate::broker::event::BrokerEvent;
use crate::broker::{BrokerConnection, DEFAULT_CONNECT_TIMEOUT};
use crate::config::Config;
use crate::connection::{ConnectionState, SessionEvent};
use crate::error::{IcarusError, Result};
use crate::serial::port_trait::SerialOpener;
use crate::serial::{SerialConnection, SerialEvent, SerialEventSender};
use crate::telemetry::decoder::{
    decode_broker_payload, decode_serial_frame, LineFramer, TelemetryMessage,
};
use crate::telemetry::record::DEFAULT_TRAIL_LENGTH;
use crate::telemetry::{DeviceId, TelemetryRecord, TelemetryStore};
use reachability::{check_internet_reachability, DEFAULT_PROBE_ADDRESS};
pub use status::{Snapshot, Status, TransportStatus};

/// How often a pending broker connect is checked against its deadline
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// How long shutdown waits for transports to confirm they are closed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Operator requests
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ConnectSerial { path: String, baud_rate: u32 },
    DisconnectSerial,
    SendSerial(Bytes),
    ConnectBroker(BrokerTarget),
    DisconnectBroker,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Bytes },
    Shutdown,
}

/// Tunables for the supervisor loop
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Subscribed automatically once the broker confirms the connection
    pub topics: Vec<String>,
    pub broker_connect_timeout: Duration,
    pub probe_address: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// `None` keeps records for the lifetime of the process
    pub stale_timeout: Option<chrono::Duration>,
    pub sweep_interval: Duration,
    /// Positions kept per device for its map trail
    pub trail_length: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            topics: vec!["icarus/#".to_string()],
            broker_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_address: DEFAULT_PROBE_ADDRESS.to_string(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            stale_timeout: None,
            sweep_interval: Duration::from_secs(60),
            trail_length: DEFAULT_TRAIL_LENGTH,
        }
    }
}

impl SupervisorSettings {
    /// Settings from a loaded configuration
    ///
    /// A stale timeout too large to represent is treated as no timeout.
    pub fn from_config(config: &Config) -> Self {
        let stale_timeout = match config.telemetry.stale_timeout_s {
            0 => None,
            secs => i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds),
        };

        Self {
            topics: config.mqtt.topics.clone(),
            broker_connect_timeout: Duration::from_millis(config.mqtt.connect_timeout_ms),
            probe_address: config.network.probe_address.clone(),
            probe_interval: Duration::from_millis(config.network.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.network.probe_timeout_ms),
            stale_timeout,
            sweep_interval: Duration::from_secs(config.telemetry.sweep_interval_s),
            trail_length: config.telemetry.trail_length,
        }
    }
}

/// Receiving ends of the queues the transports report on
///
/// Returned by [`Supervisor::new`] and handed back to [`Supervisor::run`].
pub struct EventQueues {
    pub serial: mpsc::UnboundedReceiver<SessionEvent<SerialEvent>>,
    pub broker: mpsc::UnboundedReceiver<SessionEvent<BrokerEvent>>,
    pub reachability: mpsc::UnboundedReceiver<bool>,
}

/// Connection supervisor
pub struct Supervisor {
    settings: SupervisorSettings,
    store: TelemetryStore,
    serial: SerialConnection,
    broker: BrokerConnection,
    opener: Arc<dyn SerialOpener>,
    connector: Box<dyn BrokerConnector>,
    framer: LineFramer,
    serial_events: SerialEventSender,
    reachability_results: mpsc::UnboundedSender<bool>,
    internet_reachable: bool,
    last_message: Option<String>,
    snapshots: watch::Sender<Snapshot>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        opener: Arc<dyn SerialOpener>,
        connector: Box<dyn BrokerConnector>,
    ) -> (Self, EventQueues) {
        let (serial_tx, serial_rx) = mpsc::unbounded_channel();
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let (reach_tx, reach_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(Snapshot::default());

        let supervisor = Self {
            serial: SerialConnection::new(serial_tx.clone()),
            broker: BrokerConnection::new(broker_tx, settings.broker_connect_timeout),
            store: TelemetryStore::with_trail_length(settings.trail_length),
            settings,
            opener,
            connector,
            framer: LineFramer::new(),
            serial_events: serial_tx,
            reachability_results: reach_tx,
            internet_reachable: false,
            last_message: None,
            snapshots,
        };

        let queues = EventQueues {
            serial: serial_rx,
            broker: broker_rx,
            reachability: reach_rx,
        };

        (supervisor, queues)
    }

    /// Receiver for the snapshots published by the loop
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn serial(&self) -> &SerialConnection {
        &self.serial
    }

    pub fn broker(&self) -> &BrokerConnection {
        &self.broker
    }

    pub fn internet_reachable(&self) -> bool {
        self.internet_reachable
    }

    /// Register a device before it has reported anything
    pub fn register_device(&mut self, id: DeviceId) {
        self.store.get_or_create(&id);
    }

    /// Run a single operator command
    ///
    /// A serial connect only starts here; the port is opened on a blocking
    /// thread and the result arrives as a serial event.
    pub async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::ConnectSerial { path, baud_rate } => {
                self.start_serial_connect(path, baud_rate)
            }
            Command::DisconnectSerial => self.serial.disconnect().await,
            Command::SendSerial(data) => self.serial.write(&data).await,
            Command::ConnectBroker(target) => {
                self.broker
                    .connect(self.connector.as_ref(), target, Instant::now())
                    .map(|_| ())
            }
            Command::DisconnectBroker => self.broker.disconnect().await,
            Command::Subscribe(topic) => self.broker.subscribe(&topic).await,
            Command::Unsubscribe(topic) => self.broker.unsubscribe(&topic).await,
            Command::Publish { topic, payload } => self.broker.publish(&topic, payload).await,
            Command::Shutdown => {
                self.shutdown().await;
                Ok(())
            }
        }
    }

    fn start_serial_connect(&mut self, path: String, baud_rate: u32) -> Result<()> {
        let session = self.serial.begin_connect(&path, baud_rate)?;
        self.framer.reset();

        let opener = Arc::clone(&self.opener);
        let events = self.serial_events.clone();
        tokio::task::spawn_blocking(move || {
            let result = opener.open(&path, baud_rate);
            if events.send(SessionEvent::new(session, SerialEvent::Opened(result))).is_err() {
                debug!("Supervisor gone before serial open of {} finished", path);
            }
        });

        Ok(())
    }

    /// Apply a serial event, feeding any inbound bytes through the decoder
    ///
    /// Frames that fail to decode are logged and skipped; the rest of the
    /// chunk is still applied.
    pub fn handle_serial_event(&mut self, event: SessionEvent<SerialEvent>) -> Result<()> {
        let Some(bytes) = self.serial.handle_event(event)? else {
            return Ok(());
        };

        for frame in self.framer.push(&bytes) {
            let result =
                decode_serial_frame(&frame).and_then(|message| self.apply_message(message));
            if let Err(e) = result {
                self.report(e);
            }
        }
        Ok(())
    }

    /// Apply a broker event
    ///
    /// The configured topics are subscribed as soon as the connection is
    /// confirmed. Application messages are decoded and applied to the store.
    pub async fn handle_broker_event(&mut self, event: SessionEvent<BrokerEvent>) -> Result<()> {
        let was_connected = self.broker.state().is_connected();
        let inbound = self.broker.handle_event(event)?;

        if !was_connected && self.broker.state().is_connected() {
            self.subscribe_configured_topics().await;
        }

        if let Some(message) = inbound {
            let message = decode_broker_payload(&message.topic, &message.payload)?;
            self.apply_message(message)?;
        }
        Ok(())
    }

    async fn subscribe_configured_topics(&mut self) {
        for topic in self.settings.topics.clone() {
            if let Err(e) = self.broker.subscribe(&topic).await {
                self.report(e);
            }
        }
    }

    fn apply_message(&mut self, message: TelemetryMessage) -> Result<()> {
        let TelemetryMessage { device_id, fields } = message;
        let record = self.store.update(&device_id, fields)?;

        debug!(
            "Telemetry from {} ({} devices tracked)",
            record.id(),
            self.store.len()
        );
        Ok(())
    }

    pub fn set_internet_reachable(&mut self, reachable: bool) {
        if reachable != self.internet_reachable {
            if reachable {
                info!("Internet reachable");
            } else {
                warn!("Internet unreachable");
            }
        }
        self.internet_reachable = reachable;
    }

    /// Start a reachability probe; the result arrives on the reachability queue
    fn start_probe(&self) {
        let address = self.settings.probe_address.clone();
        let limit = self.settings.probe_timeout;
        let results = self.reachability_results.clone();

        tokio::spawn(async move {
            let reachable = check_internet_reachability(&address, limit).await;
            // Receiver only goes away with the supervisor
            let _ = results.send(reachable);
        });
    }

    /// Fail a broker connect that has outlived its timeout
    pub fn check_timeouts(&mut self, now: Instant) {
        if let Err(e) = self.broker.check_timeout(now) {
            self.report(e);
        }
    }

    /// Evict devices silent for longer than the stale timeout, if one is set
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Vec<DeviceId> {
        match self.settings.stale_timeout {
            Some(max_age) => self.store.evict_stale(max_age, now),
            None => Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Status {
        Status {
            internet_reachable: self.internet_reachable,
            broker: TransportStatus {
                state: self.broker.state().clone(),
                target: self.broker.target().map(ToString::to_string),
                last_error: self.broker.last_error().map(str::to_string),
            },
            serial: TransportStatus {
                state: self.serial.state().clone(),
                target: self.serial.device().map(|device| {
                    let baud_rate = self.serial.baud_rate().unwrap_or_default();
                    format!("{} @ {}", device, baud_rate)
                }),
                last_error: self.serial.last_error().map(str::to_string),
            },
            subscriptions: self.broker.subscriptions().iter().cloned().collect(),
            last_heartbeat_age: self.store.last_contact().map(|contact| now - contact),
            last_message: self.last_message.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.status(),
            records: self.store.snapshot(),
        }
    }

    pub fn record(&self, id: &DeviceId) -> Option<&TelemetryRecord> {
        self.store.get(id)
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Close both transports; errors are logged, not returned
    pub async fn shutdown(&mut self) {
        if !self.serial.state().is_idle() {
            if let Err(e) = self.serial.disconnect().await {
                self.report(e);
            }
        }
        if !self.broker.state().is_idle() {
            if let Err(e) = self.broker.disconnect().await {
                self.report(e);
            }
        }
    }

    /// True once neither transport has a transition in flight
    fn is_settled(&self) -> bool {
        let settled = |state: &ConnectionState| {
            !matches!(state, ConnectionState::Connecting | ConnectionState::Disconnecting)
        };
        settled(self.serial.state()) && settled(self.broker.state())
    }

    fn report(&mut self, error: IcarusError) {
        warn!("{}", error);
        self.last_message = Some(error.to_string());
    }

    /// Run the event loop until `Shutdown` arrives or the command channel closes
    ///
    /// After shutdown the loop keeps draining transport events until both
    /// transports have settled, or a short grace period expires.
    pub async fn run(
        mut self,
        mut queues: EventQueues,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<()> {
        let mut probe = ticker(self.settings.probe_interval);
        let mut timeouts = ticker(TIMEOUT_CHECK_INTERVAL);
        let mut sweep = ticker(self.settings.sweep_interval);
        let mut shutdown_deadline: Option<Instant> = None;

        info!("Supervisor started");
        self.publish_snapshot();

        loop {
            tokio::select! {
                command = commands.recv(), if shutdown_deadline.is_none() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("Shutting down transports");
                        self.shutdown().await;
                        shutdown_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
                    }
                    Some(command) => {
                        debug!("Command: {:?}", command);
                        if let Err(e) = self.handle_command(command).await {
                            self.report(e);
                        }
                    }
                },

                Some(event) = queues.serial.recv() => {
                    if let Err(e) = self.handle_serial_event(event) {
                        self.report(e);
                    }
                }

                Some(event) = queues.broker.recv() => {
                    if let Err(e) = self.handle_broker_event(event).await {
                        self.report(e);
                    }
                }

                Some(reachable) = queues.reachability.recv() => {
                    self.set_internet_reachable(reachable);
                }

                _ = probe.tick(), if shutdown_deadline.is_none() => {
                    self.start_probe();
                }

                now = timeouts.tick() => {
                    self.check_timeouts(now);
                }

                _ = sweep.tick() => {
                    self.sweep_stale(Utc::now());
                }
            }

            self.publish_snapshot();

            if let Some(deadline) = shutdown_deadline {
                if self.is_settled() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Transports did not close within {:?}", SHUTDOWN_GRACE);
                    break;
                }
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
