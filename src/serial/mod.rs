//! # Serial Communication Module
//!
//! Handles the serial radio link to the tracker's ground receiver.
//!
//! This module handles:
//! - Enumerating serial devices for the operator to pick from
//! - Opening and closing the selected port at the requested baud rate
//! - Forwarding inbound bytes to the supervisor from a reader task
//! - Writing outbound bytes
//!
//! Failures are reported, never retried: a dropped link stays `Failed` until
//! the operator connects again.

pub mod port_trait;

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, SessionEvent, TransportKind};
use crate::error::{IcarusError, Result};
use port_trait::{SerialLink, SerialOpener, SerialPortIO, SerialReader};

/// Default baud rate offered to the operator
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Size of each read from the port
const READ_BUFFER_SIZE: usize = 1024;

/// A serial device as offered to the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub description: String,
    pub device_path: String,
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.device_path)
    }
}

/// List serial devices present on the system
///
/// # Errors
///
/// Returns `Serial` if the OS enumeration fails
pub fn list_ports() -> Result<Vec<PortDescriptor>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| IcarusError::Serial(format!("Failed to enumerate serial ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| PortDescriptor {
            description: describe_port(&port.port_type),
            device_path: port.port_name,
        })
        .collect())
}

fn describe_port(port_type: &tokio_serial::SerialPortType) -> String {
    match port_type {
        tokio_serial::SerialPortType::UsbPort(info) => info
            .product
            .clone()
            .or_else(|| info.manufacturer.clone())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", info.vid, info.pid)),
        tokio_serial::SerialPortType::PciPort => "PCI".to_string(),
        tokio_serial::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        tokio_serial::SerialPortType::Unknown => "n/a".to_string(),
    }
}

/// Something that happened on the serial link
#[derive(Debug)]
pub enum SerialEvent {
    /// Result of a blocking open started by [`SerialConnection::begin_connect`]
    Opened(io::Result<SerialLink>),
    /// Bytes read from the port
    Data(Bytes),
    /// Reader hit EOF (`None`) or an I/O error
    Closed(Option<String>),
}

pub type SerialEventSender = mpsc::UnboundedSender<SessionEvent<SerialEvent>>;

/// Serial link state machine
///
/// Connect is split in two so the blocking open can run off the event loop:
/// [`begin_connect`](Self::begin_connect) moves to `Connecting` and hands out a
/// session number, [`complete_connect`](Self::complete_connect) takes the open
/// result for that session.
pub struct SerialConnection {
    state: ConnectionState,
    device: Option<String>,
    baud_rate: Option<u32>,
    session: u64,
    writer: Option<Box<dyn SerialPortIO>>,
    reader_task: Option<JoinHandle<()>>,
    events: SerialEventSender,
    last_error: Option<String>,
}

impl fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnection")
            .field("state", &self.state)
            .field("device", &self.device)
            .field("baud_rate", &self.baud_rate)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SerialConnection {
    pub fn new(events: SerialEventSender) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            baud_rate: None,
            session: 0,
            writer: None,
            reader_task: None,
            events,
            last_error: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Device path of the current or last attempted connection
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Start a connect attempt
    ///
    /// # Returns
    ///
    /// * `Result<u64>` - Session number to pass to `complete_connect`
    ///
    /// # Errors
    ///
    /// - `AlreadyConnecting`: an attempt or a close is in flight
    /// - `AlreadyConnected`: the port is open
    /// - `InvalidBaudRate`: baud rate is zero
    /// - `PortOpen`: no device path given
    pub fn begin_connect(&mut self, path: &str, baud_rate: u32) -> Result<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(IcarusError::AlreadyConnecting(TransportKind::Serial));
            }
            ConnectionState::Connected => {
                return Err(IcarusError::AlreadyConnected(TransportKind::Serial));
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
        }

        if baud_rate == 0 {
            return Err(IcarusError::InvalidBaudRate(baud_rate));
        }
        if path.is_empty() {
            return Err(IcarusError::PortOpen {
                path: String::new(),
                reason: "no device selected".to_string(),
            });
        }

        self.session += 1;
        self.state = ConnectionState::Connecting;
        self.device = Some(path.to_string());
        self.baud_rate = Some(baud_rate);
        self.last_error = None;

        debug!("Opening serial port {} at {} baud", path, baud_rate);
        Ok(self.session)
    }

    /// Finish a connect attempt with the result of the open
    ///
    /// Results for a superseded session are dropped, releasing the handle. If
    /// the attempt was cancelled while in flight the handle is released and
    /// the link settles in `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns `PortOpen` if the open failed; the link moves to `Failed`.
    pub fn complete_connect(&mut self, session: u64, result: io::Result<SerialLink>) -> Result<()> {
        if session != self.session {
            debug!("Discarding serial open result for superseded session {}", session);
            return Ok(());
        }

        let path = self.device.clone().unwrap_or_default();

        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Disconnecting => {
                drop(result);
                info!("Serial connect to {} cancelled", path);
                self.reset();
                return Ok(());
            }
            _ => {
                debug!("Ignoring serial open result in state {}", self.state);
                return Ok(());
            }
        }

        match result {
            Ok(SerialLink { reader, writer }) => {
                let events = self.events.clone();
                self.reader_task = Some(tokio::spawn(read_loop(reader, session, events)));
                self.writer = Some(writer);
                self.state = ConnectionState::Connected;
                info!(
                    "Connected to serial port {} at {} baud",
                    path,
                    self.baud_rate.unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to connect to serial port {}: {}", path, reason);
                self.fail(reason.clone());
                Err(IcarusError::PortOpen { path, reason })
            }
        }
    }

    /// Open the port in one step, blocking the caller
    pub fn connect(&mut self, opener: &dyn SerialOpener, path: &str, baud_rate: u32) -> Result<()> {
        let session = self.begin_connect(path, baud_rate)?;
        let result = opener.open(path, baud_rate);
        self.complete_connect(session, result)
    }

    /// Close the port, or cancel an attempt in flight
    ///
    /// # Errors
    ///
    /// - `NotConnected`: nothing to close
    /// - `PortClose`: the port failed to close; the link moves to `Failed`
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connecting => {
                info!(
                    "Cancelling serial connect to {}",
                    self.device.as_deref().unwrap_or_default()
                );
                self.state = ConnectionState::Disconnecting;
                Ok(())
            }
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                self.stop_reader();

                let path = self.device.clone().unwrap_or_default();
                let result = match self.writer.take() {
                    Some(mut writer) => writer.shutdown().await,
                    None => Ok(()),
                };

                match result {
                    Ok(()) => {
                        info!("Disconnected from serial port {}", path);
                        self.reset();
                        Ok(())
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        warn!("Failed to disconnect from serial port {}: {}", path, reason);
                        self.fail(reason.clone());
                        Err(IcarusError::PortClose { path, reason })
                    }
                }
            }
            _ => Err(IcarusError::NotConnected(TransportKind::Serial)),
        }
    }

    /// Write bytes to the open port
    ///
    /// # Errors
    ///
    /// - `NotConnected`: the port is not open
    /// - `Serial`: the write or flush failed
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = match (&self.state, self.writer.as_mut()) {
            (ConnectionState::Connected, Some(writer)) => writer,
            _ => return Err(IcarusError::NotConnected(TransportKind::Serial)),
        };

        writer
            .write_all(data)
            .await
            .map_err(|e| IcarusError::Serial(format!("Failed to write to serial port: {}", e)))?;

        writer
            .flush()
            .await
            .map_err(|e| IcarusError::Serial(format!("Failed to flush serial port: {}", e)))?;

        debug!("Sent {} bytes to serial port", data.len());
        Ok(())
    }

    /// Apply an event from the open task or the reader task
    ///
    /// # Returns
    ///
    /// * `Result<Option<Bytes>>` - Inbound bytes, if the event carried any
    ///
    /// # Errors
    ///
    /// - `PortOpen`: a pending open failed
    /// - `Serial`: the link dropped; the state is now `Failed`
    pub fn handle_event(&mut self, event: SessionEvent<SerialEvent>) -> Result<Option<Bytes>> {
        let SessionEvent { session, event } = event;

        match event {
            SerialEvent::Opened(result) => {
                self.complete_connect(session, result)?;
                Ok(None)
            }
            _ if session != self.session || !self.state.is_connected() => {
                debug!("Ignoring stale serial event from session {}", session);
                Ok(None)
            }
            SerialEvent::Data(bytes) => Ok(Some(bytes)),
            SerialEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "device closed the connection".to_string());
                warn!(
                    "Lost serial port {}: {}",
                    self.device.as_deref().unwrap_or_default(),
                    reason
                );
                self.fail(reason.clone());
                Err(IcarusError::Serial(reason))
            }
        }
    }

    fn fail(&mut self, reason: String) {
        self.stop_reader();
        self.writer = None;
        self.last_error = Some(reason.clone());
        self.state = ConnectionState::Failed(reason);
    }

    fn reset(&mut self) {
        self.stop_reader();
        self.writer = None;
        self.device = None;
        self.baud_rate = None;
        self.state = ConnectionState::Disconnected;
    }

    fn stop_reader(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

async fn read_loop(mut reader: SerialReader, session: u64, events: SerialEventSender) {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => SerialEvent::Closed(None),
            Ok(n) => {
                debug!("Read {} bytes from serial port", n);
                SerialEvent::Data(buf.split().freeze())
            }
            Err(e) => SerialEvent::Closed(Some(e.to_string())),
        };

        let closed = matches!(event, SerialEvent::Closed(_));
        if events.send(SessionEvent::new(session, event)).is_err() || closed {
            break;
        }
        buf.reserve(READ_BUFFER_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use port_trait::mocks::MockSerialOpener;
    use port_trait::TokioSerialOpener;
    use tokio::io::AsyncWriteExt;

    fn connection() -> (SerialConnection, mpsc::UnboundedReceiver<SessionEvent<SerialEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SerialConnection::new(tx), rx)
    }

    #[tokio::test]
    async fn test_connect_disconnect_scenario() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::new();

        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();
        assert_eq!(*serial.state(), ConnectionState::Connected);
        assert_eq!(serial.device(), Some("/dev/ttyUSB0"));
        assert_eq!(serial.baud_rate(), Some(115_200));

        let err = serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap_err();
        assert!(matches!(err, IcarusError::AlreadyConnected(TransportKind::Serial)));
        assert_eq!(opener.open_count(), 1, "Port must not be opened twice");

        serial.disconnect().await.unwrap();
        assert_eq!(*serial.state(), ConnectionState::Disconnected);
        assert_eq!(serial.device(), None);
        assert_eq!(serial.baud_rate(), None);
        assert!(opener.port.is_shut_down());
    }

    #[test]
    fn test_connect_while_connecting_is_rejected() {
        let (mut serial, _rx) = connection();
        serial.begin_connect("/dev/ttyUSB0", 115_200).unwrap();

        let err = serial.begin_connect("/dev/ttyUSB1", 9600).unwrap_err();
        assert!(matches!(err, IcarusError::AlreadyConnecting(TransportKind::Serial)));
        assert_eq!(serial.device(), Some("/dev/ttyUSB0"));
        assert_eq!(*serial.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_open_failure_moves_to_failed() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::failing(io::ErrorKind::PermissionDenied);

        let err = serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap_err();
        match err {
            IcarusError::PortOpen { path, .. } => assert_eq!(path, "/dev/ttyUSB0"),
            other => panic!("Expected PortOpen, got: {:?}", other),
        }
        assert!(matches!(serial.state(), ConnectionState::Failed(_)));
        assert!(serial.last_error().is_some());
    }

    #[tokio::test]
    async fn test_can_reconnect_after_failure() {
        let (mut serial, _rx) = connection();
        let failing = MockSerialOpener::failing(io::ErrorKind::NotFound);
        assert!(serial.connect(&failing, "/dev/ttyUSB0", 115_200).is_err());

        let opener = MockSerialOpener::new();
        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();
        assert!(serial.state().is_connected());
        assert!(serial.last_error().is_none());
    }

    #[test]
    fn test_invalid_arguments() {
        let (mut serial, _rx) = connection();
        assert!(matches!(
            serial.begin_connect("/dev/ttyUSB0", 0),
            Err(IcarusError::InvalidBaudRate(0))
        ));
        assert!(matches!(
            serial.begin_connect("", 115_200),
            Err(IcarusError::PortOpen { .. })
        ));
        assert_eq!(*serial.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let (mut serial, _rx) = connection();
        let err = serial.disconnect().await.unwrap_err();
        assert!(matches!(err, IcarusError::NotConnected(TransportKind::Serial)));
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_cancels() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::new();

        let session = serial.begin_connect("/dev/ttyUSB0", 115_200).unwrap();
        serial.disconnect().await.unwrap();
        assert_eq!(*serial.state(), ConnectionState::Disconnecting);

        // Open completes after the cancel; handle is released
        let link = opener.open("/dev/ttyUSB0", 115_200);
        serial.complete_connect(session, link).unwrap();
        assert_eq!(*serial.state(), ConnectionState::Disconnected);
        assert_eq!(serial.device(), None);
    }

    #[tokio::test]
    async fn test_close_failure_is_reported() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::new();
        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();
        opener.port.set_shutdown_error(io::ErrorKind::BrokenPipe);

        let err = serial.disconnect().await.unwrap_err();
        assert!(matches!(err, IcarusError::PortClose { .. }));
        assert!(matches!(serial.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_inbound_bytes_are_forwarded() {
        let (mut serial, mut rx) = connection();
        let opener = MockSerialOpener::new();
        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();

        let mut device = opener.take_device().unwrap();
        device.write_all(b"{\"id\":\"B1\"}\n").await.unwrap();

        let event = rx.recv().await.unwrap();
        let bytes = serial.handle_event(event).unwrap();
        assert_eq!(bytes, Some(Bytes::from_static(b"{\"id\":\"B1\"}\n")));
    }

    #[tokio::test]
    async fn test_device_hangup_fails_link() {
        let (mut serial, mut rx) = connection();
        let opener = MockSerialOpener::new();
        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();

        drop(opener.take_device());

        let event = rx.recv().await.unwrap();
        let err = serial.handle_event(event).unwrap_err();
        assert!(matches!(err, IcarusError::Serial(_)));
        assert_eq!(
            *serial.state(),
            ConnectionState::Failed("device closed the connection".to_string())
        );
    }

    #[tokio::test]
    async fn test_reader_reports_read_error() {
        let (mut serial, mut rx) = connection();
        let session = serial.begin_connect("/dev/ttyUSB0", 115_200).unwrap();

        let reader = tokio_test::io::Builder::new()
            .read(b"{\"id\":\"B1\"}\n")
            .read_error(io::Error::new(io::ErrorKind::Other, "device unplugged"))
            .build();
        let link = SerialLink {
            reader: Box::new(reader),
            writer: Box::new(port_trait::mocks::MockSerialPort::new()),
        };
        serial.complete_connect(session, Ok(link)).unwrap();

        let data = serial.handle_event(rx.recv().await.unwrap()).unwrap();
        assert_eq!(data, Some(Bytes::from_static(b"{\"id\":\"B1\"}\n")));

        let err = serial.handle_event(rx.recv().await.unwrap()).unwrap_err();
        assert!(matches!(
            err,
            IcarusError::Serial(ref reason) if reason.contains("device unplugged")
        ));
        assert!(matches!(serial.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::new();
        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();

        let stale = SessionEvent::new(serial.session() - 1, SerialEvent::Closed(None));
        assert!(serial.handle_event(stale).unwrap().is_none());
        assert!(serial.state().is_connected());
    }

    #[tokio::test]
    async fn test_write() {
        let (mut serial, _rx) = connection();
        let opener = MockSerialOpener::new();

        let err = serial.write(b"ping").await.unwrap_err();
        assert!(matches!(err, IcarusError::NotConnected(TransportKind::Serial)));

        serial.connect(&opener, "/dev/ttyUSB0", 115_200).unwrap();
        serial.write(b"ping").await.unwrap();
        assert_eq!(opener.port.get_written_data(), vec![b"ping".to_vec()]);

        opener.port.set_write_error(io::ErrorKind::BrokenPipe);
        assert!(matches!(serial.write(b"ping").await, Err(IcarusError::Serial(_))));
    }

    #[tokio::test]
    async fn test_open_real_port_with_invalid_path_returns_error() {
        let result =
            TokioSerialOpener.open("/dev/nonexistent_serial_device_12345", DEFAULT_BAUD_RATE);
        assert!(result.is_err());
    }

    #[test]
    fn test_port_label() {
        let port = PortDescriptor {
            description: "CP2102 USB to UART".to_string(),
            device_path: "/dev/ttyUSB0".to_string(),
        };
        assert_eq!(port.to_string(), "CP2102 USB to UART (/dev/ttyUSB0)");
    }

    // Integration test - only meaningful with a receiver attached
    #[test]
    #[ignore] // Run with: cargo test -- --ignored
    fn test_list_ports_with_real_hardware() {
        let ports = list_ports().unwrap();
        for port in &ports {
            println!("Found serial port: {}", port);
        }
    }
}
