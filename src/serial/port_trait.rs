//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Trait for the write side of a serial link
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Flush and close the port
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Read side of a serial link
pub type SerialReader = Box<dyn AsyncRead + Send + Unpin>;

/// An opened serial device, split into its read and write halves
pub struct SerialLink {
    pub reader: SerialReader,
    pub writer: Box<dyn SerialPortIO>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

/// Opens serial devices
///
/// Opening is a blocking call; callers on the event loop should run it on a
/// blocking thread.
pub trait SerialOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<SerialLink>;
}

/// Wrapper around the write half of a tokio_serial::SerialStream
pub struct TokioSerialPort {
    port: WriteHalf<SerialStream>,
}

impl TokioSerialPort {
    pub fn new(port: WriteHalf<SerialStream>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl SerialPortIO for TokioSerialPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.shutdown().await
    }
}

/// Opens real devices with tokio-serial (8N1, no flow control)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

impl SerialOpener for TokioSerialOpener {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<SerialLink> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        let (reader, writer) = tokio::io::split(port);
        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(TokioSerialPort::new(writer)),
        })
    }
}
