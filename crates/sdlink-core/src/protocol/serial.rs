//! Serial port handling
//!
//! The physical layer owns the raw byte connection to the connectivity chip.
//! It pushes inbound bytes to the data link layer through a registered
//! channel and accepts outbound bytes without blocking. Retries are not its
//! concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::stream::StreamPhysicalLayer;
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Notifications pushed by a physical layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicalEvent {
    /// Bytes arrived from the device
    Data(Vec<u8>),
    /// The device closed the connection
    Closed,
    /// Fatal I/O error; the connection is unusable
    Error(String),
}

/// Channel a physical layer reports into
pub type PhysicalEventSender = mpsc::UnboundedSender<PhysicalEvent>;

/// Raw byte connection, either closed or open
#[async_trait]
pub trait PhysicalLayer: Send + Sync {
    /// Open the connection and start pushing events into `events`.
    /// Must be called from inside a tokio runtime.
    fn open(&self, events: PhysicalEventSender) -> Result<(), ProtocolError>;

    /// Queue bytes for transmission
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Close the connection; closing a closed layer succeeds
    fn close(&self) -> Result<(), ProtocolError>;

    /// Close the connection and wait until the device handle is released,
    /// so it can be opened again right away
    async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.close()
    }

    /// Whether the connection is open
    fn is_open(&self) -> bool;
}

/// Flow control scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// RTS/CTS
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Flow control
    pub flow_control: FlowControl,
    /// Parity
    pub parity: Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            flow_control: FlowControl::None,
            parity: Parity::None,
        }
    }
}

impl SerialSettings {
    /// Settings for `port_name` with every other value at its default
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Reject settings no port could be opened with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.port_name.trim().is_empty() {
            return Err(ProtocolError::InvalidParam(
                "serial port name is empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidParam("baud rate is 0".to_string()));
        }
        Ok(())
    }
}

/// Open a serial port as an async stream (8 data bits, 1 stop bit)
pub fn open_port(settings: &SerialSettings) -> io::Result<SerialStream> {
    let stream = tokio_serial::new(settings.port_name.as_str(), settings.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(settings.parity.into())
        .flow_control(settings.flow_control.into())
        .open_native_async()?;
    Ok(stream)
}

/// UART physical layer
pub struct UartPhysicalLayer {
    settings: SerialSettings,
    inner: StreamPhysicalLayer<SerialStream>,
}

impl UartPhysicalLayer {
    /// Create a UART layer; the port itself is opened by [`PhysicalLayer::open`]
    pub fn new(settings: SerialSettings) -> Result<Self, ProtocolError> {
        settings.validate()?;
        let connect_settings = settings.clone();
        let inner = StreamPhysicalLayer::new(settings.port_name.clone(), move || {
            open_port(&connect_settings)
        });
        Ok(Self { settings, inner })
    }

    /// Configured settings
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl PhysicalLayer for UartPhysicalLayer {
    fn open(&self, events: PhysicalEventSender) -> Result<(), ProtocolError> {
        tracing::info!(
            port = %self.settings.port_name,
            baud = self.settings.baud_rate,
            flow_control = ?self.settings.flow_control,
            parity = ?self.settings.parity,
            "opening serial port"
        );
        self.inner.open(events)
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.inner.write(bytes)
    }

    fn close(&self) -> Result<(), ProtocolError> {
        self.inner.close()
    }

    async fn shutdown(&self) -> Result<(), ProtocolError> {
        // the port is opened exclusively, the tasks must drop it first
        self.inner.shutdown().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
