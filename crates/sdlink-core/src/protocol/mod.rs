//! Serial Protocol Communication
//!
//! Layered transport to the connectivity firmware:
//!
//! - [`serial`] / [`stream`]: physical byte connection
//! - [`slip`] / [`packet`]: three-wire framing, header checksum and CRC
//! - [`link`]: reliable stop-and-wait data link with handshake and retransmission
//! - [`transport`]: request/response correlation, response timeouts, events

mod error;
pub mod link;
pub mod packet;
pub mod serial;
pub mod slip;
pub mod stream;
pub mod transport;

pub use error::{ProtocolError, StatusCode};
pub use link::{DataLinkLayer, LinkConfig, LinkEvent, LinkState, LinkStats, LinkStatus, SendPolicy};
pub use packet::{LinkControl, Packet, PacketType};
pub use serial::{
    FlowControl, Parity, PhysicalEvent, PhysicalEventSender, PhysicalLayer, SerialSettings,
    UartPhysicalLayer,
};
pub use slip::SlipCodec;
pub use stream::StreamPhysicalLayer;
pub use transport::{
    Correlation, OrderedMatcher, PacketTypeMatcher, ResponseMatcher, TransportConfig,
    TransportEvent, TransportLayer,
};

/// Default baud rate of the connectivity firmware UART
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Default data link retransmission interval in milliseconds
pub const DEFAULT_RETRANSMISSION_INTERVAL_MS: u64 = 250;

/// Default number of retransmissions before the link is declared failed
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// Default number of SYNC/CONFIG attempts per handshake step
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 10;

/// Default transport response timeout in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1500;
