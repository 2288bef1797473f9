//! Protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur anywhere in the transport stack
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The physical connection failed or could not be opened
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No response within the response timeout
    #[error("Response timeout")]
    Timeout,

    /// The layer is not open
    #[error("Adapter is not open")]
    NotOpen,

    /// The layer is already open
    #[error("Already open")]
    AlreadyOpen,

    /// Rejected argument or configuration value
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// The peer never completed the SYNC/CONFIG handshake
    #[error("Link establishment failed after {attempts} attempts")]
    LinkEstablishmentFailed {
        /// Attempts made in the failing handshake step
        attempts: u32,
    },

    /// A frame was never acknowledged
    #[error("No acknowledgment after {retries} retransmissions")]
    RetransmissionsExhausted {
        /// Retransmissions made before giving up
        retries: u32,
    },

    /// The link resynchronized while the payload was outstanding
    #[error("Link was reset by the peer")]
    LinkReset,

    /// The outbound queue has no room left
    #[error("Outbound queue is full ({0} frames waiting)")]
    QueueFull(usize),

    /// Header byte 3 does not match bytes 0 to 2
    #[error("Header checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    HeaderChecksumMismatch {
        /// Checksum computed from the header
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },

    /// Frame CRC does not match header and payload
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC computed from the frame
        expected: u16,
        /// CRC carried by the frame
        actual: u16,
    },

    /// Malformed SLIP or packet structure
    #[error("Framing error: {0}")]
    Framing(String),

    /// Payload larger than a frame can carry
    #[error("Buffer overflow: payload of {0} bytes is too large")]
    BufferOverflow(usize),

    /// File or stream I/O
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Map the error onto the small status code set reported to callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProtocolError::Timeout => StatusCode::Timeout,
            ProtocolError::NotOpen => StatusCode::NotOpen,
            ProtocolError::AlreadyOpen => StatusCode::AlreadyOpen,
            ProtocolError::InvalidParam(_)
            | ProtocolError::BufferOverflow(_)
            | ProtocolError::QueueFull(_) => StatusCode::InvalidParam,
            ProtocolError::SerialError(_)
            | ProtocolError::LinkEstablishmentFailed { .. }
            | ProtocolError::RetransmissionsExhausted { .. }
            | ProtocolError::LinkReset
            | ProtocolError::HeaderChecksumMismatch { .. }
            | ProtocolError::CrcMismatch { .. }
            | ProtocolError::Framing(_)
            | ProtocolError::IoError(_) => StatusCode::IoError,
        }
    }

    /// Frame-level errors are absorbed by the data link and never surfaced
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::HeaderChecksumMismatch { .. }
                | ProtocolError::CrcMismatch { .. }
                | ProtocolError::Framing(_)
        )
    }
}

/// Status code returned by lifecycle and control calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The call succeeded
    Success,
    /// A parameter was rejected before anything happened
    InvalidParam,
    /// Physical or link failure
    IoError,
    /// No response in time
    Timeout,
    /// The adapter is not open
    NotOpen,
    /// The adapter is already open
    AlreadyOpen,
}

impl StatusCode {
    /// Collapse an operation result into a status code
    pub fn from_result<T>(result: &Result<T, ProtocolError>) -> Self {
        match result {
            Ok(_) => StatusCode::Success,
            Err(e) => e.status_code(),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Success => "success",
            StatusCode::InvalidParam => "invalid parameter",
            StatusCode::IoError => "I/O error",
            StatusCode::Timeout => "timeout",
            StatusCode::NotOpen => "not open",
            StatusCode::AlreadyOpen => "already open",
        };
        f.write_str(name)
    }
}
