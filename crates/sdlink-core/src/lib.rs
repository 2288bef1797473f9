//! # sdlink Core Library
//!
//! Serial transport to a connectivity chip running SoftDevice-style
//! serialization firmware.
//!
//! This library provides:
//! - UART physical layer (and a generic async-stream physical layer)
//! - Three-wire (H5) data link with SLIP framing, CRC and retransmission
//! - Request/response transport with response timeouts and event dispatch
//! - A blocking adapter with status, event and log callbacks
//!
//! ## Example
//!
//! ```rust,ignore
//! use sdlink_core::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//! impl AdapterListener for Printer {
//!     fn on_event(&self, payload: &[u8], _: Option<&UserData>) {
//!         println!("event {:02x?}", payload);
//!     }
//! }
//!
//! let adapter = AdapterConfig::new("/dev/ttyACM0").build_adapter()?;
//! adapter.open(Arc::new(Printer), UserDataTokens::default())?;
//! let response = adapter.request(&[0x00, 0x60])?;
//! adapter.close()?;
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapter;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod rpc;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::adapter::{Adapter, AdapterListener, ResetMode, UserData, UserDataTokens};
    pub use crate::config::AdapterConfig;
    pub use crate::logging::LogSeverity;
    pub use crate::protocol::{
        DataLinkLayer, LinkConfig, LinkState, LinkStatus, PhysicalLayer, ProtocolError,
        SendPolicy, SerialSettings, StatusCode, TransportConfig, TransportLayer,
        UartPhysicalLayer,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
