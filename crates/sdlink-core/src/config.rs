//! Adapter configuration
//!
//! One serde document describing the whole stack, e.g.
//!
//! ```json
//! {
//!   "serial": { "port_name": "/dev/ttyACM0", "baud_rate": 1000000 },
//!   "link": { "retransmission_interval_ms": 250, "send_policy": { "mode": "block" } },
//!   "transport": { "response_timeout_ms": 1500 }
//! }
//! ```
//!
//! Omitted fields take their defaults.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapter::Adapter;
use crate::protocol::{
    DataLinkLayer, LinkConfig, PhysicalLayer, ProtocolError, SerialSettings, TransportConfig,
    TransportLayer, UartPhysicalLayer,
};

/// Configuration of every layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// UART settings
    pub serial: SerialSettings,
    /// Data link timing and send policy
    pub link: LinkConfig,
    /// Response timeout and correlation
    pub transport: TransportConfig,
}

impl AdapterConfig {
    /// Defaults for `port_name`
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings::new(port_name),
            ..Self::default()
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json)
            .map_err(|e| ProtocolError::InvalidParam(format!("invalid adapter config: {}", e)))
    }

    /// Load a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Write as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::InvalidParam(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate every layer's settings
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.serial.validate()?;
        self.link.validate()?;
        self.transport.validate()
    }

    /// Build an adapter on the configured UART
    pub fn build_adapter(&self) -> Result<Adapter, ProtocolError> {
        self.validate()?;
        let physical = UartPhysicalLayer::new(self.serial.clone())?;
        self.build_adapter_with(Arc::new(physical))
    }

    /// Build an adapter on any physical layer; the serial section is ignored
    pub fn build_adapter_with(
        &self,
        physical: Arc<dyn PhysicalLayer>,
    ) -> Result<Adapter, ProtocolError> {
        let link = DataLinkLayer::new(physical, self.link.clone())?;
        let transport = TransportLayer::new(link, self.transport.clone())?;
        Adapter::new(transport)
    }
}
