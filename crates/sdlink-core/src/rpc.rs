//! Flat construction and control API
//!
//! Mirrors the classic handle-based driver interface: constructors return
//! `None` instead of a null handle, control calls return a [`StatusCode`].
//! Rust callers that want the error details use the layer types directly.

use std::sync::Arc;

use tracing::warn;

use crate::adapter::{Adapter, AdapterListener, ResetMode, UserDataTokens};
use crate::logging::LogSeverity;
use crate::protocol::{
    DataLinkLayer, FlowControl, LinkConfig, Parity, PhysicalLayer, ProtocolError, SerialSettings,
    StatusCode, TransportConfig, TransportLayer, UartPhysicalLayer,
};

fn created<T>(what: &str, result: Result<T, ProtocolError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("cannot create {}: {}", what, e);
            None
        }
    }
}

/// UART physical layer for `port`
pub fn create_physical(
    port: &str,
    baud_rate: u32,
    flow_control: FlowControl,
    parity: Parity,
) -> Option<Arc<dyn PhysicalLayer>> {
    let settings = SerialSettings {
        port_name: port.to_string(),
        baud_rate,
        flow_control,
        parity,
    };
    created("physical layer", UartPhysicalLayer::new(settings))
        .map(|layer| Arc::new(layer) as Arc<dyn PhysicalLayer>)
}

/// Data link over `physical`
pub fn create_data_link(
    physical: Arc<dyn PhysicalLayer>,
    retransmission_interval_ms: u64,
) -> Option<DataLinkLayer> {
    created(
        "data link",
        DataLinkLayer::new(
            physical,
            LinkConfig::with_retransmission_interval(retransmission_interval_ms),
        ),
    )
}

/// Transport over `data_link`
pub fn create_transport(data_link: DataLinkLayer, response_timeout_ms: u64) -> Option<TransportLayer> {
    created(
        "transport",
        TransportLayer::new(
            data_link,
            TransportConfig::with_response_timeout(response_timeout_ms),
        ),
    )
}

/// Adapter driving `transport` on its own I/O thread
pub fn create_adapter(transport: TransportLayer) -> Option<Adapter> {
    created("adapter", Adapter::new(transport))
}

/// Dispose of an adapter, closing it first if needed
pub fn delete_adapter(adapter: Adapter) {
    drop(adapter);
}

/// Open the adapter and wait for the link to become active
pub fn open(
    adapter: &Adapter,
    listener: Arc<dyn AdapterListener>,
    tokens: UserDataTokens,
) -> StatusCode {
    StatusCode::from_result(&adapter.open(listener, tokens))
}

/// Close the adapter; closing a closed adapter succeeds
pub fn close(adapter: &Adapter) -> StatusCode {
    StatusCode::from_result(&adapter.close())
}

/// `severity` is the numeric level, 0 (trace) to 5 (fatal)
pub fn set_log_severity_filter(adapter: &Adapter, severity: u32) -> StatusCode {
    let result = LogSeverity::try_from(severity).map(|s| adapter.set_log_severity_filter(s));
    StatusCode::from_result(&result)
}

/// `reset_mode` is 0 for a system reset, 1 for a soft reset
pub fn conn_reset(adapter: &Adapter, reset_mode: u32) -> StatusCode {
    let result = ResetMode::try_from(reset_mode).and_then(|mode| adapter.conn_reset(mode));
    StatusCode::from_result(&result)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;
    impl AdapterListener for Quiet {}

    #[test]
    fn test_constructors_reject_bad_parameters() {
        assert!(create_physical("", 115_200, FlowControl::None, Parity::None).is_none());
        assert!(create_physical("/dev/ttyACM0", 0, FlowControl::None, Parity::None).is_none());

        let physical =
            create_physical("/dev/ttyACM0", 1_000_000, FlowControl::Hardware, Parity::Even)
                .unwrap();
        assert!(create_data_link(physical.clone(), 0).is_none());
        let link = create_data_link(physical, 250).unwrap();
        assert!(create_transport(link, 0).is_none());
    }

    #[test]
    fn test_control_calls_on_closed_adapter() {
        let physical =
            create_physical("/dev/sdlink-missing", 1_000_000, FlowControl::None, Parity::None)
                .unwrap();
        let link = create_data_link(physical, 250).unwrap();
        let transport = create_transport(link, 1500).unwrap();
        let adapter = create_adapter(transport).unwrap();

        assert_eq!(set_log_severity_filter(&adapter, 9), StatusCode::InvalidParam);
        assert_eq!(adapter.log_severity_filter(), LogSeverity::Info);
        assert_eq!(set_log_severity_filter(&adapter, 4), StatusCode::Success);
        assert_eq!(adapter.log_severity_filter(), LogSeverity::Error);

        assert_eq!(conn_reset(&adapter, 7), StatusCode::InvalidParam);
        assert_eq!(conn_reset(&adapter, 1), StatusCode::NotOpen);
        assert_eq!(close(&adapter), StatusCode::Success);
        assert_eq!(
            open(&adapter, Arc::new(Quiet), UserDataTokens::default()),
            StatusCode::IoError
        );
        delete_adapter(adapter);
    }
}
