//! Adapter
//!
//! Owns the transport stack together with the runtime that drives it, and
//! fans link activity out to an [`AdapterListener`]. Every method is a
//! blocking call meant for application threads; listener callbacks run on
//! the adapter's I/O thread.
//!
//! ```rust,ignore
//! use sdlink_core::prelude::*;
//!
//! let adapter = AdapterConfig::new("/dev/ttyACM0").build_adapter()?;
//! adapter.open(Arc::new(MyListener), UserDataTokens::default())?;
//! adapter.conn_reset(ResetMode::SoftReset)?;
//! adapter.close()?;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::logging::{LogSeverity, SeverityFilter};
use crate::protocol::{
    LinkState, LinkStats, LinkStatus, ProtocolError, TransportEvent, TransportLayer,
};

/// Opaque token handed back to a listener callback
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Serialization packet type of a reset command
pub const RESET_COMMAND: u8 = 0x05;

/// Name of the adapter's I/O thread
pub const IO_THREAD_NAME: &str = "sdlink-io";

/// Receives link activity. Callbacks run on the adapter's I/O thread and must
/// not call back into the adapter's blocking methods.
pub trait AdapterListener: Send + Sync {
    /// Link status change
    fn on_status(&self, _status: &LinkStatus, _user_data: Option<&UserData>) {}

    /// Inbound packet, response or unsolicited event
    fn on_event(&self, _payload: &[u8], _user_data: Option<&UserData>) {}

    /// Diagnostic message that passed the severity filter
    fn on_log(&self, _severity: LogSeverity, _message: &str, _user_data: Option<&UserData>) {}
}

/// Per-callback user data
#[derive(Clone, Default)]
pub struct UserDataTokens {
    /// Passed to [`AdapterListener::on_status`]
    pub status: Option<UserData>,
    /// Passed to [`AdapterListener::on_event`]
    pub event: Option<UserData>,
    /// Passed to [`AdapterListener::on_log`]
    pub log: Option<UserData>,
}

impl fmt::Debug for UserDataTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDataTokens")
            .field("status", &self.status.is_some())
            .field("event", &self.event.is_some())
            .field("log", &self.log.is_some())
            .finish()
    }
}

/// Reset performed by the connectivity firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResetMode {
    /// Full chip reset
    SystemReset = 0,
    /// Restart of the connectivity stack only
    SoftReset = 1,
}

impl TryFrom<u32> for ResetMode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResetMode::SystemReset),
            1 => Ok(ResetMode::SoftReset),
            other => Err(ProtocolError::InvalidParam(format!(
                "unknown reset mode {}",
                other
            ))),
        }
    }
}

struct AdapterSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    dispatcher: JoinHandle<()>,
}

enum SessionState {
    Closed,
    /// Handshake running; the lock is not held while it does
    Opening,
    Open(AdapterSession),
}

/// Connection to the connectivity firmware
pub struct Adapter {
    runtime: Option<Runtime>,
    transport: TransportLayer,
    filter: Arc<SeverityFilter>,
    session: Mutex<SessionState>,
}

impl Adapter {
    /// Wrap a transport and start the I/O thread. Nothing is opened yet.
    pub fn new(transport: TransportLayer) -> Result<Self, ProtocolError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(IO_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| ProtocolError::SerialError(format!("failed to start I/O runtime: {}", e)))?;
        Ok(Self {
            runtime: Some(runtime),
            transport,
            filter: Arc::new(SeverityFilter::default()),
            session: Mutex::new(SessionState::Closed),
        })
    }

    /// Open the physical connection and run the link handshake. Returns once
    /// the link is active or establishment failed.
    pub fn open(
        &self,
        listener: Arc<dyn AdapterListener>,
        tokens: UserDataTokens,
    ) -> Result<(), ProtocolError> {
        self.ensure_blocking_allowed()?;
        let runtime = self.runtime()?;
        {
            let mut session = self.lock_session()?;
            if !matches!(*session, SessionState::Closed) {
                return Err(ProtocolError::AlreadyOpen);
            }
            *session = SessionState::Opening;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = runtime.spawn(dispatch_callbacks(
            events_rx,
            listener,
            tokens,
            self.filter.clone(),
        ));

        let result = self.block_on(self.transport.open(events_tx.clone()));
        let mut session = self.lock_session()?;
        match result {
            Ok(()) => {
                info!("adapter open");
                *session = SessionState::Open(AdapterSession {
                    events: events_tx,
                    dispatcher,
                });
                Ok(())
            }
            Err(e) => {
                *session = SessionState::Closed;
                drop(session);
                drop(events_tx);
                // deliver the failure status before returning
                self.join_dispatcher(dispatcher);
                Err(e)
            }
        }
    }

    /// Tear down data link and physical layer. Closing a closed adapter
    /// succeeds; closing while another thread is still opening it is
    /// rejected with `InvalidParam`.
    pub fn close(&self) -> Result<(), ProtocolError> {
        self.ensure_blocking_allowed()?;
        let mut session = self.lock_session()?;
        let current = match std::mem::replace(&mut *session, SessionState::Closed) {
            SessionState::Open(current) => current,
            SessionState::Closed => return Ok(()),
            SessionState::Opening => {
                *session = SessionState::Opening;
                return Err(ProtocolError::InvalidParam(
                    "adapter is still opening".to_string(),
                ));
            }
        };
        let result = self.block_on(self.transport.close());
        let AdapterSession { events, dispatcher } = current;
        drop(events);
        self.join_dispatcher(dispatcher);
        info!("adapter closed");
        result
    }

    /// Send a vendor payload and wait for its response
    pub fn request(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.block_on(self.transport.request(payload))
    }

    /// Send a vendor payload that has no response
    pub fn send(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.block_on(self.transport.send(payload))
    }

    /// Ask the connectivity firmware to reset. Succeeds once the peer
    /// acknowledged the command within the response timeout, whatever the
    /// link's send policy.
    pub fn conn_reset(&self, mode: ResetMode) -> Result<(), ProtocolError> {
        self.log(LogSeverity::Info, format!("requesting {:?}", mode));
        let result = self.block_on(self.transport.send_acknowledged(&[RESET_COMMAND, mode as u8]));
        match &result {
            Ok(()) => self.emit(TransportEvent::Status(LinkStatus::ResetPerformed)),
            Err(e) => self.log(LogSeverity::Error, format!("reset failed: {}", e)),
        }
        result
    }

    /// Lowest severity that reaches the log callback
    pub fn set_log_severity_filter(&self, severity: LogSeverity) {
        self.filter.set(severity);
    }

    /// Current log threshold
    pub fn log_severity_filter(&self) -> LogSeverity {
        self.filter.get()
    }

    /// Whether the link is up and the adapter accepts requests
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Data link state
    pub fn link_state(&self) -> LinkState {
        self.transport.link().state()
    }

    /// Data link counters of the current session
    pub fn link_stats(&self) -> LinkStats {
        self.transport.link().stats()
    }

    /// The transport the adapter drives
    pub fn transport(&self) -> &TransportLayer {
        &self.transport
    }

    fn runtime(&self) -> Result<&Runtime, ProtocolError> {
        self.runtime.as_ref().ok_or(ProtocolError::NotOpen)
    }

    /// Blocking calls from async contexts (listener callbacks included)
    /// would stall or panic the runtime
    fn ensure_blocking_allowed(&self) -> Result<(), ProtocolError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ProtocolError::InvalidParam(
                "adapter methods block and cannot be called from an async context".to_string(),
            ));
        }
        Ok(())
    }

    fn block_on<T, F>(&self, future: F) -> Result<T, ProtocolError>
    where
        F: Future<Output = Result<T, ProtocolError>>,
    {
        self.ensure_blocking_allowed()?;
        self.runtime()?.block_on(future)
    }

    fn join_dispatcher(&self, dispatcher: JoinHandle<()>) {
        let joined = self.block_on(async move {
            dispatcher
                .await
                .map_err(|e| ProtocolError::SerialError(e.to_string()))
        });
        if let Err(e) = joined {
            debug!("callback dispatcher ended abnormally: {}", e);
        }
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, SessionState>, ProtocolError> {
        self.session
            .lock()
            .map_err(|_| ProtocolError::SerialError("adapter state lock poisoned".to_string()))
    }

    fn emit(&self, event: TransportEvent) {
        if let Ok(session) = self.session.lock() {
            if let SessionState::Open(session) = &*session {
                let _ = session.events.send(event);
            }
        }
    }

    fn log(&self, severity: LogSeverity, message: String) {
        severity.trace_message("adapter", &message);
        self.emit(TransportEvent::Log(severity, message));
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                debug!("closing adapter on drop failed: {}", e);
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn dispatch_callbacks(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    listener: Arc<dyn AdapterListener>,
    tokens: UserDataTokens,
    filter: Arc<SeverityFilter>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Packet { payload, .. } => {
                listener.on_event(&payload, tokens.event.as_ref())
            }
            TransportEvent::Status(status) => listener.on_status(&status, tokens.status.as_ref()),
            TransportEvent::Log(severity, message) => {
                if filter.allows(severity) {
                    listener.on_log(severity, &message, tokens.log.as_ref());
                }
            }
        }
    }
}
