//! Transport layer
//!
//! Request/response on top of the reliable packet stream. A request installs
//! a pending slot before its payload reaches the link, so a response that is
//! piggy-backed on the acknowledgment can never be missed. Everything the
//! link delivers is forwarded upward, flagged when it completed a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::link::{DataLinkLayer, LinkEvent, LinkStatus};
use super::{ProtocolError, DEFAULT_RESPONSE_TIMEOUT_MS};
use crate::logging::LogSeverity;

/// Leading byte of a serialized response packet
pub const SERIALIZATION_RESPONSE: u8 = 0x01;

/// How inbound packets are matched to the pending request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// First packet while a request is pending is its response
    #[default]
    Ordered,
    /// Only packets whose leading byte marks a response complete a request
    PacketType,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Time a request may take from submission to response, in milliseconds
    pub response_timeout_ms: u64,
    /// Correlation strategy
    pub correlation: Correlation,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            correlation: Correlation::Ordered,
        }
    }
}

impl TransportConfig {
    /// Default configuration with the given response timeout
    pub fn with_response_timeout(response_timeout_ms: u64) -> Self {
        Self {
            response_timeout_ms,
            ..Self::default()
        }
    }

    /// Response timeout as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Reject a zero timeout
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.response_timeout_ms == 0 {
            return Err(ProtocolError::InvalidParam(
                "response timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decides whether an inbound packet answers the pending request
pub trait ResponseMatcher: Send + Sync {
    /// Whether `payload` completes the pending request
    fn is_response(&self, payload: &[u8]) -> bool;
}

/// The link carries one request at a time, so arrival order is enough
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedMatcher;

impl ResponseMatcher for OrderedMatcher {
    fn is_response(&self, _payload: &[u8]) -> bool {
        true
    }
}

/// Looks at the serialization packet type in the first payload byte
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketTypeMatcher;

impl ResponseMatcher for PacketTypeMatcher {
    fn is_response(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&SERIALIZATION_RESPONSE)
    }
}

/// Everything the transport reports upward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound packet
    Packet {
        /// Payload as delivered by the link
        payload: Vec<u8>,
        /// Set when the packet completed a request
        response: bool,
    },
    /// Link status change
    Status(LinkStatus),
    /// Diagnostic message
    Log(LogSeverity, String),
}

type Reply = oneshot::Sender<Result<Vec<u8>, ProtocolError>>;

struct PendingRequest {
    session: u64,
    reply: Reply,
}

type PendingSlot = Arc<Mutex<Option<PendingRequest>>>;

/// Request/response transport over a data link
pub struct TransportLayer {
    link: DataLinkLayer,
    config: TransportConfig,
    matcher: Arc<dyn ResponseMatcher>,
    pending: PendingSlot,
    request_lock: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
    /// Id of the open session, 0 while closed
    active_session: AtomicU64,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransportLayer {
    /// Create a transport with the matcher selected by `config.correlation`
    pub fn new(link: DataLinkLayer, config: TransportConfig) -> Result<Self, ProtocolError> {
        let matcher: Arc<dyn ResponseMatcher> = match config.correlation {
            Correlation::Ordered => Arc::new(OrderedMatcher),
            Correlation::PacketType => Arc::new(PacketTypeMatcher),
        };
        Self::with_matcher(link, config, matcher)
    }

    /// Create a transport with a custom matcher
    pub fn with_matcher(
        link: DataLinkLayer,
        config: TransportConfig,
        matcher: Arc<dyn ResponseMatcher>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            link,
            config,
            matcher,
            pending: Arc::new(Mutex::new(None)),
            request_lock: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(0),
            active_session: AtomicU64::new(0),
            dispatcher: tokio::sync::Mutex::new(None),
        })
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The underlying data link
    pub fn link(&self) -> &DataLinkLayer {
        &self.link
    }

    /// Whether a session is open
    pub fn is_open(&self) -> bool {
        self.active_session.load(Ordering::Acquire) != 0
    }

    /// Open the link and start forwarding events to `upward`
    pub async fn open(
        &self,
        upward: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), ProtocolError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(ProtocolError::AlreadyOpen);
        }

        let session = self.next_session.fetch_add(1, Ordering::AcqRel) + 1;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dispatch(
            session,
            link_rx,
            upward,
            self.pending.clone(),
            self.matcher.clone(),
        ));

        if let Err(e) = self.link.open(link_tx).await {
            // link sender is gone, the dispatcher drains and exits
            let _ = task.await;
            return Err(e);
        }

        self.active_session.store(session, Ordering::Release);
        *dispatcher = Some(task);
        debug!(session, "transport open");
        Ok(())
    }

    /// Send `payload` and wait for its response
    pub async fn request(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let _guard = self.request_lock.lock().await;
        let session = self.active_session.load(Ordering::Acquire);
        if session == 0 {
            return Err(ProtocolError::NotOpen);
        }

        let (reply, response) = oneshot::channel();
        self.set_pending(Some(PendingRequest { session, reply }));

        let exchange = async move {
            self.link.send(payload.to_vec(), true).await?;
            response.await.unwrap_or(Err(ProtocolError::NotOpen))
        };
        let result = match tokio::time::timeout(self.config.response_timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.response_timeout_ms,
                    "no response to request"
                );
                Err(ProtocolError::Timeout)
            }
        };
        if result.is_err() {
            self.clear_pending(session);
        }
        result
    }

    /// Send `payload` without waiting for a response. Resolves once the
    /// link accepted it (and, under the blocking policy, the peer acked it).
    pub async fn send(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_with(payload.to_vec(), false).await
    }

    /// Send `payload` and wait until the peer acknowledged it, whatever the
    /// link's send policy
    pub async fn send_acknowledged(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_with(payload.to_vec(), true).await
    }

    async fn send_with(&self, payload: Vec<u8>, acknowledged: bool) -> Result<(), ProtocolError> {
        let _guard = self.request_lock.lock().await;
        if !self.is_open() {
            return Err(ProtocolError::NotOpen);
        }
        let delivery = async move {
            if acknowledged {
                self.link.send_acknowledged(payload).await
            } else {
                self.link.send(payload, true).await
            }
        };
        tokio::time::timeout(self.config.response_timeout(), delivery)
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Close the link. A waiting request fails with `NotOpen`.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let mut dispatcher = self.dispatcher.lock().await;
        let Some(task) = dispatcher.take() else {
            return Ok(());
        };
        self.active_session.store(0, Ordering::Release);
        if let Some(pending) = self.take_pending() {
            let _ = pending.reply.send(Err(ProtocolError::NotOpen));
        }

        let result = self.link.close().await;
        if let Err(e) = task.await {
            warn!("transport dispatcher ended abnormally: {}", e);
        }
        debug!("transport closed");
        result
    }

    fn set_pending(&self, request: Option<PendingRequest>) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = request;
        }
    }

    fn take_pending(&self) -> Option<PendingRequest> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }

    fn clear_pending(&self, session: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.as_ref().map(|p| p.session) == Some(session) {
                *pending = None;
            }
        }
    }
}

/// Forward link events upward, completing the pending request on the way
async fn dispatch(
    session: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    upward: mpsc::UnboundedSender<TransportEvent>,
    pending: PendingSlot,
    matcher: Arc<dyn ResponseMatcher>,
) {
    while let Some(event) = events.recv().await {
        let forwarded = match event {
            LinkEvent::Packet(payload) => {
                let response = complete_pending(&pending, session, |request| {
                    if matcher.is_response(&payload) {
                        let _ = request.reply.send(Ok(payload.clone()));
                        None
                    } else {
                        Some(request)
                    }
                });
                TransportEvent::Packet { payload, response }
            }
            LinkEvent::Status(status) => {
                if let Some(error) = failure_for(&status) {
                    complete_pending(&pending, session, |request| {
                        let _ = request.reply.send(Err(error));
                        None
                    });
                }
                TransportEvent::Status(status)
            }
            LinkEvent::Log(severity, message) => TransportEvent::Log(severity, message),
        };
        if upward.send(forwarded).is_err() {
            debug!(session, "transport listener gone");
        }
    }
}

/// Hand the pending request of `session` to `f`; returns true when `f`
/// consumed it
fn complete_pending<F>(pending: &PendingSlot, session: u64, f: F) -> bool
where
    F: FnOnce(PendingRequest) -> Option<PendingRequest>,
{
    let Ok(mut slot) = pending.lock() else {
        return false;
    };
    match slot.take() {
        Some(request) if request.session == session => {
            *slot = f(request);
            slot.is_none()
        }
        other => {
            *slot = other;
            false
        }
    }
}

/// Link statuses that end the pending request
fn failure_for(status: &LinkStatus) -> Option<ProtocolError> {
    match status {
        LinkStatus::RetransmissionsExhausted { retries } => {
            Some(ProtocolError::RetransmissionsExhausted { retries: *retries })
        }
        LinkStatus::LinkEstablishmentFailed { attempts } => {
            Some(ProtocolError::LinkEstablishmentFailed {
                attempts: *attempts,
            })
        }
        LinkStatus::Resynchronizing => Some(ProtocolError::LinkReset),
        LinkStatus::PhysicalClosed => Some(ProtocolError::SerialError(
            "device closed the connection".to_string(),
        )),
        LinkStatus::IoError(message) => Some(ProtocolError::SerialError(message.clone())),
        LinkStatus::Active | LinkStatus::ResetPerformed => None,
    }
}
