//! Three-wire data link layer
//!
//! Turns the physical byte stream into an in-order, at-most-once packet
//! channel with stop-and-wait retransmission (window size 1).
//!
//! All link state lives in a [`LinkEngine`] owned by a single background
//! task. The task multiplexes inbound bytes, send commands from callers, one
//! deadline timer (handshake resend or retransmission), and cancellation.
//! Callers only talk to the task through channels, so no link field is ever
//! touched from two places at once, and `close` cancels the timer simply by
//! stopping the task that owns it.
//!
//! State machine:
//!
//! ```plain
//! Uninitialized -> Initializing (SYNC, then CONFIG) -> Active
//!                        |                               |
//!                        +--> Failed <-------------------+  (attempts/retries exhausted)
//! any state -> Closed
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::packet::{
    next_seq, prev_seq, LinkControl, Packet, PacketType, LINK_CONFIG_FIELD, MAX_PAYLOAD_SIZE,
};
use super::serial::{PhysicalEvent, PhysicalLayer};
use super::slip::{encode_frame, SlipCodec};
use super::{
    ProtocolError, DEFAULT_HANDSHAKE_ATTEMPTS, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRANSMISSION_INTERVAL_MS,
};
use crate::logging::LogSeverity;

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Never opened
    Uninitialized,
    /// SYNC/CONFIG handshake in progress
    Initializing,
    /// Handshake complete, payloads flow
    Active,
    /// Handshake or retransmissions exhausted; stays here until closed
    Failed,
    /// Closed by the owner
    Closed,
}

/// What `send` does while the outbound window is occupied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SendPolicy {
    /// Wait until the peer acknowledged the frame
    #[default]
    Block,
    /// Return once the frame is queued; fail when `capacity` frames are waiting
    Queue {
        /// Frames allowed to wait behind the one in flight
        capacity: usize,
    },
}

/// Data link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Retransmission (and handshake resend) interval in milliseconds
    pub retransmission_interval_ms: u64,
    /// Retransmissions of one frame before the link fails
    pub max_retries: u32,
    /// SYNC and CONFIG attempts before link establishment fails
    pub handshake_attempts: u32,
    /// Behavior of `send` while the window is occupied
    pub send_policy: SendPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retransmission_interval_ms: DEFAULT_RETRANSMISSION_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            send_policy: SendPolicy::Block,
        }
    }
}

impl LinkConfig {
    /// Default configuration with the given retransmission interval
    pub fn with_retransmission_interval(retransmission_interval_ms: u64) -> Self {
        Self {
            retransmission_interval_ms,
            ..Self::default()
        }
    }

    /// Retransmission interval as a duration
    pub fn retransmission_interval(&self) -> Duration {
        Duration::from_millis(self.retransmission_interval_ms)
    }

    /// Reject values that would make the link unusable
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.retransmission_interval_ms == 0 {
            return Err(ProtocolError::InvalidParam(
                "retransmission interval must be greater than 0".to_string(),
            ));
        }
        if self.handshake_attempts == 0 {
            return Err(ProtocolError::InvalidParam(
                "handshake attempts must be greater than 0".to_string(),
            ));
        }
        if let SendPolicy::Queue { capacity: 0 } = self.send_policy {
            return Err(ProtocolError::InvalidParam(
                "send queue capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Asynchronous link notifications for the status path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Handshake completed
    Active,
    /// The peer never completed the handshake
    LinkEstablishmentFailed {
        /// Attempts made in the failing handshake step
        attempts: u32,
    },
    /// A frame was never acknowledged
    RetransmissionsExhausted {
        /// Retransmissions made before giving up
        retries: u32,
    },
    /// Sequence tracking was lost (peer SYNC or out-of-window frame); the
    /// handshake runs again
    Resynchronizing,
    /// The device closed the connection
    PhysicalClosed,
    /// Fatal I/O error on the physical connection
    IoError(String),
    /// The connectivity firmware accepted a reset command
    ResetPerformed,
}

/// Everything the link reports upward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A validated, in-order payload
    Packet(Vec<u8>),
    /// Status change
    Status(LinkStatus),
    /// Diagnostic message for the log callback
    Log(LogSeverity, String),
}

/// Link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Frames written, acks and link control included
    pub tx_frames: u64,
    /// Valid frames received
    pub rx_frames: u64,
    /// Reliable payloads put on the wire the first time
    pub tx_payloads: u64,
    /// Payloads delivered upward
    pub rx_payloads: u64,
    /// Repeated transmissions of an unacknowledged frame
    pub retransmissions: u64,
    /// Frames failing the header checksum or CRC
    pub crc_errors: u64,
    /// Frames failing SLIP or structure checks
    pub framing_errors: u64,
    /// Frames received again after their acknowledgment was lost
    pub duplicates: u64,
    /// Frames with an unexpected sequence number
    pub out_of_window: u64,
}

type Completion = oneshot::Sender<Result<(), ProtocolError>>;

/// How a submitted payload is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// No sequence number, no acknowledgment
    Unreliable,
    /// Reliable, completion follows the [`SendPolicy`]
    Reliable,
    /// Reliable, completion waits for the acknowledgment under every policy
    Acknowledged,
}

enum LinkCommand {
    Send {
        payload: Vec<u8>,
        delivery: Delivery,
        reply: Completion,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    Sync,
    Config,
}

struct Outbound {
    payload: Vec<u8>,
    /// Completed when the frame is acknowledged (blocking policy only)
    on_ack: Option<Completion>,
}

struct InFlight {
    seq: u8,
    payload: Vec<u8>,
    retries: u32,
    on_ack: Option<Completion>,
}

/// Single-owner link state machine
pub(crate) struct LinkEngine {
    config: LinkConfig,
    physical: Arc<dyn PhysicalLayer>,
    upward: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    state_tx: watch::Sender<LinkState>,
    stats: Arc<Mutex<LinkStats>>,
    step: HandshakeStep,
    attempts: u32,
    next_seq: u8,
    expected_seq: u8,
    in_flight: Option<InFlight>,
    queue: VecDeque<Outbound>,
    deadline: Option<Instant>,
    established: Option<Completion>,
    codec: SlipCodec,
    rx_buffer: BytesMut,
}

impl LinkEngine {
    pub(crate) fn new(
        config: LinkConfig,
        physical: Arc<dyn PhysicalLayer>,
        upward: mpsc::UnboundedSender<LinkEvent>,
        state_tx: watch::Sender<LinkState>,
        stats: Arc<Mutex<LinkStats>>,
        established: Completion,
    ) -> Self {
        Self {
            config,
            physical,
            upward,
            state: LinkState::Uninitialized,
            state_tx,
            stats,
            step: HandshakeStep::Sync,
            attempts: 0,
            next_seq: 0,
            expected_seq: 0,
            in_flight: None,
            queue: VecDeque::new(),
            deadline: None,
            established: Some(established),
            codec: SlipCodec::new(),
            rx_buffer: BytesMut::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Begin the handshake
    pub(crate) fn start(&mut self, now: Instant) {
        self.next_seq = 0;
        self.expected_seq = 0;
        self.step = HandshakeStep::Sync;
        self.attempts = 0;
        self.set_state(LinkState::Initializing);
        self.send_handshake(now);
    }

    pub(crate) fn on_physical(&mut self, event: PhysicalEvent, now: Instant) {
        match event {
            PhysicalEvent::Data(bytes) => self.on_bytes(&bytes, now),
            PhysicalEvent::Closed => {
                self.fail(LinkStatus::PhysicalClosed, || {
                    ProtocolError::SerialError("device closed the connection".to_string())
                });
            }
            PhysicalEvent::Error(message) => {
                let error = message.clone();
                self.fail(LinkStatus::IoError(message), move || {
                    ProtocolError::SerialError(error.clone())
                });
            }
        }
    }

    fn on_command(&mut self, command: LinkCommand, now: Instant) {
        match command {
            LinkCommand::Send {
                payload,
                delivery,
                reply,
            } => self.submit(payload, delivery, reply, now),
        }
    }

    /// Accept a payload from the transport layer
    pub(crate) fn submit(
        &mut self,
        payload: Vec<u8>,
        delivery: Delivery,
        reply: Completion,
        now: Instant,
    ) {
        if self.state != LinkState::Active {
            let _ = reply.send(Err(ProtocolError::NotOpen));
            return;
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            let _ = reply.send(Err(ProtocolError::BufferOverflow(payload.len())));
            return;
        }

        if delivery == Delivery::Unreliable {
            let packet = Packet::unreliable(self.expected_seq, payload);
            self.transmit(&packet);
            let _ = reply.send(Ok(()));
            return;
        }

        match (self.config.send_policy, delivery) {
            (SendPolicy::Queue { capacity }, _) if self.queue.len() >= capacity => {
                let _ = reply.send(Err(ProtocolError::QueueFull(self.queue.len())));
                return;
            }
            (SendPolicy::Queue { .. }, Delivery::Reliable) => {
                self.queue.push_back(Outbound {
                    payload,
                    on_ack: None,
                });
                let _ = reply.send(Ok(()));
            }
            _ => self.queue.push_back(Outbound {
                payload,
                on_ack: Some(reply),
            }),
        }
        self.pump(now);
    }

    pub(crate) fn on_bytes(&mut self, bytes: &[u8], now: Instant) {
        self.rx_buffer.extend_from_slice(bytes);
        loop {
            match self.codec.decode(&mut self.rx_buffer) {
                Ok(Some(frame)) => self.on_frame(&frame, now),
                Ok(None) => break,
                Err(e) => {
                    self.bump(|s| s.framing_errors += 1);
                    self.log(LogSeverity::Debug, format!("discarding frame: {}", e));
                }
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8], now: Instant) {
        if matches!(self.state, LinkState::Closed | LinkState::Failed) {
            return;
        }
        let packet = match Packet::from_bytes(frame) {
            Ok(packet) => packet,
            Err(e) => {
                match e {
                    ProtocolError::CrcMismatch { .. } | ProtocolError::HeaderChecksumMismatch { .. } => {
                        self.bump(|s| s.crc_errors += 1)
                    }
                    _ => self.bump(|s| s.framing_errors += 1),
                }
                self.log(LogSeverity::Debug, format!("discarding frame: {}", e));
                return;
            }
        };
        self.bump(|s| s.rx_frames += 1);
        trace!(
            seq = packet.seq,
            ack = packet.ack,
            reliable = packet.reliable,
            kind = ?packet.packet_type,
            len = packet.payload.len(),
            "rx frame"
        );

        match packet.packet_type {
            PacketType::LinkControl => match LinkControl::parse(&packet.payload) {
                Some(message) => self.on_link_control(message, now),
                None => self.log(
                    LogSeverity::Debug,
                    format!("ignoring unknown link control {:02x?}", packet.payload),
                ),
            },
            PacketType::Ack => self.on_ack(packet.ack, now),
            PacketType::VendorSpecific => self.on_data(packet, now),
        }
    }

    fn on_link_control(&mut self, message: LinkControl, now: Instant) {
        match message {
            LinkControl::Sync => {
                self.transmit(&Packet::link_control(LinkControl::SyncResponse));
                if self.state == LinkState::Active {
                    self.resynchronize("peer restarted its link".to_string(), now);
                }
            }
            LinkControl::Config(_) => {
                self.transmit(&Packet::link_control(LinkControl::ConfigResponse(
                    LINK_CONFIG_FIELD,
                )));
            }
            LinkControl::SyncResponse => {
                if self.state == LinkState::Initializing && self.step == HandshakeStep::Sync {
                    self.step = HandshakeStep::Config;
                    self.attempts = 0;
                    self.send_handshake(now);
                }
            }
            LinkControl::ConfigResponse(field) => {
                if self.state == LinkState::Initializing && self.step == HandshakeStep::Config {
                    if field != LINK_CONFIG_FIELD {
                        self.log(
                            LogSeverity::Warning,
                            format!("peer answered CONFIG with field {:#04x}", field),
                        );
                    }
                    self.become_active(now);
                }
            }
        }
    }

    fn on_ack(&mut self, ack: u8, now: Instant) {
        if self.state != LinkState::Active {
            return;
        }
        let Some(in_flight) = self.in_flight.as_ref() else {
            return;
        };
        if ack != next_seq(in_flight.seq) {
            trace!(ack, outstanding = in_flight.seq, "stale acknowledgment");
            return;
        }
        if let Some(done) = self.in_flight.take().and_then(|f| f.on_ack) {
            let _ = done.send(Ok(()));
        }
        self.deadline = None;
        self.pump(now);
    }

    fn on_data(&mut self, packet: Packet, now: Instant) {
        if self.state != LinkState::Active {
            return;
        }
        self.on_ack(packet.ack, now);

        if !packet.reliable {
            self.deliver(packet.payload);
            return;
        }

        if packet.seq == self.expected_seq {
            self.expected_seq = next_seq(self.expected_seq);
            self.deliver(packet.payload);
        } else if packet.seq == prev_seq(self.expected_seq) {
            self.bump(|s| s.duplicates += 1);
            self.log(
                LogSeverity::Debug,
                format!("duplicate frame seq {} acknowledged again", packet.seq),
            );
        } else {
            // sequence tracking with the peer is lost; start over
            self.bump(|s| s.out_of_window += 1);
            self.resynchronize(
                format!(
                    "out-of-window frame seq {} (expected {})",
                    packet.seq, self.expected_seq
                ),
                now,
            );
            return;
        }
        self.transmit(&Packet::ack(self.expected_seq));
    }

    /// Timer expiry: resend the handshake step or retransmit the frame in flight
    pub(crate) fn on_timer(&mut self, now: Instant) {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }
        self.deadline = None;

        match self.state {
            LinkState::Initializing => {
                if self.attempts >= self.config.handshake_attempts {
                    let attempts = self.attempts;
                    self.fail(LinkStatus::LinkEstablishmentFailed { attempts }, || {
                        ProtocolError::LinkEstablishmentFailed { attempts }
                    });
                } else {
                    self.send_handshake(now);
                }
            }
            LinkState::Active => {
                let Some(in_flight) = self.in_flight.as_mut() else {
                    return;
                };
                if in_flight.retries >= self.config.max_retries {
                    let retries = in_flight.retries;
                    self.fail(LinkStatus::RetransmissionsExhausted { retries }, || {
                        ProtocolError::RetransmissionsExhausted { retries }
                    });
                    return;
                }
                in_flight.retries += 1;
                let retries = in_flight.retries;
                let packet = Packet::data(in_flight.seq, self.expected_seq, in_flight.payload.clone());
                self.bump(|s| s.retransmissions += 1);
                self.log(
                    LogSeverity::Debug,
                    format!("retransmitting seq {} (attempt {})", packet.seq, retries),
                );
                self.transmit(&packet);
                self.deadline = Some(now + self.config.retransmission_interval());
            }
            _ => {}
        }
    }

    /// Stop everything; waiters learn that the link is gone
    pub(crate) fn close(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.deadline = None;
        self.drain_outbound(|| ProtocolError::NotOpen);
        if let Some(established) = self.established.take() {
            let _ = established.send(Err(ProtocolError::NotOpen));
        }
        self.set_state(LinkState::Closed);
    }

    fn send_handshake(&mut self, now: Instant) {
        self.attempts += 1;
        let message = match self.step {
            HandshakeStep::Sync => LinkControl::Sync,
            HandshakeStep::Config => LinkControl::Config(LINK_CONFIG_FIELD),
        };
        debug!(?message, attempt = self.attempts, "handshake");
        self.transmit(&Packet::link_control(message));
        if self.state == LinkState::Initializing {
            self.deadline = Some(now + self.config.retransmission_interval());
        }
    }

    fn become_active(&mut self, now: Instant) {
        self.deadline = None;
        self.set_state(LinkState::Active);
        info!("three-wire link active");
        if let Some(established) = self.established.take() {
            let _ = established.send(Ok(()));
        }
        let _ = self.upward.send(LinkEvent::Status(LinkStatus::Active));
        self.pump(now);
    }

    /// Fail the outbound frames and run the handshake again. Not fatal.
    fn resynchronize(&mut self, reason: String, now: Instant) {
        self.log(LogSeverity::Warning, format!("{}, resynchronizing", reason));
        self.drain_outbound(|| ProtocolError::LinkReset);
        let _ = self.upward.send(LinkEvent::Status(LinkStatus::Resynchronizing));
        self.start(now);
    }

    /// Put the next queued frame on the wire if the window is free
    fn pump(&mut self, now: Instant) {
        if self.state != LinkState::Active || self.in_flight.is_some() {
            return;
        }
        let Some(outbound) = self.queue.pop_front() else {
            return;
        };
        let seq = self.next_seq;
        self.next_seq = next_seq(seq);
        let packet = Packet::data(seq, self.expected_seq, outbound.payload);
        self.bump(|s| s.tx_payloads += 1);
        self.transmit(&packet);
        if self.state != LinkState::Active {
            // transmit failed and took the link down
            if let Some(done) = outbound.on_ack {
                let _ = done.send(Err(ProtocolError::NotOpen));
            }
            return;
        }
        self.in_flight = Some(InFlight {
            seq,
            payload: packet.payload,
            retries: 0,
            on_ack: outbound.on_ack,
        });
        self.deadline = Some(now + self.config.retransmission_interval());
    }

    fn transmit(&mut self, packet: &Packet) {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.log(LogSeverity::Error, format!("cannot encode frame: {}", e));
                return;
            }
        };
        trace!(
            seq = packet.seq,
            ack = packet.ack,
            kind = ?packet.packet_type,
            len = packet.payload.len(),
            "tx frame"
        );
        match self.physical.write(&encode_frame(&bytes)) {
            Ok(()) => self.bump(|s| s.tx_frames += 1),
            Err(e) => {
                let message = e.to_string();
                self.fail(LinkStatus::IoError(message.clone()), move || {
                    ProtocolError::SerialError(message.clone())
                });
            }
        }
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        self.bump(|s| s.rx_payloads += 1);
        let _ = self.upward.send(LinkEvent::Packet(payload));
    }

    /// Enter `Failed` and report `status` once; later failures are ignored
    fn fail<F>(&mut self, status: LinkStatus, error: F)
    where
        F: Fn() -> ProtocolError,
    {
        if matches!(self.state, LinkState::Failed | LinkState::Closed) {
            return;
        }
        self.deadline = None;
        self.log(LogSeverity::Error, format!("link failed: {}", error()));
        self.drain_outbound(&error);
        if let Some(established) = self.established.take() {
            let _ = established.send(Err(error()));
        }
        self.set_state(LinkState::Failed);
        let _ = self.upward.send(LinkEvent::Status(status));
    }

    fn drain_outbound<F>(&mut self, error: F)
    where
        F: Fn() -> ProtocolError,
    {
        if let Some(done) = self.in_flight.take().and_then(|f| f.on_ack) {
            let _ = done.send(Err(error()));
        }
        for outbound in self.queue.drain(..) {
            if let Some(done) = outbound.on_ack {
                let _ = done.send(Err(error()));
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn bump(&self, update: impl FnOnce(&mut LinkStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    fn log(&self, severity: LogSeverity, message: String) {
        severity.trace_message("link", &message);
        let _ = self.upward.send(LinkEvent::Log(severity, message));
    }
}

/// Drive an engine until cancelled
async fn run_link(
    mut engine: LinkEngine,
    mut physical_rx: mpsc::UnboundedReceiver<PhysicalEvent>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    cancel: CancellationToken,
) {
    engine.start(Instant::now());
    loop {
        let deadline = engine.deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = physical_rx.recv() => engine.on_physical(event, Instant::now()),
            Some(command) = commands.recv() => engine.on_command(command, Instant::now()),
            _ = sleep_until(deadline) => engine.on_timer(Instant::now()),
        }
    }
    engine.close();
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct LinkSession {
    commands: mpsc::UnboundedSender<LinkCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Data link layer handle
pub struct DataLinkLayer {
    physical: Arc<dyn PhysicalLayer>,
    config: LinkConfig,
    session: Mutex<Option<LinkSession>>,
    state_tx: watch::Sender<LinkState>,
    stats: Arc<Mutex<LinkStats>>,
}

impl DataLinkLayer {
    /// Create a data link over `physical`
    pub fn new(physical: Arc<dyn PhysicalLayer>, config: LinkConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(LinkState::Uninitialized);
        Ok(Self {
            physical,
            config,
            session: Mutex::new(None),
            state_tx,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        })
    }

    /// Link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch link state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Counters of the current session
    pub fn stats(&self) -> LinkStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Open the physical layer and run the handshake. Resolves once the link
    /// is active, or with the establishment error.
    pub async fn open(&self, upward: mpsc::UnboundedSender<LinkEvent>) -> Result<(), ProtocolError> {
        let established = {
            let mut session = self.lock_session()?;
            if session.is_some() {
                return Err(ProtocolError::AlreadyOpen);
            }

            let (physical_tx, physical_rx) = mpsc::unbounded_channel();
            self.physical.open(physical_tx)?;

            if let Ok(mut stats) = self.stats.lock() {
                *stats = LinkStats::default();
            }
            let (established_tx, established_rx) = oneshot::channel();
            let engine = LinkEngine::new(
                self.config.clone(),
                self.physical.clone(),
                upward,
                self.state_tx.clone(),
                self.stats.clone(),
                established_tx,
            );
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_link(engine, physical_rx, command_rx, cancel.clone()));
            *session = Some(LinkSession {
                commands: command_tx,
                cancel,
                task,
            });
            established_rx
        };

        let result = established.await.unwrap_or(Err(ProtocolError::NotOpen));
        if result.is_err() {
            let _ = self.close().await;
        }
        result
    }

    /// Send a payload. Reliable payloads follow the configured [`SendPolicy`];
    /// unreliable ones go out immediately without acknowledgment.
    pub async fn send(&self, payload: Vec<u8>, reliable: bool) -> Result<(), ProtocolError> {
        let delivery = if reliable {
            Delivery::Reliable
        } else {
            Delivery::Unreliable
        };
        self.submit(payload, delivery).await
    }

    /// Send a reliable payload and wait for the peer's acknowledgment,
    /// whatever the [`SendPolicy`]
    pub async fn send_acknowledged(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.submit(payload, Delivery::Acknowledged).await
    }

    async fn submit(&self, payload: Vec<u8>, delivery: Delivery) -> Result<(), ProtocolError> {
        let commands = self
            .lock_session()?
            .as_ref()
            .map(|s| s.commands.clone())
            .ok_or(ProtocolError::NotOpen)?;
        let (reply, done) = oneshot::channel();
        commands
            .send(LinkCommand::Send {
                payload,
                delivery,
                reply,
            })
            .map_err(|_| ProtocolError::NotOpen)?;
        done.await.unwrap_or(Err(ProtocolError::NotOpen))
    }

    /// Stop the link task (cancelling its timer) and shut the physical
    /// layer down. On return the device is released and can be reopened.
    /// Closing a closed link succeeds.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let session = self.lock_session()?.take();
        let Some(session) = session else {
            return Ok(());
        };
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            warn!("link task ended abnormally: {}", e);
        }
        self.physical.shutdown().await
    }

    /// Whether a session is running
    pub fn is_open(&self) -> bool {
        self.lock_session().map(|s| s.is_some()).unwrap_or(false)
    }

    fn lock_session(&self) -> Result<std::sync::MutexGuard<'_, Option<LinkSession>>, ProtocolError> {
        self.session
            .lock()
            .map_err(|_| ProtocolError::SerialError("link session lock poisoned".to_string()))
    }
}

impl Drop for DataLinkLayer {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(session) = session.take() {
                session.cancel.cancel();
                let _ = self.physical.close();
            }
        }
    }
}
