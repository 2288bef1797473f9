//! Simulated connectivity chip for integration tests
//!
//! The peer speaks the three-wire protocol over an in-memory duplex pipe. It
//! answers the handshake, acknowledges data frames, optionally drops the
//! first transmission of every frame, optionally answers requests, and can
//! push unsolicited events. Like a tty opened exclusively, the device end of
//! the pipe can only be opened again once the previous one was dropped.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::task::{Context, Poll};

use bytes::BytesMut;
use sdlink_core::protocol::packet::{next_seq, LinkControl, Packet, PacketType, LINK_CONFIG_FIELD};
use sdlink_core::protocol::slip::{encode_frame, SlipCodec};
use sdlink_core::protocol::{
    DataLinkLayer, LinkConfig, StreamPhysicalLayer, TransportConfig, TransportLayer,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds the answer to a delivered payload, if any
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct PeerOptions {
    pub answer_handshake: bool,
    pub acknowledge_data: bool,
    pub drop_first_transmission: bool,
    pub responder: Option<Responder>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            answer_handshake: true,
            acknowledge_data: true,
            drop_first_transmission: false,
            responder: None,
        }
    }
}

impl PeerOptions {
    /// Peer that answers every payload with `0x01` followed by the payload
    pub fn echo() -> Self {
        Self {
            responder: Some(Arc::new(|payload: &[u8]| {
                let mut response = vec![0x01];
                response.extend_from_slice(payload);
                Some(response)
            })),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            answer_handshake: false,
            ..Self::default()
        }
    }

    pub fn dropping_first_transmission(mut self) -> Self {
        self.drop_first_transmission = true;
        self
    }

    pub fn never_acknowledging(mut self) -> Self {
        self.acknowledge_data = false;
        self
    }
}

/// What the peer saw during one connection
#[derive(Debug, Default, Clone)]
pub struct SessionRecord {
    /// Every valid frame, including dropped transmissions
    pub frames: Vec<Packet>,
    /// Payloads accepted in order
    pub delivered: Vec<Vec<u8>>,
}

impl SessionRecord {
    pub fn data_frames(&self) -> Vec<&Packet> {
        self.frames
            .iter()
            .filter(|p| p.packet_type == PacketType::VendorSpecific)
            .collect()
    }

    /// Data frames identical to the one right before them
    pub fn retransmissions(&self) -> usize {
        let data = self.data_frames();
        data.windows(2)
            .filter(|w| w[0].seq == w[1].seq && w[0].payload == w[1].payload)
            .count()
    }

    pub fn link_control(&self) -> Vec<LinkControl> {
        self.frames
            .iter()
            .filter(|p| p.packet_type == PacketType::LinkControl)
            .filter_map(|p| LinkControl::parse(&p.payload))
            .collect()
    }
}

pub struct SimulatedPeer {
    sessions: Arc<Mutex<Vec<SessionRecord>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl SimulatedPeer {
    /// Records of every connection so far
    pub fn sessions(&self) -> MutexGuard<'_, Vec<SessionRecord>> {
        self.sessions.lock().unwrap()
    }

    /// Record of the latest connection
    pub fn current(&self) -> SessionRecord {
        self.sessions().last().cloned().unwrap_or_default()
    }

    /// Send an unsolicited reliable data frame on the current connection
    pub fn push_event(&self, payload: Vec<u8>) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(payload);
        }
    }
}

/// Host end of the pipe; releases the device when dropped
pub struct DevicePipe {
    inner: DuplexStream,
    claimed: Arc<AtomicBool>,
}

impl Drop for DevicePipe {
    fn drop(&mut self) {
        self.claimed.store(false, Ordering::SeqCst);
    }
}

impl AsyncRead for DevicePipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DevicePipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Physical layer whose every open connects to a fresh simulated peer task
pub fn peer_physical(options: PeerOptions) -> (Arc<StreamPhysicalLayer<DevicePipe>>, SimulatedPeer) {
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::new(Mutex::new(None));
    let peer = SimulatedPeer {
        sessions: sessions.clone(),
        events: events.clone(),
    };

    let claimed = Arc::new(AtomicBool::new(false));
    let physical = StreamPhysicalLayer::new("simulated-peer", move || {
        if claimed.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "device busy"));
        }
        let (ours, theirs) = tokio::io::duplex(8192);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *events.lock().unwrap() = Some(events_tx);
        let index = {
            let mut sessions = sessions.lock().unwrap();
            sessions.push(SessionRecord::default());
            sessions.len() - 1
        };
        tokio::spawn(serve(
            theirs,
            options.clone(),
            sessions.clone(),
            index,
            events_rx,
        ));
        Ok(DevicePipe {
            inner: ours,
            claimed: claimed.clone(),
        })
    });
    (Arc::new(physical), peer)
}

pub fn peer_link(options: PeerOptions, config: LinkConfig) -> (DataLinkLayer, SimulatedPeer) {
    let (physical, peer) = peer_physical(options);
    (DataLinkLayer::new(physical, config).unwrap(), peer)
}

pub fn peer_transport(
    options: PeerOptions,
    link: LinkConfig,
    transport: TransportConfig,
) -> (TransportLayer, SimulatedPeer) {
    let (link, peer) = peer_link(options, link);
    (TransportLayer::new(link, transport).unwrap(), peer)
}

struct PeerState {
    expected: u8,
    tx_seq: u8,
    last_dropped: Option<(u8, Vec<u8>)>,
}

async fn serve(
    stream: DuplexStream,
    options: PeerOptions,
    sessions: Arc<Mutex<Vec<SessionRecord>>>,
    index: usize,
    mut events: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut codec = SlipCodec::new();
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 512];
    let mut state = PeerState {
        expected: 0,
        tx_seq: 0,
        last_dropped: None,
    };

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buffer.extend_from_slice(&chunk[..n]);
                loop {
                    let frame = match codec.decode(&mut buffer) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(_) => continue,
                    };
                    let Ok(packet) = Packet::from_bytes(&frame) else {
                        continue;
                    };
                    sessions.lock().unwrap()[index].frames.push(packet.clone());
                    let replies = handle(&options, &mut state, &sessions, index, packet);
                    for reply in replies {
                        if write(&mut writer, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(payload) = events.recv() => {
                let packet = Packet::data(state.tx_seq, state.expected, payload);
                state.tx_seq = next_seq(state.tx_seq);
                if write(&mut writer, &packet).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn handle(
    options: &PeerOptions,
    state: &mut PeerState,
    sessions: &Arc<Mutex<Vec<SessionRecord>>>,
    index: usize,
    packet: Packet,
) -> Vec<Packet> {
    match packet.packet_type {
        PacketType::LinkControl => {
            if !options.answer_handshake {
                return Vec::new();
            }
            match LinkControl::parse(&packet.payload) {
                Some(LinkControl::Sync) => {
                    state.expected = 0;
                    state.tx_seq = 0;
                    vec![Packet::link_control(LinkControl::SyncResponse)]
                }
                Some(LinkControl::Config(_)) => vec![Packet::link_control(
                    LinkControl::ConfigResponse(LINK_CONFIG_FIELD),
                )],
                _ => Vec::new(),
            }
        }
        PacketType::Ack => Vec::new(),
        PacketType::VendorSpecific => {
            if !packet.reliable {
                sessions.lock().unwrap()[index].delivered.push(packet.payload);
                return Vec::new();
            }
            if options.drop_first_transmission {
                let key = (packet.seq, packet.payload.clone());
                if state.last_dropped.as_ref() != Some(&key) {
                    state.last_dropped = Some(key);
                    return Vec::new();
                }
            }
            if !options.acknowledge_data {
                return Vec::new();
            }
            if packet.seq != state.expected {
                return vec![Packet::ack(state.expected)];
            }

            state.expected = next_seq(state.expected);
            let response = options
                .responder
                .as_ref()
                .and_then(|responder| responder(&packet.payload));
            sessions.lock().unwrap()[index].delivered.push(packet.payload);
            match response {
                Some(response) => {
                    let reply = Packet::data(state.tx_seq, state.expected, response);
                    state.tx_seq = next_seq(state.tx_seq);
                    vec![reply]
                }
                None => vec![Packet::ack(state.expected)],
            }
        }
    }
}

async fn write(writer: &mut WriteHalf<DuplexStream>, packet: &Packet) -> std::io::Result<()> {
    let contents = packet
        .to_bytes()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&encode_frame(&contents)).await?;
    writer.flush().await
}
