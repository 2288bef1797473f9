//! Physical layer over any async byte stream
//!
//! The UART physical layer is a thin wrapper around this type; tests and
//! bridges (TCP, pseudo terminals, in-memory duplex pipes) use it directly.

use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::serial::{PhysicalEvent, PhysicalEventSender, PhysicalLayer};
use super::ProtocolError;

/// Size of the read buffer handed to the stream
const READ_CHUNK: usize = 1024;

/// Opens a fresh stream each time the layer is opened
pub type Connector<S> = Box<dyn Fn() -> io::Result<S> + Send + Sync>;

struct StreamSession {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    /// Reader and writer; each owns one half of the stream
    tasks: [JoinHandle<()>; 2],
}

/// Physical layer driving an `AsyncRead + AsyncWrite` stream with one reader
/// task and one writer task
pub struct StreamPhysicalLayer<S> {
    name: String,
    connector: Connector<S>,
    session: Mutex<Option<StreamSession>>,
}

impl<S> StreamPhysicalLayer<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a layer that calls `connector` on every open
    pub fn new<F>(name: impl Into<String>, connector: F) -> Self
    where
        F: Fn() -> io::Result<S> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            connector: Box::new(connector),
            session: Mutex::new(None),
        }
    }

    /// Name used in diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    fn session(&self) -> Result<MutexGuard<'_, Option<StreamSession>>, ProtocolError> {
        self.session
            .lock()
            .map_err(|_| ProtocolError::SerialError(format!("{}: state lock poisoned", self.name)))
    }
}

#[async_trait]
impl<S> PhysicalLayer for StreamPhysicalLayer<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn open(&self, events: PhysicalEventSender) -> Result<(), ProtocolError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ProtocolError::InvalidParam(
                "physical layer must be opened from inside a tokio runtime".to_string(),
            )
        })?;

        let mut session = self.session()?;
        if session.is_some() {
            return Err(ProtocolError::AlreadyOpen);
        }

        let stream = (self.connector)()
            .map_err(|e| ProtocolError::SerialError(format!("{}: {}", self.name, e)))?;
        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = runtime.spawn(read_loop(
            self.name.clone(),
            reader,
            events.clone(),
            cancel.clone(),
        ));
        let writer = runtime.spawn(write_loop(
            self.name.clone(),
            writer,
            write_rx,
            events,
            cancel.clone(),
        ));

        debug!(port = %self.name, "physical layer opened");
        *session = Some(StreamSession {
            writer: write_tx,
            cancel,
            tasks: [reader, writer],
        });
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let session = self.session()?;
        let session = session.as_ref().ok_or(ProtocolError::NotOpen)?;
        session
            .writer
            .send(bytes.to_vec())
            .map_err(|_| ProtocolError::SerialError(format!("{}: writer stopped", self.name)))
    }

    fn close(&self) -> Result<(), ProtocolError> {
        if let Some(session) = self.session()?.take() {
            session.cancel.cancel();
            debug!(port = %self.name, "physical layer closed");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ProtocolError> {
        let Some(session) = self.session()?.take() else {
            return Ok(());
        };
        session.cancel.cancel();
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(port = %self.name, "stream task ended abnormally: {}", e);
            }
        }
        debug!(port = %self.name, "physical layer shut down");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session().map(|s| s.is_some()).unwrap_or(false)
    }
}

async fn read_loop<S: AsyncRead>(
    name: String,
    mut reader: ReadHalf<S>,
    events: PhysicalEventSender,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(port = %name, "stream reached end of file");
                    let _ = events.send(PhysicalEvent::Closed);
                    break;
                }
                Ok(n) => {
                    if events.send(PhysicalEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(port = %name, "read failed: {}", e);
                    let _ = events.send(PhysicalEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }
}

async fn write_loop<S: AsyncWrite>(
    name: String,
    mut writer: WriteHalf<S>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: PhysicalEventSender,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let result: io::Result<()> = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(port = %name, "write failed: {}", e);
            let _ = events.send(PhysicalEvent::Error(e.to_string()));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    fn duplex_layer() -> (StreamPhysicalLayer<DuplexStream>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(256);
        let slot = Mutex::new(Some(ours));
        let layer = StreamPhysicalLayer::new("duplex", move || {
            slot.lock()
                .ok()
                .and_then(|mut s| s.take())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "already taken"))
        });
        (layer, theirs)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (layer, mut peer) = duplex_layer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        layer.open(tx).unwrap();
        assert!(layer.is_open());

        layer.write(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);

        peer.write_all(&[9, 8]).await.unwrap();
        match rx.recv().await {
            Some(PhysicalEvent::Data(data)) => assert_eq!(data, vec![9, 8]),
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let (layer, peer) = duplex_layer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        layer.open(tx).unwrap();
        drop(peer);
        assert!(matches!(rx.recv().await, Some(PhysicalEvent::Closed)));
    }

    #[tokio::test]
    async fn test_open_twice_and_write_when_closed() {
        let (layer, _peer) = duplex_layer();
        assert!(matches!(layer.write(&[1]), Err(ProtocolError::NotOpen)));
        let (tx, _rx) = mpsc::unbounded_channel();
        layer.open(tx.clone()).unwrap();
        assert!(matches!(layer.open(tx), Err(ProtocolError::AlreadyOpen)));
        layer.close().unwrap();
        layer.close().unwrap();
        assert!(!layer.is_open());
    }

    /// Stream that, like a tty opened with TIOCEXCL, exists at most once
    struct ExclusiveStream {
        inner: DuplexStream,
        in_use: Arc<AtomicBool>,
    }

    impl Drop for ExclusiveStream {
        fn drop(&mut self) {
            self.in_use.store(false, Ordering::SeqCst);
        }
    }

    impl AsyncRead for ExclusiveStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ExclusiveStream {
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

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn exclusive_layer() -> (StreamPhysicalLayer<ExclusiveStream>, Arc<AtomicBool>) {
        let in_use = Arc::new(AtomicBool::new(false));
        let flag = in_use.clone();
        let peers = Mutex::new(Vec::new());
        let layer = StreamPhysicalLayer::new("exclusive", move || {
            if flag.swap(true, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "device busy"));
            }
            let (ours, theirs) = tokio::io::duplex(64);
            if let Ok(mut peers) = peers.lock() {
                peers.push(theirs);
            }
            Ok(ExclusiveStream {
                inner: ours,
                in_use: flag.clone(),
            })
        });
        (layer, in_use)
    }

    #[tokio::test]
    async fn test_shutdown_releases_stream_before_returning() {
        let (layer, in_use) = exclusive_layer();
        for _ in 0..3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            layer.open(tx).unwrap();
            layer.write(&[0xC0]).unwrap();
            assert!(in_use.load(Ordering::SeqCst));

            layer.shutdown().await.unwrap();
            assert!(!layer.is_open());
            assert!(!in_use.load(Ordering::SeqCst));
        }
        layer.shutdown().await.unwrap();
    }

    #[test]
    fn test_open_outside_runtime_is_rejected() {
        let (layer, _peer) = duplex_layer();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(layer.open(tx), Err(ProtocolError::InvalidParam(_))));
    }
}
