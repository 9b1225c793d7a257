//! Pluggable transport seam.
//!
//! Every transport yields an ordered, reliable, bi-directional byte stream
//! with integrity; QUIC is used as a single stream per peer and HTTP/2 and
//! WebSocket run over TLS 1.3. The concrete socket implementations live
//! outside the core; this module defines the object-safe traits they
//! implement plus an in-memory pair used by tests and single-process wiring.

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::error::PeerError;

/// Which transport family a listener or peer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    H2,
    Ws,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Quic => write!(f, "quic"),
            TransportKind::H2 => write!(f, "h2"),
            TransportKind::Ws => write!(f, "ws"),
        }
    }
}

/// Read half of an established transport.
#[async_trait]
pub trait TransportRead: Send {
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// Write half of an established transport.
#[async_trait]
pub trait TransportWrite: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// An established transport connection to one peer.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;
    /// SHA-256 of the peer's TLS certificate, when the transport has one.
    fn peer_fingerprint(&self) -> Option<[u8; 32]>;
    /// Splits into independently owned halves for the reader/writer tasks.
    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>);
}

/// Dials one configured peer; invoked again by the reconnect policy.
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Transport>, PeerError>;
    fn kind(&self) -> TransportKind;
}

struct IoRead<R>(R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportRead for IoRead<R> {
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.0.read_exact(buf).await.map(|_| ())
    }
}

struct IoWrite<W>(W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWrite for IoWrite<W> {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// In-memory transport pair over `tokio::io::duplex`, the loopback used by
/// unit and scenario tests.
pub struct DuplexTransport {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    kind: TransportKind,
}

impl DuplexTransport {
    /// Connected pair with the default buffer size.
    pub fn pair() -> (DuplexTransport, DuplexTransport) {
        Self::pair_with(TransportKind::Quic, 256 * 1024)
    }

    pub fn pair_with(kind: TransportKind, buffer: usize) -> (DuplexTransport, DuplexTransport) {
        let (a, b) = tokio::io::duplex(buffer);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            DuplexTransport {
                read: ar,
                write: aw,
                kind,
            },
            DuplexTransport {
                read: br,
                write: bw,
                kind,
            },
        )
    }
}

impl Transport for DuplexTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        None
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        (Box::new(IoRead(self.read)), Box::new(IoWrite(self.write)))
    }
}

/// Dialer that hands out pre-staged transports in order; lets reconnect
/// tests script each successive dial.
pub struct QueueDialer {
    kind: TransportKind,
    queue: Mutex<VecDeque<Box<dyn Transport>>>,
}

impl QueueDialer {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, transport: Box<dyn Transport>) {
        self.queue.lock().push_back(transport);
    }
}

#[async_trait]
impl TransportDialer for QueueDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, PeerError> {
        self.queue
            .lock()
            .pop_front()
            .ok_or_else(|| PeerError::Transport("no staged transport".into()))
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_pair_moves_bytes_both_ways() {
        let (a, b) = DuplexTransport::pair();
        let (mut ar, mut aw) = Box::new(a).into_split();
        let (mut br, mut bw) = Box::new(b).into_split();

        aw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        br.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        bw.write_all(b"pong").await.unwrap();
        ar.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn queue_dialer_hands_out_in_order_then_fails() {
        let dialer = QueueDialer::new(TransportKind::Ws);
        let (a, _keep) = DuplexTransport::pair();
        dialer.push(Box::new(a));
        assert!(dialer.dial().await.is_ok());
        assert!(dialer.dial().await.is_err());
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TransportKind::Quic).unwrap(), "\"quic\"");
        let k: TransportKind = serde_json::from_str("\"ws\"").unwrap();
        assert_eq!(k, TransportKind::Ws);
    }
}
