//! ICMP echo sessions over unprivileged datagram ICMP sockets.
//!
//! An ICMP_SETUP open binds one echo session to a fixed target address.
//! Sealed echo payloads are decrypted at the exit, sent as real echo
//! requests, and the kernel reply (matched by identifier and sequence
//! within the echo timeout) is sealed and returned with the reply flag.
//! The socket sits behind a trait so tests run without raw network access.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::IcmpConfig;
use crate::crypto::{EphemeralKeyPair, Role, SessionKey};
use crate::error::ErrorCode;
use crate::frame::{FrameType, SetupOp};
use crate::peer::PeerHandle;
use crate::routing::Prefix;
use crate::stream::{StreamEvent, StreamKind, StreamManager};

/// One echo round observed on the kernel socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub source: IpAddr,
    pub ident: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Echo socket seam: send a request, await any reply.
#[async_trait]
pub trait IcmpSocket: Send + Sync {
    async fn send_echo(&self, dest: IpAddr, ident: u16, seq: u16, payload: &[u8])
        -> io::Result<()>;
    async fn recv_reply(&self) -> io::Result<EchoReply>;
}

/// Opens one socket per session.
pub trait IcmpSocketFactory: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn IcmpSocket>>;
}

/// Exit-side echo session handler.
pub struct IcmpExit {
    config: IcmpConfig,
    manager: StreamManager,
    factory: Arc<dyn IcmpSocketFactory>,
    allowed: Vec<Prefix>,
    active: Arc<AtomicUsize>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl IcmpExit {
    pub fn new(
        config: IcmpConfig,
        manager: StreamManager,
        factory: Arc<dyn IcmpSocketFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let allowed = config
            .allowed_cidrs
            .iter()
            .filter_map(|s| match Prefix::parse(s) {
                Ok(prefix) => Some(prefix),
                Err(err) => {
                    warn!(target: "trellis::icmp", %err, cidr = %s, "ignoring bad allow-list entry");
                    None
                }
            })
            .collect();
        Self {
            config,
            manager,
            factory,
            allowed,
            active: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn target_allowed(&self, ip: IpAddr) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|p| p.contains(ip))
    }

    /// Handles an ICMP_SETUP open terminating at this exit.
    pub async fn handle_open(&self, from: &PeerHandle, stream_id: u64, op: SetupOp) {
        let SetupOp::Open {
            request_id,
            dest,
            ephemeral_pub,
            ..
        } = op
        else {
            return;
        };

        let reject = |code: ErrorCode| {
            self.manager
                .send_setup_err(from, stream_id, FrameType::IcmpSetup, request_id, code);
        };

        if !self.config.enabled {
            reject(ErrorCode::EXIT_DISABLED);
            return;
        }
        if self.active.load(Ordering::Relaxed) >= self.config.max_sessions {
            reject(ErrorCode::RESOURCE_LIMIT);
            return;
        }
        let Some(target) = dest.as_ip() else {
            reject(ErrorCode::NOT_ALLOWED);
            return;
        };
        if !self.target_allowed(target) {
            reject(ErrorCode::NOT_ALLOWED);
            return;
        }

        let socket = match self.factory.open() {
            Ok(socket) => socket,
            Err(err) => {
                warn!(target: "trellis::icmp", %err, "echo socket open failed");
                reject(ErrorCode::WRITE_FAILED);
                return;
            }
        };

        let keypair = EphemeralKeyPair::generate();
        let responder_pub = keypair.public_bytes();
        let key = SessionKey::derive(
            keypair.agree(&ephemeral_pub),
            request_id,
            &ephemeral_pub,
            &responder_pub,
            Role::Responder,
        );

        let handle = self.manager.register_responder(
            from,
            stream_id,
            request_id,
            StreamKind::Icmp,
            dest,
            0,
            key,
        );
        let ack = SetupOp::Ack {
            request_id,
            ephemeral_pub: responder_pub,
        };
        if from
            .send_data(crate::frame::Frame::new(
                FrameType::IcmpSetup,
                stream_id,
                ack.encode(),
            ))
            .is_err()
        {
            return;
        }

        info!(
            target: "trellis::icmp",
            peer = %from.id().short(),
            stream_id,
            target = %target,
            "icmp session open"
        );

        self.active.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(self.active.clone());
        self.tracker.spawn(pump_session(
            handle,
            socket,
            target,
            self.config.clone(),
            self.cancel.clone(),
            guard,
        ));
    }

    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn pump_session(
    mut handle: crate::stream::StreamHandle,
    socket: Arc<dyn IcmpSocket>,
    target: IpAddr,
    config: IcmpConfig,
    cancel: CancellationToken,
    _guard: ActiveGuard,
) {
    let sender = handle.sender();
    let echo_timeout = config.echo_timeout();
    // Requests in flight, matched by (ident, seq).
    let mut outstanding: HashMap<(u16, u16), Instant> = HashMap::new();

    loop {
        outstanding.retain(|_, sent_at| sent_at.elapsed() < echo_timeout);

        tokio::select! {
            _ = cancel.cancelled() => break,
            event = handle.recv_event() => match event {
                Some(StreamEvent::Echo(echo)) if !echo.reply => {
                    if !sender.state().can_read() {
                        // FIN_READ went out; inbound requests get dropped.
                        continue;
                    }
                    let plain = match sender.open_sealed(&echo.payload) {
                        Ok(plain) => plain,
                        Err(err) => {
                            debug!(target: "trellis::icmp", %err, "rejecting sealed echo");
                            sender.reset(ErrorCode::WRITE_FAILED);
                            break;
                        }
                    };
                    if let Err(err) = socket.send_echo(target, echo.ident, echo.seq, &plain).await {
                        debug!(target: "trellis::icmp", %err, "echo send failed; closing read half");
                        let _ = sender.finish_read();
                        continue;
                    }
                    outstanding.insert((echo.ident, echo.seq), Instant::now());
                }
                Some(StreamEvent::Close) | Some(StreamEvent::Reset(_)) | None => break,
                Some(_) => continue,
            },
            reply = socket.recv_reply() => match reply {
                Ok(reply) => {
                    if outstanding.remove(&(reply.ident, reply.seq)).is_none() {
                        // Late or foreign reply.
                        continue;
                    }
                    if sender
                        .send_echo(reply.ident, reply.seq, true, &reply.payload)
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    debug!(target: "trellis::icmp", %err, "echo socket error");
                    break;
                }
            },
        }
    }
}

/// In-memory echo socket: every request is answered immediately. Used by
/// tests and available for loopback wiring.
pub struct LoopbackIcmp {
    queue: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<EchoReply>>,
    tx: tokio::sync::mpsc::UnboundedSender<EchoReply>,
}

impl LoopbackIcmp {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            queue: tokio::sync::Mutex::new(rx),
            tx,
        }
    }
}

impl Default for LoopbackIcmp {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct LoopbackIcmpFactory;

impl IcmpSocketFactory for LoopbackIcmpFactory {
    fn open(&self) -> io::Result<Arc<dyn IcmpSocket>> {
        Ok(Arc::new(LoopbackIcmp::new()))
    }
}

#[async_trait]
impl IcmpSocket for LoopbackIcmp {
    async fn send_echo(
        &self,
        dest: IpAddr,
        ident: u16,
        seq: u16,
        payload: &[u8],
    ) -> io::Result<()> {
        let _ = self.tx.send(EchoReply {
            source: dest,
            ident,
            seq,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn recv_reply(&self) -> io::Result<EchoReply> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// Unprivileged `IPPROTO_ICMP` datagram socket (Linux ping sockets and the
/// macOS equivalent). The kernel manages the echo identifier namespace.
#[cfg(unix)]
pub mod dgram {
    use super::*;
    use socket2::{Domain, Protocol, Socket, Type};
    use tokio::io::unix::AsyncFd;

    const ECHO_REQUEST: u8 = 8;
    const ECHO_REPLY: u8 = 0;

    pub struct DgramIcmpSocket {
        fd: AsyncFd<Socket>,
    }

    impl DgramIcmpSocket {
        pub fn new_v4() -> io::Result<Self> {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
            socket.set_nonblocking(true)?;
            Ok(Self {
                fd: AsyncFd::new(socket)?,
            })
        }
    }

    fn checksum(data: &[u8]) -> u16 {
        let mut sum = 0u32;
        for chunk in data.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_be_bytes([chunk[0], 0])
            };
            sum = sum.wrapping_add(word as u32);
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    /// Builds an echo request datagram. With `SOCK_DGRAM` ICMP the kernel
    /// rewrites the identifier to the socket's own, so the one encoded
    /// here is advisory.
    pub fn encode_echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(8 + payload.len());
        packet.push(ECHO_REQUEST);
        packet.push(0);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&ident.to_be_bytes());
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(payload);
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    /// Parses an echo reply datagram as delivered by a `SOCK_DGRAM` ICMP
    /// socket (no IP header).
    pub fn parse_echo_reply(buf: &[u8]) -> Option<(u16, u16, &[u8])> {
        if buf.len() < 8 || buf[0] != ECHO_REPLY {
            return None;
        }
        let ident = u16::from_be_bytes([buf[4], buf[5]]);
        let seq = u16::from_be_bytes([buf[6], buf[7]]);
        Some((ident, seq, &buf[8..]))
    }

    #[async_trait]
    impl IcmpSocket for DgramIcmpSocket {
        async fn send_echo(
            &self,
            dest: IpAddr,
            ident: u16,
            seq: u16,
            payload: &[u8],
        ) -> io::Result<()> {
            let IpAddr::V4(v4) = dest else {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "v6 echo requires an ICMPv6 socket",
                ));
            };
            let packet = encode_echo_request(ident, seq, payload);
            let target = std::net::SocketAddr::from((v4, 0)).into();
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(&packet, &target)) {
                    Ok(res) => {
                        res?;
                        return Ok(());
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        async fn recv_reply(&self) -> io::Result<EchoReply> {
            let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 2048];
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| inner.get_ref().recv_from(&mut buf)) {
                    Ok(res) => {
                        let (n, addr) = res?;
                        // Initialized by the kernel up to n.
                        let bytes: Vec<u8> = buf[..n]
                            .iter()
                            .map(|b| unsafe { b.assume_init() })
                            .collect();
                        let Some((ident, seq, payload)) = parse_echo_reply(&bytes) else {
                            continue;
                        };
                        let source = addr
                            .as_socket()
                            .map(|sa| sa.ip())
                            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
                        return Ok(EchoReply {
                            source,
                            ident,
                            seq,
                            payload: payload.to_vec(),
                        });
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }

    pub struct DgramIcmpFactory;

    impl IcmpSocketFactory for DgramIcmpFactory {
        fn open(&self) -> io::Result<Arc<dyn IcmpSocket>> {
            Ok(Arc::new(DgramIcmpSocket::new_v4()?))
        }
    }

}
