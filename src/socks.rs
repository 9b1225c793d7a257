//! SOCKS5 ingress (RFC 1928) with username/password auth (RFC 1929).
//!
//! Method selection is strict: a client that skips the greeting or offers
//! no configured method is refused and the connection closes without any
//! mesh state being created. CONNECT splices the client socket with a mesh
//! stream; UDP ASSOCIATE binds a local relay socket and bridges datagrams
//! into a mesh association. Credentials verify against bcrypt hashes on
//! every connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Socks5Config;
use crate::crypto::MAX_PLAINTEXT;
use crate::error::{ErrorCode, SocksError, StreamError};
use crate::frame::DestAddr;
use crate::stream::{StreamEvent, StreamHandle};
use crate::udp::{encode_socks_udp_header, parse_socks_udp_header};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Opens mesh streams on behalf of SOCKS clients; implemented by the agent
/// orchestrator, which performs route lookup and next-hop selection.
#[async_trait]
pub trait MeshConnector: Send + Sync {
    async fn connect_tcp(&self, dest: DestAddr, port: u16) -> Result<StreamHandle, StreamError>;
    async fn connect_udp(&self, hint: DestAddr, port: u16) -> Result<StreamHandle, StreamError>;
}

/// The SOCKS5 ingress listener.
pub struct Socks5Server {
    config: Socks5Config,
    /// username -> bcrypt hash
    users: HashMap<String, String>,
    connector: Arc<dyn MeshConnector>,
    active: Arc<AtomicUsize>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Socks5Server {
    pub fn new(
        config: Socks5Config,
        connector: Arc<dyn MeshConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let users = config
            .auth
            .users
            .iter()
            .map(|u| {
                // Accept either a precomputed bcrypt hash or a plaintext
                // secret that we hash once at startup.
                let hash = if u.password.starts_with("$2") {
                    u.password.clone()
                } else {
                    bcrypt::hash(&u.password, bcrypt::DEFAULT_COST)
                        .unwrap_or_else(|_| u.password.clone())
                };
                (u.username.clone(), hash)
            })
            .collect();
        Self {
            config,
            users,
            connector,
            active: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Accept loop; runs until cancellation.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target: "trellis::socks", %err, "accept failed");
                    continue;
                }
            };
            if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
                debug!(target: "trellis::socks", %addr, "connection limit reached");
                continue;
            }
            self.active.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            self.tracker.spawn(async move {
                if let Err(err) = server.handle_client(stream).await {
                    debug!(target: "trellis::socks", %addr, %err, "client session ended");
                }
                server.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
        self.tracker.close();
    }

    async fn handle_client(&self, mut stream: TcpStream) -> Result<(), SocksError> {
        self.negotiate_method(&mut stream).await?;
        let (cmd, dest, port) = read_request(&mut stream).await?;

        match cmd {
            CMD_CONNECT => self.handle_connect(stream, dest, port).await,
            CMD_UDP_ASSOCIATE => self.handle_udp_associate(stream, dest, port).await,
            other => {
                write_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
                Err(SocksError::BadCommand(other))
            }
        }
    }

    /// RFC 1928 §3 greeting plus, when configured, the RFC 1929
    /// sub-negotiation. A downgrade attempt (no acceptable method offered)
    /// answers 0xFF and errors out before any stream state exists.
    async fn negotiate_method(&self, stream: &mut TcpStream) -> Result<(), SocksError> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(SocksError::BadVersion(head[0]));
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        let want = if self.config.auth.enabled {
            METHOD_USERPASS
        } else {
            METHOD_NONE
        };
        if !methods.contains(&want) {
            stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
            return Err(SocksError::NoAcceptableMethod);
        }
        stream.write_all(&[SOCKS_VERSION, want]).await?;

        if want == METHOD_USERPASS {
            self.sub_negotiate(stream).await?;
        }
        Ok(())
    }

    async fn sub_negotiate(&self, stream: &mut TcpStream) -> Result<(), SocksError> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != AUTH_VERSION {
            return Err(SocksError::BadVersion(head[0]));
        }
        let mut username = vec![0u8; head[1] as usize];
        stream.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password).into_owned();
        let verified = match self.users.get(&username) {
            Some(hash) => {
                let hash = hash.clone();
                // bcrypt is deliberately slow; keep it off the runtime.
                tokio::task::spawn_blocking(move || {
                    bcrypt::verify(&password, &hash).unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            }
            None => false,
        };

        if verified {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(())
        } else {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(SocksError::AuthFailed)
        }
    }

    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        dest: DestAddr,
        port: u16,
    ) -> Result<(), SocksError> {
        info!(target: "trellis::socks", dest = %dest, port, "connect request");
        let handle = match self.connector.connect_tcp(dest, port).await {
            Ok(handle) => handle,
            Err(err) => {
                let reply = err.code().socks_reply();
                write_reply(&mut stream, reply, None).await?;
                return Err(err.into());
            }
        };
        let bound = handle.bound().cloned();
        write_reply(&mut stream, REPLY_SUCCESS, bound).await?;
        splice(stream, handle).await;
        Ok(())
    }

    async fn handle_udp_associate(
        &self,
        mut control: TcpStream,
        hint: DestAddr,
        port: u16,
    ) -> Result<(), SocksError> {
        let local_ip = control
            .local_addr()
            .map(|sa| sa.ip())
            .unwrap_or_else(|_| "127.0.0.1".parse().expect("literal address"));
        let relay = match UdpSocket::bind((local_ip, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                write_reply(&mut control, ErrorCode::WRITE_FAILED.socks_reply(), None).await?;
                return Err(err.into());
            }
        };
        let relay_addr = relay.local_addr()?;

        let handle = match self.connector.connect_udp(hint, port).await {
            Ok(handle) => handle,
            Err(err) => {
                let reply = err.code().socks_reply();
                write_reply(&mut control, reply, None).await?;
                return Err(err.into());
            }
        };

        write_reply(
            &mut control,
            REPLY_SUCCESS,
            Some((DestAddr::from_ip(relay_addr.ip()), relay_addr.port())),
        )
        .await?;
        info!(target: "trellis::socks", relay = %relay_addr, "udp associate established");

        relay_udp(control, relay, handle).await;
        Ok(())
    }
}

/// RFC 1928 §4 request: VER CMD RSV ATYP DST.ADDR DST.PORT.
async fn read_request(stream: &mut TcpStream) -> Result<(u8, DestAddr, u16), SocksError> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(head[0]));
    }
    if head[2] != 0x00 {
        return Err(SocksError::Malformed("nonzero reserved byte".into()));
    }
    let dest = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            DestAddr::Ipv4(octets.into())
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| SocksError::Malformed("domain not utf-8".into()))?;
            DestAddr::Domain(name)
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            DestAddr::Ipv6(octets.into())
        }
        other => {
            return Err(SocksError::Malformed(format!(
                "address type {other:#04x}"
            )))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((head[1], dest, u16::from_be_bytes(port)))
}

/// RFC 1928 §6 reply with the bound address (zeroes when unknown).
async fn write_reply(
    stream: &mut TcpStream,
    code: u8,
    bound: Option<(DestAddr, u16)>,
) -> Result<(), SocksError> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS_VERSION, code, 0x00]);
    match bound {
        Some((DestAddr::Ipv4(v4), port)) => {
            out.push(0x01);
            out.extend_from_slice(&v4.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Some((DestAddr::Ipv6(v6), port)) => {
            out.push(0x04);
            out.extend_from_slice(&v6.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Some((DestAddr::Domain(name), port)) => {
            out.push(0x03);
            out.push(name.len().min(255) as u8);
            out.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
            out.extend_from_slice(&port.to_be_bytes());
        }
        None => {
            out.push(0x01);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&out).await?;
    Ok(())
}

/// Bidirectional copy between the client socket and the mesh stream,
/// honoring half-close in both directions.
async fn splice(client: TcpStream, mut handle: StreamHandle) {
    let (mut client_read, mut client_write) = client.into_split();
    let sender = handle.sender();

    let to_mesh = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PLAINTEXT];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = sender.finish_write();
                    break;
                }
                Ok(n) => {
                    if sender.send(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    sender.reset(ErrorCode::WRITE_FAILED);
                    break;
                }
            }
        }
    });

    // A dead client write half half-closes with FIN_READ and discards
    // whatever the exit still has in flight; the client's read side keeps
    // feeding the mesh until it hits EOF.
    let mut discard = false;
    loop {
        match handle.recv().await {
            Ok(Some(data)) => {
                if discard {
                    continue;
                }
                if client_write.write_all(&data).await.is_err() {
                    let _ = handle.finish_read();
                    discard = true;
                }
            }
            Ok(None) => {
                let _ = client_write.shutdown().await;
                break;
            }
            Err(err) => {
                debug!(target: "trellis::socks", %err, "mesh stream ended");
                break;
            }
        }
    }

    let _ = to_mesh.await;
}

/// Shuttles datagrams between the client-facing relay socket and the mesh
/// association until the control connection dies.
async fn relay_udp(mut control: TcpStream, relay: UdpSocket, mut handle: StreamHandle) {
    let sender = handle.sender();
    let mut buf = vec![0u8; 65536];
    let mut client_addr: Option<SocketAddr> = None;
    let mut control_buf = [0u8; 1];

    loop {
        tokio::select! {
            // The association lives exactly as long as the TCP control
            // connection (RFC 1928 §7).
            res = control.read(&mut control_buf) => {
                if matches!(res, Ok(0) | Err(_)) {
                    break;
                }
            }
            res = relay.recv_from(&mut buf) => {
                let Ok((n, src)) = res else { break };
                match client_addr {
                    None => client_addr = Some(src),
                    Some(known) if known == src => {}
                    Some(_) => continue,
                }
                let Some((dest, port, payload)) = parse_socks_udp_header(&buf[..n]) else {
                    continue;
                };
                match sender.send_datagram(dest, port, payload) {
                    Ok(()) => {}
                    // The exit closed its read half; outbound datagrams
                    // get dropped while replies keep relaying.
                    Err(StreamError::WriteFinished) => continue,
                    Err(_) => break,
                }
            }
            event = handle.recv_event() => match event {
                Some(StreamEvent::Datagram(datagram)) => {
                    let Some(client) = client_addr else { continue };
                    let plain = match sender.open_sealed(&datagram.payload) {
                        Ok(plain) => plain,
                        Err(err) => {
                            debug!(target: "trellis::socks", %err, "bad sealed datagram");
                            sender.reset(ErrorCode::WRITE_FAILED);
                            break;
                        }
                    };
                    let packet =
                        encode_socks_udp_header(&datagram.addr, datagram.port, &plain);
                    let _ = relay.send_to(&packet, client).await;
                }
                Some(StreamEvent::Close) | Some(StreamEvent::Reset(_)) | None => break,
                Some(_) => continue,
            },
        }
    }
    handle.close();
}
