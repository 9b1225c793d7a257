//! Exit handler: binds inbound stream opens to real TCP sockets.
//!
//! An open that reaches an agent whose own route set covers the destination
//! terminates here: policy gates, DNS, the responder half of the key
//! exchange, the outbound connect, and the two pumps that move sealed
//! frames in and plaintext out.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{DnsConfig, ExitConfig};
use crate::crypto::{EphemeralKeyPair, Role, SessionKey, MAX_PLAINTEXT};
use crate::error::{ErrorCode, StreamError};
use crate::frame::{DestAddr, Frame, FrameType, StreamOpen, StreamOpenAck, StreamOpenErr};
use crate::peer::PeerHandle;
use crate::routing::RoutingEngine;
use crate::stream::{StreamKind, StreamManager};

/// Name resolution seam; the default implementation asks the system
/// resolver. A resolver honoring custom `dns.servers` plugs in here.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ErrorCode>;
}

/// System resolver with a short-TTL positive cache.
pub struct SystemResolver {
    timeout: Duration,
    cache_ttl: Duration,
    cache: parking_lot::Mutex<HashMap<String, (Instant, Vec<IpAddr>)>>,
}

impl SystemResolver {
    pub fn new(config: &DnsConfig) -> Self {
        Self {
            timeout: config.timeout(),
            cache_ttl: config.cache_ttl(),
            cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ErrorCode> {
        let key = host.to_ascii_lowercase();
        if let Some((stored_at, ips)) = self.cache.lock().get(&key) {
            if stored_at.elapsed() < self.cache_ttl {
                return Ok(ips.clone());
            }
        }
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| ErrorCode::DNS_ERROR)?
            .map_err(|_| ErrorCode::DNS_ERROR)?;
        let ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        if ips.is_empty() {
            return Err(ErrorCode::DNS_ERROR);
        }
        self.cache.lock().insert(key, (Instant::now(), ips.clone()));
        Ok(ips)
    }
}

/// Terminates TCP streams at this agent.
pub struct ExitHandler {
    config: ExitConfig,
    manager: StreamManager,
    routing: Arc<RoutingEngine>,
    resolver: Arc<dyn Resolver>,
    active: Arc<AtomicUsize>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ExitHandler {
    pub fn new(
        config: ExitConfig,
        manager: StreamManager,
        routing: Arc<RoutingEngine>,
        resolver: Arc<dyn Resolver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            routing,
            resolver,
            active: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Full exit-side open: policy, resolve, key agreement, connect, ack,
    /// pumps. Failures answer with the specific wire code.
    pub async fn handle_open(&self, from: &PeerHandle, stream_id: u64, open: StreamOpen) {
        if let Err(code) = self.admit(&open) {
            self.manager.send_open_err(
                from,
                stream_id,
                StreamOpenErr::new(open.request_id, code, code.name()),
            );
            return;
        }

        let target_ip = match self.resolve_dest(&open.dest).await {
            Ok(ip) => ip,
            Err(code) => {
                self.manager.send_open_err(
                    from,
                    stream_id,
                    StreamOpenErr::new(open.request_id, code, "resolution failed"),
                );
                return;
            }
        };

        // Responder half of the per-stream exchange. The ingress public key
        // arrived in the open; ours returns in the ack.
        let keypair = EphemeralKeyPair::generate();
        let responder_pub = keypair.public_bytes();
        let key = SessionKey::derive(
            keypair.agree(&open.ephemeral_pub),
            open.request_id,
            &open.ephemeral_pub,
            &responder_pub,
            Role::Responder,
        );

        let target = SocketAddr::new(target_ip, open.port);
        let socket = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(target),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                let code = ErrorCode::from_io(&err);
                debug!(target: "trellis::exit", %target, %err, "outbound connect failed");
                self.manager.send_open_err(
                    from,
                    stream_id,
                    StreamOpenErr::new(open.request_id, code, err.to_string()),
                );
                return;
            }
            Err(_) => {
                self.manager.send_open_err(
                    from,
                    stream_id,
                    StreamOpenErr::new(
                        open.request_id,
                        ErrorCode::CONNECTION_TIMEOUT,
                        "connect timed out",
                    ),
                );
                return;
            }
        };

        let bound = socket
            .local_addr()
            .map(|sa| (DestAddr::from_ip(sa.ip()), sa.port()))
            .unwrap_or((DestAddr::Ipv4(std::net::Ipv4Addr::UNSPECIFIED), 0));

        let handle = self.manager.register_responder(
            from,
            stream_id,
            open.request_id,
            StreamKind::Tcp,
            open.dest.clone(),
            open.port,
            key,
        );

        let ack = StreamOpenAck {
            request_id: open.request_id,
            bound: bound.0.clone(),
            bound_port: bound.1,
            ephemeral_pub: responder_pub,
        };
        if from
            .send_data(Frame::new(FrameType::StreamOpenAck, stream_id, ack.encode()))
            .is_err()
        {
            return;
        }

        info!(
            target: "trellis::exit",
            peer = %from.id().short(),
            stream_id,
            dest = %open.dest,
            port = open.port,
            "exit stream open"
        );

        self.active.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(self.active.clone());
        let cancel = self.cancel.clone();
        self.tracker.spawn(pump_tcp(handle, socket, cancel, guard));
    }

    fn admit(&self, open: &StreamOpen) -> Result<(), ErrorCode> {
        if !self.config.enabled {
            return Err(ErrorCode::EXIT_DISABLED);
        }
        if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
            return Err(ErrorCode::CONNECTION_LIMIT);
        }
        if !self.routing.serves(&open.dest) {
            return Err(ErrorCode::NOT_ALLOWED);
        }
        Ok(())
    }

    async fn resolve_dest(&self, dest: &DestAddr) -> Result<IpAddr, ErrorCode> {
        match dest {
            DestAddr::Ipv4(ip) => Ok(IpAddr::V4(*ip)),
            DestAddr::Ipv6(ip) => Ok(IpAddr::V6(*ip)),
            DestAddr::Domain(name) => {
                let ips = self.resolver.resolve(name).await?;
                // Prefer IPv4 so the common dual-stack case binds v4.
                ips.iter()
                    .find(|ip| ip.is_ipv4())
                    .or_else(|| ips.first())
                    .copied()
                    .ok_or(ErrorCode::DNS_ERROR)
            }
        }
    }

    /// Waits for in-flight pumps during shutdown.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Decrements the active-connection gauge when a pump finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bidirectional pump between the mesh stream and the real socket.
async fn pump_tcp(
    mut handle: crate::stream::StreamHandle,
    socket: TcpStream,
    cancel: CancellationToken,
    _guard: ActiveGuard,
) {
    let (mut sock_read, mut sock_write) = socket.into_split();
    let sender = handle.sender();

    // Socket -> mesh: each read fills at most one sealed frame.
    let read_cancel = cancel.clone();
    let to_mesh = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PLAINTEXT];
        loop {
            let n = tokio::select! {
                _ = read_cancel.cancelled() => break,
                res = sock_read.read(&mut buf) => match res {
                    Ok(0) => {
                        let _ = sender.finish_write();
                        break;
                    }
                    Ok(n) => n,
                    Err(_) => {
                        sender.reset(ErrorCode::WRITE_FAILED);
                        break;
                    }
                },
            };
            if sender.send(&buf[..n]).is_err() {
                break;
            }
        }
    });

    // Mesh -> socket. A failed socket write half-closes with FIN_READ
    // rather than resetting: inbound gets discarded while the socket's
    // read side keeps draining toward the mesh.
    let mut discard = false;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            res = handle.recv() => res,
        };
        match chunk {
            Ok(Some(data)) => {
                if discard {
                    continue;
                }
                if sock_write.write_all(&data).await.is_err() {
                    let _ = handle.finish_read();
                    discard = true;
                }
            }
            Ok(None) => {
                // Remote finished writing: close our write half, keep
                // reading the socket until EOF.
                let _ = sock_write.shutdown().await;
                break;
            }
            Err(StreamError::Crypto(err)) => {
                warn!(target: "trellis::exit", %err, "sealed frame rejected");
                break;
            }
            Err(_) => break,
        }
    }

    let _ = to_mesh.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::identity::AgentId;
    use crate::routing::RouteDest;

    fn handler(enabled: bool, routes: &[&str]) -> ExitHandler {
        let routing = Arc::new(RoutingEngine::new(
            AgentId::random(),
            "exit".into(),
            RoutingConfig::default(),
            routes.iter().map(|r| RouteDest::parse(r).unwrap()).collect(),
        ));
        let registry = crate::peer::PeerRegistry::new();
        let manager = StreamManager::new(registry, crate::config::LimitsConfig::default(), 16);
        ExitHandler::new(
            ExitConfig {
                enabled,
                routes: routes.iter().map(|s| s.to_string()).collect(),
                ..ExitConfig::default()
            },
            manager,
            routing,
            Arc::new(SystemResolver::new(&DnsConfig::default())),
            CancellationToken::new(),
        )
    }

    fn open_for(dest: &str, port: u16) -> StreamOpen {
        StreamOpen {
            request_id: 1,
            dest: DestAddr::Ipv4(dest.parse().unwrap()),
            port,
            ttl: 16,
            path: Vec::new(),
            ephemeral_pub: EphemeralKeyPair::generate().public_bytes(),
        }
    }

    #[test]
    fn admission_gates() {
        let h = handler(false, &["127.0.0.0/8"]);
        assert_eq!(
            h.admit(&open_for("127.0.0.1", 80)),
            Err(ErrorCode::EXIT_DISABLED)
        );

        let h = handler(true, &["127.0.0.0/8"]);
        assert_eq!(h.admit(&open_for("127.0.0.1", 80)), Ok(()));
        assert_eq!(
            h.admit(&open_for("8.8.8.8", 53)),
            Err(ErrorCode::NOT_ALLOWED)
        );

        h.active.store(h.config.max_connections, Ordering::Relaxed);
        assert_eq!(
            h.admit(&open_for("127.0.0.1", 80)),
            Err(ErrorCode::CONNECTION_LIMIT)
        );
    }

    #[tokio::test]
    async fn resolver_caches_lookups() {
        let resolver = SystemResolver::new(&DnsConfig::default());
        let first = resolver.resolve("localhost").await.unwrap();
        assert!(!first.is_empty());
        // Second hit comes from cache (observable only as identical data).
        let second = resolver.resolve("localhost").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ip_dest_skips_resolution() {
        let h = handler(true, &["10.0.0.0/8"]);
        let ip = h
            .resolve_dest(&DestAddr::Ipv4("10.1.2.3".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }
}
