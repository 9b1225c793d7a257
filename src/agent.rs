//! Agent orchestrator: owns the peer set, the routing engine, the stream
//! manager, and the exit handlers; dispatches inbound frames; runs the
//! periodic advertisement, expiry, and idle-sweep tasks; and cascades
//! cancellation on shutdown.
//!
//! Components refer to each other through numeric handles (agent ids,
//! stream ids) resolved via the tables owned here, never through direct
//! references, so teardown is a matter of cancelling tasks and draining
//! maps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{ErrorCode, PeerError, StreamError};
use crate::exit::{ExitHandler, Resolver, SystemResolver};
use crate::frame::{
    decode_cbor, encode_cbor, ControlRequest, ControlResponse, DestAddr, Frame, FrameType,
    NodeInfo, PeerSummary, RouteFlood, SetupOp, StreamOpen,
};
use crate::icmp::{IcmpExit, IcmpSocketFactory};
use crate::identity::{AgentId, AgentIdentity};
use crate::peer::{handshake, Direction, FrameDispatcher, PeerHandle, PeerRegistry};
use crate::routing::{RouteDest, RoutingEngine};
use crate::socks::{MeshConnector, Socks5Server};
use crate::stream::{StreamHandle, StreamManager};
use crate::transport::{Transport, TransportDialer};
use crate::udp::UdpExit;

struct AgentInner {
    identity: AgentIdentity,
    config: AgentConfig,
    registry: PeerRegistry,
    manager: StreamManager,
    routing: Arc<RoutingEngine>,
    exit: ExitHandler,
    udp_exit: UdpExit,
    icmp_exit: IcmpExit,
    resolver: Arc<dyn Resolver>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    start_time_unix: u64,
}

/// One mesh agent. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Builds an agent with the default resolver and platform echo socket.
    pub fn new(identity: AgentIdentity, config: AgentConfig) -> Self {
        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::new(&config.exit.dns));
        Self::with_parts(identity, config, resolver, default_icmp_factory())
    }

    /// Full constructor with injectable seams, used by tests and embedders.
    pub fn with_parts(
        identity: AgentIdentity,
        config: AgentConfig,
        resolver: Arc<dyn Resolver>,
        icmp_factory: Arc<dyn IcmpSocketFactory>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let registry = PeerRegistry::new();

        let local_routes: Vec<RouteDest> = if config.exit.enabled {
            config
                .exit
                .routes
                .iter()
                .filter_map(|r| match RouteDest::parse(r) {
                    Ok(dest) => Some(dest),
                    Err(err) => {
                        warn!(target: "trellis::agent", %err, route = %r, "ignoring bad exit route");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let routing = Arc::new(RoutingEngine::new(
            identity.id,
            identity.display_name.clone(),
            config.routing.clone(),
            local_routes,
        ));
        let manager = StreamManager::new(
            registry.clone(),
            config.limits.clone(),
            config.routing.max_hops,
        );
        let exit = ExitHandler::new(
            config.exit.clone(),
            manager.clone(),
            routing.clone(),
            resolver.clone(),
            cancel.child_token(),
        );
        let udp_exit = UdpExit::new(config.udp.clone(), manager.clone(), cancel.child_token());
        let icmp_exit = IcmpExit::new(
            config.icmp.clone(),
            manager.clone(),
            icmp_factory,
            cancel.child_token(),
        );

        Self {
            inner: Arc::new(AgentInner {
                identity,
                config,
                registry,
                manager,
                routing,
                exit,
                udp_exit,
                icmp_exit,
                resolver,
                cancel,
                tracker: TaskTracker::new(),
                start_time_unix: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.identity.id
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.inner.routing
    }

    pub fn manager(&self) -> &StreamManager {
        &self.inner.manager
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Starts the periodic background tasks: route advertiser, route
    /// expirer, node-info advertiser, idle-stream sweeper.
    pub fn start(&self) {
        let agent = self.clone();
        self.inner.tracker.spawn(async move {
            let mut advertise =
                tokio::time::interval(agent.inner.config.routing.advertise_interval());
            loop {
                tokio::select! {
                    _ = agent.inner.cancel.cancelled() => break,
                    _ = advertise.tick() => {
                        agent.advertise_local();
                        agent.advertise_node_info();
                    }
                }
            }
        });

        let agent = self.clone();
        self.inner.tracker.spawn(async move {
            let mut sweep = tokio::time::interval(agent.inner.config.routing.sweep_interval());
            loop {
                tokio::select! {
                    _ = agent.inner.cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        for withdrawal in agent.inner.routing.sweep(std::time::Instant::now()) {
                            agent.broadcast_flood(&withdrawal, true, None);
                        }
                    }
                }
            }
        });

        let agent = self.clone();
        self.inner.tracker.spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = agent.inner.cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        agent.inner.manager.sweep_idle(std::time::Instant::now()).await;
                    }
                }
            }
        });
    }

    /// Dial-side connection establishment.
    pub async fn connect_transport(
        &self,
        transport: Box<dyn Transport>,
    ) -> Result<PeerHandle, PeerError> {
        self.establish(transport, Direction::Dialed).await
    }

    /// Listener-side connection establishment.
    pub async fn accept_transport(
        &self,
        transport: Box<dyn Transport>,
    ) -> Result<PeerHandle, PeerError> {
        self.establish(transport, Direction::Accepted).await
    }

    async fn establish(
        &self,
        transport: Box<dyn Transport>,
        direction: Direction,
    ) -> Result<PeerHandle, PeerError> {
        let established = handshake(
            transport,
            self.id(),
            &self.inner.identity.display_name,
            self.capabilities(),
            direction,
            self.inner.config.connections.handshake_timeout(),
        )
        .await?;

        let dispatcher: Arc<dyn FrameDispatcher> = Arc::new(Dispatch {
            inner: self.inner.clone(),
        });
        let handle = established.spawn(
            dispatcher,
            &self.inner.config.connections,
            &self.inner.cancel,
            &self.inner.tracker,
        );

        // Newest connection per (agent, transport) wins; the older one is
        // torn down before anything opens on the new one.
        if let Some(older) = self.inner.registry.insert(handle.clone()) {
            info!(
                target: "trellis::agent",
                peer = %handle.id().short(),
                "superseding older connection"
            );
            older.close(PeerError::Superseded);
        }

        // Seed the fresh peer with our current view.
        if let Some(ad) = self.inner.routing.local_advertisement() {
            if let Ok(payload) = encode_cbor(&ad) {
                let _ = handle.send_control(Frame::control(FrameType::RouteAdvertise, payload));
            }
        }
        let info = self.local_node_info();
        if let Ok(payload) = encode_cbor(&info) {
            let _ = handle.send_control(Frame::control(FrameType::NodeInfoAdvertise, payload));
        }

        Ok(handle)
    }

    /// Registers a configured peer: dial, run, and re-dial with exponential
    /// backoff whenever the connection dies.
    pub fn add_peer(&self, dialer: Arc<dyn TransportDialer>) {
        let agent = self.clone();
        self.inner.tracker.spawn(async move {
            let reconnect = agent.inner.config.connections.reconnect.clone();
            let mut attempt: u32 = 0;
            loop {
                if agent.inner.cancel.is_cancelled() {
                    break;
                }
                match dialer.dial().await {
                    Ok(transport) => match agent.connect_transport(transport).await {
                        Ok(handle) => {
                            attempt = 0;
                            handle.closed().await;
                            if agent.inner.cancel.is_cancelled() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(target: "trellis::agent", %err, "peer handshake failed");
                        }
                    },
                    Err(err) => {
                        debug!(target: "trellis::agent", %err, "peer dial failed");
                    }
                }
                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        warn!(target: "trellis::agent", "giving up on peer after {max} retries");
                        break;
                    }
                }
                let delay = reconnect.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = agent.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }

    /// Binds the SOCKS5 ingress listener per configuration and returns the
    /// bound address.
    pub async fn bind_socks(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.inner.config.socks5.address).await?;
        let addr = listener.local_addr()?;
        let server = Arc::new(Socks5Server::new(
            self.inner.config.socks5.clone(),
            Arc::new(self.clone()),
            self.inner.cancel.child_token(),
        ));
        self.inner.tracker.spawn(server.run(listener));
        info!(target: "trellis::agent", %addr, "socks5 ingress listening");
        Ok(addr)
    }

    /// Opens a TCP stream through the mesh toward the destination.
    pub async fn open_stream(
        &self,
        dest: DestAddr,
        port: u16,
    ) -> Result<StreamHandle, StreamError> {
        self.connect_tcp(dest, port).await
    }

    /// Opens an ICMP echo session toward `target`.
    pub async fn open_icmp(&self, target: DestAddr) -> Result<StreamHandle, StreamError> {
        let table = self.inner.routing.table();
        let entry = table.lookup_dest(&target).ok_or(StreamError::NoRoute)?;
        let peer = self
            .inner
            .registry
            .get(&entry.via)
            .ok_or(StreamError::PeerGone)?;
        self.inner.manager.open_icmp(&peer, target).await
    }

    /// Cooperative shutdown: cancel every task, resolve pending work, wait
    /// for the writers to flush.
    pub async fn shutdown(&self) {
        info!(target: "trellis::agent", id = %self.id().short(), "shutting down");
        self.inner.cancel.cancel();
        self.inner.manager.shutdown();
        self.inner.tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.inner.tracker.wait()).await;
        self.inner.exit.drain().await;
        self.inner.udp_exit.drain().await;
        self.inner.icmp_exit.drain().await;
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps = vec!["tcp".to_string()];
        if self.inner.config.udp.enabled {
            caps.push("udp".to_string());
        }
        if self.inner.config.icmp.enabled {
            caps.push("icmp".to_string());
        }
        if self.inner.config.exit.enabled {
            caps.push("exit".to_string());
        }
        caps
    }

    fn local_node_info(&self) -> NodeInfo {
        let peers = self
            .inner
            .registry
            .list()
            .into_iter()
            .map(|p| PeerSummary {
                id: p.id(),
                transport: p.kind(),
                direction: p.direction().as_str().to_string(),
            })
            .collect();
        self.inner.routing.local_node_info(
            peers,
            Vec::new(),
            self.inner.start_time_unix,
            self.inner
                .identity
                .management_public_key()
                .as_bytes()
                .to_vec(),
        )
    }

    fn advertise_local(&self) {
        if let Some(flood) = self.inner.routing.local_advertisement() {
            self.broadcast_flood(&flood, false, None);
        }
    }

    fn advertise_node_info(&self) {
        let info = self.local_node_info();
        let Ok(payload) = encode_cbor(&info) else {
            return;
        };
        for peer in self.inner.registry.list() {
            if info.seen_by.contains(&peer.id()) {
                continue;
            }
            let _ = peer.send_control(Frame::control(FrameType::NodeInfoAdvertise, payload.clone()));
        }
    }

    fn broadcast_flood(&self, flood: &RouteFlood, withdraw: bool, exclude: Option<AgentId>) {
        let frame_type = if withdraw {
            FrameType::RouteWithdraw
        } else {
            FrameType::RouteAdvertise
        };
        let Ok(payload) = encode_cbor(flood) else {
            return;
        };
        for peer in self.inner.registry.list() {
            if Some(peer.id()) == exclude || flood.seen_by.contains(&peer.id()) {
                continue;
            }
            let _ = peer.send_control(Frame::control(frame_type, payload.clone()));
        }
    }
}

#[async_trait]
impl MeshConnector for Agent {
    async fn connect_tcp(&self, dest: DestAddr, port: u16) -> Result<StreamHandle, StreamError> {
        let (open_dest, via) = self.route_for(&dest).await?;
        let peer = self
            .inner
            .registry
            .get(&via)
            .ok_or(StreamError::PeerGone)?;
        self.inner.manager.open_tcp(&peer, open_dest, port).await
    }

    async fn connect_udp(&self, hint: DestAddr, port: u16) -> Result<StreamHandle, StreamError> {
        let table = self.inner.routing.table();
        // A client usually declares an unspecified destination on UDP
        // ASSOCIATE; fall back to the best exit we know and rewrite the
        // hint so transit agents can route the open.
        let (hint, via) = match table.lookup_dest(&hint) {
            Some(entry) => (hint, entry.via),
            None => {
                let entry = table
                    .iter()
                    .min_by_key(|e| e.metric)
                    .ok_or(StreamError::NoRoute)?;
                let routable = match &entry.dest {
                    RouteDest::Cidr(prefix) => DestAddr::from_ip(prefix.ip()),
                    RouteDest::Domain(_) => hint,
                };
                (routable, entry.via)
            }
        };
        let peer = self
            .inner
            .registry
            .get(&via)
            .ok_or(StreamError::PeerGone)?;
        self.inner.manager.open_udp(&peer, hint, port).await
    }
}

impl Agent {
    /// Route selection for a stream open. Domains prefer a domain-pattern
    /// route (resolved at the exit); without one, resolution happens here
    /// at the ingress and the open is IP-targeted.
    async fn route_for(&self, dest: &DestAddr) -> Result<(DestAddr, AgentId), StreamError> {
        let table = self.inner.routing.table();
        match dest {
            DestAddr::Domain(name) => {
                if let Some(entry) = table.lookup_domain(name) {
                    return Ok((dest.clone(), entry.via));
                }
                let ips = self
                    .inner
                    .resolver
                    .resolve(name)
                    .await
                    .map_err(|code| StreamError::Rejected {
                        code,
                        message: format!("cannot resolve {name}"),
                    })?;
                let ip = ips
                    .iter()
                    .find(|ip| ip.is_ipv4())
                    .or_else(|| ips.first())
                    .copied()
                    .ok_or(StreamError::Rejected {
                        code: ErrorCode::DNS_ERROR,
                        message: "empty resolution".into(),
                    })?;
                let ip_dest = DestAddr::from_ip(ip);
                let entry = table.lookup_dest(&ip_dest).ok_or(StreamError::NoRoute)?;
                Ok((ip_dest, entry.via))
            }
            other => {
                let entry = table.lookup_dest(other).ok_or(StreamError::NoRoute)?;
                Ok((other.clone(), entry.via))
            }
        }
    }
}

fn default_icmp_factory() -> Arc<dyn IcmpSocketFactory> {
    #[cfg(unix)]
    {
        Arc::new(crate::icmp::dgram::DgramIcmpFactory)
    }
    #[cfg(not(unix))]
    {
        Arc::new(crate::icmp::LoopbackIcmpFactory)
    }
}

fn dest_is_unspecified(dest: &DestAddr) -> bool {
    match dest {
        DestAddr::Ipv4(ip) => ip.is_unspecified(),
        DestAddr::Ipv6(ip) => ip.is_unspecified(),
        DestAddr::Domain(name) => name.is_empty(),
    }
}

/// The agent's frame dispatcher, handed to every peer reader.
struct Dispatch {
    inner: Arc<AgentInner>,
}

impl Dispatch {
    fn agent(&self) -> Agent {
        Agent {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl FrameDispatcher for Dispatch {
    async fn on_frame(&self, from: &PeerHandle, frame: Frame) {
        let inner = &self.inner;
        match frame.header.frame_type {
            FrameType::RouteAdvertise | FrameType::RouteWithdraw => {
                let withdraw = frame.header.frame_type == FrameType::RouteWithdraw;
                let Ok(flood) = decode_cbor::<RouteFlood>(&frame.payload) else {
                    warn!(target: "trellis::agent", "undecodable route flood");
                    return;
                };
                if let Some(forward) = inner.routing.handle_flood(from.id(), flood, withdraw) {
                    self.agent().broadcast_flood(&forward, withdraw, Some(from.id()));
                }
            }
            FrameType::NodeInfoAdvertise => {
                let Ok(info) = decode_cbor::<NodeInfo>(&frame.payload) else {
                    return;
                };
                if let Some(forward) = inner.routing.handle_node_info(from.id(), info) {
                    if let Ok(payload) = encode_cbor(&forward) {
                        for peer in inner.registry.list() {
                            if peer.id() == from.id() || forward.seen_by.contains(&peer.id()) {
                                continue;
                            }
                            let _ = peer.send_control(Frame::control(
                                FrameType::NodeInfoAdvertise,
                                payload.clone(),
                            ));
                        }
                    }
                }
            }
            FrameType::ControlRequest => {
                if let Ok(request) = decode_cbor::<ControlRequest>(&frame.payload) {
                    self.handle_control(from, request);
                }
            }
            FrameType::ControlResponse => {
                // Management-plane reporting is an external collaborator;
                // responses arriving here are logged and dropped.
                debug!(target: "trellis::agent", "control response without a local waiter");
            }
            FrameType::StreamOpen => {
                if inner.manager.bridge_forward(from, &frame) {
                    return;
                }
                let Ok(open) = StreamOpen::decode(frame.payload.clone()) else {
                    warn!(target: "trellis::agent", "undecodable stream open");
                    return;
                };
                if inner.routing.serves(&open.dest) {
                    inner
                        .exit
                        .handle_open(from, frame.header.stream_id, open)
                        .await;
                } else {
                    let table = inner.routing.table();
                    inner
                        .manager
                        .transit_open(from, frame.header.stream_id, open, &table);
                }
            }
            FrameType::UdpSetup | FrameType::IcmpSetup => {
                if inner.manager.bridge_forward(from, &frame) {
                    return;
                }
                let Ok(op) = SetupOp::decode(frame.payload.clone()) else {
                    return;
                };
                match &op {
                    SetupOp::Open { dest, .. } => {
                        let local = inner.routing.serves(dest)
                            || (dest_is_unspecified(dest)
                                && frame.header.frame_type == FrameType::UdpSetup
                                && inner.config.udp.enabled);
                        if local {
                            if frame.header.frame_type == FrameType::UdpSetup {
                                inner
                                    .udp_exit
                                    .handle_open(from, frame.header.stream_id, op)
                                    .await;
                            } else {
                                inner
                                    .icmp_exit
                                    .handle_open(from, frame.header.stream_id, op)
                                    .await;
                            }
                        } else {
                            let table = inner.routing.table();
                            inner.manager.transit_setup(
                                from,
                                frame.header.stream_id,
                                frame.header.frame_type,
                                op,
                                &table,
                            );
                        }
                    }
                    _ => inner.manager.on_setup_reply(from, op),
                }
            }
            t if t.is_stream() => {
                if inner.manager.bridge_forward(from, &frame) {
                    return;
                }
                inner.manager.on_stream_frame(from, frame).await;
            }
            _ => {}
        }
    }

    async fn on_peer_closed(&self, peer: &PeerHandle, reason: &PeerError) {
        info!(
            target: "trellis::agent",
            peer = %peer.id().short(),
            %reason,
            "peer connection closed"
        );
        self.inner.registry.remove(peer);
        // A superseded connection leaves a live replacement in the
        // registry; its routes and new streams must survive the old
        // connection's teardown.
        if self.inner.registry.get(&peer.id()).is_some() {
            return;
        }
        self.inner.manager.peer_closed(&peer.id()).await;
        self.inner.routing.peer_lost(&peer.id());
    }
}

impl Dispatch {
    fn handle_control(&self, from: &PeerHandle, request: ControlRequest) {
        let inner = &self.inner;
        let local = request.target.is_none() || request.target == Some(inner.identity.id);
        if !local {
            // Source-routed control: forward toward the target when it is a
            // direct peer, otherwise drop.
            if let Some(target) = request.target {
                if let Some(next) = inner.registry.get(&target) {
                    if let Ok(payload) = encode_cbor(&request) {
                        let _ = next.send_control(Frame::control(
                            FrameType::ControlRequest,
                            payload,
                        ));
                    }
                    return;
                }
            }
            let response = ControlResponse {
                request_id: request.request_id,
                kind: request.kind.clone(),
                success: false,
                data: serde_json::json!({"error": "target unreachable"}),
            };
            if let Ok(payload) = encode_cbor(&response) {
                let _ = from.send_control(Frame::control(FrameType::ControlResponse, payload));
            }
            return;
        }

        let (success, data) = match request.kind.as_str() {
            "ping" => (
                true,
                serde_json::json!({"ts_ns": crate::peer::now_unix_ns()}),
            ),
            "info" => {
                let agent = self.agent();
                let info = agent.local_node_info();
                (
                    true,
                    serde_json::to_value(&info).unwrap_or(serde_json::Value::Null),
                )
            }
            "streams" => (
                true,
                serde_json::json!({
                    "local": inner.manager.total_streams(),
                    "bridged": inner.manager.bridge_count(),
                }),
            ),
            other => (
                false,
                serde_json::json!({"error": format!("unknown control kind {other}")}),
            ),
        };
        let response = ControlResponse {
            request_id: request.request_id,
            kind: request.kind,
            success,
            data,
        };
        if let Ok(payload) = encode_cbor(&response) {
            let _ = from.send_control(Frame::control(FrameType::ControlResponse, payload));
        }
    }
}
