//! Virtual stream layer: lifecycle, request correlation, half-close,
//! transit bridging, and the per-stream E2E key plumbing.
//!
//! The manager owns three tables keyed by numeric handles (never direct
//! references): locally terminated streams at `(peer, stream id)`, pending
//! opens at their request id, and transit bridges mapping an ingress
//! `(peer, stream id)` to its egress counterpart. Bridged frames are
//! forwarded without payload inspection; the ciphertext stays opaque here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub mod state;

pub use state::StreamState;

use crate::config::LimitsConfig;
use crate::crypto::{EphemeralKeyPair, Role, SessionKey, MAX_PLAINTEXT};
use crate::error::{ErrorCode, StreamError};
use crate::frame::{
    decode_reset, encode_reset, DestAddr, Frame, FrameType, IcmpEcho, SetupOp, StreamOpen,
    StreamOpenAck, StreamOpenErr, UdpDatagram, FLAG_FIN_READ, FLAG_FIN_WRITE,
};
use crate::identity::AgentId;
use crate::peer::{PeerHandle, PeerRegistry};
use crate::routing::RouteTable;

/// What kind of real socket the exit binds for this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
    Icmp,
}

impl StreamKind {
    fn open_frame_type(self) -> FrameType {
        match self {
            StreamKind::Tcp => FrameType::StreamOpen,
            StreamKind::Udp => FrameType::UdpSetup,
            StreamKind::Icmp => FrameType::IcmpSetup,
        }
    }
}

/// Events delivered to the owner of a stream, in arrival order.
#[derive(Debug)]
pub enum StreamEvent {
    /// Sealed stream bytes; `fin` set when the sender finished writing.
    Data { payload: Bytes, fin: bool },
    /// Sealed datagram with its wire address (UDP associations).
    Datagram(UdpDatagram),
    /// Sealed echo payload (ICMP sessions).
    Echo(IcmpEcho),
    Close,
    Reset(ErrorCode),
}

struct StreamShared {
    peer_id: AgentId,
    stream_id: u64,
    request_id: u64,
    kind: StreamKind,
    dest: DestAddr,
    port: u16,
    state: Mutex<StreamState>,
    key: OnceLock<Arc<SessionKey>>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl StreamShared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

struct StreamRecord {
    shared: Arc<StreamShared>,
    tx: mpsc::Sender<StreamEvent>,
}

struct ResolvedOpen {
    key: Arc<SessionKey>,
    bound: Option<(DestAddr, u16)>,
}

struct PendingOpen {
    peer: AgentId,
    keypair: Option<EphemeralKeyPair>,
    tx: oneshot::Sender<Result<ResolvedOpen, StreamError>>,
}

struct Inner {
    registry: PeerRegistry,
    limits: LimitsConfig,
    default_ttl: u8,
    streams: Mutex<HashMap<(AgentId, u64), StreamRecord>>,
    pending: Mutex<HashMap<u64, PendingOpen>>,
    bridges: Mutex<HashMap<(AgentId, u64), (AgentId, u64)>>,
    next_request_id: AtomicU64,
}

/// Owns every virtual stream crossing this agent.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(registry: PeerRegistry, limits: LimitsConfig, default_ttl: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                limits,
                default_ttl,
                streams: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                bridges: Mutex::new(HashMap::new()),
                // Random start keeps request ids from colliding across
                // restarts of the same agent.
                next_request_id: AtomicU64::new(rand::random::<u64>() >> 1),
            }),
        }
    }

    pub fn total_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn streams_for_peer(&self, peer: &AgentId) -> usize {
        self.inner
            .streams
            .lock()
            .keys()
            .filter(|(id, _)| id == peer)
            .count()
    }

    pub fn bridge_count(&self) -> usize {
        self.inner.bridges.lock().len() / 2
    }

    fn pending_for_peer(&self, peer: &AgentId) -> usize {
        self.inner
            .pending
            .lock()
            .values()
            .filter(|p| p.peer == *peer)
            .count()
    }

    fn check_open_limits(&self, peer: &AgentId) -> Result<(), StreamError> {
        let limits = &self.inner.limits;
        if self.total_streams() >= limits.max_streams_total
            || self.streams_for_peer(peer) >= limits.max_streams_per_peer
            || self.pending_for_peer(peer) >= limits.max_pending_opens
        {
            return Err(StreamError::ResourceLimit);
        }
        Ok(())
    }

    /// Opens a TCP stream through `peer` toward the destination.
    pub async fn open_tcp(
        &self,
        peer: &PeerHandle,
        dest: DestAddr,
        port: u16,
    ) -> Result<StreamHandle, StreamError> {
        self.open(peer, StreamKind::Tcp, dest, port).await
    }

    /// Opens a UDP association; `hint` routes the open through transit
    /// agents and may be the unspecified address.
    pub async fn open_udp(
        &self,
        peer: &PeerHandle,
        hint: DestAddr,
        port: u16,
    ) -> Result<StreamHandle, StreamError> {
        self.open(peer, StreamKind::Udp, hint, port).await
    }

    /// Opens an ICMP echo session toward a fixed target.
    pub async fn open_icmp(
        &self,
        peer: &PeerHandle,
        target: DestAddr,
    ) -> Result<StreamHandle, StreamError> {
        self.open(peer, StreamKind::Icmp, target, 0).await
    }

    async fn open(
        &self,
        peer: &PeerHandle,
        kind: StreamKind,
        dest: DestAddr,
        port: u16,
    ) -> Result<StreamHandle, StreamError> {
        self.check_open_limits(&peer.id())?;

        let stream_id = peer.allocate_stream_id();
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let keypair = EphemeralKeyPair::generate();
        let ephemeral_pub = keypair.public_bytes();

        let (event_tx, event_rx) = mpsc::channel(self.inner.limits.buffer_size.max(1));
        let shared = Arc::new(StreamShared {
            peer_id: peer.id(),
            stream_id,
            request_id,
            kind,
            dest: dest.clone(),
            port,
            state: Mutex::new(StreamState::Opening),
            key: OnceLock::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        });
        self.inner.streams.lock().insert(
            (peer.id(), stream_id),
            StreamRecord {
                shared: shared.clone(),
                tx: event_tx,
            },
        );

        let (open_tx, open_rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            request_id,
            PendingOpen {
                peer: peer.id(),
                keypair: Some(keypair),
                tx: open_tx,
            },
        );

        let payload = match kind {
            StreamKind::Tcp => StreamOpen {
                request_id,
                dest: dest.clone(),
                port,
                ttl: self.inner.default_ttl,
                path: Vec::new(),
                ephemeral_pub,
            }
            .encode(),
            StreamKind::Udp | StreamKind::Icmp => SetupOp::Open {
                request_id,
                dest: dest.clone(),
                port,
                ttl: self.inner.default_ttl,
                ephemeral_pub,
            }
            .encode(),
        };
        let frame = Frame::new(kind.open_frame_type(), stream_id, payload);
        if peer.send_data(frame).is_err() {
            self.drop_pending(request_id);
            self.remove_stream(&peer.id(), stream_id);
            return Err(StreamError::PeerGone);
        }

        let outcome =
            tokio::time::timeout(self.inner.limits.stream_open_timeout(), open_rx).await;
        match outcome {
            Ok(Ok(Ok(resolved))) => {
                let _ = shared.key.set(resolved.key);
                *shared.state.lock() = StreamState::Open;
                Ok(StreamHandle {
                    sender: StreamSender {
                        shared,
                        peer: peer.clone(),
                        manager: self.clone(),
                    },
                    rx: event_rx,
                    bound: resolved.bound,
                    eof: false,
                })
            }
            Ok(Ok(Err(err))) => {
                self.remove_stream(&peer.id(), stream_id);
                Err(err)
            }
            Ok(Err(_)) => {
                self.remove_stream(&peer.id(), stream_id);
                Err(StreamError::Cancelled)
            }
            Err(_) => {
                self.drop_pending(request_id);
                self.remove_stream(&peer.id(), stream_id);
                Err(StreamError::OpenTimeout)
            }
        }
    }

    /// Registers an exit-side stream whose key is already derived; the exit
    /// handler sends its own acknowledgement.
    #[allow(clippy::too_many_arguments)]
    pub fn register_responder(
        &self,
        peer: &PeerHandle,
        stream_id: u64,
        request_id: u64,
        kind: StreamKind,
        dest: DestAddr,
        port: u16,
        key: SessionKey,
    ) -> StreamHandle {
        let (event_tx, event_rx) = mpsc::channel(self.inner.limits.buffer_size.max(1));
        let shared = Arc::new(StreamShared {
            peer_id: peer.id(),
            stream_id,
            request_id,
            kind,
            dest,
            port,
            state: Mutex::new(StreamState::Open),
            key: OnceLock::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        });
        let _ = shared.key.set(Arc::new(key));
        self.inner.streams.lock().insert(
            (peer.id(), stream_id),
            StreamRecord {
                shared: shared.clone(),
                tx: event_tx,
            },
        );
        StreamHandle {
            sender: StreamSender {
                shared,
                peer: peer.clone(),
                manager: self.clone(),
            },
            rx: event_rx,
            bound: None,
            eof: false,
        }
    }

    fn drop_pending(&self, request_id: u64) {
        // Dropping the entry zeroizes the ephemeral private key.
        self.inner.pending.lock().remove(&request_id);
    }

    fn remove_stream(&self, peer: &AgentId, stream_id: u64) {
        self.inner.streams.lock().remove(&(*peer, stream_id));
    }

    fn remove_stream_if(&self, peer: &AgentId, stream_id: u64, shared: &Arc<StreamShared>) {
        let mut streams = self.inner.streams.lock();
        if let Some(record) = streams.get(&(*peer, stream_id)) {
            if Arc::ptr_eq(&record.shared, shared) {
                streams.remove(&(*peer, stream_id));
            }
        }
    }

    /// Resolves a pending open with the responder's ephemeral key,
    /// deriving the session key in the initiator role. The ephemeral
    /// private key is consumed (and zeroized) here.
    fn resolve_ack(
        &self,
        from: AgentId,
        request_id: u64,
        responder_pub: [u8; 32],
        bound: Option<(DestAddr, u16)>,
    ) {
        let pending = {
            let mut map = self.inner.pending.lock();
            let from_expected_peer = map.get(&request_id).map(|p| p.peer == from);
            if from_expected_peer == Some(true) {
                map.remove(&request_id)
            } else {
                None
            }
        };
        let Some(mut pending) = pending else {
            debug!(target: "trellis::stream", request_id, "ack for unknown open");
            return;
        };
        let Some(keypair) = pending.keypair.take() else {
            return;
        };
        let initiator_pub = keypair.public_bytes();
        let secret = keypair.agree(&responder_pub);
        let key = SessionKey::derive(
            secret,
            request_id,
            &initiator_pub,
            &responder_pub,
            Role::Initiator,
        );
        let _ = pending.tx.send(Ok(ResolvedOpen {
            key: Arc::new(key),
            bound,
        }));
    }

    fn resolve_err(&self, from: AgentId, request_id: u64, code: ErrorCode, message: String) {
        let pending = {
            let mut map = self.inner.pending.lock();
            let from_expected_peer = map.get(&request_id).map(|p| p.peer == from);
            if from_expected_peer == Some(true) {
                map.remove(&request_id)
            } else {
                None
            }
        };
        if let Some(pending) = pending {
            let _ = pending.tx.send(Err(StreamError::Rejected { code, message }));
        }
    }

    /// Forwards a frame across a transit bridge if one exists for
    /// `(sender, stream id)`. Returns true when the frame was consumed.
    pub fn bridge_forward(&self, from: &PeerHandle, frame: &Frame) -> bool {
        let ingress_key = (from.id(), frame.header.stream_id);
        let Some((peer_id, egress_sid)) = self.inner.bridges.lock().get(&ingress_key).copied()
        else {
            return false;
        };

        let teardown = matches!(
            frame.header.frame_type,
            FrameType::StreamClose
                | FrameType::StreamReset
                | FrameType::StreamOpenErr
                | FrameType::UdpClose
                | FrameType::IcmpClose
        );

        match self.inner.registry.get(&peer_id) {
            Some(egress) => {
                let mut forwarded = frame.clone();
                forwarded.header.stream_id = egress_sid;
                if egress.send_data(forwarded).is_err() {
                    let reset = Frame::new(
                        FrameType::StreamReset,
                        frame.header.stream_id,
                        encode_reset(ErrorCode::CONNECTION_TIMEOUT),
                    );
                    let _ = from.send_data(reset);
                    self.remove_bridge(&ingress_key, &(peer_id, egress_sid));
                    return true;
                }
            }
            None => {
                let reset = Frame::new(
                    FrameType::StreamReset,
                    frame.header.stream_id,
                    encode_reset(ErrorCode::CONNECTION_TIMEOUT),
                );
                let _ = from.send_data(reset);
                self.remove_bridge(&ingress_key, &(peer_id, egress_sid));
                return true;
            }
        }

        if teardown {
            self.remove_bridge(&ingress_key, &(peer_id, egress_sid));
        }
        true
    }

    fn remove_bridge(&self, a: &(AgentId, u64), b: &(AgentId, u64)) {
        let mut bridges = self.inner.bridges.lock();
        bridges.remove(a);
        bridges.remove(b);
    }

    /// Handles a STREAM_OPEN arriving at a transit node: burn a hop, pick
    /// the egress, record the bridge, forward the payload untouched apart
    /// from the decremented TTL.
    pub fn transit_open(
        &self,
        from: &PeerHandle,
        stream_id: u64,
        open: StreamOpen,
        table: &RouteTable,
    ) {
        if open.ttl <= 1 {
            self.send_open_err(
                from,
                stream_id,
                StreamOpenErr::new(open.request_id, ErrorCode::TTL_EXCEEDED, "hop budget spent"),
            );
            return;
        }
        let (remaining_path, egress) =
            match self.pick_egress(from, &open.dest, &open.path, table) {
                Ok(pick) => pick,
                Err(code) => {
                    self.send_open_err(
                        from,
                        stream_id,
                        StreamOpenErr::new(open.request_id, code, "no usable next hop"),
                    );
                    return;
                }
            };
        if self.bridge_count() >= self.inner.limits.max_streams_total {
            self.send_open_err(
                from,
                stream_id,
                StreamOpenErr::new(open.request_id, ErrorCode::RESOURCE_LIMIT, "transit full"),
            );
            return;
        }

        let egress_sid = egress.allocate_stream_id();
        {
            let mut bridges = self.inner.bridges.lock();
            bridges.insert((from.id(), stream_id), (egress.id(), egress_sid));
            bridges.insert((egress.id(), egress_sid), (from.id(), stream_id));
        }

        let forwarded = StreamOpen {
            ttl: open.ttl - 1,
            path: remaining_path,
            ..open
        };
        let frame = Frame::new(FrameType::StreamOpen, egress_sid, forwarded.encode());
        if egress.send_data(frame).is_err() {
            self.remove_bridge(&(from.id(), stream_id), &(egress.id(), egress_sid));
            self.send_open_err(
                from,
                stream_id,
                StreamOpenErr::new(
                    forwarded.request_id,
                    ErrorCode::CONNECTION_TIMEOUT,
                    "next hop unavailable",
                ),
            );
        }
    }

    /// Transit handling for UDP/ICMP association opens, identical to
    /// stream opens apart from the frame type.
    pub fn transit_setup(
        &self,
        from: &PeerHandle,
        stream_id: u64,
        frame_type: FrameType,
        op: SetupOp,
        table: &RouteTable,
    ) {
        let SetupOp::Open {
            request_id,
            dest,
            port,
            ttl,
            ephemeral_pub,
        } = op
        else {
            return;
        };
        if ttl <= 1 {
            self.send_setup_err(from, stream_id, frame_type, request_id, ErrorCode::TTL_EXCEEDED);
            return;
        }
        let (_, egress) = match self.pick_egress(from, &dest, &[], table) {
            Ok(pick) => pick,
            Err(code) => {
                self.send_setup_err(from, stream_id, frame_type, request_id, code);
                return;
            }
        };

        let egress_sid = egress.allocate_stream_id();
        {
            let mut bridges = self.inner.bridges.lock();
            bridges.insert((from.id(), stream_id), (egress.id(), egress_sid));
            bridges.insert((egress.id(), egress_sid), (from.id(), stream_id));
        }
        let forwarded = SetupOp::Open {
            request_id,
            dest,
            port,
            ttl: ttl - 1,
            ephemeral_pub,
        };
        let frame = Frame::new(frame_type, egress_sid, forwarded.encode());
        if egress.send_data(frame).is_err() {
            self.remove_bridge(&(from.id(), stream_id), &(egress.id(), egress_sid));
            self.send_setup_err(
                from,
                stream_id,
                frame_type,
                request_id,
                ErrorCode::CONNECTION_TIMEOUT,
            );
        }
    }

    fn pick_egress(
        &self,
        from: &PeerHandle,
        dest: &DestAddr,
        explicit_path: &[AgentId],
        table: &RouteTable,
    ) -> Result<(Vec<AgentId>, PeerHandle), ErrorCode> {
        let (next_hop, remaining) = if let Some((next, rest)) = explicit_path.split_first() {
            (*next, rest.to_vec())
        } else {
            let entry = table.lookup_dest(dest).ok_or(ErrorCode::NO_ROUTE)?;
            (entry.via, Vec::new())
        };
        let egress = self
            .inner
            .registry
            .get(&next_hop)
            .ok_or(ErrorCode::NO_ROUTE)?;
        if egress.id() == from.id() {
            return Err(ErrorCode::NO_ROUTE);
        }
        Ok((remaining, egress))
    }

    pub fn send_open_err(&self, peer: &PeerHandle, stream_id: u64, err: StreamOpenErr) {
        let frame = Frame::new(FrameType::StreamOpenErr, stream_id, err.encode());
        let _ = peer.send_data(frame);
    }

    pub fn send_setup_err(
        &self,
        peer: &PeerHandle,
        stream_id: u64,
        frame_type: FrameType,
        request_id: u64,
        code: ErrorCode,
    ) {
        let op = SetupOp::Err {
            request_id,
            code,
            message: code.name().to_string(),
        };
        let _ = peer.send_data(Frame::new(frame_type, stream_id, op.encode()));
    }

    /// Resolution of a UDP/ICMP setup ack or err on the ingress side.
    pub fn on_setup_reply(&self, from: &PeerHandle, op: SetupOp) {
        match op {
            SetupOp::Ack {
                request_id,
                ephemeral_pub,
            } => self.resolve_ack(from.id(), request_id, ephemeral_pub, None),
            SetupOp::Err {
                request_id,
                code,
                message,
            } => self.resolve_err(from.id(), request_id, code, message),
            SetupOp::Open { .. } => {}
        }
    }

    /// Handles every locally terminated stream frame (data, close, reset,
    /// acks, datagrams, echoes). Bridged frames must be tried with
    /// [`bridge_forward`] first.
    pub async fn on_stream_frame(&self, from: &PeerHandle, frame: Frame) {
        let stream_id = frame.header.stream_id;
        match frame.header.frame_type {
            FrameType::StreamOpenAck => {
                if let Ok(ack) = StreamOpenAck::decode(frame.payload) {
                    self.resolve_ack(
                        from.id(),
                        ack.request_id,
                        ack.ephemeral_pub,
                        Some((ack.bound, ack.bound_port)),
                    );
                }
            }
            FrameType::StreamOpenErr => {
                if let Ok(err) = StreamOpenErr::decode(frame.payload) {
                    self.resolve_err(from.id(), err.request_id, err.code, err.message);
                }
            }
            FrameType::StreamData => {
                if frame.header.fin_read() {
                    // The remote will discard anything further; stop
                    // producing on this side.
                    if let Some(shared) = self.shared_for(&from.id(), stream_id) {
                        let mut state = shared.state.lock();
                        *state = state.after_local_fin();
                    }
                }
                let fin = frame.header.fin_write();
                self.deliver(
                    &from.id(),
                    stream_id,
                    StreamEvent::Data {
                        payload: frame.payload,
                        fin,
                    },
                )
                .await;
            }
            FrameType::StreamClose => {
                self.deliver(&from.id(), stream_id, StreamEvent::Close).await;
                self.remove_stream(&from.id(), stream_id);
            }
            FrameType::StreamReset => {
                let code = decode_reset(frame.payload).unwrap_or(ErrorCode::WRITE_FAILED);
                self.deliver(&from.id(), stream_id, StreamEvent::Reset(code))
                    .await;
                self.remove_stream(&from.id(), stream_id);
            }
            FrameType::UdpDatagram => {
                if let Ok(datagram) = UdpDatagram::decode(frame.payload) {
                    self.deliver(&from.id(), stream_id, StreamEvent::Datagram(datagram))
                        .await;
                }
            }
            FrameType::IcmpEcho => {
                if let Ok(echo) = IcmpEcho::decode(frame.payload) {
                    self.deliver(&from.id(), stream_id, StreamEvent::Echo(echo))
                        .await;
                }
            }
            FrameType::UdpClose | FrameType::IcmpClose => {
                self.deliver(&from.id(), stream_id, StreamEvent::Close).await;
                self.remove_stream(&from.id(), stream_id);
            }
            other => {
                debug!(
                    target: "trellis::stream",
                    ?other,
                    stream_id,
                    "unexpected frame type at stream layer"
                );
            }
        }
    }

    fn shared_for(&self, peer: &AgentId, stream_id: u64) -> Option<Arc<StreamShared>> {
        self.inner
            .streams
            .lock()
            .get(&(*peer, stream_id))
            .map(|r| r.shared.clone())
    }

    async fn deliver(&self, peer: &AgentId, stream_id: u64, event: StreamEvent) {
        let entry = {
            let streams = self.inner.streams.lock();
            streams
                .get(&(*peer, stream_id))
                .map(|r| (r.tx.clone(), r.shared.clone()))
        };
        let Some((tx, shared)) = entry else {
            debug!(
                target: "trellis::stream",
                peer = %peer.short(),
                stream_id,
                "frame for unknown stream"
            );
            return;
        };
        shared.touch();
        // Bounded channel: a full buffer blocks the peer reader, which is
        // the cooperative back-pressure the protocol mandates.
        let _ = tx.send(event).await;
    }

    /// Resets everything carried by a dead peer connection.
    pub async fn peer_closed(&self, peer: &AgentId) {
        // Pending opens fail with the timeout code their waiters map.
        let failed: Vec<PendingOpen> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.peer == *peer)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in failed {
            let _ = p
                .tx
                .send(Err(StreamError::Reset(ErrorCode::CONNECTION_TIMEOUT)));
        }

        // Local streams observe a reset.
        let records: Vec<StreamRecord> = {
            let mut streams = self.inner.streams.lock();
            let keys: Vec<(AgentId, u64)> = streams
                .keys()
                .filter(|(id, _)| id == peer)
                .copied()
                .collect();
            keys.into_iter().filter_map(|k| streams.remove(&k)).collect()
        };
        for record in records {
            let _ = record
                .tx
                .send(StreamEvent::Reset(ErrorCode::CONNECTION_TIMEOUT))
                .await;
        }

        // Bridges through the peer reset their other end.
        let torn: Vec<((AgentId, u64), (AgentId, u64))> = {
            let mut bridges = self.inner.bridges.lock();
            let keys: Vec<(AgentId, u64)> = bridges
                .keys()
                .filter(|(id, _)| id == peer)
                .copied()
                .collect();
            let mut torn = Vec::new();
            for key in keys {
                if let Some(other) = bridges.remove(&key) {
                    bridges.remove(&other);
                    torn.push((key, other));
                }
            }
            torn
        };
        for (_, (other_peer, other_sid)) in torn {
            if let Some(handle) = self.inner.registry.get(&other_peer) {
                let reset = Frame::new(
                    FrameType::StreamReset,
                    other_sid,
                    encode_reset(ErrorCode::CONNECTION_TIMEOUT),
                );
                let _ = handle.send_data(reset);
            }
        }
    }

    /// Resets streams idle past the configured limit.
    pub async fn sweep_idle(&self, now: Instant) {
        let idle = self.inner.limits.idle_stream_timeout();
        let stale: Vec<((AgentId, u64), StreamRecord)> = {
            let mut streams = self.inner.streams.lock();
            let keys: Vec<(AgentId, u64)> = streams
                .iter()
                .filter(|(_, r)| now.duration_since(*r.shared.last_activity.lock()) >= idle)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| streams.remove(&k).map(|r| (k, r)))
                .collect()
        };
        for ((peer_id, stream_id), record) in stale {
            warn!(
                target: "trellis::stream",
                peer = %peer_id.short(),
                stream_id,
                "resetting idle stream"
            );
            if let Some(handle) = self.inner.registry.get(&peer_id) {
                let reset = Frame::new(
                    FrameType::StreamReset,
                    stream_id,
                    encode_reset(ErrorCode::CONNECTION_TIMEOUT),
                );
                let _ = handle.send_data(reset);
            }
            let _ = record
                .tx
                .send(StreamEvent::Reset(ErrorCode::CONNECTION_TIMEOUT))
                .await;
        }
    }

    /// Cooperative shutdown: pending opens and live streams resolve with
    /// a cancellation.
    pub fn shutdown(&self) {
        let pending: Vec<PendingOpen> = {
            let mut map = self.inner.pending.lock();
            map.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            let _ = p.tx.send(Err(StreamError::Cancelled));
        }
        let records: Vec<StreamRecord> = {
            let mut streams = self.inner.streams.lock();
            streams.drain().map(|(_, r)| r).collect()
        };
        for record in records {
            let _ = record.tx.try_send(StreamEvent::Reset(ErrorCode::CANCELLED));
        }
        self.inner.bridges.lock().clear();
    }
}

/// Cloneable write half of a stream: sealing and frame emission. The exit
/// and ingress pumps run their socket-read loop with one of these while the
/// receive half lives in another task.
#[derive(Clone)]
pub struct StreamSender {
    shared: Arc<StreamShared>,
    peer: PeerHandle,
    manager: StreamManager,
}

impl StreamSender {
    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn stream_id(&self) -> u64 {
        self.shared.stream_id
    }

    pub fn peer_id(&self) -> AgentId {
        self.shared.peer_id
    }

    fn key(&self) -> Result<&Arc<SessionKey>, StreamError> {
        self.shared.key.get().ok_or(StreamError::Closed)
    }

    /// Seals and sends plaintext, splitting into frame-sized chunks.
    pub fn send(&self, plaintext: &[u8]) -> Result<(), StreamError> {
        if !self.state().can_write() {
            return Err(StreamError::WriteFinished);
        }
        let key = self.key()?;
        let chunks = if plaintext.is_empty() {
            vec![&[][..]]
        } else {
            plaintext.chunks(MAX_PLAINTEXT).collect()
        };
        for chunk in chunks {
            let sealed = key.seal(chunk)?;
            let frame = Frame::new(FrameType::StreamData, self.shared.stream_id, sealed.into());
            self.peer
                .send_data(frame)
                .map_err(|_| StreamError::PeerGone)?;
        }
        self.shared
            .bytes_sent
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        self.shared.touch();
        Ok(())
    }

    /// Signals that this side will write no more: an empty sealed chunk
    /// with FIN_WRITE set.
    pub fn finish_write(&self) -> Result<(), StreamError> {
        if !self.state().can_write() {
            return Ok(());
        }
        let key = self.key()?;
        let sealed = key.seal(&[])?;
        let frame = Frame::new(FrameType::StreamData, self.shared.stream_id, sealed.into())
            .with_flags(FLAG_FIN_WRITE);
        self.peer
            .send_data(frame)
            .map_err(|_| StreamError::PeerGone)?;
        let mut state = self.shared.state.lock();
        *state = state.after_local_fin();
        Ok(())
    }

    /// Signals that this side will read no more and discards anything the
    /// remote still has in flight: an empty sealed chunk with FIN_READ
    /// set. The remote's write half closes when it processes the flag;
    /// this side may keep writing.
    pub fn finish_read(&self) -> Result<(), StreamError> {
        if !self.state().can_read() {
            return Ok(());
        }
        let key = self.key()?;
        let sealed = key.seal(&[])?;
        let frame = Frame::new(FrameType::StreamData, self.shared.stream_id, sealed.into())
            .with_flags(FLAG_FIN_READ);
        self.peer
            .send_data(frame)
            .map_err(|_| StreamError::PeerGone)?;
        let mut state = self.shared.state.lock();
        *state = state.after_remote_fin();
        Ok(())
    }

    /// Seals and sends one datagram toward `addr:port` (or, on the exit's
    /// return path, stamped with the datagram's source).
    pub fn send_datagram(
        &self,
        addr: DestAddr,
        port: u16,
        plaintext: &[u8],
    ) -> Result<(), StreamError> {
        if !self.state().can_write() {
            return Err(StreamError::WriteFinished);
        }
        let sealed = self.key()?.seal(plaintext)?;
        let datagram = UdpDatagram {
            addr,
            port,
            payload: sealed.into(),
        };
        let frame = Frame::new(
            FrameType::UdpDatagram,
            self.shared.stream_id,
            datagram.encode(),
        );
        self.peer
            .send_data(frame)
            .map_err(|_| StreamError::PeerGone)?;
        self.shared.touch();
        Ok(())
    }

    /// Seals and sends one echo payload.
    pub fn send_echo(
        &self,
        ident: u16,
        seq: u16,
        reply: bool,
        plaintext: &[u8],
    ) -> Result<(), StreamError> {
        if !self.state().can_write() {
            return Err(StreamError::WriteFinished);
        }
        let sealed = self.key()?.seal(plaintext)?;
        let echo = IcmpEcho {
            ident,
            seq,
            reply,
            payload: sealed.into(),
        };
        let frame = Frame::new(FrameType::IcmpEcho, self.shared.stream_id, echo.encode());
        self.peer
            .send_data(frame)
            .map_err(|_| StreamError::PeerGone)?;
        self.shared.touch();
        Ok(())
    }

    /// Opens a sealed payload from a datagram or echo event.
    pub fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>, StreamError> {
        Ok(self.key()?.open(sealed)?)
    }

    fn send_reset_frame(&self, code: ErrorCode) -> Result<(), StreamError> {
        let frame = Frame::new(
            FrameType::StreamReset,
            self.shared.stream_id,
            encode_reset(code),
        );
        self.peer
            .send_data(frame)
            .map_err(|_| StreamError::PeerGone)
    }

    /// Abrupt teardown with an error code.
    pub fn reset(&self, code: ErrorCode) {
        if !self.state().is_closed() {
            let _ = self.send_reset_frame(code);
            *self.shared.state.lock() = StreamState::Closed;
        }
        self.manager
            .remove_stream_if(&self.shared.peer_id, self.shared.stream_id, &self.shared);
    }
}

/// Owner-side handle to one stream: the ingress or exit pump reads and
/// writes plaintext through it; sealing and opening happen here.
pub struct StreamHandle {
    sender: StreamSender,
    rx: mpsc::Receiver<StreamEvent>,
    bound: Option<(DestAddr, u16)>,
    eof: bool,
}

impl StreamHandle {
    fn shared(&self) -> &Arc<StreamShared> {
        &self.sender.shared
    }

    pub fn state(&self) -> StreamState {
        *self.shared().state.lock()
    }

    pub fn kind(&self) -> StreamKind {
        self.shared().kind
    }

    pub fn dest(&self) -> (&DestAddr, u16) {
        (&self.sender.shared.dest, self.sender.shared.port)
    }

    pub fn peer_id(&self) -> AgentId {
        self.shared().peer_id
    }

    pub fn stream_id(&self) -> u64 {
        self.shared().stream_id
    }

    pub fn request_id(&self) -> u64 {
        self.shared().request_id
    }

    /// Exit-reported bound address from the open acknowledgement.
    pub fn bound(&self) -> Option<&(DestAddr, u16)> {
        self.bound.as_ref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared().bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared().bytes_recv.load(Ordering::Relaxed)
    }

    /// A write half that can move to another task.
    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    pub fn send(&self, plaintext: &[u8]) -> Result<(), StreamError> {
        self.sender.send(plaintext)
    }

    pub fn finish_write(&self) -> Result<(), StreamError> {
        self.sender.finish_write()
    }

    pub fn finish_read(&self) -> Result<(), StreamError> {
        self.sender.finish_read()
    }

    pub fn send_datagram(
        &self,
        addr: DestAddr,
        port: u16,
        plaintext: &[u8],
    ) -> Result<(), StreamError> {
        self.sender.send_datagram(addr, port, plaintext)
    }

    pub fn send_echo(
        &self,
        ident: u16,
        seq: u16,
        reply: bool,
        plaintext: &[u8],
    ) -> Result<(), StreamError> {
        self.sender.send_echo(ident, seq, reply, plaintext)
    }

    pub fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>, StreamError> {
        self.sender.open_sealed(sealed)
    }

    /// Receives the next plaintext chunk; `Ok(None)` is end-of-stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            if self.eof {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(StreamEvent::Data { payload, fin }) => {
                    if fin {
                        self.eof = true;
                        let mut state = self.sender.shared.state.lock();
                        *state = state.after_remote_fin();
                    }
                    if payload.is_empty() {
                        if fin {
                            return Ok(None);
                        }
                        continue;
                    }
                    let opened = self.sender.key().and_then(|k| Ok(k.open(&payload)?));
                    let plaintext = match opened {
                        Ok(plaintext) => plaintext,
                        Err(err) => {
                            // Bad seal: reset the stream, leave the peer up.
                            let _ = self.sender.send_reset_frame(ErrorCode::WRITE_FAILED);
                            *self.sender.shared.state.lock() = StreamState::Closed;
                            self.sender.manager.remove_stream_if(
                                &self.sender.shared.peer_id,
                                self.sender.shared.stream_id,
                                &self.sender.shared,
                            );
                            return Err(err);
                        }
                    };
                    if plaintext.is_empty() {
                        if self.eof {
                            return Ok(None);
                        }
                        continue;
                    }
                    self.shared()
                        .bytes_recv
                        .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
                    return Ok(Some(plaintext.into()));
                }
                Some(StreamEvent::Close) => {
                    *self.sender.shared.state.lock() = StreamState::Closed;
                    return Ok(None);
                }
                Some(StreamEvent::Reset(code)) => {
                    *self.sender.shared.state.lock() = StreamState::Closed;
                    return if code == ErrorCode::CANCELLED {
                        Err(StreamError::Cancelled)
                    } else {
                        Err(StreamError::Reset(code))
                    };
                }
                Some(StreamEvent::Datagram(_)) | Some(StreamEvent::Echo(_)) => continue,
                None => {
                    if self.state().is_closed() {
                        return Ok(None);
                    }
                    *self.sender.shared.state.lock() = StreamState::Closed;
                    return Err(StreamError::Closed);
                }
            }
        }
    }

    /// Next raw event; the UDP and ICMP pumps consume these directly.
    pub async fn recv_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.shared().touch();
        }
        event
    }

    /// Graceful full close.
    pub fn close(&mut self) {
        if !self.state().is_closed() {
            let close_type = match self.shared().kind {
                StreamKind::Tcp => FrameType::StreamClose,
                StreamKind::Udp => FrameType::UdpClose,
                StreamKind::Icmp => FrameType::IcmpClose,
            };
            let payload = match self.shared().kind {
                StreamKind::Tcp => Bytes::new(),
                _ => crate::frame::encode_close_reason(0),
            };
            let frame = Frame::new(close_type, self.shared().stream_id, payload);
            let _ = self.sender.peer.send_data(frame);
            *self.sender.shared.state.lock() = StreamState::Closed;
        }
        self.sender.manager.remove_stream_if(
            &self.sender.shared.peer_id,
            self.sender.shared.stream_id,
            &self.sender.shared,
        );
    }

    /// Abrupt teardown with an error code.
    pub fn reset(&mut self, code: ErrorCode) {
        self.sender.reset(code);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.sender.manager.remove_stream_if(
            &self.sender.shared.peer_id,
            self.sender.shared.stream_id,
            &self.sender.shared,
        );
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("peer", &self.shared().peer_id.short())
            .field("stream_id", &self.shared().stream_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionsConfig;
    use crate::peer::{handshake, Direction, FrameDispatcher};
    use crate::transport::DuplexTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn id(fill: u8) -> AgentId {
        AgentId::from_bytes([fill; 16])
    }

    struct NullDispatcher;

    #[async_trait]
    impl FrameDispatcher for NullDispatcher {
        async fn on_frame(&self, _from: &PeerHandle, _frame: Frame) {}
        async fn on_peer_closed(&self, _peer: &PeerHandle, _reason: &crate::error::PeerError) {}
    }

    /// Remote side that acknowledges stream opens the way an exit would.
    struct AckingExit {
        manager: StreamManager,
        handles: Mutex<Vec<StreamHandle>>,
    }

    #[async_trait]
    impl FrameDispatcher for AckingExit {
        async fn on_frame(&self, from: &PeerHandle, frame: Frame) {
            match frame.header.frame_type {
                FrameType::StreamOpen => {
                    let open = StreamOpen::decode(frame.payload).unwrap();
                    let responder = EphemeralKeyPair::generate();
                    let responder_pub = responder.public_bytes();
                    let key = SessionKey::derive(
                        responder.agree(&open.ephemeral_pub),
                        open.request_id,
                        &open.ephemeral_pub,
                        &responder_pub,
                        Role::Responder,
                    );
                    let handle = self.manager.register_responder(
                        from,
                        frame.header.stream_id,
                        open.request_id,
                        StreamKind::Tcp,
                        open.dest.clone(),
                        open.port,
                        key,
                    );
                    self.handles.lock().push(handle);
                    let ack = StreamOpenAck {
                        request_id: open.request_id,
                        bound: DestAddr::Ipv4("127.0.0.1".parse().unwrap()),
                        bound_port: 4321,
                        ephemeral_pub: responder_pub,
                    };
                    let _ = from.send_data(Frame::new(
                        FrameType::StreamOpenAck,
                        frame.header.stream_id,
                        ack.encode(),
                    ));
                }
                _ => self.manager.on_stream_frame(from, frame).await,
            }
        }

        async fn on_peer_closed(&self, peer: &PeerHandle, _reason: &crate::error::PeerError) {
            self.manager.peer_closed(&peer.id()).await;
        }
    }

    async fn connected_pair(
        left_dispatcher: Arc<dyn FrameDispatcher>,
        right_dispatcher: Arc<dyn FrameDispatcher>,
    ) -> (PeerHandle, PeerHandle, CancellationToken) {
        let (a, b) = DuplexTransport::pair();
        let left = handshake(
            Box::new(a),
            id(1),
            "left",
            vec![],
            Direction::Dialed,
            Duration::from_secs(5),
        );
        let right = handshake(
            Box::new(b),
            id(2),
            "right",
            vec![],
            Direction::Accepted,
            Duration::from_secs(5),
        );
        let (left, right) = tokio::join!(left, right);
        let cancel = CancellationToken::new();
        let tracker = tokio_util::task::TaskTracker::new();
        let cfg = ConnectionsConfig::default();
        let lh = left.unwrap().spawn(left_dispatcher, &cfg, &cancel, &tracker);
        let rh = right.unwrap().spawn(right_dispatcher, &cfg, &cancel, &tracker);
        (lh, rh, cancel)
    }

    fn manager_with(limits: LimitsConfig) -> (StreamManager, PeerRegistry) {
        let registry = PeerRegistry::new();
        (StreamManager::new(registry.clone(), limits, 16), registry)
    }

    #[tokio::test]
    async fn open_resolves_and_carries_data() {
        let (ingress_mgr, ingress_reg) = manager_with(LimitsConfig::default());
        let (exit_mgr, exit_reg) = manager_with(LimitsConfig::default());

        let ingress_dispatch = Arc::new(ForwardToManager(ingress_mgr.clone()));
        let exit_dispatch = Arc::new(AckingExit {
            manager: exit_mgr.clone(),
            handles: Mutex::new(Vec::new()),
        });
        let (lh, rh, _cancel) = connected_pair(ingress_dispatch, exit_dispatch).await;
        ingress_reg.insert(lh.clone());
        exit_reg.insert(rh.clone());

        let dest = DestAddr::Ipv4("127.0.0.1".parse().unwrap());
        let handle = ingress_mgr.open_tcp(&lh, dest, 80).await.unwrap();
        assert_eq!(handle.state(), StreamState::Open);
        assert_eq!(handle.bound().unwrap().1, 4321);
        // Odd id: the dialer allocated it.
        assert_eq!(handle.stream_id() % 2, 1);
    }

    struct ForwardToManager(StreamManager);

    #[async_trait]
    impl FrameDispatcher for ForwardToManager {
        async fn on_frame(&self, from: &PeerHandle, frame: Frame) {
            self.0.on_stream_frame(from, frame).await;
        }
        async fn on_peer_closed(&self, peer: &PeerHandle, _reason: &crate::error::PeerError) {
            self.0.peer_closed(&peer.id()).await;
        }
    }

    #[tokio::test]
    async fn finish_read_closes_remote_write_half() {
        let (ingress_mgr, ingress_reg) = manager_with(LimitsConfig::default());
        let (exit_mgr, exit_reg) = manager_with(LimitsConfig::default());

        let ingress_dispatch = Arc::new(ForwardToManager(ingress_mgr.clone()));
        let exit_dispatch = Arc::new(AckingExit {
            manager: exit_mgr.clone(),
            handles: Mutex::new(Vec::new()),
        });
        let (lh, rh, _cancel) = connected_pair(ingress_dispatch, exit_dispatch.clone()).await;
        ingress_reg.insert(lh.clone());
        exit_reg.insert(rh.clone());

        let dest = DestAddr::Ipv4("127.0.0.1".parse().unwrap());
        let handle = ingress_mgr.open_tcp(&lh, dest, 80).await.unwrap();

        // The flag rides the real send path, not a hand-built frame.
        handle.finish_read().unwrap();
        assert!(!handle.state().can_read());
        assert!(handle.state().can_write(), "our write half stays open");

        // The responder processes the flag and loses its write half.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let handles = exit_dispatch.handles.lock();
                    if let Some(remote) = handles.first() {
                        if !remote.state().can_write() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fin_read should reach the responder");

        let handles = exit_dispatch.handles.lock();
        let remote = handles.first().unwrap();
        assert!(matches!(
            remote.send(b"late data"),
            Err(StreamError::WriteFinished)
        ));
        assert!(remote.state().can_read(), "responder may still read");
        // Repeating the signal once the read half is closed is a no-op.
        handle.finish_read().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_times_out_without_ack() {
        let (mgr, reg) = manager_with(LimitsConfig::default());
        let (lh, _rh, _cancel) =
            connected_pair(Arc::new(NullDispatcher), Arc::new(NullDispatcher)).await;
        reg.insert(lh.clone());

        let dest = DestAddr::Ipv4("10.0.0.1".parse().unwrap());
        let res = mgr.open_tcp(&lh, dest, 80).await;
        assert!(matches!(res, Err(StreamError::OpenTimeout)));
        assert_eq!(mgr.total_streams(), 0, "timed-out open leaves no state");
    }

    #[tokio::test]
    async fn resource_limit_fails_before_any_state_change() {
        let limits = LimitsConfig {
            max_streams_total: 0,
            ..LimitsConfig::default()
        };
        let (mgr, reg) = manager_with(limits);
        let (lh, _rh, _cancel) =
            connected_pair(Arc::new(NullDispatcher), Arc::new(NullDispatcher)).await;
        reg.insert(lh.clone());

        let before = lh.clone();
        let dest = DestAddr::Ipv4("10.0.0.1".parse().unwrap());
        let res = mgr.open_tcp(&lh, dest, 80).await;
        assert!(matches!(res, Err(StreamError::ResourceLimit)));
        assert_eq!(mgr.total_streams(), 0);
        // No stream id was burned either.
        assert_eq!(before.allocate_stream_id(), 1);
    }

    #[tokio::test]
    async fn transit_ttl_exhaustion_replies_err_and_does_not_forward() {
        let (mgr, _reg) = manager_with(LimitsConfig::default());
        let captured: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));

        struct Capture(Arc<Mutex<Vec<Frame>>>);
        #[async_trait]
        impl FrameDispatcher for Capture {
            async fn on_frame(&self, _from: &PeerHandle, frame: Frame) {
                self.0.lock().push(frame);
            }
            async fn on_peer_closed(&self, _peer: &PeerHandle, _r: &crate::error::PeerError) {}
        }

        let (lh, _rh, _cancel) = connected_pair(
            Arc::new(NullDispatcher),
            Arc::new(Capture(captured.clone())),
        )
        .await;

        let open = StreamOpen {
            request_id: 99,
            dest: DestAddr::Ipv4("10.0.0.1".parse().unwrap()),
            port: 80,
            ttl: 1,
            path: Vec::new(),
            ephemeral_pub: [0u8; 32],
        };
        let table = RouteTable::default();
        mgr.transit_open(&lh, 7, open, &table);
        assert_eq!(mgr.bridge_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = captured.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.frame_type, FrameType::StreamOpenErr);
        let err = StreamOpenErr::decode(frames[0].payload.clone()).unwrap();
        assert_eq!(err.code, ErrorCode::TTL_EXCEEDED);
        assert_eq!(err.request_id, 99);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_opens() {
        let (mgr, reg) = manager_with(LimitsConfig::default());
        let (lh, _rh, _cancel) =
            connected_pair(Arc::new(NullDispatcher), Arc::new(NullDispatcher)).await;
        reg.insert(lh.clone());

        let mgr2 = mgr.clone();
        let lh2 = lh.clone();
        let opener = tokio::spawn(async move {
            mgr2.open_tcp(&lh2, DestAddr::Ipv4("10.0.0.1".parse().unwrap()), 80)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.shutdown();
        let res = opener.await.unwrap();
        assert!(matches!(res, Err(StreamError::Cancelled)));
    }
}
