//! Peer connections: hello handshake, reader/writer task split, fair send
//! queue, keepalive probing, and the reconnect backoff policy.
//!
//! Each established connection runs exactly two long-lived tasks. The
//! reader decodes frames and hands them to the agent's dispatcher; the
//! writer drains a single-writer queue in which control frames preempt
//! stream data and data frames from different streams interleave
//! round-robin. Everything else holds only the cheap `PeerHandle`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionsConfig;
use crate::error::{FrameError, PeerError};
use crate::frame::{
    decode_keepalive, encode_keepalive, Frame, FrameHeader, FrameType, PeerHello, HEADER_LEN,
    PROTOCOL_VERSION,
};
use crate::identity::AgentId;
use crate::transport::{Transport, TransportKind, TransportRead, TransportWrite};

/// Who initiated the underlying transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dialed,
    Accepted,
}

impl Direction {
    /// Dialers allocate odd stream ids, acceptors even. Zero is reserved.
    fn first_stream_id(self) -> u64 {
        match self {
            Direction::Dialed => 1,
            Direction::Accepted => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Dialed => "dialed",
            Direction::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Receives every non-keepalive frame a peer reader decodes, plus the
/// close notification. Implemented by the agent orchestrator.
#[async_trait]
pub trait FrameDispatcher: Send + Sync {
    async fn on_frame(&self, from: &PeerHandle, frame: Frame);
    async fn on_peer_closed(&self, peer: &PeerHandle, reason: &PeerError);
}

struct KeepaliveState {
    probe_deadline: Option<Instant>,
}

struct PeerShared {
    id: AgentId,
    kind: TransportKind,
    direction: Direction,
    hello: PeerHello,
    queue: SendQueue,
    state: Mutex<PeerState>,
    next_stream_id: AtomicU64,
    cancel: CancellationToken,
    close_reason: Mutex<Option<PeerError>>,
    last_recv: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    keepalive: Mutex<KeepaliveState>,
}

/// Cheap handle to one live peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn id(&self) -> AgentId {
        self.shared.id
    }

    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn remote_hello(&self) -> &PeerHello {
        &self.shared.hello
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state.lock()
    }

    /// Next stream id with the parity this side owns.
    pub fn allocate_stream_id(&self) -> u64 {
        self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Enqueues a control frame; control preempts data on the wire.
    pub fn send_control(&self, frame: Frame) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.queue.push_control(frame);
        Ok(())
    }

    /// Enqueues a data frame into the per-stream round-robin.
    pub fn send_data(&self, frame: Frame) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.queue.push_data(frame);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        match self.state() {
            PeerState::Established | PeerState::Handshaking => Ok(()),
            _ => Err(PeerError::Closed),
        }
    }

    /// Initiates teardown. Idempotent; the first reason wins.
    pub fn close(&self, reason: PeerError) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, PeerState::Closing | PeerState::Closed) {
                return;
            }
            *state = PeerState::Closing;
        }
        *self.shared.close_reason.lock() = Some(reason);
        self.shared.cancel.cancel();
    }

    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), PeerState::Closing | PeerState::Closed)
    }

    fn note_recv(&self) {
        *self.shared.last_recv.lock() = Instant::now();
    }

    fn note_sent(&self) {
        *self.shared.last_sent.lock() = Instant::now();
    }

    /// Instant of the last frame in either direction.
    pub fn last_activity(&self) -> Instant {
        (*self.shared.last_recv.lock()).max(*self.shared.last_sent.lock())
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.shared.id.short())
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Single-writer send queue: a control lane that preempts, and per-stream
/// data lanes drained round-robin for fairness between streams.
struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    control: VecDeque<Frame>,
    data: BTreeMap<u64, VecDeque<Frame>>,
    rotation: VecDeque<u64>,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                control: VecDeque::new(),
                data: BTreeMap::new(),
                rotation: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn push_control(&self, frame: Frame) {
        self.inner.lock().control.push_back(frame);
        self.notify.notify_one();
    }

    fn push_data(&self, frame: Frame) {
        let stream_id = frame.header.stream_id;
        let mut inner = self.inner.lock();
        let fresh_lane = inner.data.get(&stream_id).is_none_or(|l| l.is_empty());
        if fresh_lane {
            inner.rotation.push_back(stream_id);
        }
        inner.data.entry(stream_id).or_default().push_back(frame);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.control.pop_front() {
            return Some(frame);
        }
        while let Some(stream_id) = inner.rotation.pop_front() {
            let Some(lane) = inner.data.get_mut(&stream_id) else {
                continue;
            };
            let frame = lane.pop_front();
            if lane.is_empty() {
                inner.data.remove(&stream_id);
            } else {
                inner.rotation.push_back(stream_id);
            }
            if let Some(frame) = frame {
                return Some(frame);
            }
        }
        None
    }

    async fn pop(&self) -> Frame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

/// Reads one frame from a transport read half. Oversize payloads are fatal
/// for the connection.
pub async fn read_frame(reader: &mut Box<dyn TransportRead>) -> Result<Frame, PeerError> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    let header = FrameHeader::decode(&header_buf).map_err(PeerError::Frame)?;
    let mut payload = vec![0u8; header.len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;
    Ok(Frame {
        header,
        payload: payload.into(),
    })
}

async fn write_frame(
    writer: &mut Box<dyn TransportWrite>,
    frame: &Frame,
) -> Result<(), PeerError> {
    writer
        .write_all(&frame.encode())
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))
}

/// Nanoseconds since the Unix epoch; hello and keepalive timestamps.
pub fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// A transport that has completed the hello exchange but is not yet
/// running its tasks.
pub struct EstablishedPeer {
    pub hello: PeerHello,
    pub kind: TransportKind,
    pub direction: Direction,
    reader: Box<dyn TransportRead>,
    writer: Box<dyn TransportWrite>,
}

/// Runs the PEER_HELLO / PEER_HELLO_ACK exchange on a fresh transport.
///
/// Both sides send their hello immediately, then acknowledge the remote
/// one with the identical schema. A version mismatch or a handshake
/// overrunning its deadline closes the transport.
pub async fn handshake(
    transport: Box<dyn Transport>,
    local_id: AgentId,
    display_name: &str,
    capabilities: Vec<String>,
    direction: Direction,
    timeout: Duration,
) -> Result<EstablishedPeer, PeerError> {
    let kind = transport.kind();
    let (mut reader, mut writer) = transport.into_split();

    let hello = PeerHello {
        version: PROTOCOL_VERSION,
        agent_id: local_id,
        timestamp_ns: now_unix_ns(),
        display_name: display_name.to_string(),
        capabilities,
    };

    let exchange = async {
        let payload = crate::frame::encode_cbor(&hello)?;
        write_frame(&mut writer, &Frame::control(FrameType::PeerHello, payload.clone())).await?;

        let frame = read_frame(&mut reader).await?;
        if frame.header.frame_type != FrameType::PeerHello {
            return Err(PeerError::Protocol(format!(
                "expected PEER_HELLO, got {:?}",
                frame.header.frame_type
            )));
        }
        let remote: PeerHello = crate::frame::decode_cbor(&frame.payload)?;
        if remote.version != PROTOCOL_VERSION {
            return Err(PeerError::VersionMismatch(remote.version));
        }
        if remote.agent_id == local_id {
            return Err(PeerError::Protocol("connected to self".into()));
        }

        write_frame(&mut writer, &Frame::control(FrameType::PeerHelloAck, payload)).await?;

        let frame = read_frame(&mut reader).await?;
        if frame.header.frame_type != FrameType::PeerHelloAck {
            return Err(PeerError::Protocol(format!(
                "expected PEER_HELLO_ACK, got {:?}",
                frame.header.frame_type
            )));
        }
        let ack: PeerHello = crate::frame::decode_cbor(&frame.payload)?;
        if ack.agent_id != remote.agent_id {
            return Err(PeerError::Protocol("hello ack from a different agent".into()));
        }
        Ok(remote)
    };

    let remote = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;

    info!(
        target: "trellis::peer",
        peer = %remote.agent_id.short(),
        name = %remote.display_name,
        %kind,
        direction = direction.as_str(),
        "peer handshake complete"
    );

    Ok(EstablishedPeer {
        hello: remote,
        kind,
        direction,
        reader,
        writer,
    })
}

impl EstablishedPeer {
    /// Spawns the reader, writer, and keepalive tasks and returns the
    /// handle the rest of the agent uses.
    pub fn spawn(
        self,
        dispatcher: Arc<dyn FrameDispatcher>,
        config: &ConnectionsConfig,
        parent_cancel: &CancellationToken,
        tracker: &tokio_util::task::TaskTracker,
    ) -> PeerHandle {
        let now = Instant::now();
        let shared = Arc::new(PeerShared {
            id: self.hello.agent_id,
            kind: self.kind,
            direction: self.direction,
            hello: self.hello,
            queue: SendQueue::new(),
            state: Mutex::new(PeerState::Established),
            next_stream_id: AtomicU64::new(self.direction.first_stream_id()),
            cancel: parent_cancel.child_token(),
            close_reason: Mutex::new(None),
            last_recv: Mutex::new(now),
            last_sent: Mutex::new(now),
            keepalive: Mutex::new(KeepaliveState {
                probe_deadline: None,
            }),
        });
        let handle = PeerHandle { shared };

        tracker.spawn(reader_loop(
            handle.clone(),
            self.reader,
            dispatcher.clone(),
        ));
        tracker.spawn(writer_loop(handle.clone(), self.writer));
        tracker.spawn(keepalive_loop(
            handle.clone(),
            config.idle_threshold(),
            config.keepalive_timeout(),
        ));
        handle
    }
}

async fn reader_loop(
    handle: PeerHandle,
    mut reader: Box<dyn TransportRead>,
    dispatcher: Arc<dyn FrameDispatcher>,
) {
    let cancel = handle.shared.cancel.clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            res = read_frame(&mut reader) => match res {
                Ok(frame) => frame,
                Err(err) => {
                    handle.close(classify_read_error(err));
                    break;
                }
            },
        };
        handle.note_recv();

        match frame.header.frame_type {
            FrameType::Keepalive => {
                // Echo the timestamp straight back on the control lane.
                let ack = Frame::control(FrameType::KeepaliveAck, frame.payload);
                let _ = handle.send_control(ack);
            }
            FrameType::KeepaliveAck => {
                if let Ok(ts) = decode_keepalive(frame.payload) {
                    debug!(
                        target: "trellis::peer",
                        peer = %handle.id().short(),
                        rtt_ns = now_unix_ns().saturating_sub(ts),
                        "keepalive acknowledged"
                    );
                }
                handle.shared.keepalive.lock().probe_deadline = None;
            }
            FrameType::Unknown(t) => {
                debug!(
                    target: "trellis::peer",
                    peer = %handle.id().short(),
                    frame_type = t,
                    "ignoring unknown frame type"
                );
            }
            _ => dispatcher.on_frame(&handle, frame).await,
        }
    }

    *handle.shared.state.lock() = PeerState::Closed;
    let reason = handle
        .shared
        .close_reason
        .lock()
        .take()
        .unwrap_or(PeerError::Closed);
    handle.shared.cancel.cancel();
    dispatcher.on_peer_closed(&handle, &reason).await;
}

fn classify_read_error(err: PeerError) -> PeerError {
    // Oversize or malformed frames are protocol errors; everything else is
    // the transport going away.
    match err {
        PeerError::Frame(FrameError::Oversize(n)) => {
            PeerError::Protocol(format!("oversize frame ({n} bytes)"))
        }
        other => other,
    }
}

async fn writer_loop(handle: PeerHandle, mut writer: Box<dyn TransportWrite>) {
    let cancel = handle.shared.cancel.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = handle.shared.queue.pop() => {
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    handle.close(err);
                    return;
                }
                handle.note_sent();
            }
        }
    }
    // Flush whatever is already queued, then close the transport.
    while let Some(frame) = handle.shared.queue.try_pop() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.close().await;
}

async fn keepalive_loop(handle: PeerHandle, idle_threshold: Duration, ack_timeout: Duration) {
    let cancel = handle.shared.cancel.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let deadline = handle.shared.keepalive.lock().probe_deadline;
        match deadline {
            Some(deadline) if now >= deadline => {
                warn!(
                    target: "trellis::peer",
                    peer = %handle.id().short(),
                    "keepalive ack missed; declaring peer dead"
                );
                handle.close(PeerError::KeepaliveTimeout);
                return;
            }
            Some(_) => {}
            None => {
                if now.duration_since(handle.last_activity()) >= idle_threshold {
                    let frame = Frame::control(
                        FrameType::Keepalive,
                        encode_keepalive(now_unix_ns()),
                    );
                    if handle.send_control(frame).is_ok() {
                        handle.shared.keepalive.lock().probe_deadline =
                            Some(now + ack_timeout);
                    }
                }
            }
        }
    }
}

/// Live peers keyed by (agent id, transport kind); at most one established
/// connection per key, newest wins.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<RwLock<BTreeMap<(AgentId, TransportKind), PeerHandle>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh connection, returning the superseded older handle
    /// for the same (agent, transport) when there is one.
    pub fn insert(&self, handle: PeerHandle) -> Option<PeerHandle> {
        self.inner
            .write()
            .insert((handle.id(), handle.kind()), handle)
    }

    /// Removes the handle only if it is still the registered one; a newer
    /// connection that superseded it stays.
    pub fn remove(&self, handle: &PeerHandle) {
        let mut inner = self.inner.write();
        let key = (handle.id(), handle.kind());
        if let Some(current) = inner.get(&key) {
            if Arc::ptr_eq(&current.shared, &handle.shared) {
                inner.remove(&key);
            }
        }
    }

    /// Any live connection to the agent.
    pub fn get(&self, id: &AgentId) -> Option<PeerHandle> {
        let inner = self.inner.read();
        inner
            .iter()
            .filter(|((peer, _), _)| peer == id)
            .map(|(_, handle)| handle.clone())
            .find(|h| !h.is_closed())
    }

    pub fn list(&self) -> Vec<PeerHandle> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexTransport;
    use bytes::Bytes;

    struct NullDispatcher;

    #[async_trait]
    impl FrameDispatcher for NullDispatcher {
        async fn on_frame(&self, _from: &PeerHandle, _frame: Frame) {}
        async fn on_peer_closed(&self, _peer: &PeerHandle, _reason: &PeerError) {}
    }

    fn id(fill: u8) -> AgentId {
        AgentId::from_bytes([fill; 16])
    }

    async fn handshake_pair() -> (EstablishedPeer, EstablishedPeer) {
        let (a, b) = DuplexTransport::pair();
        let left = handshake(
            Box::new(a),
            id(1),
            "left",
            vec!["tcp".into()],
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
        (left.unwrap(), right.unwrap())
    }

    #[tokio::test]
    async fn handshake_exchanges_identities() {
        let (left, right) = handshake_pair().await;
        assert_eq!(left.hello.agent_id, id(2));
        assert_eq!(right.hello.agent_id, id(1));
        assert_eq!(left.hello.display_name, "right");
        assert_eq!(right.hello.capabilities, vec!["tcp".to_string()]);
    }

    #[tokio::test]
    async fn handshake_rejects_version_mismatch() {
        let (a, b) = DuplexTransport::pair();
        let task = tokio::spawn(handshake(
            Box::new(a),
            id(1),
            "left",
            vec![],
            Direction::Dialed,
            Duration::from_secs(5),
        ));
        // Hand-roll a hello with a bad version.
        let (mut reader, mut writer) = (Box::new(b) as Box<dyn Transport>).into_split();
        let bad = PeerHello {
            version: 0x02,
            agent_id: id(2),
            timestamp_ns: 0,
            display_name: String::new(),
            capabilities: vec![],
        };
        let frame = Frame::control(FrameType::PeerHello, crate::frame::encode_cbor(&bad).unwrap());
        write_frame(&mut writer, &frame).await.unwrap();
        let _ = read_frame(&mut reader).await.unwrap();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(PeerError::VersionMismatch(0x02))));
    }

    #[tokio::test]
    async fn stream_id_parity_follows_direction() {
        let (left, right) = handshake_pair().await;
        let tracker = tokio_util::task::TaskTracker::new();
        let cancel = CancellationToken::new();
        let cfg = ConnectionsConfig::default();
        let dispatcher: Arc<dyn FrameDispatcher> = Arc::new(NullDispatcher);
        let lh = left.spawn(dispatcher.clone(), &cfg, &cancel, &tracker);
        let rh = right.spawn(dispatcher, &cfg, &cancel, &tracker);
        assert_eq!(lh.allocate_stream_id(), 1);
        assert_eq!(lh.allocate_stream_id(), 3);
        assert_eq!(rh.allocate_stream_id(), 2);
        assert_eq!(rh.allocate_stream_id(), 4);
        cancel.cancel();
    }

    #[test]
    fn send_queue_control_preempts_and_data_round_robins() {
        let queue = SendQueue::new();
        let data = |sid: u64, tag: u8| {
            Frame::new(FrameType::StreamData, sid, Bytes::from(vec![tag]))
        };
        queue.push_data(data(1, 10));
        queue.push_data(data(1, 11));
        queue.push_data(data(3, 30));
        queue.push_control(Frame::control(FrameType::Keepalive, encode_keepalive(1)));

        let first = queue.try_pop().unwrap();
        assert_eq!(first.header.frame_type, FrameType::Keepalive);
        // Streams 1 and 3 interleave.
        let order: Vec<(u64, u8)> = (0..3)
            .map(|_| {
                let f = queue.try_pop().unwrap();
                (f.header.stream_id, f.payload[0])
            })
            .collect();
        assert_eq!(order, vec![(1, 10), (3, 30), (1, 11)]);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn keepalive_is_echoed_by_the_remote_reader() {
        let (left, right) = handshake_pair().await;
        let tracker = tokio_util::task::TaskTracker::new();
        let cancel = CancellationToken::new();
        let cfg = ConnectionsConfig::default();
        let dispatcher: Arc<dyn FrameDispatcher> = Arc::new(NullDispatcher);
        let lh = left.spawn(dispatcher.clone(), &cfg, &cancel, &tracker);
        let _rh = right.spawn(dispatcher, &cfg, &cancel, &tracker);

        lh.shared.keepalive.lock().probe_deadline =
            Some(Instant::now() + Duration::from_secs(90));
        lh.send_control(Frame::control(
            FrameType::Keepalive,
            encode_keepalive(now_unix_ns()),
        ))
        .unwrap();

        // The ack clears the probe.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if lh.shared.keepalive.lock().probe_deadline.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("keepalive ack should arrive");
        cancel.cancel();
    }

    #[tokio::test]
    async fn registry_supersedes_older_connection() {
        let (left_a, _keep_a) = handshake_pair().await;
        let (left_b, _keep_b) = handshake_pair().await;
        let tracker = tokio_util::task::TaskTracker::new();
        let cancel = CancellationToken::new();
        let cfg = ConnectionsConfig::default();
        let dispatcher: Arc<dyn FrameDispatcher> = Arc::new(NullDispatcher);

        let registry = PeerRegistry::new();
        let older = left_a.spawn(dispatcher.clone(), &cfg, &cancel, &tracker);
        assert!(registry.insert(older.clone()).is_none());
        let newer = left_b.spawn(dispatcher, &cfg, &cancel, &tracker);
        let superseded = registry.insert(newer.clone()).unwrap();
        assert!(Arc::ptr_eq(&superseded.shared, &older.shared));

        // Removing the superseded handle must not evict the newer one.
        registry.remove(&older);
        assert!(registry.get(&older.id()).is_some());
        cancel.cancel();
    }
}
