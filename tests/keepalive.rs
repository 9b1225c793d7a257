//! Keepalive loss: a peer that answers the handshake but nothing else is
//! declared dead after the probe timeout, and its state is cleaned up.

mod support;

use std::time::Duration;

use trellis::frame::{encode_cbor, Frame, FrameType, PeerHello, PROTOCOL_VERSION};
use trellis::identity::AgentId;
use trellis::peer::read_frame;
use trellis::transport::{DuplexTransport, Transport, TransportWrite};

use support::agent;

/// Completes the hello exchange by hand, then swallows every frame
/// without ever answering a keepalive.
async fn run_silent_remote(transport: Box<dyn Transport>, id: AgentId) {
    let (mut reader, mut writer) = transport.into_split();

    let hello = PeerHello {
        version: PROTOCOL_VERSION,
        agent_id: id,
        timestamp_ns: 0,
        display_name: "silent".into(),
        capabilities: vec![],
    };
    let payload = encode_cbor(&hello).unwrap();

    // Peer hello arrives first; answer with ours, then ack theirs.
    let inbound = read_frame(&mut reader).await.unwrap();
    assert_eq!(inbound.header.frame_type, FrameType::PeerHello);
    writer
        .write_all(&Frame::control(FrameType::PeerHello, payload.clone()).encode())
        .await
        .unwrap();
    writer
        .write_all(&Frame::control(FrameType::PeerHelloAck, payload).encode())
        .await
        .unwrap();
    let ack = read_frame(&mut reader).await.unwrap();
    assert_eq!(ack.header.frame_type, FrameType::PeerHelloAck);

    // Keep draining so writes never stall, but never respond.
    while read_frame(&mut reader).await.is_ok() {}
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_declared_dead_after_probe_timeout() {
    let a = agent("watcher", &[]);
    let (ta, tb) = DuplexTransport::pair();

    let remote_id = AgentId::from_bytes([9u8; 16]);
    let remote = tokio::spawn(run_silent_remote(Box::new(tb), remote_id));

    let handle = a.connect_transport(Box::new(ta)).await.unwrap();
    assert_eq!(handle.id(), remote_id);
    assert_eq!(a.registry().len(), 1);

    // Idle threshold (5 min) elapses, the probe goes out, and the 90 s
    // ack window passes unanswered.
    tokio::time::sleep(Duration::from_secs(300 + 90 + 5)).await;

    assert!(handle.is_closed(), "peer declared dead after missed ack");
    // Registry cleanup happened through the close notification.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.registry().len(), 0);

    a.shutdown().await;
    remote.abort();
}
