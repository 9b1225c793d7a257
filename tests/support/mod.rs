//! Shared fixtures for the scenario tests: in-memory agents wired over
//! duplex transports, plus a tapping transport that records ciphertext.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use trellis::agent::Agent;
use trellis::config::AgentConfig;
use trellis::exit::SystemResolver;
use trellis::icmp::LoopbackIcmpFactory;
use trellis::identity::AgentIdentity;
use trellis::peer::PeerHandle;
use trellis::transport::{
    DuplexTransport, Transport, TransportKind, TransportRead, TransportWrite,
};

/// Builds an agent with an ephemeral identity; non-empty `routes` makes it
/// an exit for those destinations.
pub fn agent(name: &str, routes: &[&str]) -> Agent {
    agent_with(name, routes, |_| {})
}

pub fn agent_with(name: &str, routes: &[&str], tweak: impl FnOnce(&mut AgentConfig)) -> Agent {
    let mut config = AgentConfig::default();
    config.agent.display_name = name.to_string();
    config.socks5.enabled = true;
    config.socks5.address = "127.0.0.1:0".into();
    if !routes.is_empty() {
        config.exit.enabled = true;
        config.exit.routes = routes.iter().map(|r| r.to_string()).collect();
    }
    tweak(&mut config);
    let resolver = Arc::new(SystemResolver::new(&config.exit.dns));
    Agent::with_parts(
        AgentIdentity::ephemeral(name),
        config,
        resolver,
        Arc::new(LoopbackIcmpFactory),
    )
}

/// Connects two agents over an in-memory transport pair.
pub async fn link(dialer: &Agent, acceptor: &Agent) -> (PeerHandle, PeerHandle) {
    let (ta, tb) = DuplexTransport::pair();
    let (a, b) = tokio::join!(
        dialer.connect_transport(Box::new(ta)),
        acceptor.accept_transport(Box::new(tb)),
    );
    (a.expect("dial side"), b.expect("accept side"))
}

/// Connects two agents while recording every byte the acceptor-side reader
/// sees (i.e. the dialer-to-acceptor wire) plus the reverse direction.
pub async fn link_tapped(
    dialer: &Agent,
    acceptor: &Agent,
) -> (PeerHandle, PeerHandle, Arc<Mutex<Vec<u8>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (ta, tb) = DuplexTransport::pair();
    let ta = TapTransport::new(Box::new(ta), log.clone());
    let tb = TapTransport::new(Box::new(tb), log.clone());
    let (a, b) = tokio::join!(
        dialer.connect_transport(Box::new(ta)),
        acceptor.accept_transport(Box::new(tb)),
    );
    (a.expect("dial side"), b.expect("accept side"), log)
}

/// Lets in-flight frames and floods settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// Transport wrapper recording everything read from the inner transport.
pub struct TapTransport {
    inner: Box<dyn Transport>,
    log: Arc<Mutex<Vec<u8>>>,
}

impl TapTransport {
    pub fn new(inner: Box<dyn Transport>, log: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { inner, log }
    }
}

impl Transport for TapTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        self.inner.peer_fingerprint()
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        let (read, write) = self.inner.into_split();
        (
            Box::new(TapRead {
                inner: read,
                log: self.log,
            }),
            write,
        )
    }
}

struct TapRead {
    inner: Box<dyn TransportRead>,
    log: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl TransportRead for TapRead {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await?;
        self.log.lock().extend_from_slice(buf);
        Ok(())
    }
}

/// True when `needle` occurs anywhere in the captured bytes.
pub fn wire_contains(log: &Mutex<Vec<u8>>, needle: &[u8]) -> bool {
    let data = log.lock();
    data.windows(needle.len()).any(|w| w == needle)
}
