//! Trellis mesh tunneling agent (wire protocol v1).
//!
//! Builds virtual TCP/UDP/ICMP tunnels across a peer-to-peer overlay of
//! agents connected by pluggable reliable transports. Ingress agents accept
//! SOCKS5 clients and forward streams hop-by-hop to an exit agent that
//! performs the real network operation. Every user stream is end-to-end
//! encrypted between ingress and exit with X25519 + HKDF + ChaCha20-Poly1305;
//! transit agents forward ciphertext they cannot read.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exit;
pub mod frame;
pub mod icmp;
pub mod identity;
pub mod peer;
pub mod routing;
pub mod socks;
pub mod stream;
pub mod transport;
pub mod udp;

pub use agent::Agent;
pub use config::AgentConfig;
pub use crypto::{SessionKey, AEAD_OVERHEAD, MAX_PLAINTEXT};
pub use error::{ErrorCode, StreamError};
pub use frame::{DestAddr, Frame, FrameHeader, FrameType, HEADER_LEN, MAX_PAYLOAD};
pub use identity::{AgentId, AgentIdentity};
pub use routing::{RouteEntry, RouteTable};
pub use stream::{StreamHandle, StreamManager, StreamState};
pub use transport::{DuplexTransport, Transport, TransportDialer, TransportKind};
