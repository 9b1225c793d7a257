//! Error taxonomy: wire-level error codes plus per-layer error enums.
//!
//! Transport errors engage the reconnect policy, protocol errors close the
//! peer connection, stream-open errors surface to the requester as a
//! `STREAM_OPEN_ERR` code, crypto errors reset the stream without touching
//! the peer, and policy/resource errors carry their own codes. Nothing in
//! this crate terminates the process.

use std::fmt;
use std::io;

use thiserror::Error;

/// Wire-level error code carried in `STREAM_OPEN_ERR` and `STREAM_RESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const NO_ROUTE: ErrorCode = ErrorCode(1);
    pub const CONNECTION_REFUSED: ErrorCode = ErrorCode(2);
    pub const CONNECTION_TIMEOUT: ErrorCode = ErrorCode(3);
    pub const TTL_EXCEEDED: ErrorCode = ErrorCode(4);
    pub const HOST_UNREACHABLE: ErrorCode = ErrorCode(5);
    pub const NETWORK_UNREACHABLE: ErrorCode = ErrorCode(6);
    pub const DNS_ERROR: ErrorCode = ErrorCode(7);
    pub const EXIT_DISABLED: ErrorCode = ErrorCode(8);
    pub const RESOURCE_LIMIT: ErrorCode = ErrorCode(9);
    pub const CONNECTION_LIMIT: ErrorCode = ErrorCode(10);
    pub const NOT_ALLOWED: ErrorCode = ErrorCode(11);
    pub const AUTH_REQUIRED: ErrorCode = ErrorCode(13);
    pub const WRITE_FAILED: ErrorCode = ErrorCode(17);
    /// Local-only code used to resolve pending work during shutdown.
    pub const CANCELLED: ErrorCode = ErrorCode(0xFFFF);

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NO_ROUTE => "NO_ROUTE",
            ErrorCode::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            ErrorCode::CONNECTION_TIMEOUT => "CONNECTION_TIMEOUT",
            ErrorCode::TTL_EXCEEDED => "TTL_EXCEEDED",
            ErrorCode::HOST_UNREACHABLE => "HOST_UNREACHABLE",
            ErrorCode::NETWORK_UNREACHABLE => "NETWORK_UNREACHABLE",
            ErrorCode::DNS_ERROR => "DNS_ERROR",
            ErrorCode::EXIT_DISABLED => "EXIT_DISABLED",
            ErrorCode::RESOURCE_LIMIT => "RESOURCE_LIMIT",
            ErrorCode::CONNECTION_LIMIT => "CONNECTION_LIMIT",
            ErrorCode::NOT_ALLOWED => "NOT_ALLOWED",
            ErrorCode::AUTH_REQUIRED => "AUTH_REQUIRED",
            ErrorCode::WRITE_FAILED => "WRITE_FAILED",
            ErrorCode::CANCELLED => "CANCELLED",
            _ => "UNKNOWN",
        }
    }

    /// Classifies a failed outbound connect into the wire code the exit
    /// reports back to the ingress.
    pub fn from_io(err: &io::Error) -> ErrorCode {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorCode::CONNECTION_REFUSED,
            io::ErrorKind::TimedOut => ErrorCode::CONNECTION_TIMEOUT,
            io::ErrorKind::HostUnreachable => ErrorCode::HOST_UNREACHABLE,
            io::ErrorKind::NetworkUnreachable => ErrorCode::NETWORK_UNREACHABLE,
            io::ErrorKind::AddrNotAvailable => ErrorCode::HOST_UNREACHABLE,
            _ => ErrorCode::CONNECTION_REFUSED,
        }
    }

    /// SOCKS5 reply code (RFC 1928 §6) for a failed CONNECT.
    pub fn socks_reply(self) -> u8 {
        match self {
            ErrorCode::NO_ROUTE => 0x04,
            ErrorCode::CONNECTION_REFUSED => 0x05,
            ErrorCode::CONNECTION_TIMEOUT => 0x04,
            ErrorCode::TTL_EXCEEDED => 0x06,
            ErrorCode::HOST_UNREACHABLE => 0x04,
            ErrorCode::NETWORK_UNREACHABLE => 0x03,
            ErrorCode::DNS_ERROR => 0x04,
            ErrorCode::NOT_ALLOWED => 0x02,
            ErrorCode::EXIT_DISABLED => 0x02,
            ErrorCode::AUTH_REQUIRED => 0x02,
            _ => 0x01,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Frame-layer protocol violations. These close the peer connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload length {0} exceeds maximum")]
    Oversize(u32),
    #[error("truncated payload: {0}")]
    Truncated(&'static str),
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// End-to-end encryption failures. Reset the stream, never the peer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealed payload shorter than nonce+tag")]
    TooShort,
    #[error("authentication tag mismatch")]
    Auth,
    #[error("nonce counter replayed or decreased")]
    Replay,
    #[error("nonce counter space exhausted")]
    Exhausted,
}

/// Route parsing and validation failures.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed route target: {0}")]
    BadPrefix(String),
    #[error("invalid route entry: {0}")]
    Invalid(&'static str),
}

/// Stream lifecycle errors surfaced to the opener or the pump tasks.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("remote rejected open: {code} {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("stream open timed out")]
    OpenTimeout,
    #[error("stream reset: {0}")]
    Reset(ErrorCode),
    #[error("stream closed")]
    Closed,
    #[error("write half already finished")]
    WriteFinished,
    #[error("no route to destination")]
    NoRoute,
    #[error("stream limit reached")]
    ResourceLimit,
    #[error("peer unavailable")]
    PeerGone,
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("cancelled")]
    Cancelled,
}

impl StreamError {
    /// The wire code this error maps to when it must be reported remotely.
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::Rejected { code, .. } => *code,
            StreamError::OpenTimeout => ErrorCode::CONNECTION_TIMEOUT,
            StreamError::Reset(code) => *code,
            StreamError::NoRoute => ErrorCode::NO_ROUTE,
            StreamError::ResourceLimit => ErrorCode::RESOURCE_LIMIT,
            StreamError::PeerGone => ErrorCode::CONNECTION_TIMEOUT,
            StreamError::Crypto(_) => ErrorCode::WRITE_FAILED,
            StreamError::Cancelled => ErrorCode::CANCELLED,
            StreamError::Closed | StreamError::WriteFinished => ErrorCode::WRITE_FAILED,
        }
    }
}

/// Peer-connection failures: transport faults and protocol violations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("protocol version mismatch: remote sent {0:#04x}")]
    VersionMismatch(u8),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("superseded by a newer connection from the same agent")]
    Superseded,
    #[error("keepalive timed out")]
    KeepaliveTimeout,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("peer closed")]
    Closed,
}

/// SOCKS5 ingress failures.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported socks version {0:#04x}")]
    BadVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("authentication failed")]
    AuthFailed,
    #[error("unsupported command {0:#04x}")]
    BadCommand(u8),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("stream: {0}")]
    Stream(#[from] StreamError),
}

/// Identity persistence failures.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed agent id: {0}")]
    BadId(String),
    #[error("malformed key material in {path}")]
    BadKey { path: String },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_maps_to_wire_codes() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ErrorCode::from_io(&refused), ErrorCode::CONNECTION_REFUSED);
        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(ErrorCode::from_io(&timeout), ErrorCode::CONNECTION_TIMEOUT);
    }

    #[test]
    fn socks_reply_mapping() {
        assert_eq!(ErrorCode::CONNECTION_REFUSED.socks_reply(), 0x05);
        assert_eq!(ErrorCode::TTL_EXCEEDED.socks_reply(), 0x06);
        assert_eq!(ErrorCode::NOT_ALLOWED.socks_reply(), 0x02);
        assert_eq!(ErrorCode::NETWORK_UNREACHABLE.socks_reply(), 0x03);
    }

    #[test]
    fn display_names() {
        assert_eq!(ErrorCode::NO_ROUTE.to_string(), "NO_ROUTE(1)");
        assert_eq!(ErrorCode(999).name(), "UNKNOWN");
    }
}
