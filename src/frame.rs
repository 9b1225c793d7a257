//! Wire framing: a fixed 14-byte header followed by 0..=16384 payload bytes.
//!
//! Header layout (big-endian):
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 1    | type |
//! | 1      | 1    | flags (bit0 FIN_WRITE, bit1 FIN_READ) |
//! | 2      | 4    | payload length |
//! | 6      | 8    | stream id |
//!
//! Stream id 0 carries control traffic (handshake, routing, keepalive,
//! control RPC). Data-plane payloads whose byte layout the protocol fixes
//! are hand-packed; structured control-plane payloads are CBOR.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorCode, FrameError};
use crate::identity::AgentId;
use crate::transport::TransportKind;

pub const HEADER_LEN: usize = 14;
pub const MAX_PAYLOAD: usize = 16384;
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Sender will produce no further bytes on this stream.
pub const FLAG_FIN_WRITE: u8 = 0b0000_0001;
/// Sender will discard any further inbound bytes on this stream.
pub const FLAG_FIN_READ: u8 = 0b0000_0010;

/// Stream id reserved for connection-scoped control frames.
pub const CONTROL_STREAM: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    StreamOpen,
    StreamOpenAck,
    StreamOpenErr,
    StreamData,
    StreamClose,
    StreamReset,
    RouteAdvertise,
    RouteWithdraw,
    NodeInfoAdvertise,
    PeerHello,
    PeerHelloAck,
    Keepalive,
    KeepaliveAck,
    ControlRequest,
    ControlResponse,
    UdpSetup,
    UdpDatagram,
    UdpClose,
    IcmpSetup,
    IcmpEcho,
    IcmpClose,
    /// Forward-compatibility: decoded but ignored by readers.
    Unknown(u8),
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::StreamOpen => 0x01,
            FrameType::StreamOpenAck => 0x02,
            FrameType::StreamOpenErr => 0x03,
            FrameType::StreamData => 0x04,
            FrameType::StreamClose => 0x05,
            FrameType::StreamReset => 0x06,
            FrameType::RouteAdvertise => 0x10,
            FrameType::RouteWithdraw => 0x11,
            FrameType::NodeInfoAdvertise => 0x12,
            FrameType::PeerHello => 0x20,
            FrameType::PeerHelloAck => 0x21,
            FrameType::Keepalive => 0x22,
            FrameType::KeepaliveAck => 0x23,
            FrameType::ControlRequest => 0x24,
            FrameType::ControlResponse => 0x25,
            FrameType::UdpSetup => 0x30,
            FrameType::UdpDatagram => 0x31,
            FrameType::UdpClose => 0x32,
            FrameType::IcmpSetup => 0x33,
            FrameType::IcmpEcho => 0x34,
            FrameType::IcmpClose => 0x35,
            FrameType::Unknown(b) => b,
        }
    }

    pub fn from_u8(b: u8) -> Self {
        match b {
            0x01 => FrameType::StreamOpen,
            0x02 => FrameType::StreamOpenAck,
            0x03 => FrameType::StreamOpenErr,
            0x04 => FrameType::StreamData,
            0x05 => FrameType::StreamClose,
            0x06 => FrameType::StreamReset,
            0x10 => FrameType::RouteAdvertise,
            0x11 => FrameType::RouteWithdraw,
            0x12 => FrameType::NodeInfoAdvertise,
            0x20 => FrameType::PeerHello,
            0x21 => FrameType::PeerHelloAck,
            0x22 => FrameType::Keepalive,
            0x23 => FrameType::KeepaliveAck,
            0x24 => FrameType::ControlRequest,
            0x25 => FrameType::ControlResponse,
            0x30 => FrameType::UdpSetup,
            0x31 => FrameType::UdpDatagram,
            0x32 => FrameType::UdpClose,
            0x33 => FrameType::IcmpSetup,
            0x34 => FrameType::IcmpEcho,
            0x35 => FrameType::IcmpClose,
            other => FrameType::Unknown(other),
        }
    }

    /// True for types dispatched to the stream layer.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            FrameType::StreamOpen
                | FrameType::StreamOpenAck
                | FrameType::StreamOpenErr
                | FrameType::StreamData
                | FrameType::StreamClose
                | FrameType::StreamReset
                | FrameType::UdpSetup
                | FrameType::UdpDatagram
                | FrameType::UdpClose
                | FrameType::IcmpSetup
                | FrameType::IcmpEcho
                | FrameType::IcmpClose
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: u8,
    pub len: u32,
    pub stream_id: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.frame_type.as_u8();
        out[1] = self.flags;
        out[2..6].copy_from_slice(&self.len.to_be_bytes());
        out[6..14].copy_from_slice(&self.stream_id.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if len as usize > MAX_PAYLOAD {
            return Err(FrameError::Oversize(len));
        }
        Ok(Self {
            frame_type: FrameType::from_u8(buf[0]),
            flags: buf[1],
            len,
            stream_id: u64::from_be_bytes([
                buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
            ]),
        })
    }

    pub fn fin_write(&self) -> bool {
        self.flags & FLAG_FIN_WRITE != 0
    }

    pub fn fin_read(&self) -> bool {
        self.flags & FLAG_FIN_READ != 0
    }
}

/// One wire frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: u64, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self {
            header: FrameHeader {
                frame_type,
                flags: 0,
                len: payload.len() as u32,
                stream_id,
            },
            payload,
        }
    }

    /// Control frame on the reserved stream id 0.
    pub fn control(frame_type: FrameType, payload: Bytes) -> Self {
        Self::new(frame_type, CONTROL_STREAM, payload)
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.header.flags = flags;
        self
    }

    /// Serializes header and payload into one buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf
    }

    /// Reads exactly one frame. Oversize lengths are a fatal protocol error;
    /// unknown types still decode so the caller can skip them.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
        let mut header_buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Frame {
            header,
            payload: Bytes::from(payload),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), FrameError> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }
}

/// Destination address as carried on the wire (SOCKS-compatible atyp codes:
/// 0x01 IPv4, 0x03 domain, 0x04 IPv6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl DestAddr {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => DestAddr::Ipv4(v4),
            IpAddr::V6(v6) => DestAddr::Ipv6(v6),
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            DestAddr::Ipv4(v4) => Some(IpAddr::V4(*v4)),
            DestAddr::Ipv6(v6) => Some(IpAddr::V6(*v6)),
            DestAddr::Domain(_) => None,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            DestAddr::Ipv4(v4) => {
                buf.put_u8(0x01);
                buf.put_slice(&v4.octets());
            }
            DestAddr::Domain(name) => {
                buf.put_u8(0x03);
                buf.put_u8(name.len().min(255) as u8);
                buf.put_slice(&name.as_bytes()[..name.len().min(255)]);
            }
            DestAddr::Ipv6(v6) => {
                buf.put_u8(0x04);
                buf.put_slice(&v6.octets());
            }
        }
    }

    fn take(buf: &mut Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 1 {
            return Err(FrameError::Truncated("address type"));
        }
        match buf.get_u8() {
            0x01 => {
                if buf.remaining() < 4 {
                    return Err(FrameError::Truncated("ipv4 address"));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Ok(DestAddr::Ipv4(Ipv4Addr::from(octets)))
            }
            0x03 => {
                if buf.remaining() < 1 {
                    return Err(FrameError::Truncated("domain length"));
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(FrameError::Truncated("domain name"));
                }
                let name = buf.split_to(len);
                let name = std::str::from_utf8(&name)
                    .map_err(|e| FrameError::Malformed {
                        what: "domain name",
                        detail: e.to_string(),
                    })?
                    .to_string();
                Ok(DestAddr::Domain(name))
            }
            0x04 => {
                if buf.remaining() < 16 {
                    return Err(FrameError::Truncated("ipv6 address"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Ok(DestAddr::Ipv6(Ipv6Addr::from(octets)))
            }
            other => Err(FrameError::Malformed {
                what: "address type",
                detail: format!("{other:#04x}"),
            }),
        }
    }
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestAddr::Ipv4(v4) => write!(f, "{v4}"),
            DestAddr::Domain(name) => write!(f, "{name}"),
            DestAddr::Ipv6(v6) => write!(f, "{v6}"),
        }
    }
}

fn take_agent_id(buf: &mut Bytes) -> Result<AgentId, FrameError> {
    if buf.remaining() < AgentId::LEN {
        return Err(FrameError::Truncated("agent id"));
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(AgentId::from_bytes(raw))
}

/// STREAM_OPEN payload: request correlation id, destination, hop budget,
/// optional explicit remaining path, and the ingress ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    pub request_id: u64,
    pub dest: DestAddr,
    pub port: u16,
    pub ttl: u8,
    pub path: Vec<AgentId>,
    pub ephemeral_pub: [u8; 32],
}

impl StreamOpen {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u64(self.request_id);
        self.dest.put(&mut buf);
        buf.put_u16(self.port);
        buf.put_u8(self.ttl);
        buf.put_u8(self.path.len().min(255) as u8);
        for hop in self.path.iter().take(255) {
            buf.put_slice(hop.as_bytes());
        }
        buf.put_slice(&self.ephemeral_pub);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 8 {
            return Err(FrameError::Truncated("request id"));
        }
        let request_id = buf.get_u64();
        let dest = DestAddr::take(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(FrameError::Truncated("port/ttl/path"));
        }
        let port = buf.get_u16();
        let ttl = buf.get_u8();
        let hops = buf.get_u8() as usize;
        let mut path = Vec::with_capacity(hops);
        for _ in 0..hops {
            path.push(take_agent_id(&mut buf)?);
        }
        if buf.remaining() < 32 {
            return Err(FrameError::Truncated("ephemeral public key"));
        }
        let mut ephemeral_pub = [0u8; 32];
        buf.copy_to_slice(&mut ephemeral_pub);
        Ok(Self {
            request_id,
            dest,
            port,
            ttl,
            path,
            ephemeral_pub,
        })
    }
}

/// STREAM_OPEN_ACK: the exit's bound socket address plus its ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenAck {
    pub request_id: u64,
    pub bound: DestAddr,
    pub bound_port: u16,
    pub ephemeral_pub: [u8; 32],
}

impl StreamOpenAck {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u64(self.request_id);
        self.bound.put(&mut buf);
        buf.put_u16(self.bound_port);
        buf.put_slice(&self.ephemeral_pub);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 8 {
            return Err(FrameError::Truncated("request id"));
        }
        let request_id = buf.get_u64();
        let bound = DestAddr::take(&mut buf)?;
        if buf.remaining() < 2 + 32 {
            return Err(FrameError::Truncated("bound port/key"));
        }
        let bound_port = buf.get_u16();
        let mut ephemeral_pub = [0u8; 32];
        buf.copy_to_slice(&mut ephemeral_pub);
        Ok(Self {
            request_id,
            bound,
            bound_port,
            ephemeral_pub,
        })
    }
}

/// STREAM_OPEN_ERR: failure code plus a short human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenErr {
    pub request_id: u64,
    pub code: ErrorCode,
    pub message: String,
}

impl StreamOpenErr {
    pub fn new(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        message.truncate(255);
        Self {
            request_id,
            code,
            message,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.message.len());
        buf.put_u64(self.request_id);
        buf.put_u16(self.code.0);
        buf.put_u8(self.message.len() as u8);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 11 {
            return Err(FrameError::Truncated("open error"));
        }
        let request_id = buf.get_u64();
        let code = ErrorCode(buf.get_u16());
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(FrameError::Truncated("error message"));
        }
        let message = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
        Ok(Self {
            request_id,
            code,
            message,
        })
    }
}

/// STREAM_RESET payload: a bare error code.
pub fn encode_reset(code: ErrorCode) -> Bytes {
    Bytes::copy_from_slice(&code.0.to_be_bytes())
}

pub fn decode_reset(mut buf: Bytes) -> Result<ErrorCode, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated("reset code"));
    }
    Ok(ErrorCode(buf.get_u16()))
}

/// KEEPALIVE / KEEPALIVE_ACK payload: an 8-byte big-endian timestamp.
pub fn encode_keepalive(timestamp_ns: u64) -> Bytes {
    Bytes::copy_from_slice(&timestamp_ns.to_be_bytes())
}

pub fn decode_keepalive(mut buf: Bytes) -> Result<u64, FrameError> {
    if buf.remaining() < 8 {
        return Err(FrameError::Truncated("keepalive timestamp"));
    }
    Ok(buf.get_u64())
}

/// Association setup sub-operation shared by the UDP and ICMP setup frames
/// (one frame type carries the open/ack/err trio). The open carries a
/// destination so transit agents can route it: the echo target for ICMP, a
/// routing hint (possibly the unspecified address) for UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOp {
    Open {
        request_id: u64,
        dest: DestAddr,
        port: u16,
        ttl: u8,
        ephemeral_pub: [u8; 32],
    },
    Ack {
        request_id: u64,
        ephemeral_pub: [u8; 32],
    },
    Err {
        request_id: u64,
        code: ErrorCode,
        message: String,
    },
}

impl SetupOp {
    pub fn request_id(&self) -> u64 {
        match self {
            SetupOp::Open { request_id, .. }
            | SetupOp::Ack { request_id, .. }
            | SetupOp::Err { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            SetupOp::Open {
                request_id,
                dest,
                port,
                ttl,
                ephemeral_pub,
            } => {
                buf.put_u8(0x00);
                buf.put_u64(*request_id);
                dest.put(&mut buf);
                buf.put_u16(*port);
                buf.put_u8(*ttl);
                buf.put_slice(ephemeral_pub);
            }
            SetupOp::Ack {
                request_id,
                ephemeral_pub,
            } => {
                buf.put_u8(0x01);
                buf.put_u64(*request_id);
                buf.put_slice(ephemeral_pub);
            }
            SetupOp::Err {
                request_id,
                code,
                message,
            } => {
                buf.put_u8(0x02);
                buf.put_u64(*request_id);
                buf.put_u16(code.0);
                buf.put_u8(message.len().min(255) as u8);
                buf.put_slice(&message.as_bytes()[..message.len().min(255)]);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 9 {
            return Err(FrameError::Truncated("setup op"));
        }
        let op = buf.get_u8();
        let request_id = buf.get_u64();
        match op {
            0x00 => {
                let dest = DestAddr::take(&mut buf)?;
                if buf.remaining() < 3 + 32 {
                    return Err(FrameError::Truncated("setup open"));
                }
                let port = buf.get_u16();
                let ttl = buf.get_u8();
                let mut ephemeral_pub = [0u8; 32];
                buf.copy_to_slice(&mut ephemeral_pub);
                Ok(SetupOp::Open {
                    request_id,
                    dest,
                    port,
                    ttl,
                    ephemeral_pub,
                })
            }
            0x01 => {
                if buf.remaining() < 32 {
                    return Err(FrameError::Truncated("setup key"));
                }
                let mut ephemeral_pub = [0u8; 32];
                buf.copy_to_slice(&mut ephemeral_pub);
                Ok(SetupOp::Ack {
                    request_id,
                    ephemeral_pub,
                })
            }
            0x02 => {
                if buf.remaining() < 3 {
                    return Err(FrameError::Truncated("setup error"));
                }
                let code = ErrorCode(buf.get_u16());
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(FrameError::Truncated("setup error message"));
                }
                let message = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
                Ok(SetupOp::Err {
                    request_id,
                    code,
                    message,
                })
            }
            other => Err(FrameError::Malformed {
                what: "setup op",
                detail: format!("{other:#04x}"),
            }),
        }
    }
}

/// UDP_DATAGRAM payload: destination (or source, on the return path) plus
/// the sealed datagram bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub addr: DestAddr,
    pub port: u16,
    pub payload: Bytes,
}

impl UdpDatagram {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.payload.len());
        self.addr.put(&mut buf);
        buf.put_u16(self.port);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        let addr = DestAddr::take(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(FrameError::Truncated("datagram port"));
        }
        let port = buf.get_u16();
        Ok(Self {
            addr,
            port,
            payload: buf,
        })
    }
}

/// ICMP_ECHO payload: echo identifier, sequence, direction, sealed user
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub ident: u16,
    pub seq: u16,
    pub reply: bool,
    pub payload: Bytes,
}

impl IcmpEcho {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u16(self.ident);
        buf.put_u16(self.seq);
        buf.put_u8(u8::from(self.reply));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < 5 {
            return Err(FrameError::Truncated("icmp echo"));
        }
        let ident = buf.get_u16();
        let seq = buf.get_u16();
        let reply = buf.get_u8() != 0;
        Ok(Self {
            ident,
            seq,
            reply,
            payload: buf,
        })
    }
}

/// UDP_CLOSE / ICMP_CLOSE payload: one reason byte.
pub fn encode_close_reason(reason: u8) -> Bytes {
    Bytes::copy_from_slice(&[reason])
}

pub fn decode_close_reason(buf: Bytes) -> Result<u8, FrameError> {
    buf.first()
        .copied()
        .ok_or(FrameError::Truncated("close reason"))
}

/// PEER_HELLO / PEER_HELLO_ACK payload (CBOR).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHello {
    pub version: u8,
    pub agent_id: AgentId,
    pub timestamp_ns: u64,
    pub display_name: String,
    pub capabilities: Vec<String>,
}

/// One advertised reachability target: a CIDR prefix or a domain pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTarget {
    Cidr {
        family: u8,
        prefix_len: u8,
        bits: Vec<u8>,
    },
    Domain {
        pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    pub target: RouteTarget,
    pub metric: u16,
}

/// Payload of ROUTE_ADVERTISE and ROUTE_WITHDRAW (CBOR). The same shape
/// floods both ways; the frame type decides install versus remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFlood {
    pub origin: AgentId,
    pub origin_name: String,
    pub sequence: u64,
    pub routes: Vec<AdvertisedRoute>,
    /// Agents the announcement has visited, in order; origin first.
    pub path: Vec<AgentId>,
    /// Agents that have already processed the announcement.
    pub seen_by: Vec<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: AgentId,
    pub transport: TransportKind,
    pub direction: String,
}

/// NODE_INFO_ADVERTISE payload (CBOR): floods like a route announcement but
/// in its own sequence namespace; receivers keep only the latest per origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub origin: AgentId,
    pub sequence: u64,
    pub display_name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub start_time_unix: u64,
    pub addresses: Vec<String>,
    pub peers: Vec<PeerSummary>,
    pub management_key: Vec<u8>,
    pub path: Vec<AgentId>,
    pub seen_by: Vec<AgentId>,
}

/// CONTROL_REQUEST payload (CBOR): management-plane RPC addressed to a
/// specific agent, source-routed along `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: u64,
    pub kind: String,
    pub target: Option<AgentId>,
    pub path: Vec<AgentId>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub request_id: u64,
    pub kind: String,
    pub success: bool,
    pub data: serde_json::Value,
}

/// Encodes a CBOR control-plane payload.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    serde_cbor::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| FrameError::Malformed {
            what: "cbor payload",
            detail: e.to_string(),
        })
}

/// Decodes a CBOR control-plane payload.
pub fn decode_cbor<T: for<'de> Deserialize<'de>>(buf: &Bytes) -> Result<T, FrameError> {
    serde_cbor::from_slice(buf).map_err(|e| FrameError::Malformed {
        what: "cbor payload",
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id(fill: u8) -> AgentId {
        AgentId::from_bytes([fill; 16])
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            frame_type: FrameType::StreamData,
            flags: FLAG_FIN_WRITE,
            len: 1234,
            stream_id: 0xDEAD_BEEF,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.fin_write());
        assert!(!decoded.fin_read());
    }

    #[test]
    fn header_rejects_oversize() {
        let header = FrameHeader {
            frame_type: FrameType::StreamData,
            flags: 0,
            len: MAX_PAYLOAD as u32 + 1,
            stream_id: 1,
        };
        assert!(matches!(
            FrameHeader::decode(&header.encode()),
            Err(FrameError::Oversize(_))
        ));
    }

    #[test]
    fn unknown_type_survives_round_trip() {
        let header = FrameHeader {
            frame_type: FrameType::from_u8(0x7F),
            flags: 0,
            len: 0,
            stream_id: 9,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Unknown(0x7F));
    }

    #[tokio::test]
    async fn frame_async_round_trip() {
        let frame = Frame::new(
            FrameType::StreamData,
            42,
            Bytes::from_static(b"ciphertext bytes"),
        )
        .with_flags(FLAG_FIN_WRITE);
        let (mut a, mut b) = tokio::io::duplex(1024);
        frame.write_to(&mut a).await.unwrap();
        let back = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn stream_open_round_trip_all_addr_kinds() {
        for dest in [
            DestAddr::Ipv4("10.1.2.3".parse().unwrap()),
            DestAddr::Domain("example.com".into()),
            DestAddr::Ipv6("2001:db8::1".parse().unwrap()),
        ] {
            let open = StreamOpen {
                request_id: 7,
                dest: dest.clone(),
                port: 443,
                ttl: 16,
                path: vec![sample_id(1), sample_id(2)],
                ephemeral_pub: [9u8; 32],
            };
            let back = StreamOpen::decode(open.encode()).unwrap();
            assert_eq!(back, open);
        }
    }

    #[test]
    fn stream_open_rejects_truncated_key() {
        let open = StreamOpen {
            request_id: 7,
            dest: DestAddr::Ipv4("127.0.0.1".parse().unwrap()),
            port: 80,
            ttl: 4,
            path: vec![],
            ephemeral_pub: [0u8; 32],
        };
        let mut bytes = open.encode().to_vec();
        bytes.truncate(bytes.len() - 5);
        assert!(StreamOpen::decode(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn ack_err_reset_round_trip() {
        let ack = StreamOpenAck {
            request_id: 11,
            bound: DestAddr::Ipv4("192.0.2.1".parse().unwrap()),
            bound_port: 50000,
            ephemeral_pub: [3u8; 32],
        };
        assert_eq!(StreamOpenAck::decode(ack.encode()).unwrap(), ack);

        let err = StreamOpenErr::new(11, ErrorCode::TTL_EXCEEDED, "hop budget spent");
        assert_eq!(StreamOpenErr::decode(err.encode()).unwrap(), err);

        assert_eq!(
            decode_reset(encode_reset(ErrorCode::WRITE_FAILED)).unwrap(),
            ErrorCode::WRITE_FAILED
        );
    }

    #[test]
    fn open_err_message_truncates_at_255() {
        let err = StreamOpenErr::new(1, ErrorCode::NO_ROUTE, "x".repeat(400));
        assert_eq!(err.message.len(), 255);
        assert_eq!(StreamOpenErr::decode(err.encode()).unwrap(), err);
    }

    #[test]
    fn setup_op_round_trip() {
        for op in [
            SetupOp::Open {
                request_id: 4,
                dest: DestAddr::Ipv4("192.0.2.7".parse().unwrap()),
                port: 4444,
                ttl: 16,
                ephemeral_pub: [7u8; 32],
            },
            SetupOp::Ack {
                request_id: 4,
                ephemeral_pub: [8u8; 32],
            },
            SetupOp::Err {
                request_id: 4,
                code: ErrorCode::NOT_ALLOWED,
                message: "port blocked".into(),
            },
        ] {
            assert_eq!(SetupOp::decode(op.encode()).unwrap(), op);
        }
    }

    #[test]
    fn udp_datagram_and_icmp_echo_round_trip() {
        let dgram = UdpDatagram {
            addr: DestAddr::Ipv4("8.8.8.8".parse().unwrap()),
            port: 53,
            payload: Bytes::from_static(b"sealed"),
        };
        assert_eq!(UdpDatagram::decode(dgram.encode()).unwrap(), dgram);

        let echo = IcmpEcho {
            ident: 77,
            seq: 3,
            reply: true,
            payload: Bytes::from_static(b"ping"),
        };
        assert_eq!(IcmpEcho::decode(echo.encode()).unwrap(), echo);
    }

    #[test]
    fn cbor_payloads_round_trip() {
        let hello = PeerHello {
            version: PROTOCOL_VERSION,
            agent_id: sample_id(5),
            timestamp_ns: 123456789,
            display_name: "edge-1".into(),
            capabilities: vec!["tcp".into(), "udp".into()],
        };
        let bytes = encode_cbor(&hello).unwrap();
        assert_eq!(decode_cbor::<PeerHello>(&bytes).unwrap(), hello);

        let flood = RouteFlood {
            origin: sample_id(1),
            origin_name: "exit-a".into(),
            sequence: 42,
            routes: vec![
                AdvertisedRoute {
                    target: RouteTarget::Cidr {
                        family: 4,
                        prefix_len: 8,
                        bits: vec![10, 0, 0, 0],
                    },
                    metric: 1,
                },
                AdvertisedRoute {
                    target: RouteTarget::Domain {
                        pattern: "*.internal.example".into(),
                    },
                    metric: 1,
                },
            ],
            path: vec![sample_id(1)],
            seen_by: vec![sample_id(1)],
        };
        let bytes = encode_cbor(&flood).unwrap();
        assert_eq!(decode_cbor::<RouteFlood>(&bytes).unwrap(), flood);
    }

    #[test]
    fn keepalive_round_trip() {
        let ts = 1_234_567_890_123_456_789u64;
        assert_eq!(decode_keepalive(encode_keepalive(ts)).unwrap(), ts);
        assert_eq!(encode_keepalive(ts).len(), 8);
    }
}
