//! UDP associations: the exit side of SOCKS5 UDP-ASSOCIATE.
//!
//! Each association owns one unconnected kernel socket. Datagram frames
//! arriving from the mesh carry a destination and sealed payload; datagrams
//! arriving on the socket are sealed and returned stamped with their
//! source. The configured port allow-list is enforced per datagram.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::UdpConfig;
use crate::crypto::{EphemeralKeyPair, Role, SessionKey, MAX_PLAINTEXT};
use crate::error::ErrorCode;
use crate::frame::{DestAddr, FrameType, SetupOp};
use crate::peer::PeerHandle;
use crate::stream::{StreamEvent, StreamKind, StreamManager};

/// Exit-side UDP association handler.
pub struct UdpExit {
    config: UdpConfig,
    manager: StreamManager,
    active: Arc<AtomicUsize>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl UdpExit {
    pub fn new(config: UdpConfig, manager: StreamManager, cancel: CancellationToken) -> Self {
        Self {
            config,
            manager,
            active: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn active_associations(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Handles a UDP_SETUP open terminating at this exit.
    pub async fn handle_open(&self, from: &PeerHandle, stream_id: u64, op: SetupOp) {
        let SetupOp::Open {
            request_id,
            dest,
            port,
            ephemeral_pub,
            ..
        } = op
        else {
            return;
        };

        if !self.config.enabled {
            self.manager.send_setup_err(
                from,
                stream_id,
                FrameType::UdpSetup,
                request_id,
                ErrorCode::EXIT_DISABLED,
            );
            return;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(target: "trellis::udp", %err, "association socket bind failed");
                self.manager.send_setup_err(
                    from,
                    stream_id,
                    FrameType::UdpSetup,
                    request_id,
                    ErrorCode::WRITE_FAILED,
                );
                return;
            }
        };

        let keypair = EphemeralKeyPair::generate();
        let responder_pub = keypair.public_bytes();
        let key = SessionKey::derive(
            keypair.agree(&ephemeral_pub),
            request_id,
            &ephemeral_pub,
            &responder_pub,
            Role::Responder,
        );

        let handle = self.manager.register_responder(
            from,
            stream_id,
            request_id,
            StreamKind::Udp,
            dest,
            port,
            key,
        );
        let ack = SetupOp::Ack {
            request_id,
            ephemeral_pub: responder_pub,
        };
        if from
            .send_data(crate::frame::Frame::new(
                FrameType::UdpSetup,
                stream_id,
                ack.encode(),
            ))
            .is_err()
        {
            return;
        }

        info!(
            target: "trellis::udp",
            peer = %from.id().short(),
            stream_id,
            "udp association open"
        );

        self.active.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(self.active.clone());
        self.tracker.spawn(pump_association(
            handle,
            socket,
            self.config.clone(),
            self.cancel.clone(),
            guard,
        ));
    }

    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn pump_association(
    mut handle: crate::stream::StreamHandle,
    socket: UdpSocket,
    config: UdpConfig,
    cancel: CancellationToken,
    _guard: ActiveGuard,
) {
    let sender = handle.sender();
    let mut buf = vec![0u8; MAX_PLAINTEXT];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = handle.recv_event() => match event {
                Some(StreamEvent::Datagram(datagram)) => {
                    if !sender.state().can_read() {
                        // FIN_READ went out; inbound datagrams get dropped.
                        continue;
                    }
                    if !config.port_allowed(datagram.port) {
                        debug!(
                            target: "trellis::udp",
                            port = datagram.port,
                            "datagram to disallowed port dropped"
                        );
                        continue;
                    }
                    let Some(ip) = datagram.addr.as_ip() else {
                        // Domain-addressed datagrams resolve with the
                        // exit's own view.
                        let DestAddr::Domain(name) = &datagram.addr else { continue };
                        match tokio::net::lookup_host((name.as_str(), datagram.port)).await {
                            Ok(mut addrs) => {
                                if let Some(sa) = addrs.next() {
                                    forward_datagram(&socket, &sender, sa, &datagram.payload).await;
                                }
                            }
                            Err(err) => {
                                debug!(target: "trellis::udp", %err, "datagram resolve failed");
                            }
                        }
                        continue;
                    };
                    let target = SocketAddr::new(ip, datagram.port);
                    forward_datagram(&socket, &sender, target, &datagram.payload).await;
                }
                Some(StreamEvent::Close) | Some(StreamEvent::Reset(_)) | None => break,
                Some(_) => continue,
            },
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((n, src)) => {
                    let addr = match src.ip() {
                        IpAddr::V4(v4) => DestAddr::Ipv4(v4),
                        IpAddr::V6(v6) => DestAddr::Ipv6(v6),
                    };
                    if sender.send_datagram(addr, src.port(), &buf[..n]).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(target: "trellis::udp", %err, "association socket error");
                    break;
                }
            },
        }
    }
}

async fn forward_datagram(
    socket: &UdpSocket,
    sender: &crate::stream::StreamSender,
    target: SocketAddr,
    sealed: &[u8],
) {
    let plain = match sender.open_sealed(sealed) {
        Ok(plain) => plain,
        Err(err) => {
            debug!(target: "trellis::udp", %err, "rejecting sealed datagram");
            sender.reset(ErrorCode::WRITE_FAILED);
            return;
        }
    };
    if let Err(err) = socket.send_to(&plain, target).await {
        debug!(target: "trellis::udp", %err, %target, "datagram send failed; closing read half");
        // The socket cannot deliver outbound datagrams anymore; tell the
        // ingress to stop producing while return traffic keeps flowing.
        let _ = sender.finish_read();
    }
}

/// SOCKS5 UDP request header (RFC 1928 §7): RSV(2) FRAG(1) ATYP ADDR PORT.
pub fn parse_socks_udp_header(buf: &[u8]) -> Option<(DestAddr, u16, &[u8])> {
    if buf.len() < 4 || buf[2] != 0 {
        // Fragmented datagrams are not supported.
        return None;
    }
    let (dest, consumed) = match buf[3] {
        0x01 => {
            if buf.len() < 10 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            (DestAddr::Ipv4(octets.into()), 8)
        }
        0x03 => {
            let len = *buf.get(4)? as usize;
            if buf.len() < 5 + len + 2 {
                return None;
            }
            let name = std::str::from_utf8(&buf[5..5 + len]).ok()?;
            (DestAddr::Domain(name.to_string()), 5 + len)
        }
        0x04 => {
            if buf.len() < 22 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            (DestAddr::Ipv6(octets.into()), 20)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([buf[consumed], buf[consumed + 1]]);
    Some((dest, port, &buf[consumed + 2..]))
}

/// Builds the SOCKS5 UDP reply header for a datagram returned to the client.
pub fn encode_socks_udp_header(addr: &DestAddr, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22 + payload.len());
    out.extend_from_slice(&[0, 0, 0]);
    match addr {
        DestAddr::Ipv4(v4) => {
            out.push(0x01);
            out.extend_from_slice(&v4.octets());
        }
        DestAddr::Domain(name) => {
            out.push(0x03);
            out.push(name.len().min(255) as u8);
            out.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
        }
        DestAddr::Ipv6(v6) => {
            out.push(0x04);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks_udp_header_round_trip() {
        let encoded = encode_socks_udp_header(
            &DestAddr::Ipv4("8.8.8.8".parse().unwrap()),
            53,
            b"query",
        );
        let (dest, port, payload) = parse_socks_udp_header(&encoded).unwrap();
        assert_eq!(dest, DestAddr::Ipv4("8.8.8.8".parse().unwrap()));
        assert_eq!(port, 53);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn socks_udp_header_domain_and_v6() {
        let encoded =
            encode_socks_udp_header(&DestAddr::Domain("dns.example".into()), 53, b"q");
        let (dest, port, payload) = parse_socks_udp_header(&encoded).unwrap();
        assert_eq!(dest, DestAddr::Domain("dns.example".into()));
        assert_eq!(port, 53);
        assert_eq!(payload, b"q");

        let encoded =
            encode_socks_udp_header(&DestAddr::Ipv6("2001:db8::1".parse().unwrap()), 123, b"x");
        let (dest, _, _) = parse_socks_udp_header(&encoded).unwrap();
        assert_eq!(dest, DestAddr::Ipv6("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn fragmented_datagrams_rejected() {
        let mut encoded =
            encode_socks_udp_header(&DestAddr::Ipv4("1.2.3.4".parse().unwrap()), 9, b"p");
        encoded[2] = 1;
        assert!(parse_socks_udp_header(&encoded).is_none());
    }

    #[test]
    fn truncated_headers_rejected() {
        assert!(parse_socks_udp_header(&[0, 0, 0]).is_none());
        assert!(parse_socks_udp_header(&[0, 0, 0, 0x01, 1, 2]).is_none());
        assert!(parse_socks_udp_header(&[0, 0, 0, 0x09, 0, 0]).is_none());
    }
}
