//! UDP association and ICMP echo-session scenarios across a three-agent
//! chain with the exit performing the real socket work.

mod support;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use trellis::frame::DestAddr;
use trellis::stream::StreamEvent;

use support::{agent, agent_with, link, settle};

async fn spawn_udp_echo() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, src)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], src).await;
        }
    });
    addr
}

#[tokio::test]
async fn udp_associate_relays_datagrams_end_to_end() {
    let ingress = agent("ingress", &[]);
    let transit = agent("transit", &[]);
    let exit = agent_with("exit", &["127.0.0.0/8"], |cfg| {
        cfg.udp.enabled = true;
    });

    link(&ingress, &transit).await;
    link(&transit, &exit).await;
    settle().await;

    let echo_addr = spawn_udp_echo().await;
    let socks_addr = ingress.bind_socks().await.unwrap();

    // SOCKS5: greeting, then UDP ASSOCIATE with an unspecified target.
    let mut control = TcpStream::connect(socks_addr).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    control.read_exact(&mut reply).await.unwrap();
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut assoc_reply = [0u8; 10];
    control.read_exact(&mut assoc_reply).await.unwrap();
    assert_eq!(assoc_reply[1], 0x00, "associate must succeed");
    let relay_ip: [u8; 4] = assoc_reply[4..8].try_into().unwrap();
    let relay_port = u16::from_be_bytes([assoc_reply[8], assoc_reply[9]]);
    let relay = std::net::SocketAddr::from((relay_ip, relay_port));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = trellis::udp::encode_socks_udp_header(
        &DestAddr::Ipv4("127.0.0.1".parse().unwrap()),
        echo_addr.port(),
        b"dns-ish payload",
    );
    client.send_to(&packet, relay).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("datagram should come back")
        .unwrap();
    assert_eq!(from, relay);
    let (src, src_port, payload) = trellis::udp::parse_socks_udp_header(&buf[..n]).unwrap();
    assert_eq!(src, DestAddr::Ipv4("127.0.0.1".parse().unwrap()));
    assert_eq!(src_port, echo_addr.port());
    assert_eq!(payload, b"dns-ish payload");

    ingress.shutdown().await;
    transit.shutdown().await;
    exit.shutdown().await;
}

#[tokio::test]
async fn icmp_session_round_trips_sealed_echoes() {
    let ingress = agent("ingress", &[]);
    let transit = agent("transit", &[]);
    let exit = agent_with("exit", &["127.0.0.0/8"], |cfg| {
        cfg.icmp.enabled = true;
    });

    link(&ingress, &transit).await;
    link(&transit, &exit).await;
    settle().await;

    let target = DestAddr::Ipv4("127.0.0.1".parse().unwrap());
    let mut session = ingress.open_icmp(target).await.expect("session opens");

    session.send_echo(0x42, 1, false, b"probe one").unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), session.recv_event())
        .await
        .expect("echo reply expected")
        .expect("session alive");
    match reply {
        StreamEvent::Echo(echo) => {
            assert!(echo.reply);
            assert_eq!(echo.ident, 0x42);
            assert_eq!(echo.seq, 1);
            assert_eq!(session.open_sealed(&echo.payload).unwrap(), b"probe one");
        }
        other => panic!("expected an echo event, got {other:?}"),
    }

    // Sequence numbers keep flowing on the same session.
    session.send_echo(0x42, 2, false, b"probe two").unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), session.recv_event())
        .await
        .unwrap()
        .unwrap();
    match reply {
        StreamEvent::Echo(echo) => assert_eq!(echo.seq, 2),
        other => panic!("expected an echo event, got {other:?}"),
    }

    ingress.shutdown().await;
    transit.shutdown().await;
    exit.shutdown().await;
}

#[tokio::test]
async fn icmp_target_outside_allowlist_is_refused() {
    let ingress = agent("ingress", &[]);
    let exit = agent_with("exit", &["0.0.0.0/0"], |cfg| {
        cfg.icmp.enabled = true;
        cfg.icmp.allowed_cidrs = vec!["10.0.0.0/8".into()];
    });

    link(&ingress, &exit).await;
    settle().await;

    let target = DestAddr::Ipv4("192.168.1.1".parse().unwrap());
    let err = ingress.open_icmp(target).await.expect_err("must be refused");
    match err {
        trellis::error::StreamError::Rejected { code, .. } => {
            assert_eq!(code, trellis::error::ErrorCode::NOT_ALLOWED);
        }
        other => panic!("expected a rejection, got {other}"),
    }

    ingress.shutdown().await;
    exit.shutdown().await;
}
