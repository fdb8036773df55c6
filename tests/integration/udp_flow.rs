//! UDP relay over loopback sockets

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use desync_tunnel::config::{DpiSettings, SettingsStore};
use desync_tunnel::packet::{FlowKey, PacketBuilder, PacketView};
use desync_tunnel::tunnel::{InterfaceWriter, MemoryInterface, MemoryInterfaceHandle, NoopProtector};
use desync_tunnel::udp::UdpFlowTable;

use super::{client, eventually, WAIT};

fn table(idle: Duration) -> (UdpFlowTable, MemoryInterfaceHandle) {
    table_with(DpiSettings::default(), idle)
}

fn table_with(settings: DpiSettings, idle: Duration) -> (UdpFlowTable, MemoryInterfaceHandle) {
    let (iface, handle) = MemoryInterface::pair(16);
    let table = UdpFlowTable::new(
        Arc::new(InterfaceWriter::new(Arc::new(iface))),
        Arc::new(SettingsStore::new(settings)),
        Arc::new(NoopProtector),
        idle,
        CancellationToken::new(),
    );
    (table, handle)
}

/// Loopback echo server; returns its address
async fn echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

fn send(table: &UdpFlowTable, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) {
    let frame = PacketBuilder::udp(src, dst, payload);
    table.process_packet(&PacketView::parse(&frame).unwrap());
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (table, mut iface) = table(Duration::from_secs(30));
    let echo = echo_server().await;

    send(&table, client(5000), echo, b"ping over udp");

    let frame = iface.recv_timeout(WAIT).await.expect("no reply frame");
    let view = PacketView::parse(&frame).unwrap();
    let udp = view.udp().unwrap();
    assert_eq!(view.src_ip(), *echo.ip());
    assert_eq!(udp.src_port, echo.port());
    assert_eq!(view.dst_ip(), *client(5000).ip());
    assert_eq!(udp.dst_port, 5000);
    assert_eq!(view.payload(), b"ping over udp");

    let stats = table.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.bytes_in, 13);
    let table_ref = table.clone();
    assert!(
        eventually(|| {
            let table = table_ref.clone();
            async move { table.stats().bytes_out == 13 }
        })
        .await
    );
}

#[tokio::test]
async fn test_session_reused_per_flow() {
    let (table, mut iface) = table(Duration::from_secs(30));
    let echo = echo_server().await;

    send(&table, client(5001), echo, b"one");
    send(&table, client(5001), echo, b"two");
    send(&table, client(5002), echo, b"three");

    for _ in 0..3 {
        assert!(iface.recv_timeout(WAIT).await.is_some());
    }
    assert_eq!(table.len(), 2);
    assert!(table.session(&FlowKey::udp(client(5001), echo)).is_some());
    assert!(table.session(&FlowKey::udp(client(5002), echo)).is_some());
}

#[tokio::test]
async fn test_quic_dropped_without_session() {
    let (table, mut iface) = table(Duration::from_secs(30));
    let quic = SocketAddrV4::new(Ipv4Addr::new(142, 250, 1, 1), 443);

    send(&table, client(5003), quic, b"\xc3\x00\x00\x00\x01");

    assert!(table.is_empty());
    assert_eq!(table.stats().quic_dropped, 1);
    assert!(iface.recv_timeout(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_unexpected_peer_ignored() {
    let (table, mut iface) = table(Duration::from_secs(30));
    let echo = echo_server().await;

    send(&table, client(5004), echo, b"hello");
    assert!(iface.recv_timeout(WAIT).await.is_some());

    let session = table.session(&FlowKey::udp(client(5004), echo)).unwrap();
    let local = session.local_addr().unwrap();
    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger
        .send_to(b"spoofed", SocketAddr::from((Ipv4Addr::LOCALHOST, local.port())))
        .await
        .unwrap();

    assert!(iface.recv_timeout(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_idle_session_reaped() {
    let (table, mut iface) = table(Duration::from_millis(200));
    let echo = echo_server().await;

    send(&table, client(5005), echo, b"once");
    assert!(iface.recv_timeout(WAIT).await.is_some());
    assert_eq!(table.len(), 1);

    let table_ref = table.clone();
    assert!(
        eventually(|| {
            let table = table_ref.clone();
            async move { table.is_empty() }
        })
        .await
    );
}

#[tokio::test]
async fn test_shutdown_clears_sessions() {
    let (table, mut iface) = table(Duration::from_secs(30));
    let echo = echo_server().await;

    send(&table, client(5006), echo, b"x");
    assert!(iface.recv_timeout(WAIT).await.is_some());

    table.shutdown();
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_dns_redirected_to_custom_resolver() {
    let resolver = echo_server().await;
    let settings = DpiSettings {
        custom_dns_enabled: true,
        custom_dns: resolver.to_string(),
        ..DpiSettings::default()
    };
    let (table, mut iface) = table_with(settings, Duration::from_secs(30));
    let requested = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

    send(&table, client(5300), requested, b"\x12\x34 dns query");

    let frame = iface.recv_timeout(WAIT).await.expect("resolver reply not relayed");
    let view = PacketView::parse(&frame).unwrap();
    let udp = view.udp().unwrap();
    // The client sees the answer from the server it asked, not the resolver
    assert_eq!(view.src_ip(), *requested.ip());
    assert_eq!(udp.src_port, 53);
    assert_eq!(view.dst_ip(), *client(5300).ip());
    assert_eq!(udp.dst_port, 5300);
    assert_eq!(view.payload(), b"\x12\x34 dns query");

    let session = table
        .session(&FlowKey::udp(client(5300), requested))
        .expect("session tracked under the requested address");
    assert_eq!(session.target(), resolver);
    assert_eq!(table.stats().dns_redirected, 1);
    table.shutdown();
}
