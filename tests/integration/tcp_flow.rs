//! TCP session lifecycle through the flow table

use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use desync_tunnel::config::{DpiSettings, LimitsConfig, SettingsStore};
use desync_tunnel::error::SessionError;
use desync_tunnel::packet::{tcp_flags, FlowKey, PacketView};
use desync_tunnel::tcp::{TcpFlowTable, TcpState};
use desync_tunnel::tunnel::{
    BoxedStream, DialOptions, Dialer, InterfaceWriter, MemoryInterface, MemoryInterfaceHandle,
};

use super::{client, eventually, parse_tcp, server, tcp_frame, TcpHarness, WAIT};

const ISN: u32 = 1000;

fn plain_settings() -> DpiSettings {
    DpiSettings {
        desync_http: false,
        desync_https: false,
        ..DpiSettings::default()
    }
}

async fn established(harness: &TcpHarness, port: u16) -> bool {
    let key = FlowKey::tcp(client(port), server(80));
    let Some(session) = harness.table.session(&key) else {
        return false;
    };
    eventually(|| {
        let session = Arc::clone(&session);
        async move { session.state().await == TcpState::Established }
    })
    .await
}

/// SYN from `port` and the SYN-ACK; returns the engine's sequence number
async fn handshake(harness: &mut TcpHarness, port: u16) -> u32 {
    harness
        .send(&tcp_frame(client(port), server(80), ISN, tcp_flags::SYN, b""))
        .await;
    let (tcp, _) = harness.expect_frame().await;
    assert_eq!(tcp.flags, tcp_flags::SYN | tcp_flags::ACK);
    assert_eq!(tcp.ack, ISN + 1);
    tcp.seq.wrapping_add(1)
}

fn data(port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    tcp_frame(client(port), server(80), seq, tcp_flags::PSH | tcp_flags::ACK, payload)
}

#[tokio::test]
async fn test_syn_creates_connecting_session() {
    let mut harness = TcpHarness::new(plain_settings(), false);
    let server_seq = handshake(&mut harness, 40001).await;

    let key = FlowKey::tcp(client(40001), server(80));
    let session = harness.table.session(&key).expect("session tracked");
    assert_eq!(session.state().await, TcpState::Connecting);
    assert_eq!(session.peer_isn(), ISN);
    assert_eq!(session.expected_seq().await, ISN + 1);
    assert!(server_seq < 0x8000_0001);
}

#[tokio::test]
async fn test_connecting_buffer_flushed_in_order() {
    let mut harness = TcpHarness::new(plain_settings(), false);
    handshake(&mut harness, 40002).await;

    let first = b"first chunk;";
    let second = b"second chunk";
    harness.send(&data(40002, ISN + 1, first)).await;
    let (ack, _) = harness.expect_frame().await;
    assert_eq!(ack.flags, tcp_flags::ACK);
    assert_eq!(ack.ack, ISN + 1 + 12);

    harness.send(&data(40002, ISN + 13, second)).await;
    let (ack, _) = harness.expect_frame().await;
    assert_eq!(ack.ack, ISN + 1 + 24);

    harness.dialer.open();
    let (addr, mut far) = harness.dialer.next_stream().await;
    assert_eq!(addr, server(80));

    let mut received = vec![0u8; 24];
    tokio::time::timeout(WAIT, far.read_exact(&mut received))
        .await
        .expect("buffered data not flushed")
        .unwrap();
    assert_eq!(&received, b"first chunk;second chunk");

    let key = FlowKey::tcp(client(40002), server(80));
    let session = harness.table.session(&key).unwrap();
    assert_eq!(session.state().await, TcpState::Established);
    assert_eq!(harness.table.stats().bytes_in, 24);
}

#[tokio::test]
async fn test_destination_reply_reaches_client() {
    let mut harness = TcpHarness::new(plain_settings(), true);
    let server_seq = handshake(&mut harness, 40003).await;
    let (_, mut far) = harness.dialer.next_stream().await;

    assert!(established(&harness, 40003).await);

    far.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    let (tcp, payload) = harness.expect_frame().await;
    assert_eq!(tcp.flags, tcp_flags::PSH | tcp_flags::ACK);
    assert_eq!(tcp.seq, server_seq);
    assert_eq!(tcp.ack, ISN + 1);
    assert_eq!(tcp.src_port, 80);
    assert_eq!(tcp.dst_port, 40003);
    assert_eq!(payload, b"HTTP/1.1 200 OK\r\n\r\n");
}

#[tokio::test]
async fn test_large_reply_split_by_mss() {
    let limits = LimitsConfig {
        mss: 600,
        ..LimitsConfig::default()
    };
    let mut harness = TcpHarness::with_limits(plain_settings(), limits, true);
    let server_seq = handshake(&mut harness, 40004).await;
    let (_, mut far) = harness.dialer.next_stream().await;

    assert!(established(&harness, 40004).await);

    far.write_all(&[0x42; 1500]).await.unwrap();

    let mut total = 0;
    let mut expected_seq = server_seq;
    while total < 1500 {
        let (tcp, payload) = harness.expect_frame().await;
        assert!(payload.len() <= 600);
        assert_eq!(tcp.seq, expected_seq);
        expected_seq = expected_seq.wrapping_add(payload.len() as u32);
        total += payload.len();
    }
    assert_eq!(total, 1500);
}

#[tokio::test]
async fn test_fin_closes_and_removes_session() {
    let mut harness = TcpHarness::new(plain_settings(), true);
    handshake(&mut harness, 40005).await;
    let (_, mut far) = harness.dialer.next_stream().await;
    assert!(established(&harness, 40005).await);

    harness.send(&data(40005, ISN + 1, b"bye")).await;
    let (ack, _) = harness.expect_frame().await;
    assert_eq!(ack.ack, ISN + 4);

    let key = FlowKey::tcp(client(40005), server(80));
    let session = harness.table.session(&key).unwrap();

    let fin = tcp_frame(client(40005), server(80), ISN + 4, tcp_flags::FIN | tcp_flags::ACK, b"");
    harness.send(&fin).await;
    let (fin_ack, _) = harness.expect_frame().await;
    assert_eq!(fin_ack.flags, tcp_flags::FIN | tcp_flags::ACK);
    assert_eq!(fin_ack.ack, ISN + 5);

    assert_eq!(session.state().await, TcpState::Closed);
    assert!(!harness.table.contains(&key));

    // Acknowledged data is still delivered, then the real socket is shut down
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, far.read_to_end(&mut received))
        .await
        .expect("real socket not shut down")
        .unwrap();
    assert_eq!(received, b"bye");

    // Late data for the closed flow is ignored
    harness.send(&data(40005, ISN + 5, b"late")).await;
    harness.expect_silence().await;
}

#[tokio::test]
async fn test_distinct_source_ports_get_distinct_sessions() {
    let mut harness = TcpHarness::new(plain_settings(), false);
    handshake(&mut harness, 41000).await;
    handshake(&mut harness, 41001).await;

    assert_eq!(harness.table.len(), 2);
    let a = harness.table.session(&FlowKey::tcp(client(41000), server(80))).unwrap();
    let b = harness.table.session(&FlowKey::tcp(client(41001), server(80))).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(harness.table.stats().sessions_total, 2);
}

#[tokio::test]
async fn test_repeated_syn_replaces_session() {
    let mut harness = TcpHarness::new(plain_settings(), false);
    handshake(&mut harness, 42000).await;
    let key = FlowKey::tcp(client(42000), server(80));
    let old = harness.table.session(&key).unwrap();

    handshake(&mut harness, 42000).await;
    let new = harness.table.session(&key).unwrap();

    assert_ne!(old.id(), new.id());
    assert_eq!(old.state().await, TcpState::Closed);
    assert_eq!(harness.table.len(), 1);
}

#[tokio::test]
async fn test_connect_failure_resets_client() {
    let TcpHarness {
        table,
        mut iface,
        dialer,
    } = TcpHarness::new(plain_settings(), false);
    // Closing the gate channel makes every pending connect fail
    drop(dialer);

    let frame = tcp_frame(client(43000), server(80), ISN, tcp_flags::SYN, b"");
    let view = PacketView::parse(&frame).unwrap();
    table.process_packet(&view).await;

    let syn_ack = iface.recv_timeout(WAIT).await.unwrap();
    assert_eq!(parse_tcp(&syn_ack).0.flags, tcp_flags::SYN | tcp_flags::ACK);

    let rst = iface.recv_timeout(WAIT).await.expect("no RST after failed connect");
    let (tcp, _) = parse_tcp(&rst);
    assert_eq!(tcp.flags, tcp_flags::RST | tcp_flags::ACK);

    let key = FlowKey::tcp(client(43000), server(80));
    assert!(
        eventually(|| {
            let table = table.clone();
            async move { !table.contains(&key) }
        })
        .await
    );
}

#[tokio::test]
async fn test_first_http_chunk_desynchronized() {
    let mut harness = TcpHarness::new(
        DpiSettings {
            split_delay: 10,
            ..DpiSettings::default()
        },
        true,
    );
    handshake(&mut harness, 44000).await;
    let (_, mut far) = harness.dialer.next_stream().await;

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    harness.send(&data(44000, ISN + 1, request)).await;
    harness.expect_frame().await;

    let mut received = vec![0u8; request.len()];
    tokio::time::timeout(WAIT, far.read_exact(&mut received))
        .await
        .expect("request not relayed")
        .unwrap();
    assert_eq!(&received, b"GET / HTTP/1.1\r\nHost: ExAmPlE.CoM\r\n\r\n");

    let table = harness.table.clone();
    assert!(
        eventually(|| {
            let table = table.clone();
            async move { table.stats().desynced == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_fin_while_connecting_flushes_buffer() {
    let mut harness = TcpHarness::new(plain_settings(), false);
    handshake(&mut harness, 40006).await;

    harness.send(&data(40006, ISN + 1, b"queued")).await;
    let (ack, _) = harness.expect_frame().await;
    assert_eq!(ack.ack, ISN + 7);

    let fin = tcp_frame(client(40006), server(80), ISN + 7, tcp_flags::FIN | tcp_flags::ACK, b"");
    harness.send(&fin).await;
    let (fin_ack, _) = harness.expect_frame().await;
    assert_eq!(fin_ack.flags, tcp_flags::FIN | tcp_flags::ACK);
    assert_eq!(fin_ack.ack, ISN + 8);
    assert!(!harness.table.contains(&FlowKey::tcp(client(40006), server(80))));

    // The connect completes after the FIN and still delivers the data
    harness.dialer.open();
    let (_, mut far) = harness.dialer.next_stream().await;
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, far.read_to_end(&mut received))
        .await
        .expect("real socket not shut down")
        .unwrap();
    assert_eq!(received, b"queued");
    harness.expect_silence().await;
}

#[tokio::test]
async fn test_destination_close_sends_fin() {
    let mut harness = TcpHarness::new(plain_settings(), true);
    let server_seq = handshake(&mut harness, 40007).await;
    let (_, far) = harness.dialer.next_stream().await;
    assert!(established(&harness, 40007).await);

    drop(far);
    let (fin_ack, payload) = harness.expect_frame().await;
    assert_eq!(fin_ack.flags, tcp_flags::FIN | tcp_flags::ACK);
    assert_eq!(fin_ack.seq, server_seq);
    assert_eq!(fin_ack.ack, ISN + 1);
    assert!(payload.is_empty());

    let table = harness.table.clone();
    let key = FlowKey::tcp(client(40007), server(80));
    assert!(
        eventually(|| {
            let table = table.clone();
            async move { !table.contains(&key) }
        })
        .await
    );
}

/// Destination stream whose reads or writes fail
struct BrokenStream {
    fail_reads: bool,
}

impl AsyncRead for BrokenStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.fail_reads {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        } else {
            Poll::Pending
        }
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct BrokenDialer {
    fail_reads: bool,
}

#[async_trait]
impl Dialer for BrokenDialer {
    async fn connect_tcp(&self, _addr: SocketAddrV4, _opts: DialOptions) -> Result<BoxedStream, SessionError> {
        Ok(Box::new(BrokenStream {
            fail_reads: self.fail_reads,
        }))
    }
}

fn broken_table(fail_reads: bool) -> (TcpFlowTable, MemoryInterfaceHandle) {
    let (iface, handle) = MemoryInterface::pair(16);
    let table = TcpFlowTable::new(
        Arc::new(InterfaceWriter::new(Arc::new(iface))),
        Arc::new(SettingsStore::new(plain_settings())),
        Arc::new(BrokenDialer { fail_reads }),
        LimitsConfig::default(),
        CancellationToken::new(),
    );
    (table, handle)
}

async fn feed(table: &TcpFlowTable, frame: &[u8]) {
    table.process_packet(&PacketView::parse(frame).unwrap()).await;
}

async fn next_flags(iface: &mut MemoryInterfaceHandle) -> u8 {
    let frame = iface.recv_timeout(WAIT).await.expect("expected a frame from the engine");
    parse_tcp(&frame).0.flags
}

#[tokio::test]
async fn test_read_error_resets_client() {
    let (table, mut iface) = broken_table(true);
    feed(&table, &tcp_frame(client(40008), server(80), ISN, tcp_flags::SYN, b"")).await;
    assert_eq!(next_flags(&mut iface).await, tcp_flags::SYN | tcp_flags::ACK);
    assert_eq!(next_flags(&mut iface).await, tcp_flags::RST | tcp_flags::ACK);

    let key = FlowKey::tcp(client(40008), server(80));
    assert!(
        eventually(|| {
            let table = table.clone();
            async move { !table.contains(&key) }
        })
        .await
    );
}

#[tokio::test]
async fn test_write_error_resets_client() {
    let (table, mut iface) = broken_table(false);
    feed(&table, &tcp_frame(client(40009), server(80), ISN, tcp_flags::SYN, b"")).await;
    assert_eq!(next_flags(&mut iface).await, tcp_flags::SYN | tcp_flags::ACK);

    let key = FlowKey::tcp(client(40009), server(80));
    let session = table.session(&key).unwrap();
    assert!(
        eventually(|| {
            let session = Arc::clone(&session);
            async move { session.state().await == TcpState::Established }
        })
        .await
    );

    feed(&table, &data(40009, ISN + 1, b"hello")).await;
    assert_eq!(next_flags(&mut iface).await, tcp_flags::ACK);
    assert_eq!(next_flags(&mut iface).await, tcp_flags::RST | tcp_flags::ACK);
    assert_eq!(session.state().await, TcpState::Closed);
}
