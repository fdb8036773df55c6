//! Frame dispatch, statistics and shutdown of the whole engine

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use desync_tunnel::config::{DesyncMethod, DpiSettings, EngineConfig, SettingsStore};
use desync_tunnel::error::EngineError;
use desync_tunnel::packet::tcp_flags;
use desync_tunnel::tunnel::{MemoryInterface, MemoryInterfaceHandle, NoopProtector, TunnelEngine};

use super::{client, client_hello, eventually, gated_dialer, parse_tcp, server, tcp_frame, DialerControl, WAIT};

struct Running {
    engine: Arc<TunnelEngine>,
    iface: MemoryInterfaceHandle,
    dialer: DialerControl,
    task: JoinHandle<Result<(), EngineError>>,
}

fn start(dpi: DpiSettings) -> Running {
    let mut config = EngineConfig::default();
    config.limits.stats_interval_frames = 1;
    config.dpi = dpi;

    let (iface, handle) = MemoryInterface::pair(64);
    let (dialer, control) = gated_dialer(true);
    let engine = Arc::new(TunnelEngine::new(
        Arc::new(iface),
        Arc::new(SettingsStore::new(config.dpi.clone())),
        &config,
        dialer,
        Arc::new(NoopProtector),
    ));

    let run_engine = Arc::clone(&engine);
    let task = tokio::spawn(async move { run_engine.run().await });
    Running {
        engine,
        iface: handle,
        dialer: control,
        task,
    }
}

async fn wait_stats<F>(engine: &Arc<TunnelEngine>, check: F) -> bool
where
    F: Fn(&desync_tunnel::TrafficStats) -> bool,
{
    eventually(|| {
        let stats = engine.stats();
        let ok = check(&stats);
        async move { ok }
    })
    .await
}

#[tokio::test]
async fn test_bad_frames_counted_and_dropped() {
    let mut running = start(DpiSettings::default());

    // IPv6 header start, truncated IPv4, and an ICMP datagram
    running.iface.inject(vec![0x60, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
    running.iface.inject(vec![0x45, 0, 0, 40, 0]).await.unwrap();
    let mut icmp = vec![0u8; 28];
    icmp[0] = 0x45;
    icmp[2..4].copy_from_slice(&28u16.to_be_bytes());
    icmp[9] = 1;
    running.iface.inject(icmp).await.unwrap();

    assert!(wait_stats(&running.engine, |s| s.packets_in == 3).await);
    let stats = running.engine.stats();
    assert_eq!(stats.parse_errors, 1);
    assert_eq!(stats.packets_out, 0);
    assert!(running.iface.recv_timeout(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_client_hello_desynced_end_to_end() {
    let mut running = start(DpiSettings {
        split_delay: 5,
        ..DpiSettings::default()
    });

    let syn = tcp_frame(client(45000), server(443), 7000, tcp_flags::SYN, b"");
    running.iface.inject(syn).await.unwrap();
    let (syn_ack, _) = parse_tcp(&running.iface.recv_timeout(WAIT).await.unwrap());
    assert_eq!(syn_ack.ack, 7001);

    let (_, mut far) = running.dialer.next_stream().await;

    let hello = client_hello("rutracker.org");
    let data = tcp_frame(client(45000), server(443), 7001, tcp_flags::PSH | tcp_flags::ACK, &hello);
    running.iface.inject(data).await.unwrap();

    let mut received = vec![0u8; hello.len()];
    tokio::time::timeout(WAIT, far.read_exact(&mut received))
        .await
        .expect("ClientHello not relayed")
        .unwrap();
    assert_eq!(received, hello);

    assert!(wait_stats(&running.engine, |s| s.desynced_flows == 1).await);
    let stats = running.engine.stats();
    assert_eq!(stats.tcp_sessions, 1);
    assert!(stats.packets_out >= 2);
}

#[tokio::test]
async fn test_whitelisted_sni_not_desynced() {
    let mut running = start(DpiSettings {
        whitelist: vec!["rutracker".into()],
        ..DpiSettings::default()
    });

    running
        .iface
        .inject(tcp_frame(client(45001), server(443), 1, tcp_flags::SYN, b""))
        .await
        .unwrap();
    assert!(running.iface.recv_timeout(WAIT).await.is_some());
    let (_, mut far) = running.dialer.next_stream().await;

    let hello = client_hello("rutracker.org");
    running
        .iface
        .inject(tcp_frame(client(45001), server(443), 2, tcp_flags::PSH | tcp_flags::ACK, &hello))
        .await
        .unwrap();

    let mut received = vec![0u8; hello.len()];
    tokio::time::timeout(WAIT, far.read_exact(&mut received))
        .await
        .expect("ClientHello not relayed")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(running.engine.stats().desynced_flows, 0);
}

#[tokio::test]
async fn test_stop_clears_tables_and_ends_loop() {
    let mut running = start(DpiSettings::default());
    running
        .iface
        .inject(tcp_frame(client(45002), server(80), 1, tcp_flags::SYN, b""))
        .await
        .unwrap();
    assert!(running.iface.recv_timeout(WAIT).await.is_some());
    assert_eq!(running.engine.tcp().len(), 1);
    assert!(running.engine.is_running());

    running.engine.stop().await;

    assert!(running.engine.tcp().is_empty());
    assert!(running.engine.udp().is_empty());
    let result = tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(!running.engine.is_running());
}

#[tokio::test]
async fn test_interface_close_ends_loop() {
    let mut running = start(DpiSettings::default());
    running.iface.close();
    let result = tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_reload_settings() {
    let running = start(DpiSettings::default());
    assert_eq!(running.engine.settings().method, DesyncMethod::Split);

    let invalid = DpiSettings {
        fake_hex: "not hex".into(),
        ..DpiSettings::default()
    };
    assert!(running.engine.reload_settings(invalid).is_err());
    assert_eq!(running.engine.settings().method, DesyncMethod::Split);

    let disorder = DpiSettings {
        method: DesyncMethod::Disorder,
        ..DpiSettings::default()
    };
    running.engine.reload_settings(disorder).unwrap();
    assert_eq!(running.engine.settings().method, DesyncMethod::Disorder);
}

#[tokio::test]
async fn test_stats_published() {
    let running = start(DpiSettings::default());
    let mut stats = running.engine.subscribe_stats();

    running
        .iface
        .inject(tcp_frame(client(45003), server(80), 1, tcp_flags::ACK, b""))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, stats.changed()).await.unwrap().unwrap();
    assert_eq!(stats.borrow().packets_in, 1);
}
