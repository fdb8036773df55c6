//! Write sequences produced by each desync method
//!
//! Runs with a paused clock so inter-fragment delays are observed exactly.

use std::sync::Arc;
use std::time::Duration;

use desync_tunnel::config::{DesyncMethod, DpiSettings};
use desync_tunnel::desync::{DesyncEngine, DesyncOutcome};

use super::{client_hello, RecordingWriter};

const DELAY: Duration = Duration::from_millis(50);

fn engine(settings: DpiSettings) -> DesyncEngine {
    DesyncEngine::new(Arc::new(settings))
}

fn settings(method: DesyncMethod) -> DpiSettings {
    DpiSettings {
        method,
        first_packet_size: 2,
        split_delay: 50,
        split_count: 4,
        ..DpiSettings::default()
    }
}

/// Ten bytes recognised as a `ClientHello`
const HELLO_PREFIX: &[u8] = b"\x16\x03\x01\x00\x05\x01ABCD";

#[tokio::test(start_paused = true)]
async fn test_split_two_then_rest_with_delay() {
    let mut out = RecordingWriter::default();
    let outcome = engine(settings(DesyncMethod::Split))
        .send_first_chunk(&mut out, HELLO_PREFIX, true)
        .await
        .unwrap();

    assert_eq!(outcome, DesyncOutcome::Applied(DesyncMethod::Split));
    let writes = out.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].data, &HELLO_PREFIX[..2]);
    assert_eq!(writes[1].data, &HELLO_PREFIX[2..]);
    assert!(writes[1].at - writes[0].at >= DELAY);
}

#[tokio::test(start_paused = true)]
async fn test_split_reverse_sends_tail_first() {
    let mut out = RecordingWriter::default();
    engine(settings(DesyncMethod::SplitReverse))
        .send_first_chunk(&mut out, HELLO_PREFIX, true)
        .await
        .unwrap();

    let writes = out.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].data.len(), 8);
    assert_eq!(writes[0].data, &HELLO_PREFIX[2..]);
    assert_eq!(writes[1].data, &HELLO_PREFIX[..2]);
    assert!(writes[1].at - writes[0].at >= DELAY);
}

#[tokio::test(start_paused = true)]
async fn test_disorder_equal_pieces_in_order() {
    let chunk = b"GET /abcdef\n";
    let mut out = RecordingWriter::default();
    engine(DpiSettings {
        split_count: 4,
        mix_host_case: false,
        ..settings(DesyncMethod::Disorder)
    })
    .send_first_chunk(&mut out, chunk, false)
    .await
    .unwrap();

    let payloads = out.payloads();
    assert_eq!(payloads, vec![b"GET".to_vec(), b" /a".to_vec(), b"bcd".to_vec(), b"ef\n".to_vec()]);

    let writes = out.writes();
    for pair in writes.windows(2) {
        assert!(pair[1].at - pair[0].at >= DELAY);
    }
}

#[tokio::test(start_paused = true)]
async fn test_disorder_reverse_descending_without_trailing_delay() {
    let chunk = b"GET /abcdef\n";
    let mut out = RecordingWriter::default();
    let start = tokio::time::Instant::now();
    engine(settings(DesyncMethod::DisorderReverse))
        .send_first_chunk(&mut out, chunk, false)
        .await
        .unwrap();
    let finished = tokio::time::Instant::now();

    let payloads = out.payloads();
    assert_eq!(payloads, vec![b"ef\n".to_vec(), b"bcd".to_vec(), b" /a".to_vec(), b"GET".to_vec()]);

    // Three gaps between four writes and no sleep after the last one
    let writes = out.writes();
    assert_eq!(writes.last().unwrap().at, finished);
    assert_eq!(finished - start, DELAY * 3);
}

#[tokio::test(start_paused = true)]
async fn test_fake_writes_decoy_then_splits() {
    let mut out = RecordingWriter::default();
    let outcome = engine(DpiSettings {
        fake_count: 2,
        ..settings(DesyncMethod::Fake)
    })
    .send_first_chunk(&mut out, HELLO_PREFIX, true)
    .await
    .unwrap();

    assert_eq!(outcome, DesyncOutcome::Applied(DesyncMethod::Fake));
    let decoy = DpiSettings::default().fake_payload();
    let payloads = out.payloads();
    assert_eq!(payloads.len(), 4);
    assert_eq!(payloads[0], decoy);
    assert_eq!(payloads[1], decoy);
    assert_eq!(payloads[2], &HELLO_PREFIX[..2]);
    assert_eq!(payloads[3], &HELLO_PREFIX[2..]);
}

#[tokio::test(start_paused = true)]
async fn test_whitelisted_host_single_write() {
    let request = b"GET / HTTP/1.1\r\nHost: news.blocked.example\r\n\r\n";
    let mut out = RecordingWriter::default();
    let outcome = engine(DpiSettings {
        whitelist: vec!["BLOCKED.example".into()],
        ..settings(DesyncMethod::Disorder)
    })
    .send_first_chunk(&mut out, request, false)
    .await
    .unwrap();

    assert_eq!(outcome, DesyncOutcome::Whitelisted);
    assert_eq!(out.payloads(), vec![request.to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_whitelisted_sni_single_write() {
    let hello = client_hello("video.example.org");
    let mut out = RecordingWriter::default();
    let outcome = engine(DpiSettings {
        whitelist: vec!["example.org".into()],
        ..settings(DesyncMethod::Split)
    })
    .send_first_chunk(&mut out, &hello, true)
    .await
    .unwrap();

    assert_eq!(outcome, DesyncOutcome::Whitelisted);
    assert_eq!(out.payloads(), vec![hello]);
}

#[tokio::test(start_paused = true)]
async fn test_https_without_client_hello_passes_through() {
    let mut out = RecordingWriter::default();
    let outcome = engine(settings(DesyncMethod::Split))
        .send_first_chunk(&mut out, b"\x17\x03\x03\x00\x02hi", true)
        .await
        .unwrap();

    assert_eq!(outcome, DesyncOutcome::Passthrough);
    assert_eq!(out.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_http_host_case_mixed_before_split() {
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut out = RecordingWriter::default();
    engine(settings(DesyncMethod::Split))
        .send_first_chunk(&mut out, request, false)
        .await
        .unwrap();

    let sent: Vec<u8> = out.payloads().concat();
    assert_eq!(sent.len(), request.len());
    let text = String::from_utf8(sent).unwrap();
    assert!(text.contains("Host: ExAmPlE.CoM\r\n"));
}
