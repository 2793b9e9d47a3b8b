//! Hostile input: scanners, floods and corrupted frames against a TCP
//! endpoint, alongside a well-behaved device that must be unaffected.
//!
//! # Scenarios
//! 1. A request that matches no decoder is disconnected.
//! 2. A frame header announcing more than the buffer limit is disconnected.
//! 3. Corrupted frames are dropped and counted, good frames around them
//!    still arrive.
//! 4. A device trickling bytes one at a time is served normally.
//! 5. A session sending nothing but garbage after a valid header is closed
//!    by the identification timeout without emitting anything.

use listener_test_utils::{MockDevice, RecordingSink};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracklink::listener::acceptor::{Acceptor, ListenerContext, ListenerHandle};
use tracklink::listener::config::load_config_from_str;
use tracklink::listener::registry::ConfiguredRegistry;
use tracklink::tracker_protocol::fixtures::{Gt06Fix, gt06_location, gt06_login, meitrack_aaa};
use tracklink::tracker_protocol::gt06::{PROTO_LOGIN, ack};

const WAIT: Duration = Duration::from_secs(5);
const IMEI: &str = "862170013556541";

const CONFIG: &str = r#"
schema_version = 1

[session]
identification_timeout_secs = 1
max_buffer_bytes = 512
probe_bytes = 16

[[endpoints]]
address = "127.0.0.1"
port = 0
protocols = ["meitrack", "gt06"]
"#;

async fn start(sink: RecordingSink) -> ListenerHandle {
    let cfg = load_config_from_str(CONFIG).expect("config loads");
    let ctx = ListenerContext::new(
        ConfiguredRegistry::from_config(&cfg.registry),
        sink,
        cfg.session.clone(),
        cfg.delivery.clone(),
    );
    Acceptor::new(ctx).bind(&cfg.endpoints).await.expect("bind")
}

fn fix(second: u8) -> Gt06Fix {
    Gt06Fix {
        time: [21, 5, 17, 21, 55, second],
        latitude: 45.0,
        longitude: -75.0,
        speed: 0,
        course: 0,
        valid: true,
        satellites: 4,
    }
}

#[tokio::test]
async fn http_request_is_disconnected() {
    let handle = start(RecordingSink::new()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut scanner = MockDevice::connect(addr).await.unwrap();
    scanner
        .send(b"GET / HTTP/1.1\r\nHost: tracker.example\r\n\r\n")
        .await
        .unwrap();
    assert!(scanner.wait_closed(WAIT).await);
    assert!(handle.stats().framing_errors.load(Ordering::Relaxed) > 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_is_disconnected() {
    let handle = start(RecordingSink::new()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut flood = MockDevice::connect(addr).await.unwrap();
    // long-form GT06 header announcing a 768 byte body
    let mut bytes = vec![0x79, 0x79, 0x03, 0x00];
    bytes.resize(700, 0);
    // the listener may hang up mid-write
    let _ = flood.send(&bytes).await;
    assert!(flood.wait_closed(WAIT).await);

    handle.shutdown().await;
}

#[tokio::test]
async fn corrupted_frames_do_not_disturb_good_ones() {
    let sink = RecordingSink::new();
    let handle = start(sink.clone()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut device = MockDevice::connect(addr).await.unwrap();
    device.send(&gt06_login("355951091348789", 1)).await.unwrap();
    assert_eq!(device.read_exact(10, WAIT).await.unwrap(), ack(PROTO_LOGIN, 1));

    let mut stream = Vec::new();
    for second in 0..6u8 {
        let mut frame = gt06_location(&fix(second), 10 + u16::from(second));
        if second % 2 == 1 {
            // flip a bit in the coordinates
            frame[12] ^= 0x04;
        }
        stream.extend(frame);
    }
    stream.extend_from_slice(b"\x00\xff noise ");
    stream.extend(gt06_location(&fix(59), 99));
    device.send(&stream).await.unwrap();

    let got = sink.wait_for(4, WAIT).await.expect("good frames delivered");
    let seconds: Vec<String> = got
        .iter()
        .map(|l| l.position().timestamp().format("%S").to_string())
        .collect();
    assert_eq!(seconds, vec!["00", "02", "04", "59"]);
    assert!(got.iter().all(|l| l.position().latitude() == 45.0));
    assert_eq!(handle.stats().decode_errors.load(Ordering::Relaxed), 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn trickled_bytes_are_reassembled() {
    let sink = RecordingSink::new();
    let handle = start(sink.clone()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut slow = MockDevice::connect(addr).await.unwrap();
    let frame = meitrack_aaa(IMEI, "210517215508", 22.913191, 114.079882);
    for byte in &frame {
        slow.send(std::slice::from_ref(byte)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let got = sink.wait_for(1, WAIT).await.expect("location delivered");
    assert_eq!(got[0].device().device_id, IMEI);

    handle.shutdown().await;
}

#[tokio::test]
async fn garbage_after_valid_header_times_out_silently() {
    let sink = RecordingSink::new();
    let handle = start(sink.clone()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut device = MockDevice::connect(addr).await.unwrap();
    // binds the GT06 decoder, then never logs in
    device.send(&[0x78, 0x78, 0x01, 0x02, 0x03]).await.unwrap();
    device.send(&gt06_location(&fix(1), 2)).await.unwrap();
    assert!(device.wait_closed(WAIT).await);
    assert!(sink.is_empty());

    handle.shutdown().await;
}
