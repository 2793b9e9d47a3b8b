//! End-to-end: many devices of every protocol talking to one TCP endpoint
//! at once, configured from a TOML file with a static registry.
//!
//! # Scenarios
//! 1. Every registered device's locations arrive, attributed to the right
//!    device id and in the order the device sent them.
//! 2. Chunk boundaries differ per device and never change the outcome.
//! 3. A device missing from the registry produces nothing.

use listener_test_utils::{MockDevice, RecordingSink};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tracklink::listener::acceptor::{Acceptor, ListenerContext, ListenerHandle};
use tracklink::listener::config::load_config_from_path;
use tracklink::listener::registry::ConfiguredRegistry;
use tracklink::tracker_protocol::ProtocolFamily;
use tracklink::tracker_protocol::fixtures::{
    AvlRecord, Gt06Fix, gt06_location, gt06_login, meitrack_aaa, teltonika_avl, teltonika_imei,
};
use tracklink::tracker_protocol::teltonika::CODEC_8E;

const DEVICES: usize = 12;
const FIXES_PER_DEVICE: u8 = 5;
const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn imei(i: usize) -> String {
    format!("35000000000{:04}", i)
}

fn protocol(i: usize) -> ProtocolFamily {
    ProtocolFamily::ALL[i % ProtocolFamily::ALL.len()]
}

fn write_config(devices: usize) -> tempfile::NamedTempFile {
    let mut toml = String::from(
        r#"
schema_version = 1

[registry]
mode = "static"
"#,
    );
    for i in 0..devices {
        toml.push_str(&format!(
            "\n[[registry.devices]]\nidentifier = \"{}\"\nprotocol = \"{}\"\ndevice_id = \"unit-{}\"\n",
            imei(i),
            protocol(i),
            i
        ));
    }
    toml.push_str(
        r#"
[[endpoints]]
address = "127.0.0.1"
port = 0
protocols = ["meitrack", "gt06", "teltonika"]
"#,
    );
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    write!(f, "{}", toml).expect("write config");
    f
}

async fn start(config: &tempfile::NamedTempFile, sink: RecordingSink) -> ListenerHandle {
    let cfg = load_config_from_path(config.path()).expect("config loads");
    let ctx = ListenerContext::new(
        ConfiguredRegistry::from_config(&cfg.registry),
        sink,
        cfg.session.clone(),
        cfg.delivery.clone(),
    );
    Acceptor::new(ctx).bind(&cfg.endpoints).await.expect("bind")
}

/// Everything device `i` sends, with fixes at seconds 0..FIXES_PER_DEVICE.
fn device_stream(i: usize) -> Vec<u8> {
    let id = imei(i);
    let latitude = 10.0 + i as f64;
    let mut out = Vec::new();
    match protocol(i) {
        ProtocolFamily::Meitrack => {
            for s in 0..FIXES_PER_DEVICE {
                out.extend(meitrack_aaa(&id, &format!("2105172155{:02}", s), latitude, 20.0));
            }
        }
        ProtocolFamily::Gt06 => {
            out.extend(gt06_login(&id, 1));
            for s in 0..FIXES_PER_DEVICE {
                let fix = Gt06Fix {
                    time: [21, 5, 17, 21, 55, s],
                    latitude,
                    longitude: 20.0,
                    speed: 10,
                    course: 45,
                    valid: true,
                    satellites: 6,
                };
                out.extend(gt06_location(&fix, 2 + u16::from(s)));
            }
        }
        ProtocolFamily::Teltonika => {
            out.extend(teltonika_imei(&id));
            let records: Vec<AvlRecord> = (0..FIXES_PER_DEVICE)
                .map(|s| AvlRecord {
                    timestamp_ms: 1_621_288_500_000 + u64::from(s) * 1000,
                    latitude,
                    longitude: 20.0,
                    altitude: 100,
                    angle: 45,
                    satellites: 9,
                    speed: 10,
                    odometer: Some(5_000 + u32::from(s)),
                    gsm_signal: Some(3),
                    hdop_tenths: Some(8),
                })
                .collect();
            out.extend(teltonika_avl(CODEC_8E, &records));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_devices_deliver_ordered_attributed_locations() {
    let config = write_config(DEVICES);
    let sink = RecordingSink::new();
    let handle = start(&config, sink.clone()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut tasks = Vec::new();
    for i in 0..DEVICES {
        tasks.push(tokio::spawn(async move {
            let mut device = MockDevice::connect(addr).await.expect("connect");
            device
                .send_in_chunks(&device_stream(i), i % 7 + 1)
                .await
                .expect("send");
            device
        }));
    }
    let mut devices = Vec::new();
    for task in tasks {
        devices.push(task.await.expect("device task"));
    }

    let expected = DEVICES * usize::from(FIXES_PER_DEVICE);
    let got = sink.wait_for(expected, WAIT).await.expect("all locations delivered");
    assert_eq!(got.len(), expected);

    let mut by_device: HashMap<String, Vec<_>> = HashMap::new();
    for location in &got {
        by_device
            .entry(location.device().device_id.clone())
            .or_default()
            .push(location.clone());
    }
    assert_eq!(by_device.len(), DEVICES);
    for i in 0..DEVICES {
        let locations = &by_device[&format!("unit-{}", i)];
        assert_eq!(locations.len(), usize::from(FIXES_PER_DEVICE));
        assert!(locations.iter().all(|l| l.protocol() == protocol(i)));
        assert!(
            locations
                .windows(2)
                .all(|w| w[0].position().timestamp() < w[1].position().timestamp()),
            "unit-{} out of order",
            i
        );
        let expected_lat = 10.0 + i as f64;
        assert!(
            locations
                .iter()
                .all(|l| (l.position().latitude() - expected_lat).abs() < 1e-5)
        );
    }

    drop(devices);
    handle.shutdown().await;
}

#[tokio::test]
async fn unregistered_device_is_not_published() {
    let config = write_config(1);
    let sink = RecordingSink::new();
    let handle = start(&config, sink.clone()).await;
    let addr = handle.local_addrs()[0].local_addr;

    let mut stranger = MockDevice::connect(addr).await.unwrap();
    stranger
        .send(&meitrack_aaa("999999999999999", "210517215500", 1.0, 1.0))
        .await
        .unwrap();
    // device 0 is the registered Meitrack unit
    let mut known = MockDevice::connect(addr).await.unwrap();
    known.send(&device_stream(0)).await.unwrap();

    let got = sink
        .wait_for(usize::from(FIXES_PER_DEVICE), WAIT)
        .await
        .expect("registered device delivered");
    assert!(got.iter().all(|l| l.device().device_id == "unit-0"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.len(), usize::from(FIXES_PER_DEVICE));

    handle.shutdown().await;
}
