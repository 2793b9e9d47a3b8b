//! Datagram sessions: several UDP sources sharing one endpoint, each with
//! its own session, plus a TCP endpoint on the same port.
//!
//! # Scenarios
//! 1. Interleaved datagrams from many sources are attributed per source.
//! 2. TCP and UDP endpoints bound to the same port run side by side.
//! 3. Shutdown with idle UDP sessions completes.

use listener_test_utils::{MockDevice, RecordingSink};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracklink::listener::acceptor::{Acceptor, ListenerContext, ListenerHandle};
use tracklink::listener::config::{Transport, load_config_from_str};
use tracklink::listener::registry::ConfiguredRegistry;
use tracklink::tracker_protocol::fixtures::{Gt06Fix, gt06_location, gt06_login, meitrack_aaa};
use tracklink::tracker_protocol::gt06::{PROTO_LOGIN, ack};

const WAIT: Duration = Duration::from_secs(5);

async fn start(toml: &str, sink: RecordingSink) -> ListenerHandle {
    let cfg = load_config_from_str(toml).expect("config loads");
    let ctx = ListenerContext::new(
        ConfiguredRegistry::from_config(&cfg.registry),
        sink,
        cfg.session.clone(),
        cfg.delivery.clone(),
    );
    Acceptor::new(ctx).bind(&cfg.endpoints).await.expect("bind")
}

fn bound(handle: &ListenerHandle, transport: Transport) -> std::net::SocketAddr {
    handle
        .local_addrs()
        .iter()
        .find(|b| b.transport == transport)
        .map(|b| b.local_addr)
        .expect("endpoint bound")
}

#[tokio::test]
async fn interleaved_sources_are_attributed_per_source() {
    let sink = RecordingSink::new();
    let handle = start(
        r#"
schema_version = 1

[[endpoints]]
address = "127.0.0.1"
port = 0
transport = "udp"
protocols = ["gt06"]
"#,
        sink.clone(),
    )
    .await;
    let target = bound(&handle, Transport::Udp);

    let imeis = ["355951091348701", "355951091348702", "355951091348703"];
    let mut sockets = Vec::new();
    for imei in imeis {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&gt06_login(imei, 1), target).await.unwrap();
        let mut buf = [0u8; 32];
        let (n, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("login ack")
            .unwrap();
        assert_eq!(&buf[..n], ack(PROTO_LOGIN, 1).as_slice());
        sockets.push(socket);
    }

    for second in 0..3u8 {
        for (i, socket) in sockets.iter().enumerate() {
            let fix = Gt06Fix {
                time: [21, 5, 17, 21, 55, second],
                latitude: 40.0 + i as f64,
                longitude: 3.0,
                speed: 5,
                course: 10,
                valid: true,
                satellites: 6,
            };
            socket
                .send_to(&gt06_location(&fix, 2 + u16::from(second)), target)
                .await
                .unwrap();
        }
    }

    let got = sink.wait_for(9, WAIT).await.expect("all datagrams delivered");
    let mut per_device: HashMap<String, Vec<f64>> = HashMap::new();
    for location in &got {
        per_device
            .entry(location.device().device_id.clone())
            .or_default()
            .push(location.position().latitude());
    }
    for (i, imei) in imeis.iter().enumerate() {
        assert_eq!(per_device[*imei], vec![40.0 + i as f64; 3]);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn tcp_and_udp_share_a_port() {
    // reserve a free port number for both transports
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let toml = format!(
        r#"
schema_version = 1

[[endpoints]]
address = "127.0.0.1"
port = {port}
protocols = ["meitrack"]

[[endpoints]]
address = "127.0.0.1"
port = {port}
transport = "udp"
protocols = ["meitrack"]
"#
    );
    let sink = RecordingSink::new();
    let handle = start(&toml, sink.clone()).await;
    assert_eq!(handle.local_addrs().len(), 2);

    let mut tcp = MockDevice::connect(bound(&handle, Transport::Tcp)).await.unwrap();
    tcp.send(&meitrack_aaa("862170013556541", "210517215508", 1.0, 2.0))
        .await
        .unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(
        &meitrack_aaa("862170013556542", "210517215509", 1.0, 2.0),
        bound(&handle, Transport::Udp),
    )
    .await
    .unwrap();

    let got = sink.wait_for(2, WAIT).await.expect("both transports delivered");
    let mut ids: Vec<&str> = got.iter().map(|l| l.device().device_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["862170013556541", "862170013556542"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_with_idle_datagram_sessions_completes() {
    let handle = start(
        r#"
schema_version = 1

[[endpoints]]
address = "127.0.0.1"
port = 0
transport = "udp"
protocols = ["gt06"]
"#,
        RecordingSink::new(),
    )
    .await;
    let target = bound(&handle, Transport::Udp);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&gt06_login("355951091348701", 1), target).await.unwrap();
    let mut buf = [0u8; 32];
    tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("login ack")
        .unwrap();

    let stats = std::sync::Arc::clone(handle.stats());
    tokio::time::timeout(WAIT, handle.shutdown())
        .await
        .expect("shutdown completes");
    assert_eq!(stats.snapshot().connections_active, 0);
}
