// listener-test-utils: Shared test utilities for the listener suite.
//
// Provides in-memory sink and registry doubles plus a mock device client
// for integration testing of the listener and its sessions.

pub mod mock_device;
pub mod mock_registry;
pub mod recording_sink;

pub use mock_device::MockDevice;
pub use mock_registry::MemoryRegistry;
pub use recording_sink::{FailingSink, RecordingSink};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracker_protocol::{
        DeviceIdentity, DeviceRegistry, Location, LocationSink, Position, ProtocolFamily,
    };

    fn location(device_id: &str) -> Location {
        let position = Position::builder("2021-05-17T21:55:08Z".parse().unwrap(), 1.0, 2.0)
            .build()
            .unwrap();
        Location::new(
            tracker_protocol::DeviceRef {
                device_id: device_id.to_owned(),
                asset_id: None,
            },
            ProtocolFamily::Gt06,
            position,
        )
    }

    /// Test: recording sink hands out locations in submission order and
    /// wakes waiters.
    #[tokio::test]
    async fn recording_sink_waits_for_count() {
        let sink = RecordingSink::new();
        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for(2, Duration::from_secs(5)).await })
        };
        sink.submit(&location("a")).await.unwrap();
        sink.submit(&location("b")).await.unwrap();
        let got = waiter.await.unwrap().expect("two locations");
        let ids: Vec<&str> = got.iter().map(|l| l.device().device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    /// Test: wait_for gives up after the timeout.
    #[tokio::test(start_paused = true)]
    async fn recording_sink_wait_times_out() {
        let sink = RecordingSink::new();
        assert!(sink.wait_for(1, Duration::from_secs(1)).await.is_none());
    }

    /// Test: failing sink fails exactly the configured number of times.
    #[tokio::test]
    async fn failing_sink_recovers() {
        let sink = FailingSink::new(2);
        assert!(sink.submit(&location("a")).await.is_err());
        assert!(sink.submit(&location("a")).await.is_err());
        assert!(sink.submit(&location("a")).await.is_ok());
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.recorded().len(), 1);
    }

    /// Test: memory registry resolves only what was added and counts lookups.
    #[tokio::test]
    async fn memory_registry_resolves_added_devices() {
        let registry = MemoryRegistry::new();
        let known = DeviceIdentity::new("123", ProtocolFamily::Meitrack);
        registry.add(known.clone(), "dev-1");
        assert_eq!(
            registry.resolve(&known).await.unwrap().unwrap().device_id,
            "dev-1"
        );
        let unknown = DeviceIdentity::new("999", ProtocolFamily::Meitrack);
        assert!(registry.resolve(&unknown).await.unwrap().is_none());
        assert_eq!(registry.lookups(), 2);
    }

    /// Test: mock device sends in chunks and reads replies.
    #[tokio::test]
    async fn mock_device_chunks_and_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut got = vec![0u8; 6];
            stream.read_exact(&mut got).await.unwrap();
            stream.write_all(b"ok").await.unwrap();
            got
        });

        let mut device = MockDevice::connect(addr).await.unwrap();
        device.send_in_chunks(b"abcdef", 1).await.unwrap();
        let reply = device.read_exact(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, b"ok");
        assert_eq!(server.await.unwrap(), b"abcdef");
    }
}
