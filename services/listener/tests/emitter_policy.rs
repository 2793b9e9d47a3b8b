/// Integration tests for the location emitter: resolution, retry with
/// backoff, queue overflow and cancellation.
///
/// Time is paused so backoff sleeps complete instantly.
use listener::config::DeliveryConfig;
use listener::emitter::EmitterHandle;
use listener::stats::ListenerStats;
use listener_test_utils::{FailingSink, MemoryRegistry, RecordingSink};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracker_protocol::{DeviceIdentity, DeviceRef, DeviceRegistry, Position, ProtocolFamily, RegistryError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn identity() -> DeviceIdentity {
    DeviceIdentity::new("862170013556541", ProtocolFamily::Meitrack)
}

fn position(latitude: f64) -> Position {
    Position::builder("2021-05-17T21:55:08Z".parse().unwrap(), latitude, 10.0)
        .build()
        .unwrap()
}

fn policy(max_attempts: u32, queue_capacity: usize) -> DeliveryConfig {
    DeliveryConfig {
        max_attempts,
        backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(150),
        queue_capacity,
    }
}

fn known_registry() -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry.add(identity(), "truck-7");
    registry
}

#[derive(Debug)]
struct BrokenRegistry;

impl DeviceRegistry for BrokenRegistry {
    async fn resolve(&self, _identity: &DeviceIdentity) -> Result<Option<DeviceRef>, RegistryError> {
        Err(RegistryError::Unavailable("connection refused".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sink_failures_are_retried_with_backoff() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(FailingSink::new(2));
    let emitter = EmitterHandle::spawn(
        Arc::new(known_registry()),
        Arc::clone(&sink),
        policy(3, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    let started = Instant::now();
    assert!(emitter.submit(identity(), position(1.0)));
    emitter.close(true).await.unwrap();

    assert_eq!(sink.attempts(), 3);
    let recorded = sink.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].device().device_id, "truck-7");
    // 100ms, then doubled but capped at 150ms
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(stats.locations_emitted.load(Ordering::Relaxed), 1);
    assert_eq!(stats.sink_failures.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_count_a_sink_failure() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(FailingSink::new(100));
    let emitter = EmitterHandle::spawn(
        Arc::new(known_registry()),
        Arc::clone(&sink),
        policy(3, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    emitter.submit(identity(), position(1.0));
    emitter.submit(identity(), position(2.0));
    emitter.close(true).await.unwrap();

    assert_eq!(sink.attempts(), 6);
    assert!(sink.recorded().is_empty());
    assert_eq!(stats.sink_failures.load(Ordering::Relaxed), 2);
    assert_eq!(stats.locations_emitted.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn locations_are_delivered_in_order_with_one_lookup() {
    let stats = Arc::new(ListenerStats::new());
    let registry = known_registry();
    let sink = Arc::new(RecordingSink::new());
    let emitter = EmitterHandle::spawn(
        Arc::new(registry.clone()),
        Arc::clone(&sink),
        policy(1, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    for lat in [1.0, 2.0, 3.0] {
        assert!(emitter.submit(identity(), position(lat)));
    }
    emitter.close(true).await.unwrap();

    let lats: Vec<f64> = sink.recorded().iter().map(|l| l.position().latitude()).collect();
    assert_eq!(lats, vec![1.0, 2.0, 3.0]);
    assert_eq!(registry.lookups(), 1);
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_device_is_dropped_and_not_cached() {
    let stats = Arc::new(ListenerStats::new());
    let registry = MemoryRegistry::new();
    let sink = Arc::new(RecordingSink::new());
    let emitter = EmitterHandle::spawn(
        Arc::new(registry.clone()),
        Arc::clone(&sink),
        policy(1, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    emitter.submit(identity(), position(1.0));
    emitter.submit(identity(), position(2.0));
    emitter.close(true).await.unwrap();

    assert!(sink.is_empty());
    assert_eq!(registry.lookups(), 2);
    assert_eq!(stats.unresolved_devices.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn registry_error_drops_location() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(RecordingSink::new());
    let emitter = EmitterHandle::spawn(
        Arc::new(BrokenRegistry),
        Arc::clone(&sink),
        policy(1, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    emitter.submit(identity(), position(1.0));
    emitter.close(true).await.unwrap();

    assert!(sink.is_empty());
    assert_eq!(stats.locations_dropped.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Backpressure and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_drops_without_blocking() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(RecordingSink::new());
    let emitter = EmitterHandle::spawn(
        Arc::new(known_registry()),
        Arc::clone(&sink),
        policy(1, 1),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    // the emitter task has not run yet on this single-threaded runtime
    let accepted: Vec<bool> = [1.0, 2.0, 3.0]
        .into_iter()
        .map(|lat| emitter.submit(identity(), position(lat)))
        .collect();
    assert_eq!(accepted, vec![true, false, false]);
    assert_eq!(stats.locations_dropped.load(Ordering::Relaxed), 2);

    emitter.close(true).await.unwrap();
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.recorded()[0].position().latitude(), 1.0);
}

#[tokio::test]
async fn close_without_drain_discards_queued_locations() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(RecordingSink::new());
    let emitter = EmitterHandle::spawn(
        Arc::new(known_registry()),
        Arc::clone(&sink),
        policy(1, 16),
        Arc::clone(&stats),
        &CancellationToken::new(),
    );

    emitter.submit(identity(), position(1.0));
    emitter.submit(identity(), position(2.0));
    emitter.close(false).await.unwrap();

    assert!(sink.is_empty());
    assert_eq!(stats.locations_dropped.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_interrupts_backoff() {
    let stats = Arc::new(ListenerStats::new());
    let sink = Arc::new(FailingSink::new(100));
    let parent = CancellationToken::new();
    let emitter = EmitterHandle::spawn(
        Arc::new(known_registry()),
        Arc::clone(&sink),
        DeliveryConfig {
            max_attempts: 5,
            backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            queue_capacity: 16,
        },
        Arc::clone(&stats),
        &parent,
    );

    emitter.submit(identity(), position(1.0));
    // let the first attempt fail and the backoff start
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.attempts(), 1);

    parent.cancel();
    emitter.close(true).await.unwrap();
    assert_eq!(sink.attempts(), 1);
    assert_eq!(stats.locations_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(stats.sink_failures.load(Ordering::Relaxed), 0);
}
