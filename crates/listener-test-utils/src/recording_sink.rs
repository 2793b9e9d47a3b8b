// recording_sink: In-memory LocationSink doubles.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracker_protocol::{Location, LocationSink, SinkError};

/// Records every submitted location. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    locations: Mutex<Vec<Location>>,
    changed: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything submitted so far, in submission order.
    pub fn recorded(&self) -> Vec<Location> {
        self.inner.locations.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.locations.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` locations are recorded. Returns the
    /// snapshot, or None on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Option<Vec<Location>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.changed.notified();
                let snapshot = self.recorded();
                if snapshot.len() >= count {
                    return snapshot;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn record(&self, location: &Location) {
        self.inner.locations.lock().unwrap().push(location.clone());
        self.inner.changed.notify_waiters();
    }
}

impl LocationSink for RecordingSink {
    async fn submit(&self, location: &Location) -> Result<(), SinkError> {
        self.record(location);
        Ok(())
    }
}

/// Fails the first `failures` submissions, then records like
/// [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct FailingSink {
    remaining_failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    recorder: RecordingSink,
}

impl FailingSink {
    pub fn new(failures: usize) -> Self {
        FailingSink {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
            recorder: RecordingSink::new(),
        }
    }

    /// Total submit calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<Location> {
        self.recorder.recorded()
    }

    pub fn recorder(&self) -> &RecordingSink {
        &self.recorder
    }
}

impl LocationSink for FailingSink {
    async fn submit(&self, location: &Location) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::Unavailable("injected failure".to_owned()));
        }
        self.recorder.record(location);
        Ok(())
    }
}
