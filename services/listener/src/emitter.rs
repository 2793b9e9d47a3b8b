//! Location event emitter.
//!
//! Every session gets its own emitter task, fed through a bounded queue. The
//! task resolves the device through the registry, builds the [`Location`] and
//! hands it to the sink, retrying sink failures with exponential backoff.
//! The read loop never waits on the registry or the sink: when the queue is
//! full the event is dropped and counted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracker_protocol::{DeviceIdentity, DeviceRef, DeviceRegistry, Location, LocationSink, Position};

use crate::config::DeliveryConfig;
use crate::stats::ListenerStats;

#[derive(Debug)]
struct Emission {
    identity: DeviceIdentity,
    position: Position,
}

/// Sending half of a session's emitter.
#[derive(Debug)]
pub struct EmitterHandle {
    tx: mpsc::Sender<Emission>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<ListenerStats>,
}

impl EmitterHandle {
    /// Spawn the emitter task. Cancelling `parent` cancels this emitter too.
    pub fn spawn<R, S>(
        registry: Arc<R>,
        sink: Arc<S>,
        policy: DeliveryConfig,
        stats: Arc<ListenerStats>,
        parent: &CancellationToken,
    ) -> Self
    where
        R: DeviceRegistry,
        S: LocationSink,
    {
        let (tx, rx) = mpsc::channel(policy.queue_capacity);
        let cancel = parent.child_token();
        let task = tokio::spawn(run_emitter(
            rx,
            registry,
            sink,
            policy,
            Arc::clone(&stats),
            cancel.clone(),
        ));
        EmitterHandle {
            tx,
            cancel,
            task,
            stats,
        }
    }

    /// Queue a position without waiting. Returns false if it was dropped.
    pub fn submit(&self, identity: DeviceIdentity, position: Position) -> bool {
        match self.tx.try_send(Emission { identity, position }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(e)) => {
                self.stats.location_dropped();
                warn!(device = %e.identity, "emitter queue full, dropping location");
                false
            }
            Err(mpsc::error::TrySendError::Closed(e)) => {
                self.stats.location_dropped();
                debug!(device = %e.identity, "emitter stopped, dropping location");
                false
            }
        }
    }

    /// Stop accepting events. With `drain`, already queued events are still
    /// delivered; otherwise pending work is cancelled. The returned handle
    /// completes when the task has exited.
    pub fn close(self, drain: bool) -> JoinHandle<()> {
        drop(self.tx);
        if !drain {
            self.cancel.cancel();
        }
        self.task
    }
}

async fn run_emitter<R, S>(
    mut rx: mpsc::Receiver<Emission>,
    registry: Arc<R>,
    sink: Arc<S>,
    policy: DeliveryConfig,
    stats: Arc<ListenerStats>,
    cancel: CancellationToken,
) where
    R: DeviceRegistry,
    S: LocationSink,
{
    let mut resolved: Option<(DeviceIdentity, DeviceRef)> = None;

    loop {
        let emission = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(e) => e,
                None => break,
            },
        };

        let cached = resolved
            .as_ref()
            .filter(|(identity, _)| *identity == emission.identity)
            .map(|(_, device)| device.clone());
        let device = match cached {
            Some(device) => device,
            None => {
                let lookup = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.location_dropped();
                        break;
                    }
                    r = registry.resolve(&emission.identity) => r,
                };
                match lookup {
                    Ok(Some(device)) => {
                        debug!(device = %emission.identity, device_id = %device.device_id, "device resolved");
                        resolved = Some((emission.identity.clone(), device.clone()));
                        device
                    }
                    Ok(None) => {
                        stats.device_unresolved();
                        warn!(device = %emission.identity, "unknown device, dropping location");
                        continue;
                    }
                    Err(e) => {
                        stats.location_dropped();
                        warn!(device = %emission.identity, error = %e, "registry lookup failed, dropping location");
                        continue;
                    }
                }
            }
        };

        let location = Location::new(device, emission.identity.protocol, emission.position);
        if !deliver(sink.as_ref(), &location, &policy, &stats, &cancel).await {
            break;
        }
    }

    rx.close();
    while rx.try_recv().is_ok() {
        stats.location_dropped();
    }
}

/// Submit with bounded retries. Returns false only when cancelled.
async fn deliver<S: LocationSink>(
    sink: &S,
    location: &Location,
    policy: &DeliveryConfig,
    stats: &ListenerStats,
    cancel: &CancellationToken,
) -> bool {
    let mut backoff = policy.backoff;
    for attempt in 1..=policy.max_attempts {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stats.location_dropped();
                return false;
            }
            r = sink.submit(location) => r,
        };
        match result {
            Ok(()) => {
                stats.location_emitted();
                return true;
            }
            Err(e) if attempt == policy.max_attempts => {
                stats.sink_failure();
                warn!(
                    device_id = %location.device().device_id,
                    attempts = attempt,
                    error = %e,
                    "sink failed, dropping location"
                );
                return true;
            }
            Err(e) => {
                warn!(
                    device_id = %location.device().device_id,
                    attempt,
                    retry_in_ms = backoff.as_millis() as u64,
                    error = %e,
                    "sink failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.location_dropped();
                        return false;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff, policy.max_backoff);
            }
        }
    }
    true
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
