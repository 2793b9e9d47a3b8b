//! Lock-free listener counters shared by every acceptor, session and emitter.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    /// Connections or datagram sources turned away by `max_sessions`.
    pub connections_rejected: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_active: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub framing_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub identifications: AtomicU64,
    pub locations_emitted: AtomicU64,
    /// Dropped because the per-session emitter queue was full or cancelled.
    pub locations_dropped: AtomicU64,
    pub unresolved_devices: AtomicU64,
    pub sink_failures: AtomicU64,
    pub session_panics: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        #[inline]
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ListenerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    counter!(connection_rejected, connections_rejected);
    counter!(frame_decoded, frames_decoded);
    counter!(framing_error, framing_errors);
    counter!(decode_error, decode_errors);
    counter!(identified, identifications);
    counter!(location_emitted, locations_emitted);
    counter!(location_dropped, locations_dropped);
    counter!(device_unresolved, unresolved_devices);
    counter!(sink_failure, sink_failures);
    counter!(session_panic, session_panics);

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected),
            connections_closed: load(&self.connections_closed),
            connections_active: load(&self.connections_active),
            bytes_received: load(&self.bytes_received),
            frames_decoded: load(&self.frames_decoded),
            framing_errors: load(&self.framing_errors),
            decode_errors: load(&self.decode_errors),
            identifications: load(&self.identifications),
            locations_emitted: load(&self.locations_emitted),
            locations_dropped: load(&self.locations_dropped),
            unresolved_devices: load(&self.unresolved_devices),
            sink_failures: load(&self.sink_failures),
            session_panics: load(&self.session_panics),
        }
    }
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_closed: u64,
    pub connections_active: u64,
    pub bytes_received: u64,
    pub frames_decoded: u64,
    pub framing_errors: u64,
    pub decode_errors: u64,
    pub identifications: u64,
    pub locations_emitted: u64,
    pub locations_dropped: u64,
    pub unresolved_devices: u64,
    pub sink_failures: u64,
    pub session_panics: u64,
}
