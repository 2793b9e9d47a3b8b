//! Per-connection protocol session.
//!
//! A [`Session`] owns everything one device connection needs: the receive
//! buffer, the decoder bound to it, the device identity once known, and
//! positions waiting for that identity. It performs no IO. The acceptor feeds
//! it bytes and a clock reading, and gets back [`SessionEvent`]s to act on
//! (locations to emit, replies to write).
//!
//! Lifecycle:
//!
//! ```text
//! Unidentified --first frame--> Identifying --login--> Active
//!       |                                         ^
//!       +--first frame (inline identity)----------+
//! any --close--> Closing --finish--> Closed
//! ```

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracker_protocol::{
    DecodeOutcome, Decoded, Decoder, DecoderSet, DeviceIdentity, FrameStatus, Position,
};

use crate::config::SessionConfig;
use crate::stats::ListenerStats;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No decoder bound yet.
    Unidentified,
    /// Decoder bound, waiting for a login message.
    Identifying,
    /// Positions are forwarded as they are decoded.
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection.
    Eof,
    IdleTimeout,
    IdentificationTimeout,
    BufferOverflow,
    PendingOverflow,
    NoMatchingProtocol,
    Io(String),
    /// A decoder panicked while handling this session's bytes.
    Panic,
    Shutdown,
}

impl CloseReason {
    /// Whether events already queued for the sink should still be delivered.
    pub fn drains(&self) -> bool {
        matches!(self, CloseReason::Eof)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("peer closed connection"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::IdentificationTimeout => f.write_str("identification timeout"),
            CloseReason::BufferOverflow => f.write_str("receive buffer limit exceeded"),
            CloseReason::PendingOverflow => f.write_str("too many positions before login"),
            CloseReason::NoMatchingProtocol => f.write_str("no matching protocol"),
            CloseReason::Io(e) => write!(f, "socket error: {}", e),
            CloseReason::Panic => f.write_str("decoder panic"),
            CloseReason::Shutdown => f.write_str("listener shutdown"),
        }
    }
}

/// Something the owner of the session must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded position attributable to a device.
    Location {
        identity: DeviceIdentity,
        position: Position,
    },
    /// Bytes to write back to the device.
    Reply(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    peer: SocketAddr,
    decoders: Arc<DecoderSet>,
    config: SessionConfig,
    stats: Arc<ListenerStats>,
    buffer: BytesMut,
    decoder: Option<Arc<dyn Decoder>>,
    identity: Option<DeviceIdentity>,
    phase: Phase,
    pending: VecDeque<Position>,
    /// Bytes discarded while no decoder was bound.
    unmatched: usize,
    opened_at: Instant,
    last_activity: Instant,
    close_reason: Option<CloseReason>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("protocol", &self.decoder.as_ref().map(|d| d.family()))
            .field("identity", &self.identity)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        decoders: Arc<DecoderSet>,
        config: SessionConfig,
        stats: Arc<ListenerStats>,
        now: Instant,
    ) -> Self {
        Session {
            peer,
            decoders,
            buffer: BytesMut::with_capacity(config.probe_bytes.max(512)),
            config,
            stats,
            decoder: None,
            identity: None,
            phase: Phase::Unidentified,
            pending: VecDeque::new(),
            unmatched: 0,
            opened_at: now,
            last_activity: now,
            close_reason: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.phase, Phase::Closing | Phase::Closed)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append received bytes and process every complete frame.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.is_closing() {
            return events;
        }
        self.last_activity = now;
        self.stats.bytes(data.len());
        self.buffer.extend_from_slice(data);

        while !self.buffer.is_empty() && !self.is_closing() {
            let Some(decoder) = self.bind_decoder() else {
                break;
            };
            match decoder.extract_frame(&self.buffer) {
                FrameStatus::Complete(n) => {
                    let frame = self.buffer.split_to(n);
                    match decoder.decode(&frame) {
                        Ok(outcome) => {
                            self.stats.frame_decoded();
                            self.apply(decoder.as_ref(), outcome, &mut events);
                        }
                        Err(e) => {
                            self.stats.decode_error();
                            debug!(
                                peer = %self.peer,
                                protocol = %decoder.family(),
                                error = %e,
                                "dropping undecodable frame"
                            );
                        }
                    }
                }
                FrameStatus::Incomplete => break,
                FrameStatus::Invalid => {
                    self.stats.framing_error();
                    let skip = decoder.resync_offset(&self.buffer).clamp(1, self.buffer.len());
                    debug!(
                        peer = %self.peer,
                        protocol = %decoder.family(),
                        skipped = skip,
                        "framing error, resynchronizing"
                    );
                    self.buffer.advance(skip);
                }
            }
        }

        if !self.is_closing() && self.buffer.len() > self.config.max_buffer_bytes {
            self.close(CloseReason::BufferOverflow);
        }
        events
    }

    /// [`Session::feed`] with decoder panics contained: a panic closes this
    /// session instead of unwinding into the acceptor.
    pub fn feed_guarded(&mut self, data: &[u8], now: Instant) -> Vec<SessionEvent> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.feed(data, now))) {
            Ok(events) => events,
            Err(_) => {
                self.stats.session_panic();
                warn!(peer = %self.peer, "decoder panicked, closing session");
                self.close(CloseReason::Panic);
                Vec::new()
            }
        }
    }

    /// When the session must next be checked with [`Session::poll_deadline`].
    pub fn next_deadline(&self) -> Instant {
        let idle = self.last_activity + self.config.idle_timeout;
        if self.identity.is_none() {
            idle.min(self.opened_at + self.config.identification_timeout)
        } else {
            idle
        }
    }

    /// Apply timeouts. Returns the reason if this call closed the session.
    pub fn poll_deadline(&mut self, now: Instant) -> Option<CloseReason> {
        if self.is_closing() {
            return None;
        }
        let reason = if self.identity.is_none()
            && now >= self.opened_at + self.config.identification_timeout
        {
            CloseReason::IdentificationTimeout
        } else if now >= self.last_activity + self.config.idle_timeout {
            CloseReason::IdleTimeout
        } else {
            return None;
        };
        self.close(reason.clone());
        Some(reason)
    }

    /// Move to `Closing`, discarding buffered bytes and unattributed
    /// positions. The first reason wins.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closing() {
            return;
        }
        self.phase = Phase::Closing;
        self.buffer.clear();
        self.pending.clear();
        self.close_reason = Some(reason);
    }

    /// The owner has released the socket; the session is done.
    pub fn finish(&mut self) {
        if self.close_reason.is_none() {
            self.close_reason = Some(CloseReason::Shutdown);
        }
        self.phase = Phase::Closed;
        self.buffer = BytesMut::new();
        self.pending.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Bound decoder, binding one if possible. A decoder is bound only once
    /// it has framed a complete message. Bytes no decoder can frame are
    /// discarded; too many of them closes the session.
    fn bind_decoder(&mut self) -> Option<Arc<dyn Decoder>> {
        if let Some(decoder) = &self.decoder {
            return Some(Arc::clone(decoder));
        }
        let detected = self.decoders.detect(&self.buffer);
        let skip = detected
            .as_ref()
            .map_or(self.buffer.len(), |(start, ..)| *start);
        if skip > 0 {
            self.stats.framing_error();
            self.unmatched += skip;
            self.buffer.advance(skip);
        }
        if self.unmatched >= self.config.probe_bytes {
            self.close(CloseReason::NoMatchingProtocol);
            return None;
        }
        let (_, decoder, status) = detected?;
        if status == FrameStatus::Incomplete {
            return None;
        }
        self.phase = if decoder.requires_identification() {
            Phase::Identifying
        } else {
            Phase::Active
        };
        debug!(peer = %self.peer, protocol = %decoder.family(), "protocol detected");
        self.decoder = Some(Arc::clone(&decoder));
        Some(decoder)
    }

    fn apply(&mut self, decoder: &dyn Decoder, outcome: DecodeOutcome, events: &mut Vec<SessionEvent>) {
        if let Some(reply) = outcome.reply {
            events.push(SessionEvent::Reply(reply));
        }
        match outcome.decoded {
            Decoded::Identification(raw_id) => {
                self.identify(DeviceIdentity::new(raw_id, decoder.family()), events);
            }
            Decoded::Positions {
                device_id,
                positions,
            } => {
                if let Some(raw_id) = device_id {
                    self.identify(DeviceIdentity::new(raw_id, decoder.family()), events);
                }
                match &self.identity {
                    Some(identity) => {
                        events.extend(positions.into_iter().map(|position| {
                            SessionEvent::Location {
                                identity: identity.clone(),
                                position,
                            }
                        }));
                    }
                    None => {
                        self.pending.extend(positions);
                        if self.pending.len() > self.config.max_pending_messages {
                            warn!(
                                peer = %self.peer,
                                pending = self.pending.len(),
                                "positions before login exceed limit"
                            );
                            self.close(CloseReason::PendingOverflow);
                        }
                    }
                }
            }
            Decoded::Keepalive => {}
        }
    }

    fn identify(&mut self, identity: DeviceIdentity, events: &mut Vec<SessionEvent>) {
        if self.identity.as_ref() == Some(&identity) {
            return;
        }
        match &self.identity {
            Some(previous) => warn!(
                peer = %self.peer,
                previous = %previous,
                device = %identity,
                "device identity changed mid-session"
            ),
            None => info!(peer = %self.peer, device = %identity, "device identified"),
        }
        self.stats.identified();
        self.phase = Phase::Active;
        events.extend(self.pending.drain(..).map(|position| SessionEvent::Location {
            identity: identity.clone(),
            position,
        }));
        self.identity = Some(identity);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
