//! The decoder contract every wire protocol implements, and the ordered set
//! of decoders a listener endpoint tries.

use crate::datetime::DateTimeError;
use crate::location::{Position, PositionError, ProtocolFamily};
use crate::{gt06::Gt06Decoder, meitrack::MeitrackDecoder, teltonika::TeltonikaDecoder};
use bytes::{Buf, TryGetError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Decoder results
// ---------------------------------------------------------------------------

/// Result of looking for a frame at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A whole frame occupies the first `n` bytes.
    Complete(usize),
    /// The buffer starts like a frame but more bytes are needed.
    Incomplete,
    /// The buffer does not start with a frame of this protocol.
    Invalid,
}

/// What a single frame said.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Zero or more fixes. `device_id` is set when the protocol carries the
    /// identifier inline in every message.
    Positions {
        device_id: Option<String>,
        positions: Vec<Position>,
    },
    /// Login/handshake carrying the device identifier.
    Identification(String),
    /// Heartbeat or any message that carries nothing to emit.
    Keepalive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutcome {
    pub decoded: Decoded,
    /// Bytes the device expects back (acknowledgements).
    pub reply: Option<Vec<u8>>,
}

impl DecodeOutcome {
    pub fn new(decoded: Decoded) -> Self {
        DecodeOutcome {
            decoded,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Vec<u8>) -> Self {
        self.reply = Some(reply);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("frame truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("bad {field}: {reason}")]
    Field { field: &'static str, reason: String },
    #[error("unsupported message: {0}")]
    Unsupported(String),
    #[error(transparent)]
    DateTime(#[from] DateTimeError),
    #[error(transparent)]
    Position(#[from] PositionError),
}

impl DecodeError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Field {
            field,
            reason: reason.into(),
        }
    }
}

impl From<TryGetError> for DecodeError {
    fn from(e: TryGetError) -> Self {
        DecodeError::Truncated {
            needed: e.requested,
            available: e.available,
        }
    }
}

/// Split `n` bytes off the front of `buf`.
pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated {
            needed: n,
            available: buf.remaining(),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Read a fixed-size byte group.
pub(crate) fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], DecodeError> {
    let mut out = [0u8; N];
    buf.try_copy_to_slice(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoder trait
// ---------------------------------------------------------------------------

/// One wire protocol: recognize, frame, and decode.
///
/// Decoders are stateless; all per-connection state lives in the session
/// that drives them, so one instance is shared by every connection.
pub trait Decoder: Send + Sync + fmt::Debug {
    fn family(&self) -> ProtocolFamily;

    /// Cheap check whether `prefix` could be the start of this protocol.
    /// A prefix shorter than the protocol's magic bytes matches when it is
    /// consistent with them.
    fn matches(&self, prefix: &[u8]) -> bool;

    fn extract_frame(&self, buf: &[u8]) -> FrameStatus;

    /// Decode exactly one frame previously returned by [`Decoder::extract_frame`].
    fn decode(&self, frame: &[u8]) -> Result<DecodeOutcome, DecodeError>;

    /// Whether positions only become attributable after a login message.
    fn requires_identification(&self) -> bool {
        false
    }

    /// Offset of the next plausible frame start after a framing failure.
    /// Always at least 1 so the caller makes progress.
    fn resync_offset(&self, buf: &[u8]) -> usize {
        (1..buf.len())
            .find(|&i| self.matches(&buf[i..]))
            .unwrap_or(buf.len())
            .max(1)
    }
}

// ---------------------------------------------------------------------------
// DecoderSet
// ---------------------------------------------------------------------------

/// Ordered, read-only list of decoders an endpoint tries on new sessions.
#[derive(Debug, Clone)]
pub struct DecoderSet {
    decoders: Vec<Arc<dyn Decoder>>,
}

impl DecoderSet {
    /// Every built-in protocol in priority order.
    pub fn all() -> Self {
        Self::for_protocols(&ProtocolFamily::ALL)
    }

    /// Built-in decoders for `protocols`, kept in global priority order
    /// regardless of the order given.
    pub fn for_protocols(protocols: &[ProtocolFamily]) -> Self {
        let decoders = ProtocolFamily::ALL
            .into_iter()
            .filter(|p| protocols.contains(p))
            .map(builtin)
            .collect();
        DecoderSet { decoders }
    }

    /// Custom decoder list, tried in the order given.
    pub fn from_decoders(decoders: Vec<Arc<dyn Decoder>>) -> Self {
        DecoderSet { decoders }
    }

    /// First decoder whose `matches` accepts the prefix.
    pub fn select(&self, prefix: &[u8]) -> Option<Arc<dyn Decoder>> {
        self.decoders.iter().find(|d| d.matches(prefix)).cloned()
    }

    /// Earliest offset in `buf` where some decoder both matches and can frame
    /// the bytes, with that decoder and its framing status. Offsets where
    /// every matching decoder reports [`FrameStatus::Invalid`] are skipped.
    pub fn detect(&self, buf: &[u8]) -> Option<(usize, Arc<dyn Decoder>, FrameStatus)> {
        (0..buf.len()).find_map(|start| {
            let candidate = &buf[start..];
            self.decoders
                .iter()
                .filter(|d| d.matches(candidate))
                .find_map(|d| match d.extract_frame(candidate) {
                    FrameStatus::Invalid => None,
                    status => Some((start, Arc::clone(d), status)),
                })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn families(&self) -> Vec<ProtocolFamily> {
        self.decoders.iter().map(|d| d.family()).collect()
    }
}

fn builtin(family: ProtocolFamily) -> Arc<dyn Decoder> {
    match family {
        ProtocolFamily::Meitrack => Arc::new(MeitrackDecoder),
        ProtocolFamily::Gt06 => Arc::new(Gt06Decoder),
        ProtocolFamily::Teltonika => Arc::new(TeltonikaDecoder),
    }
}
