//! Wire-protocol decoding for GPS trackers.
//!
//! Each supported protocol implements [`Decoder`]; a [`DecoderSet`] holds the
//! decoders an endpoint accepts. Decoders produce validated [`Position`]s,
//! which the listener turns into [`Location`] events once the device has been
//! resolved through a [`DeviceRegistry`].

pub mod checksum;
pub mod datetime;
pub mod decoder;
pub mod gt06;
pub mod location;
pub mod meitrack;
pub mod sink;
pub mod teltonika;

#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

pub use decoder::{DecodeError, DecodeOutcome, Decoded, Decoder, DecoderSet, FrameStatus};
pub use location::{DeviceIdentity, DeviceRef, Location, Position, PositionError, ProtocolFamily};
pub use sink::{DeviceRegistry, LocationSink, RegistryError, SinkError};
