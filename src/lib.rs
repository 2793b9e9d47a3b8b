//! tracklink: accepts connections from GPS trackers, decodes their wire
//! protocols and publishes normalized location events.
//!
//! This crate ties the workspace together for the end-to-end suites under
//! `tests/integration`. The pieces live in their own crates:
//!
//! - [`tracker_protocol`]: framing, decoding and the registry/sink contracts
//! - [`listener`]: config, sessions, acceptors and delivery

pub use listener;
pub use tracker_protocol;
