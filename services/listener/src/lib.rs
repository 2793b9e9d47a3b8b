// listener: Library entry point.
// Exposes modules for integration testing.

pub mod acceptor;
pub mod config;
pub mod emitter;
pub mod registry;
pub mod session;
pub mod sink;
pub mod stats;
