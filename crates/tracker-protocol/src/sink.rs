//! Contracts between the listener and the rest of the platform.
//!
//! The listener never owns devices or storage: it asks a [`DeviceRegistry`]
//! who a raw identifier belongs to, and hands finished [`Location`]s to a
//! [`LocationSink`]. Both are shared by every session and must be safe for
//! concurrent use.

use crate::location::{DeviceIdentity, DeviceRef, Location};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink rejected location: {0}")]
    Rejected(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

pub trait DeviceRegistry: Send + Sync + 'static {
    /// `Ok(None)` means the identifier is not registered.
    fn resolve(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<Option<DeviceRef>, RegistryError>> + Send;
}

pub trait LocationSink: Send + Sync + 'static {
    fn submit(&self, location: &Location) -> impl Future<Output = Result<(), SinkError>> + Send;
}
