//! Sink that publishes each location as a structured log line.

use tracing::info;
use tracker_protocol::{Location, LocationSink, SinkError};

/// Writes every location as JSON on the `tracklink::locations` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LocationSink for TracingSink {
    async fn submit(&self, location: &Location) -> Result<(), SinkError> {
        let json =
            serde_json::to_string(location).map_err(|e| SinkError::Rejected(e.to_string()))?;
        info!(
            target: "tracklink::locations",
            device_id = %location.device().device_id,
            protocol = %location.protocol(),
            location = %json,
            "location"
        );
        Ok(())
    }
}
