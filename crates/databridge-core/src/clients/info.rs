use chrono::{DateTime, Utc};
use serde::Serialize;

/// Latency telemetry of one API client handle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientInfo {
    /// `(timestamp, duration in seconds)` samples of the current period, in arrival order
    pub samples: Vec<(DateTime<Utc>, f64)>,
    /// Mean duration computed at the last evaluation
    pub avg_duration: f64,
    /// Delay (seconds) inserted before each request through this handle
    pub request_interval: f64,
    /// No traffic within the last observation window
    pub grown: bool,
    /// Discard and recreate this handle on its next acquisition
    pub drop_cookies: bool,
}

impl ClientInfo {
    pub fn record(&mut self, at: DateTime<Utc>, duration: f64) {
        self.samples.push((at, duration));
    }

    /// Reset the induced delay after a session rotation has been decided
    ///
    /// `grown` is left as evaluated; the replacement handle starts fresh.
    pub fn mark_for_rotation(&mut self) {
        self.drop_cookies = true;
        self.request_interval = 0.0;
    }
}
