//! Protocol recognition contract consumed by detection and diagnostics.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::channel::Channel;

/// Decides whether an open channel carries the location protocol.
#[async_trait]
pub trait ProtocolValidator: Send + Sync {
    /// Must return by `deadline`. I/O errors count as `false`.
    async fn is_valid(&self, channel: &mut Channel, deadline: Instant) -> bool;

    /// Reads up to `max_units` protocol units and reports what they carry.
    async fn inspect(&self, channel: &mut Channel, max_units: usize, deadline: Instant) -> TestReport;
}

/// What kinds of data a receiver emitted during a diagnostic read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub position: bool,
    pub altitude: bool,
    pub bearing: bool,
    pub precision: bool,
    pub speed: bool,
    pub satellites: bool,
}

impl Capabilities {
    pub fn any(&self) -> bool {
        self.position || self.altitude || self.bearing || self.precision || self.speed || self.satellites
    }

    pub fn merge(&mut self, other: Capabilities) {
        self.position |= other.position;
        self.altitude |= other.altitude;
        self.bearing |= other.bearing;
        self.precision |= other.precision;
        self.speed |= other.speed;
        self.satellites |= other.satellites;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.position, "position"),
            (self.altitude, "altitude"),
            (self.bearing, "bearing"),
            (self.precision, "precision"),
            (self.speed, "speed"),
            (self.satellites, "satellites"),
        ];
        let present: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if present.is_empty() { f.write_str("none") } else { f.write_str(&present.join(", ")) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub units_read: usize,
    pub valid_units: usize,
    pub capabilities: Capabilities,
    pub log: Vec<String>,
}

impl TestReport {
    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_display_and_merge() {
        let mut c = Capabilities::default();
        assert_eq!(c.to_string(), "none");
        assert!(!c.any());
        c.merge(Capabilities { position: true, speed: true, ..Default::default() });
        c.merge(Capabilities { altitude: true, ..Default::default() });
        assert_eq!(c.to_string(), "position, altitude, speed");
    }
}
