//! Millisecond duration newtype used across latency/timeout fields.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A duration expressed in whole milliseconds.
///
/// Using a plain `u64` newtype instead of `std::time::Duration` keeps
/// every wire type trivially `Serialize`/`Deserialize` without a shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct DurationMs(pub u64);

impl DurationMs {
    /// Zero duration.
    pub const ZERO: DurationMs = DurationMs(0);

    /// Construct from whole milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// The number of whole milliseconds.
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: DurationMs) -> DurationMs {
        DurationMs(self.0.saturating_add(other.0))
    }
}

impl From<Duration> for DurationMs {
    fn from(d: Duration) -> Self {
        DurationMs(d.as_millis() as u64)
    }
}

impl From<DurationMs> for Duration {
    fn from(d: DurationMs) -> Self {
        Duration::from_millis(d.0)
    }
}
