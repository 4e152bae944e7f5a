//! Measurement primitives: throughput sampling, latency estimation, stream
//! lifecycle and the auxiliary client lookup and telemetry phases.

pub mod client_lookup;
pub mod latency;
pub mod profile;
pub mod streams;
pub mod telemetry;
pub mod throughput;

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

pub use client_lookup::{ClientIdentity, ClientLookup};
pub use latency::{LatencyEstimator, LatencyOutcome, SmoothedLatency, choose_rtt};
pub use profile::{TransferProfile, UploadStrategy};
pub use streams::{StreamBody, StreamEvent, StreamEvents, StreamSet};
pub use telemetry::{TelemetryReport, parse_test_id};
pub use throughput::{
    ByteCounter, SpeedWindow, ThroughputSampler, WindowSample, random_payload,
};

use crate::network::Transport;
use crate::session::{PhaseTicket, SharedSession, TestSettings, TestStatus, UnitBase};

/// Everything a running phase needs: frozen settings, the resolved profile,
/// the transport and a write ticket into the session.
#[derive(Clone)]
pub struct PhaseContext {
    pub settings: Arc<TestSettings>,
    pub profile: TransferProfile,
    pub transport: Arc<dyn Transport>,
    pub session: SharedSession,
    pub ticket: PhaseTicket,
}

impl PhaseContext {
    /// Applies `f` to the session if this phase is still current.
    pub fn publish(&self, f: impl FnOnce(&mut crate::session::SessionState)) -> bool {
        self.session.update(self.ticket, f)
    }

    pub fn is_current(&self) -> bool {
        self.session.is_current(self.ticket)
    }
}

impl fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseContext")
            .field("profile", &self.profile)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Direction of a throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    /// Session status while this direction is measured.
    pub fn status(self) -> TestStatus {
        match self {
            Self::Download => TestStatus::Download,
            Self::Upload => TestStatus::Upload,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

/// A published reading: not yet available, a value, or a failed phase.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Measurement {
    #[default]
    Pending,
    Value(f64),
    Fail,
}

impl Measurement {
    /// Wraps a value, turning non-finite numbers into `Fail`.
    pub fn from_value(value: f64) -> Self {
        if value.is_finite() {
            Self::Value(value)
        } else {
            Self::Fail
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_fail(self) -> bool {
        self == Self::Fail
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => Ok(()),
            Self::Value(v) => write!(f, "{v:.2}"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Converts a byte rate into megabits (or mebibits) per second, rounded to
/// hundredths.
pub fn bits_per_second(bytes: u64, elapsed_secs: f64, overhead: f64, unit: UnitBase) -> f64 {
    let speed = bytes as f64 / elapsed_secs;
    round_hundredths(speed * 8.0 * overhead / unit.divisor())
}

pub(crate) fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_display() {
        assert_eq!(Measurement::Pending.to_string(), "");
        assert_eq!(Measurement::Value(12.345).to_string(), "12.35");
        assert_eq!(Measurement::Value(0.0).to_string(), "0.00");
        assert_eq!(Measurement::Fail.to_string(), "Fail");
        assert_eq!(Measurement::from_value(f64::NAN), Measurement::Fail);
    }

    #[test]
    fn test_bits_per_second_units() {
        // 1_250_000 bytes in one second is 10 Mbit/s before overhead
        assert_eq!(bits_per_second(1_250_000, 1.0, 1.0, UnitBase::Decimal), 10.0);
        assert_eq!(bits_per_second(1_250_000, 1.0, 1.06, UnitBase::Decimal), 10.6);
        assert_eq!(bits_per_second(131_072, 1.0, 1.0, UnitBase::Binary), 1.0);
        assert_eq!(bits_per_second(1_000, 2.0, 1.0, UnitBase::Decimal), 0.0);
    }
}
