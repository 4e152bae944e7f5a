//! Network abstraction layer for production and simulation environments
//!
//! The measurement code only talks to the `Transport` trait, so the same
//! sampler and estimator logic runs against a real HTTP server or against a
//! deterministic simulated link.

pub mod http;
pub mod shaper;
pub mod simulation;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
pub use http::HttpTransport;
pub use shaper::{LinkShaper, SharedShaper};
pub use simulation::{FaultPlan, SimulatedLink, SimulatedOperation, SimulatedTransport};

use crate::measurement::TelemetryReport;
use crate::session::DistanceUnit;

/// Errors raised by transport operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Server returned HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Transfer interrupted: {reason}")]
    Stream { reason: String },

    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidUrl { endpoint: String, reason: String },

    #[error("Simulated failure: {reason}")]
    Simulated { reason: String },
}

/// What the transport can observe, used to pick a transfer profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Upload progress is reported while the body is sent
    pub upload_progress: bool,
    /// `ping` returns a precise server timing
    pub precise_timing: bool,
    pub preferred_download_streams: Option<usize>,
    pub preferred_upload_streams: Option<usize>,
    /// Largest upload payload the transport can handle, in MiB
    pub max_upload_blob_mib: Option<u32>,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            upload_progress: true,
            precise_timing: false,
            preferred_download_streams: None,
            preferred_upload_streams: None,
            max_upload_blob_mib: None,
        }
    }
}

/// Timing details of one ping round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingTiming {
    /// Transport-measured round trip, excluding local overhead
    pub precise: Option<Duration>,
}

/// Optional details requested from the client lookup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientLookupQuery {
    pub isp: bool,
    pub distance: Option<DistanceUnit>,
}

impl ClientLookupQuery {
    /// Query string pairs for the lookup request.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if self.isp {
            pairs.push(("isp", "true".to_string()));
            if let Some(unit) = self.distance {
                pairs.push(("distance", unit.as_str().to_string()));
            }
        }
        pairs
    }
}

/// Receives cumulative byte counts for the transfer in flight.
#[derive(Clone)]
pub struct ProgressSink {
    report: Arc<dyn Fn(u64) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(report: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Sink that drops every report.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Reports bytes transferred so far in the current transfer.
    pub fn report(&self, loaded: u64) {
        (self.report)(loaded)
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

/// Network operations needed by the speed test phases.
///
/// Every call is cancellable by dropping its future.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reports what this transport can observe.
    fn capabilities(&self) -> TransportCapabilities;

    /// Downloads one transfer of `chunk_mib` MiB, reporting cumulative bytes.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - Server unreachable
    /// - `TransportError::Stream` - Transfer interrupted mid-body
    async fn download(
        &self,
        endpoint: &str,
        chunk_mib: u32,
        progress: &ProgressSink,
    ) -> Result<(), TransportError>;

    /// Uploads `payload`, reporting cumulative bytes sent.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - Server unreachable
    /// - `TransportError::HttpStatus` - Server rejected the upload
    async fn upload(
        &self,
        endpoint: &str,
        payload: Bytes,
        progress: &ProgressSink,
    ) -> Result<(), TransportError>;

    /// Sends one empty echo request.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - Server unreachable
    async fn ping(&self, endpoint: &str) -> Result<PingTiming, TransportError>;

    /// Asks the lookup service who the client is. Returns the raw body.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - Service unreachable
    async fn lookup_client(
        &self,
        endpoint: &str,
        query: &ClientLookupQuery,
    ) -> Result<String, TransportError>;

    /// Posts a telemetry report. Returns the raw response body.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectionFailed` - Collector unreachable
    async fn submit_telemetry(
        &self,
        endpoint: &str,
        report: &TelemetryReport,
    ) -> Result<String, TransportError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[test]
    fn test_lookup_query_pairs() {
        let query = ClientLookupQuery {
            isp: true,
            distance: Some(DistanceUnit::Miles),
        };
        assert_eq!(
            query.query_pairs(),
            vec![("isp", "true".to_string()), ("distance", "mi".to_string())]
        );

        let no_isp = ClientLookupQuery {
            isp: false,
            distance: Some(DistanceUnit::Kilometers),
        };
        assert!(no_isp.query_pairs().is_empty());
    }

    #[test]
    fn test_progress_sink_forwards_reports() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = {
            let seen = seen.clone();
            ProgressSink::new(move |loaded| seen.store(loaded, Ordering::SeqCst))
        };
        sink.report(4096);
        assert_eq!(seen.load(Ordering::SeqCst), 4096);
    }
}
