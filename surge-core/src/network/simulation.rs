//! Simulated transport for deterministic testing and offline demos
//!
//! Models a link with fixed download and upload rates shaped by token
//! buckets, a scripted sequence of round-trip times and injectable faults.
//! All waiting goes through `tokio::time`, so tests on a paused clock see
//! exact, repeatable timings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::shaper::{LinkShaper, SharedShaper};
use super::{
    ClientLookupQuery, PingTiming, ProgressSink, Transport, TransportCapabilities, TransportError,
};
use crate::measurement::TelemetryReport;

const MIB: u64 = 1024 * 1024;

/// Operations the simulated transport counts and can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOperation {
    Download,
    Upload,
    Ping,
    ClientLookup,
    Telemetry,
}

/// Shape of the simulated link.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedLink {
    pub download_bytes_per_sec: u64,
    pub upload_bytes_per_sec: u64,
    /// Delay before the first byte of every request
    pub latency: Duration,
    /// Granularity of progress reports
    pub chunk_bytes: u64,
    /// Overrides the requested transfer size when set
    pub transfer_bytes: Option<u64>,
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self {
            // 100 Mbit/s down, 20 Mbit/s up
            download_bytes_per_sec: 12_500_000,
            upload_bytes_per_sec: 2_500_000,
            latency: Duration::from_millis(20),
            chunk_bytes: 64 * 1024,
            transfer_bytes: None,
        }
    }
}

/// Which calls of each operation fail.
///
/// Calls are numbered from 1 per operation, in the order they start.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    failing_calls: HashMap<SimulatedOperation, HashSet<u64>>,
    always_failing: HashSet<SimulatedOperation>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the given call numbers of `operation`.
    pub fn fail_calls(
        mut self,
        operation: SimulatedOperation,
        calls: impl IntoIterator<Item = u64>,
    ) -> Self {
        self.failing_calls
            .entry(operation)
            .or_default()
            .extend(calls);
        self
    }

    /// Fails every call of `operation`.
    pub fn fail_always(mut self, operation: SimulatedOperation) -> Self {
        self.always_failing.insert(operation);
        self
    }

    fn should_fail(&self, operation: SimulatedOperation, call: u64) -> bool {
        self.always_failing.contains(&operation)
            || self
                .failing_calls
                .get(&operation)
                .is_some_and(|calls| calls.contains(&call))
    }
}

/// Transport backed by a simulated link instead of the network.
pub struct SimulatedTransport {
    link: SimulatedLink,
    download_shaper: SharedShaper,
    upload_shaper: SharedShaper,
    rtt_script: Vec<Duration>,
    precise_offset: Option<Duration>,
    capabilities: TransportCapabilities,
    faults: FaultPlan,
    lookup_response: String,
    telemetry_response: String,
    calls: HashMap<SimulatedOperation, AtomicU64>,
    reports: Mutex<Vec<TelemetryReport>>,
}

impl SimulatedTransport {
    /// Creates a transport for `link` with default scripts and no faults.
    pub fn new(link: SimulatedLink) -> Self {
        let calls = [
            SimulatedOperation::Download,
            SimulatedOperation::Upload,
            SimulatedOperation::Ping,
            SimulatedOperation::ClientLookup,
            SimulatedOperation::Telemetry,
        ]
        .into_iter()
        .map(|op| (op, AtomicU64::new(0)))
        .collect();

        Self {
            download_shaper: SharedShaper::new(LinkShaper::for_rate(link.download_bytes_per_sec)),
            upload_shaper: SharedShaper::new(LinkShaper::for_rate(link.upload_bytes_per_sec)),
            rtt_script: vec![link.latency * 2],
            precise_offset: None,
            capabilities: TransportCapabilities::default(),
            faults: FaultPlan::default(),
            lookup_response: serde_json::json!({
                "processedString": "203.0.113.7 - Surge Simulated ISP, US",
                "rawIspInfo": { "ip": "203.0.113.7", "org": "Surge Simulated ISP" },
            })
            .to_string(),
            telemetry_response: "id 1".to_string(),
            calls,
            reports: Mutex::new(Vec::new()),
            link,
        }
    }

    /// Round-trip times used by successive pings, cycled.
    pub fn with_rtt_script(mut self, script: Vec<Duration>) -> Self {
        if !script.is_empty() {
            self.rtt_script = script;
        }
        self
    }

    /// Reports precise ping timings `offset` below the scripted RTT.
    pub fn with_precise_timing(mut self, offset: Duration) -> Self {
        self.precise_offset = Some(offset);
        self.capabilities.precise_timing = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_lookup_response(mut self, body: impl Into<String>) -> Self {
        self.lookup_response = body.into();
        self
    }

    pub fn with_telemetry_response(mut self, body: impl Into<String>) -> Self {
        self.telemetry_response = body.into();
        self
    }

    /// Number of calls of `operation` started so far.
    pub fn calls(&self, operation: SimulatedOperation) -> u64 {
        self.calls
            .get(&operation)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    /// Telemetry reports received so far.
    pub fn submitted_reports(&self) -> Vec<TelemetryReport> {
        self.reports.lock().clone()
    }

    pub fn link(&self) -> &SimulatedLink {
        &self.link
    }

    /// Registers a call and returns whether it should fail.
    fn begin_call(&self, operation: SimulatedOperation) -> Result<u64, TransportError> {
        let call = self
            .calls
            .get(&operation)
            .map_or(0, |count| count.fetch_add(1, Ordering::SeqCst) + 1);
        if self.faults.should_fail(operation, call) {
            tracing::debug!("Simulation: failing {:?} call {}", operation, call);
            return Err(TransportError::Simulated {
                reason: format!("{operation:?} call {call} failed"),
            });
        }
        Ok(call)
    }

    /// Moves `total` bytes through `shaper`, reporting progress per chunk.
    ///
    /// A faulted transfer delivers one chunk before failing.
    async fn transfer(
        &self,
        operation: SimulatedOperation,
        shaper: &SharedShaper,
        total: u64,
        progress: &ProgressSink,
    ) -> Result<(), TransportError> {
        let outcome = self.begin_call(operation);
        tokio::time::sleep(self.link.latency).await;

        let chunk = self.link.chunk_bytes.max(1);
        if let Err(error) = outcome {
            shaper.acquire(chunk.min(total)).await;
            progress.report(chunk.min(total));
            return Err(error);
        }

        let mut moved = 0u64;
        while moved < total {
            let step = chunk.min(total - moved);
            shaper.acquire(step).await;
            moved += step;
            progress.report(moved);
        }
        Ok(())
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulatedLink::default())
    }
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("link", &self.link)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn download(
        &self,
        _endpoint: &str,
        chunk_mib: u32,
        progress: &ProgressSink,
    ) -> Result<(), TransportError> {
        let total = self
            .link
            .transfer_bytes
            .unwrap_or(u64::from(chunk_mib) * MIB);
        self.transfer(
            SimulatedOperation::Download,
            &self.download_shaper,
            total,
            progress,
        )
        .await
    }

    async fn upload(
        &self,
        _endpoint: &str,
        payload: Bytes,
        progress: &ProgressSink,
    ) -> Result<(), TransportError> {
        let total = self
            .link
            .transfer_bytes
            .map_or(payload.len() as u64, |cap| cap.min(payload.len() as u64));
        self.transfer(
            SimulatedOperation::Upload,
            &self.upload_shaper,
            total,
            progress,
        )
        .await
    }

    async fn ping(&self, _endpoint: &str) -> Result<PingTiming, TransportError> {
        let call = self.begin_call(SimulatedOperation::Ping);
        let index = match call {
            Ok(call) => call,
            Err(error) => {
                tokio::time::sleep(self.link.latency).await;
                return Err(error);
            }
        };
        let rtt = self.rtt_script[(index as usize - 1) % self.rtt_script.len()];
        tokio::time::sleep(rtt).await;

        Ok(PingTiming {
            precise: self.precise_offset.map(|offset| rtt.saturating_sub(offset)),
        })
    }

    async fn lookup_client(
        &self,
        _endpoint: &str,
        _query: &ClientLookupQuery,
    ) -> Result<String, TransportError> {
        tokio::time::sleep(self.link.latency).await;
        self.begin_call(SimulatedOperation::ClientLookup)?;
        Ok(self.lookup_response.clone())
    }

    async fn submit_telemetry(
        &self,
        _endpoint: &str,
        report: &TelemetryReport,
    ) -> Result<String, TransportError> {
        tokio::time::sleep(self.link.latency).await;
        self.begin_call(SimulatedOperation::Telemetry)?;
        self.reports.lock().push(report.clone());
        Ok(self.telemetry_response.clone())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    fn recording_sink() -> (ProgressSink, Arc<AtomicU64>) {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = {
            let seen = seen.clone();
            ProgressSink::new(move |loaded| seen.store(loaded, Ordering::SeqCst))
        };
        (sink, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_is_shaped_to_link_rate() {
        let transport = SimulatedTransport::new(SimulatedLink {
            download_bytes_per_sec: 1_000_000,
            latency: Duration::ZERO,
            chunk_bytes: 10_000,
            transfer_bytes: Some(1_100_000),
            ..SimulatedLink::default()
        });
        let (sink, seen) = recording_sink();

        let started = Instant::now();
        transport.download("garbage", 20, &sink).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(seen.load(Ordering::SeqCst), 1_100_000);
        assert!(
            elapsed >= Duration::from_millis(990) && elapsed <= Duration::from_millis(1100),
            "took {elapsed:?}"
        );
        assert_eq!(transport.calls(SimulatedOperation::Download), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_transfer_reports_partial_progress() {
        let transport = SimulatedTransport::new(SimulatedLink {
            chunk_bytes: 1000,
            transfer_bytes: Some(10_000),
            ..SimulatedLink::default()
        })
        .with_faults(FaultPlan::new().fail_calls(SimulatedOperation::Upload, [2]));
        let (sink, seen) = recording_sink();

        transport
            .upload("empty", Bytes::from(vec![0u8; 20_000]), &sink)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10_000);

        let result = transport
            .upload("empty", Bytes::from(vec![0u8; 20_000]), &sink)
            .await;
        assert!(matches!(result, Err(TransportError::Simulated { .. })));
        assert_eq!(seen.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_follows_script_and_precise_offset() {
        let transport = SimulatedTransport::default()
            .with_rtt_script(vec![Duration::from_millis(30), Duration::from_millis(50)])
            .with_precise_timing(Duration::from_millis(5));
        assert!(transport.capabilities().precise_timing);

        let started = Instant::now();
        let first = transport.ping("empty").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(30));
        assert_eq!(first.precise, Some(Duration::from_millis(25)));

        let second = transport.ping("empty").await.unwrap();
        assert_eq!(second.precise, Some(Duration::from_millis(45)));

        let third = transport.ping("empty").await.unwrap();
        assert_eq!(third.precise, Some(Duration::from_millis(25)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation() {
        let transport = SimulatedTransport::default()
            .with_faults(FaultPlan::new().fail_always(SimulatedOperation::ClientLookup));
        let result = transport
            .lookup_client("getIP", &ClientLookupQuery::default())
            .await;
        assert!(result.is_err());
        assert_eq!(transport.calls(SimulatedOperation::ClientLookup), 1);
    }
}
