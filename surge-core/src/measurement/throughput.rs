//! Multi-stream throughput sampler.
//!
//! A phase runs N concurrent streams, each restarting a fresh transfer as
//! soon as the previous one completes. Streams report cumulative byte counts
//! per transfer; the sampler folds the non-negative deltas into one total and
//! turns it into a speed estimate on a fixed 200 ms tick. The first part of
//! the phase is a grace period whose bytes are thrown away once, so TCP
//! ramp-up does not drag the estimate down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use rand::RngCore;
use tokio::time::{Instant, MissedTickBehavior};

use super::streams::{StreamBody, StreamEvent, StreamEvents, StreamSet};
use super::{Direction, Measurement, PhaseContext, UploadStrategy, bits_per_second};
use crate::network::ProgressSink;
use crate::session::{ErrorPolicy, SessionState, UnitBase};

/// Sampling period of the speed estimate.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// No estimate is produced before this much time has elapsed.
const MIN_ELAPSED: Duration = Duration::from_millis(200);

/// Size of the random block upload payloads are built from.
const RANDOM_BLOCK_BYTES: usize = 1024 * 1024;

/// Running byte total of a phase built from per-stream cumulative reports.
#[derive(Debug, Default, Clone)]
pub struct ByteCounter {
    last_loaded: HashMap<usize, u64>,
    total: u64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a cumulative report from stream `index` into the total.
    ///
    /// Returns the delta added. Reports lower than the previous one for the
    /// same transfer are discarded.
    pub fn record(&mut self, index: usize, loaded: u64) -> u64 {
        let previous = self.last_loaded.get(&index).copied().unwrap_or(0);
        match loaded.checked_sub(previous) {
            Some(delta) => {
                self.total += delta;
                self.last_loaded.insert(index, loaded);
                delta
            }
            None => 0,
        }
    }

    /// Starts a new transfer on stream `index`; its next report counts from zero.
    pub fn restart(&mut self, index: usize) {
        self.last_loaded.remove(&index);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Drops the accumulated total, keeping per-stream baselines.
    pub fn reset_total(&mut self) {
        self.total = 0;
    }
}

/// One tick's view of the measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowSample {
    /// Phase progress, unclamped, once the grace period is over
    pub progress: Option<f64>,
    /// Speed estimate in the configured unit
    pub speed: Option<f64>,
    /// Measured time exceeded the configured duration
    pub past_duration: bool,
}

impl WindowSample {
    /// The phase may stop with a usable result.
    pub fn is_complete(&self) -> bool {
        self.past_duration && self.speed.is_some_and(|speed| speed > 0.0)
    }
}

/// Grace handling and speed computation of one throughput phase.
#[derive(Debug, Clone)]
pub struct SpeedWindow {
    started: Instant,
    grace: Duration,
    duration: Duration,
    grace_done: bool,
    resets: u32,
    overhead: f64,
    unit: UnitBase,
}

impl SpeedWindow {
    pub fn new(
        started: Instant,
        grace: Duration,
        duration: Duration,
        overhead: f64,
        unit: UnitBase,
    ) -> Self {
        Self {
            started,
            grace,
            duration,
            grace_done: false,
            resets: 0,
            overhead,
            unit,
        }
    }

    /// Samples the window at `now`.
    ///
    /// The first sample past the grace time ends the grace period; if any
    /// bytes were counted by then, the total and the start time are reset.
    /// That happens at most once per window.
    pub fn observe(&mut self, now: Instant, counter: &mut ByteCounter) -> WindowSample {
        let elapsed = now.saturating_duration_since(self.started);
        let mut sample = WindowSample::default();

        if self.grace_done {
            sample.progress = Some(elapsed.as_secs_f64() / self.duration.as_secs_f64());
        }
        if elapsed < MIN_ELAPSED {
            return sample;
        }

        if !self.grace_done {
            if elapsed > self.grace {
                if counter.total() > 0 {
                    self.started = now;
                    counter.reset_total();
                    self.resets += 1;
                }
                self.grace_done = true;
            }
            return sample;
        }

        sample.speed = Some(bits_per_second(
            counter.total(),
            elapsed.as_secs_f64(),
            self.overhead,
            self.unit,
        ));
        sample.past_duration = elapsed > self.duration;
        sample
    }

    pub fn grace_done(&self) -> bool {
        self.grace_done
    }

    /// Number of grace resets performed; never more than one.
    pub fn resets(&self) -> u32 {
        self.resets
    }
}

/// Outcome of handling one stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Fail,
}

/// Measures throughput in one direction.
#[derive(Debug)]
pub struct ThroughputSampler {
    direction: Direction,
    ctx: PhaseContext,
}

impl ThroughputSampler {
    pub fn new(direction: Direction, ctx: PhaseContext) -> Self {
        Self { direction, ctx }
    }

    /// Runs the phase to completion and returns the final reading.
    pub async fn run(self) -> Measurement {
        let direction = self.direction;
        let settings = self.ctx.settings.clone();
        let stream_count = self.ctx.profile.streams(direction).max(1);
        let policy = settings.error_policy;

        self.ctx.session.record(&format!(
            "{direction} test started with {stream_count} streams, policy {policy}"
        ));

        let mut streams = StreamSet::new(self.stream_body());
        for index in 0..stream_count {
            streams.spawn(index, settings.stream_delay * index as u32);
        }

        let start = Instant::now();
        let mut counter = ByteCounter::new();
        let mut window = SpeedWindow::new(
            start,
            settings.grace(direction),
            settings.duration(direction),
            settings.overhead_compensation,
            settings.unit_base,
        );
        let mut ticker = tokio::time::interval_at(start + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut retries: HashMap<usize, u32> = HashMap::new();
        let mut latest = None;
        let mut failed = false;

        loop {
            tokio::select! {
                Some(event) = streams.next_event() => {
                    let flow = self.handle_event(event, &mut streams, &mut counter, &mut retries);
                    if flow == Flow::Fail {
                        failed = true;
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let sample = window.observe(Instant::now(), &mut counter);
                    tracing::trace!(
                        "{} tick: total={} grace_done={} speed={:?}",
                        direction,
                        counter.total(),
                        window.grace_done(),
                        sample.speed
                    );
                    if let Some(speed) = sample.speed {
                        latest = Some(speed);
                    }
                    self.publish(sample.progress, sample.speed.map(Measurement::from_value));

                    if sample.is_complete() {
                        break;
                    }
                    if sample.past_duration && streams.live_count() == 0 {
                        self.ctx
                            .session
                            .warn(&format!("{direction} test has no live streams left"));
                        break;
                    }
                }
            }
        }

        streams.abort_all();

        let result = match latest {
            Some(speed) if !failed && speed > 0.0 => Measurement::from_value(speed),
            _ => Measurement::Fail,
        };
        self.publish(Some(1.0), Some(result));
        self.ctx
            .session
            .record(&format!("{direction} test finished {result}"));
        result
    }

    fn handle_event(
        &self,
        event: StreamEvent,
        streams: &mut StreamSet,
        counter: &mut ByteCounter,
        retries: &mut HashMap<usize, u32>,
    ) -> Flow {
        match event {
            StreamEvent::Progress { index, loaded } => {
                counter.record(index, loaded);
            }
            StreamEvent::TransferCompleted { index } => counter.restart(index),
            StreamEvent::Failed { index, reason } => {
                let direction = self.direction;
                self.ctx
                    .session
                    .record(&format!("{direction} stream {index} failed: {reason}"));
                counter.restart(index);

                match self.ctx.settings.error_policy {
                    ErrorPolicy::FailFast => return Flow::Fail,
                    ErrorPolicy::RetryStream => {
                        let attempts = retries.entry(index).or_insert(0);
                        *attempts += 1;
                        let allowed = self
                            .ctx
                            .settings
                            .max_stream_retries
                            .is_none_or(|max| *attempts <= max);
                        if allowed {
                            streams.retry(index);
                        } else {
                            self.ctx.session.warn(&format!(
                                "{direction} stream {index} gave up after {} retries",
                                *attempts - 1
                            ));
                            streams.discard(index);
                        }
                    }
                    ErrorPolicy::IgnoreAll => streams.discard(index),
                }
            }
        }
        Flow::Continue
    }

    fn publish(&self, progress: Option<f64>, value: Option<Measurement>) {
        let direction = self.direction;
        self.ctx.publish(|state: &mut SessionState| {
            let (slot, progress_slot) = match direction {
                Direction::Download => (&mut state.download, &mut state.download_progress),
                Direction::Upload => (&mut state.upload, &mut state.upload_progress),
            };
            if let Some(progress) = progress {
                *progress_slot = progress;
            }
            if let Some(value) = value {
                *slot = value;
            }
        });
    }

    fn stream_body(&self) -> StreamBody {
        match self.direction {
            Direction::Download => self.download_body(),
            Direction::Upload => self.upload_body(),
        }
    }

    fn download_body(&self) -> StreamBody {
        let ctx = self.ctx.clone();
        Arc::new(move |events: StreamEvents| {
            let ctx = ctx.clone();
            async move {
                if !ctx.is_current() {
                    return;
                }
                let endpoint = ctx.settings.endpoints.download.clone();
                let chunk_mib = ctx.settings.download_chunk_mib;
                let sink = progress_sink(&events);
                loop {
                    match ctx.transport.download(&endpoint, chunk_mib, &sink).await {
                        Ok(()) => events.completed(),
                        Err(error) => {
                            events.failed(error.to_string());
                            return;
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }
            .boxed()
        })
    }

    fn upload_body(&self) -> StreamBody {
        let ctx = self.ctx.clone();
        let payload = random_payload(ctx.profile.upload_payload_bytes());
        let strategy = ctx.profile.upload_strategy;
        Arc::new(move |events: StreamEvents| {
            let ctx = ctx.clone();
            let payload = payload.clone();
            async move {
                if !ctx.is_current() {
                    return;
                }
                let endpoint = ctx.settings.endpoints.upload.clone();
                let sink = match strategy {
                    UploadStrategy::Streaming => progress_sink(&events),
                    UploadStrategy::SmallChunks => ProgressSink::discard(),
                };
                loop {
                    match ctx.transport.upload(&endpoint, payload.clone(), &sink).await {
                        Ok(()) => {
                            if strategy == UploadStrategy::SmallChunks {
                                events.progress(payload.len() as u64);
                            }
                            events.completed();
                        }
                        Err(error) => {
                            events.failed(error.to_string());
                            return;
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }
            .boxed()
        })
    }
}

fn progress_sink(events: &StreamEvents) -> ProgressSink {
    let events = events.clone();
    ProgressSink::new(move |loaded| events.progress(loaded))
}

/// Incompressible payload of `len` bytes built from one random block.
pub fn random_payload(len: usize) -> Bytes {
    let mut block = vec![0u8; RANDOM_BLOCK_BYTES.min(len.max(1))];
    rand::rng().fill_bytes(&mut block);

    let mut payload = BytesMut::with_capacity(len);
    while payload.len() < len {
        let take = block.len().min(len - payload.len());
        payload.extend_from_slice(&block[..take]);
    }
    payload.freeze()
}
