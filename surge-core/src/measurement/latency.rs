//! Latency and jitter estimation from sequential ping probes.

use std::time::Duration;

use tokio::time::Instant;

use super::{Measurement, PhaseContext, round_hundredths};
use crate::session::ErrorPolicy;

/// Weight of a new sample in the ping average.
const PING_WEIGHT: f64 = 0.1;
/// Weight of a new jitter sample when jitter rises.
const JITTER_RISE_WEIGHT: f64 = 0.8;
/// Weight of a new jitter sample when jitter decays.
const JITTER_DECAY_WEIGHT: f64 = 0.1;

/// Exponentially smoothed ping and jitter, in milliseconds.
///
/// The first sample seeds the ping; jitter needs two samples. Spikes move
/// jitter eight times faster than calm samples bring it down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmoothedLatency {
    ping: Option<f64>,
    jitter: Option<f64>,
    previous_rtt: Option<f64>,
    samples: u32,
}

impl SmoothedLatency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one round-trip time into the estimates.
    pub fn record(&mut self, rtt_ms: f64) {
        if let (Some(ping), Some(previous)) = (self.ping, self.previous_rtt) {
            let instant_jitter = (rtt_ms - previous).abs();
            let jitter = self.jitter.unwrap_or(0.0);
            let weight = if instant_jitter > jitter {
                JITTER_RISE_WEIGHT
            } else {
                JITTER_DECAY_WEIGHT
            };
            self.ping = Some(ping * (1.0 - PING_WEIGHT) + rtt_ms * PING_WEIGHT);
            self.jitter = Some(jitter * (1.0 - weight) + instant_jitter * weight);
        } else {
            self.ping = Some(rtt_ms);
        }
        self.previous_rtt = Some(rtt_ms);
        self.samples += 1;
    }

    pub fn ping(&self) -> Option<f64> {
        self.ping
    }

    pub fn jitter(&self) -> Option<f64> {
        self.jitter
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// Picks the round-trip time of one probe in milliseconds.
///
/// The transport timing replaces the stopwatch only when allowed, positive
/// and smaller than the stopwatch value.
pub fn choose_rtt(stopwatch: Duration, precise: Option<Duration>, allow_precise: bool) -> f64 {
    match precise {
        Some(precise) if allow_precise && !precise.is_zero() && precise < stopwatch => {
            millis(precise)
        }
        _ => millis(stopwatch),
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Final ping and jitter readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyOutcome {
    pub ping: Measurement,
    pub jitter: Measurement,
}

/// Runs the ping phase: strictly sequential probes, the first a warm-up.
#[derive(Debug)]
pub struct LatencyEstimator {
    ctx: PhaseContext,
}

impl LatencyEstimator {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self) -> LatencyOutcome {
        let settings = self.ctx.settings.clone();
        let count = settings.ping_count.max(1);
        let endpoint = settings.endpoints.ping.clone();
        let mut estimate = SmoothedLatency::new();
        let mut done = 0u32;
        let mut retries = 0u32;

        self.ctx
            .session
            .record(&format!("ping test started with {count} probes"));

        while done < count {
            let progress = f64::from(done) / f64::from(count);
            self.ctx.publish(|s| s.ping_progress = progress);

            let sent = Instant::now();
            match self.ctx.transport.ping(&endpoint).await {
                Ok(timing) => {
                    if done > 0 {
                        let rtt = choose_rtt(
                            sent.elapsed(),
                            timing.precise,
                            self.ctx.profile.precise_timing,
                        );
                        estimate.record(rtt);
                        self.publish_estimate(&estimate);
                        tracing::trace!("pong {}: rtt={:.2}ms", done, rtt);
                    }
                    done += 1;
                    retries = 0;
                }
                Err(error) => {
                    self.ctx
                        .session
                        .record(&format!("ping {done} failed: {error}"));
                    match settings.error_policy {
                        ErrorPolicy::FailFast => {
                            let outcome = LatencyOutcome {
                                ping: Measurement::Fail,
                                jitter: Measurement::Fail,
                            };
                            self.ctx.publish(|s| {
                                s.ping = outcome.ping;
                                s.jitter = outcome.jitter;
                            });
                            self.ctx.session.record("ping test finished Fail");
                            return outcome;
                        }
                        ErrorPolicy::RetryStream => {
                            retries += 1;
                            if settings.max_stream_retries.is_some_and(|max| retries > max) {
                                self.ctx.session.warn(&format!(
                                    "ping {done} skipped after {} retries",
                                    retries - 1
                                ));
                                done += 1;
                                retries = 0;
                            }
                        }
                        ErrorPolicy::IgnoreAll => done += 1,
                    }
                }
            }
        }

        let outcome = LatencyOutcome {
            ping: estimate
                .ping()
                .map_or(Measurement::Pending, |p| Measurement::from_value(round_hundredths(p))),
            jitter: match (estimate.ping(), estimate.jitter()) {
                (_, Some(j)) => Measurement::from_value(round_hundredths(j)),
                (Some(_), None) => Measurement::Value(0.0),
                (None, None) => Measurement::Pending,
            },
        };
        self.ctx.publish(|s| {
            s.ping_progress = 1.0;
            s.ping = outcome.ping;
            s.jitter = outcome.jitter;
        });
        self.ctx.session.record(&format!(
            "ping test finished ping={} jitter={} samples={}",
            outcome.ping,
            outcome.jitter,
            estimate.samples()
        ));
        outcome
    }

    fn publish_estimate(&self, estimate: &SmoothedLatency) {
        let ping = estimate.ping().map(|p| Measurement::from_value(round_hundredths(p)));
        let jitter = estimate.jitter().map(|j| Measurement::from_value(round_hundredths(j)));
        self.ctx.publish(|s| {
            if let Some(ping) = ping {
                s.ping = ping;
            }
            if let Some(jitter) = jitter {
                s.jitter = jitter;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_sample_seeds_ping_without_jitter() {
        let mut estimate = SmoothedLatency::new();
        estimate.record(40.0);
        assert_eq!(estimate.ping(), Some(40.0));
        assert_eq!(estimate.jitter(), None);
    }

    #[test]
    fn test_ping_is_weighted_average() {
        let mut estimate = SmoothedLatency::new();
        estimate.record(40.0);
        estimate.record(50.0);
        assert!(approx(estimate.ping().unwrap(), 41.0));
        estimate.record(50.0);
        assert!(approx(estimate.ping().unwrap(), 41.9));
    }

    #[test]
    fn test_jitter_rises_fast_and_decays_slowly() {
        let mut estimate = SmoothedLatency::new();
        estimate.record(20.0);
        estimate.record(30.0);
        // rise from 0 towards 10 with weight 0.8
        assert!(approx(estimate.jitter().unwrap(), 8.0));

        estimate.record(30.0);
        // decay towards 0 with weight 0.1
        assert!(approx(estimate.jitter().unwrap(), 7.2));

        estimate.record(50.0);
        // rise towards 20 with weight 0.8
        assert!(approx(estimate.jitter().unwrap(), 7.2 * 0.2 + 16.0));
        assert_eq!(estimate.samples(), 4);
    }

    #[test]
    fn test_precise_timing_only_when_sane() {
        let stopwatch = Duration::from_millis(30);
        assert_eq!(choose_rtt(stopwatch, None, true), 30.0);
        assert_eq!(choose_rtt(stopwatch, Some(Duration::from_millis(20)), true), 20.0);
        assert_eq!(choose_rtt(stopwatch, Some(Duration::from_millis(20)), false), 30.0);
        assert_eq!(choose_rtt(stopwatch, Some(Duration::ZERO), true), 30.0);
        assert_eq!(choose_rtt(stopwatch, Some(Duration::from_millis(45)), true), 30.0);
    }
}
