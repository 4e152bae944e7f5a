//! Token bucket link shaper for the simulated transport.
//!
//! Tokens are bytes. The bucket refills at the link rate and allows bursts up
//! to its capacity. Time comes from `tokio::time`, so a paused test clock
//! drives the shaper deterministically.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Shortest wait handed out while tokens refill.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Byte-rate token bucket.
#[derive(Debug, Clone)]
pub struct LinkShaper {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    tokens: u64,
    /// Bytes added per second
    refill_rate: u64,
    last_refill: Instant,
}

impl LinkShaper {
    /// Creates a full bucket. Zero capacity or rate is raised to one.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(1),
            last_refill: Instant::now(),
        }
    }

    /// Bucket holding a tenth of a second of traffic at `bytes_per_sec`.
    pub fn for_rate(bytes_per_sec: u64) -> Self {
        Self::new(bytes_per_sec / 10, bytes_per_sec)
    }

    /// Consumes up to `requested` tokens and returns how many were taken.
    pub fn consume(&mut self, requested: u64) -> u64 {
        self.refill();
        let consumed = requested.min(self.tokens);
        self.tokens -= consumed;
        consumed
    }

    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Time until `wanted` tokens (capped at capacity) are available.
    pub fn time_until(&mut self, wanted: u64) -> Duration {
        self.refill();
        let wanted = wanted.min(self.capacity);
        if self.tokens >= wanted {
            return Duration::ZERO;
        }
        let deficit = (wanted - self.tokens) as f64;
        Duration::from_secs_f64(deficit / self.refill_rate as f64).max(MIN_WAIT)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if tokens_to_add == 0 {
            return;
        }
        if self.tokens + tokens_to_add >= self.capacity {
            self.tokens = self.capacity;
            self.last_refill = now;
        } else {
            self.tokens += tokens_to_add;
            // Keep the fractional remainder for the next refill
            self.last_refill +=
                Duration::from_secs_f64(tokens_to_add as f64 / self.refill_rate as f64);
        }
    }
}

/// Shaper shared by every stream on one simulated link direction.
#[derive(Debug, Clone)]
pub struct SharedShaper {
    inner: Arc<Mutex<LinkShaper>>,
}

impl SharedShaper {
    pub fn new(shaper: LinkShaper) -> Self {
        Self {
            inner: Arc::new(Mutex::new(shaper)),
        }
    }

    /// Waits until `bytes` have passed through the link.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut bucket = self.inner.lock();
                remaining -= bucket.consume(remaining);
                if remaining == 0 {
                    return;
                }
                bucket.time_until(remaining)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
