//! Per-principal request throttling.
//!
//! A [`BoundedRateLimiter`] is a token bucket with a cap on how many
//! calls may wait for a token. The master asks the limiter for an
//! admission decision synchronously; deferred calls are parked by the
//! master's own timer machinery and re-enter the mailbox when their
//! token matures.

use std::time::{Duration, Instant};

/// Admission decision for one inbound call.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// No limit applies; process the call now.
    Admit,

    /// Park the call and process it after the delay. A zero delay
    /// means a token was free; the call still counts as outstanding
    /// until [`BoundedRateLimiter::released`].
    Defer(Duration),

    /// Too many calls already waiting; drop with an error reply.
    Drop,
}

/// Token bucket with bounded deferral.
#[derive(Debug)]
pub struct BoundedRateLimiter {
    /// Time between tokens. `None` means unlimited.
    interval: Option<Duration>,

    /// Maximum deferred calls. `None` means unbounded.
    capacity: Option<usize>,

    /// When the next token matures.
    next_token: Instant,

    /// Calls admitted but not yet processed (deferred).
    outstanding: usize,

    /// Total calls dropped for capacity. Exposed as a counter.
    dropped: u64,
}

impl BoundedRateLimiter {
    pub fn new(qps: Option<f64>, capacity: Option<usize>) -> Self {
        let interval = qps
            .filter(|qps| *qps > 0.0)
            .map(|qps| Duration::from_secs_f64(1.0 / qps));
        Self {
            interval,
            capacity,
            next_token: Instant::now(),
            outstanding: 0,
            dropped: 0,
        }
    }

    /// Decide admission for a call arriving now. Every admitted call
    /// waits for its token, immediately mature or not, and counts
    /// toward capacity until released.
    pub fn admit(&mut self, now: Instant) -> Admission {
        let interval = match self.interval {
            None => return Admission::Admit,
            Some(interval) => interval,
        };

        if let Some(capacity) = self.capacity {
            if self.outstanding >= capacity {
                self.dropped += 1;
                return Admission::Drop;
            }
        }

        let delay = if self.next_token <= now {
            Duration::ZERO
        } else {
            self.next_token - now
        };
        self.next_token = self.next_token.max(now) + interval;
        self.outstanding += 1;
        Admission::Defer(delay)
    }

    /// A deferred call has been released into the mailbox.
    pub fn released(&mut self) {
        debug_assert!(self.outstanding > 0, "released without a deferred call");
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Unbounded token bucket used to pace background work (agent removal
/// storms). Returns the delay until the caller may proceed.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_token: Instant,
}

impl RateLimiter {
    pub fn new(permits_per_second: f64) -> Self {
        assert!(permits_per_second > 0.0, "rate must be positive");
        Self {
            interval: Duration::from_secs_f64(1.0 / permits_per_second),
            next_token: Instant::now(),
        }
    }

    /// Claim the next token, returning how long to wait for it.
    pub fn acquire(&mut self, now: Instant) -> Duration {
        if self.next_token <= now {
            self.next_token = now + self.interval;
            Duration::ZERO
        } else {
            let delay = self.next_token - now;
            self.next_token += self.interval;
            delay
        }
    }
}
