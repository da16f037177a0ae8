// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::clock::SharedClock;

/// Default minimum gap between two outbound calls
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Default bucket capacity, also the refill rate per minute
pub const DEFAULT_CAPACITY: u32 = 30;

/// Enforces a minimum spacing between consecutive calls across all tasks
#[derive(Debug)]
pub struct MinInterval {
    interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl MinInterval {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait until at least `interval` has passed since the previous call.
    ///
    /// The lock is held across the sleep, so waiters are released one at a
    /// time and each one stamps the new call time before the next checks it.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;

        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }

        *last_call = Some(Instant::now());
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token bucket holding `capacity` tokens and refilling `capacity` per minute
pub struct TokenBucket {
    capacity: f64,
    poll_interval: Duration,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        let now = clock.now();

        Self {
            capacity: f64::from(capacity),
            poll_interval: Duration::from_secs_f64(60.0 / f64::from(capacity)),
            clock,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    /// Take one token if available, refilling for the elapsed time first
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state.tokens = self.refilled(&state, now);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Poll `try_acquire` every `60 / capacity` seconds until it succeeds
    pub async fn wait(&self) {
        while !self.try_acquire() {
            tracing::trace!(poll = ?self.poll_interval, "Token bucket empty, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Tokens currently available, after refill
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refilled(&state, now)
    }

    fn refilled(&self, state: &BucketState, now: DateTime<Utc>) -> f64 {
        let elapsed_minutes = (now - state.last_refill)
            .num_microseconds()
            .unwrap_or(i64::MAX)
            .max(0) as f64
            / 60_000_000.0;
        (state.tokens + elapsed_minutes * self.capacity).min(self.capacity)
    }
}

/// The process-wide pacing applied before every upstream call
pub struct CallBudget {
    spacing: MinInterval,
    bucket: TokenBucket,
}

impl CallBudget {
    pub fn new(min_interval: Duration, capacity: u32, clock: SharedClock) -> Self {
        Self {
            spacing: MinInterval::new(min_interval),
            bucket: TokenBucket::new(capacity, clock),
        }
    }

    pub fn with_defaults(clock: SharedClock) -> Self {
        Self::new(DEFAULT_MIN_INTERVAL, DEFAULT_CAPACITY, clock)
    }

    /// Suspend the calling task until both the bucket and the spacing allow a call
    pub async fn wait(&self) {
        self.bucket.wait().await;
        self.spacing.wait().await;
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}
