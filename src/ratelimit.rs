//! Token-bucket admission control for outbound platform calls.
//!
//! The bucket refills one token per elapsed `refill_interval`, capped at
//! `capacity`. Refills are counted in whole intervals and `last_refill` only moves
//! forward by whole intervals, so the unused fraction of an interval carries
//! over to the next call instead of drifting.

use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// A token bucket shared between pipeline stages.
///
/// [`TokenBucket::try_consume`] is atomic: the refill-and-subtract sequence runs
/// under a mutex, so concurrent stages can never overdraw the bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(initial_tokens: u32, capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: initial_tokens.min(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // The critical section never panics, so a poisoned lock still holds a valid state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let interval = self.refill_interval.as_nanos();
        if interval == 0 {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        let whole_intervals = elapsed / interval;

        if whole_intervals > 0 {
            let added = u32::try_from(whole_intervals).unwrap_or(u32::MAX);
            state.tokens = state.tokens.saturating_add(added).min(self.capacity);

            let advance = whole_intervals * interval;
            state.last_refill += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
        }
    }

    /// Takes `n` tokens if that many are available.
    ///
    /// Returns `false` and leaves the bucket untouched otherwise; there is no
    /// partial consumption.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available(&self) -> u32 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Waits until one token can be taken.
    pub async fn acquire(&self) {
        while !self.try_consume(1) {
            tracing::debug!(
                wait_ms = self.refill_interval.as_millis() as u64,
                "Rate limit reached, waiting for a token"
            );
            tokio::time::sleep(self.refill_interval).await;
        }
    }
}
