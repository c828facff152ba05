use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

/// Composite identity of one rate-limit domain. Two logically identical
/// keys resolve to the same shared bucket instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub command: String,
    pub actor_id: u64,
    pub channel_id: u64,
    pub parent_id: u64,
}

impl BucketKey {
    pub fn new(
        command: impl Into<String>,
        actor_id: u64,
        channel_id: u64,
        parent_id: u64,
    ) -> Self {
        Self {
            command: command.into(),
            actor_id,
            channel_id,
            parent_id,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    remaining: u32,
    reset_at: Instant,
}

/// Fixed-window token bucket. Refill is lazy (checked on consume), never a
/// background timer.
///
/// Fixed-window semantics are an accepted tradeoff: bursts straddling a
/// window boundary can exceed `max` within a span shorter than two
/// windows.
#[derive(Debug)]
pub struct Bucket {
    max: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(BucketState {
                remaining: max,
                reset_at: Instant::now() + window,
            }),
        }
    }

    /// One atomic refill-check-decrement critical section. A denial is a
    /// normal outcome, not an error.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now >= state.reset_at {
            state.remaining = self.max;
            state.reset_at = now + self.window;
        }
        if state.remaining > 0 {
            state.remaining -= 1;
            true
        } else {
            trace!(max = self.max, "bucket exhausted");
            false
        }
    }

    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Shared table of rate-limit buckets, keyed by [`BucketKey`].
///
/// Lookup is an atomic get-or-insert, so concurrent first accesses of the
/// same key dedupe to a single bucket. Buckets are never explicitly
/// removed; they go away with the table.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the shared bucket for `key`, creating it on first access.
    /// `max` and `window` only apply to a newly created bucket.
    pub fn bucket(&self, key: BucketKey, max: u32, window: Duration) -> Arc<Bucket> {
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(Bucket::new(max, window)));
        Arc::clone(entry.value())
    }

    /// Convenience: resolve and consume in one step.
    pub fn try_consume(&self, key: BucketKey, max: u32, window: Duration) -> bool {
        self.bucket(key, max, window).try_consume()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
