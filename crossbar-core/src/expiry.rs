//! Bucketed expiry wheel
//!
//! Elements are grouped into buckets keyed by their deadline, which is always
//! rounded **up** to the next multiple of the configured tick. Renewing an
//! element is a cheap bucket-to-bucket move, and an expired bucket is drained
//! in one detach, at the cost of up to one tick of expiration jitter. The
//! wheel advances exactly one tick per `poll`, whether or not the elapsed
//! bucket held anything.

use crate::timing;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

pub struct ExpiryQueue<E> {
    interval_ms: u64,
    inner: Mutex<Inner<E>>,
}

struct Inner<E> {
    /// element -> its current deadline
    deadlines: HashMap<E, u64>,
    /// deadline -> elements expiring at that tick
    buckets: HashMap<u64, HashSet<E>>,
    /// the earliest deadline `poll` has not yet consumed
    next_expiration: u64,
}

impl<E: Eq + Hash + Clone> ExpiryQueue<E> {
    /// `interval_ms` is the tick length and must be positive.
    pub fn new(interval_ms: u64) -> Self {
        assert!(interval_ms > 0, "expiry interval must be positive");
        let next_expiration = round_up(timing::now_ms(), interval_ms);
        Self {
            interval_ms,
            inner: Mutex::new(Inner {
                deadlines: HashMap::new(),
                buckets: HashMap::new(),
                next_expiration,
            }),
        }
    }

    /// Move `elem` to the bucket covering `now + timeout_ms`. Returns the new
    /// deadline when the element changed buckets, `None` when the renewal was
    /// absorbed by its current bucket.
    pub fn update(&self, elem: &E, timeout_ms: u64) -> Option<u64> {
        let deadline = round_up(timing::now_ms() + timeout_ms, self.interval_ms);
        let mut inner = self.inner.lock().unwrap();

        let prev = inner.deadlines.insert(elem.clone(), deadline);
        if prev == Some(deadline) {
            return None;
        }
        if let Some(prev) = prev {
            if let Some(bucket) = inner.buckets.get_mut(&prev) {
                bucket.remove(elem);
            }
        }
        inner.buckets.entry(deadline).or_default().insert(elem.clone());
        Some(deadline)
    }

    /// Delete `elem` from the wheel. Returns its deadline if it was present.
    pub fn remove(&self, elem: &E) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.deadlines.remove(elem)?;
        if let Some(bucket) = inner.buckets.get_mut(&deadline) {
            bucket.remove(elem);
        }
        Some(deadline)
    }

    /// Time until the earliest unconsumed deadline; zero when `poll` has work.
    pub fn wait_time(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        Duration::from_millis(inner.next_expiration.saturating_sub(timing::now_ms()))
    }

    /// Detach and return the earliest bucket if its deadline has passed.
    pub fn poll(&self) -> Vec<E> {
        let mut inner = self.inner.lock().unwrap();
        if timing::now_ms() < inner.next_expiration {
            return Vec::new();
        }
        let expired = inner.next_expiration;
        inner.next_expiration = expired + self.interval_ms;

        let Some(bucket) = inner.buckets.remove(&expired) else {
            return Vec::new();
        };
        for elem in &bucket {
            inner.deadlines.remove(elem);
        }
        bucket.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable bucket summary for the connection dump command.
    pub fn dump(&self, out: &mut String) {
        let inner = self.inner.lock().unwrap();
        let mut deadlines: Vec<&u64> = inner.buckets.keys().collect();
        deadlines.sort();
        let now = timing::now_ms();
        for deadline in deadlines {
            let count = inner.buckets[deadline].len();
            if count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{count} expire in {} ms",
                deadline.saturating_sub(now)
            );
        }
    }
}

fn round_up(time_ms: u64, interval_ms: u64) -> u64 {
    (time_ms / interval_ms + 1) * interval_ms
}
