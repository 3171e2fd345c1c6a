use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    clock::Clock,
    ratelimit::store::{CounterStore, StoreResult},
};

/// Seconds of clock time between full sweeps for expired sets.
const SWEEP_INTERVAL_SECS: f64 = 30.0;

/// Process-local counter store with the same ordered-set semantics as the
/// Redis backend. Only suitable when a single gateway instance runs.
///
/// Expired sets are dropped lazily when their key is touched, and by a sweep
/// that `add` runs at most once per [`SWEEP_INTERVAL_SECS`], so abandoned
/// identifiers do not accumulate.
pub struct InMemoryCounterStore {
    sets: DashMap<String, SortedSet>,
    clock: Arc<dyn Clock>,
    // f64 bits of the clock time at which the next sweep is due.
    next_sweep_at: AtomicU64,
}

#[derive(Default)]
struct SortedSet {
    // Kept ordered by score; equal scores keep insertion order.
    entries: Vec<(f64, String)>,
    expires_at: Option<f64>,
}

impl SortedSet {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn insert(&mut self, member: &str, score: f64) {
        self.entries.retain(|(_, m)| m != member);
        let at = self.entries.partition_point(|(s, _)| *s <= score);
        self.entries.insert(at, (score, member.to_string()));
    }
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let first_sweep = clock.now() + SWEEP_INTERVAL_SECS;
        Self {
            sets: DashMap::new(),
            clock,
            next_sweep_at: AtomicU64::new(first_sweep.to_bits()),
        }
    }

    fn evict_if_expired(&self, key: &str) {
        let now = self.clock.now();
        self.sets.remove_if(key, |_, set| set.is_expired(now));
    }

    fn sweep_if_due(&self) {
        let now = self.clock.now();
        let due = self.next_sweep_at.load(Ordering::Relaxed);
        if now < f64::from_bits(due) {
            return;
        }
        // One caller wins the sweep; the rest carry on.
        if self
            .next_sweep_at
            .compare_exchange(
                due,
                (now + SWEEP_INTERVAL_SECS).to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return;
        }

        let before = self.sets.len();
        self.sets.retain(|_, set| !set.is_expired(now));
        let evicted = before.saturating_sub(self.sets.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.sets.len(), "swept expired rate limit records");
        }
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.sets.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.sweep_if_due();
        self.evict_if_expired(key);
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn remove_up_to(&self, key: &str, max_score: f64) -> StoreResult<u64> {
        self.evict_if_expired(key);
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.entries.len();
        set.entries.retain(|(score, _)| *score > max_score);
        let removed = (before - set.entries.len()) as u64;
        let empty = set.entries.is_empty();
        drop(set);

        // Redis drops a sorted set once its last member is gone.
        if empty {
            self.sets.remove_if(key, |_, set| set.entries.is_empty());
        }
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .map(|set| set.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn oldest_score(&self, key: &str) -> StoreResult<Option<f64>> {
        self.evict_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .and_then(|set| set.entries.first().map(|(score, _)| *score)))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let deadline = self.clock.now() + ttl_secs as f64;
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.sets.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
