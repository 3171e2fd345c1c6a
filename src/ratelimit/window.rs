use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use crate::ratelimit::store::{CounterStore, StoreError, StoreResult};

/// Extra lifetime given to a window record beyond its span, so that a key
/// is never evicted while its newest marker can still count.
pub const EXPIRY_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub name: &'static str,
    pub duration_secs: u64,
}

impl Window {
    pub const MINUTE: Window = Window {
        name: "minute",
        duration_secs: 60,
    };
    pub const HOUR: Window = Window {
        name: "hour",
        duration_secs: 3_600,
    };
    pub const DAY: Window = Window {
        name: "day",
        duration_secs: 86_400,
    };

    /// Every window, shortest first. Evaluation order follows this slice.
    pub const ALL: [Window; 3] = [Window::MINUTE, Window::HOUR, Window::DAY];

    pub fn duration(&self) -> f64 {
        self.duration_secs as f64
    }
}

/// Maintains the sliding log of request markers for (identifier, window)
/// pairs in the counter store.
#[derive(Clone)]
pub struct WindowTracker {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    op_timeout: Duration,
}

impl WindowTracker {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: String, op_timeout: Duration) -> Self {
        Self {
            store,
            key_prefix,
            op_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn key(&self, identifier: &str, window: &Window) -> String {
        format!("{}:{}:{}", self.key_prefix, identifier, window.name)
    }

    /// Drops markers that fell out of the window, then counts the survivors.
    pub async fn trim_and_count(
        &self,
        identifier: &str,
        window: &Window,
        now: f64,
    ) -> StoreResult<u64> {
        let key = self.key(identifier, window);
        let cutoff = now - window.duration();
        self.bounded("zremrangebyscore", self.store.remove_up_to(&key, cutoff))
            .await?;
        self.bounded("zcard", self.store.cardinality(&key)).await
    }

    pub async fn record(
        &self,
        identifier: &str,
        window: &Window,
        now: f64,
        marker_id: &str,
    ) -> StoreResult<()> {
        let key = self.key(identifier, window);
        self.bounded("zadd", self.store.add(&key, marker_id, now))
            .await?;
        self.bounded(
            "expire",
            self.store
                .expire(&key, window.duration_secs + EXPIRY_GRACE_SECS),
        )
        .await
    }

    pub async fn oldest_marker(&self, identifier: &str, window: &Window) -> StoreResult<Option<f64>> {
        let key = self.key(identifier, window);
        self.bounded("zrange", self.store.oldest_score(&key)).await
    }

    /// Deletes the records of every identifier for every window in one call.
    pub async fn clear(&self, identifiers: &[String], windows: &[Window]) -> StoreResult<()> {
        let keys = identifiers
            .iter()
            .flat_map(|identifier| windows.iter().map(move |window| self.key(identifier, window)))
            .collect::<Vec<_>>();
        self.bounded("del", self.store.delete(&keys)).await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.bounded("ping", self.store.ping()).await
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        tokio::time::timeout(self.op_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout {
                op,
                after: self.op_timeout,
            })?
    }
}
