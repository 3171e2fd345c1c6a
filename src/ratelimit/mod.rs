pub mod in_memory;
pub mod redis_backend;
pub mod resolver;
pub mod store;
pub mod window;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    clock::Clock,
    metrics::RateLimitMetrics,
    ratelimit::{
        resolver::route_scoped,
        store::{StoreError, StoreResult},
        window::{Window, WindowTracker},
    },
};

/// Request caps per window. Zero disables a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitProfile {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
}

impl LimitProfile {
    pub const fn new(per_minute: u64, per_hour: u64, per_day: u64) -> Self {
        Self {
            per_minute,
            per_hour,
            per_day,
        }
    }

    pub fn limit_for(&self, window: &Window) -> u64 {
        match window.name {
            "minute" => self.per_minute,
            "hour" => self.per_hour,
            "day" => self.per_day,
            _ => 0,
        }
    }

    /// Enabled windows with their caps, shortest window first.
    pub fn active_windows(&self) -> impl Iterator<Item = (Window, u64)> + '_ {
        Window::ALL
            .into_iter()
            .map(|window| (window, self.limit_for(&window)))
            .filter(|(_, limit)| *limit > 0)
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,
    pub retry_after: u64,
    pub window: Option<&'static str>,
    /// Set when the request was admitted without consulting the store.
    pub degraded: bool,
}

impl RateLimitDecision {
    fn unmetered() -> Self {
        Self::default()
    }

    fn degraded() -> Self {
        Self {
            degraded: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Multi-window sliding-log admission control.
///
/// The trim, count and record steps are separate store round trips, so
/// concurrent requests for one identifier may overshoot a cap by up to the
/// number of requests in flight. The burst allowance is expected to absorb it.
#[derive(Clone)]
pub struct RateLimiter {
    tracker: WindowTracker,
    clock: Arc<dyn Clock>,
    burst_allowance: u64,
    failure_policy: FailurePolicy,
    metrics: Arc<RateLimitMetrics>,
}

impl RateLimiter {
    pub fn new(
        tracker: WindowTracker,
        clock: Arc<dyn Clock>,
        burst_allowance: u64,
        failure_policy: FailurePolicy,
        metrics: Arc<RateLimitMetrics>,
    ) -> Self {
        Self {
            tracker,
            clock,
            burst_allowance,
            failure_policy,
            metrics,
        }
    }

    /// Decides whether one request from `identifier` may proceed, recording
    /// it against every active window when admitted.
    pub async fn check(
        &self,
        identifier: &str,
        profile: &LimitProfile,
        request_id: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.metrics.checked();

        match self.evaluate(identifier, profile).await {
            Ok(decision) => {
                if decision.limited {
                    self.metrics.limited();
                } else {
                    self.metrics.admitted();
                }
                Ok(decision)
            }
            Err(err) => {
                self.metrics.store_error();
                match self.failure_policy {
                    FailurePolicy::FailOpen => {
                        tracing::warn!(
                            request_id,
                            identifier,
                            error = %err,
                            "rate limiter store failed; admitting request (fail-open)"
                        );
                        self.metrics.failed_open();
                        Ok(RateLimitDecision::degraded())
                    }
                    FailurePolicy::FailClosed => {
                        tracing::error!(
                            request_id,
                            identifier,
                            error = %err,
                            "rate limiter store failed; rejecting request (fail-closed)"
                        );
                        Err(err.into())
                    }
                }
            }
        }
    }

    async fn evaluate(&self, identifier: &str, profile: &LimitProfile) -> StoreResult<RateLimitDecision> {
        let now = self.clock.now();
        let active = profile.active_windows().collect::<Vec<_>>();
        if active.is_empty() {
            return Ok(RateLimitDecision::unmetered());
        }

        // Minute comes first whenever it is active, so the first active
        // window is also the one reported back to the client.
        let mut headline_count = None;

        for (window, limit) in &active {
            let count = self.tracker.trim_and_count(identifier, window, now).await?;
            let effective_cap = limit + self.burst_allowance;

            if count >= effective_cap {
                match self.tracker.oldest_marker(identifier, window).await? {
                    Some(oldest) => return Ok(deny(window, *limit, oldest, now)),
                    None => {
                        // Emptied by a concurrent reset or expiry since the count.
                        tracing::debug!(identifier, window = window.name, "window drained mid-check");
                    }
                }
            }

            headline_count.get_or_insert(count);
        }

        // Markers are ZSET members, so they must be unique per admission even
        // when clients reuse request ids.
        let marker = format!("{now:.6}:{}", Uuid::new_v4());

        // Every window gets its marker even if one write fails, so the windows
        // never disagree about which requests were admitted.
        let mut record_failure = None;
        for (window, _) in &active {
            if let Err(err) = self.tracker.record(identifier, window, now, &marker).await {
                tracing::warn!(identifier, window = window.name, error = %err, "failed to record request marker");
                record_failure.get_or_insert(err);
            }
        }
        if let Some(err) = record_failure {
            return Err(err);
        }

        let (window, limit) = active[0];
        let count = headline_count.unwrap_or(0);
        Ok(RateLimitDecision {
            limited: false,
            limit,
            remaining: limit.saturating_sub(count + 1),
            reset: (now + window.duration()) as u64,
            retry_after: 0,
            window: None,
            degraded: false,
        })
    }

    /// Current marker count per window, without recording anything.
    pub async fn get_usage(&self, identifier: &str) -> Result<BTreeMap<&'static str, u64>, RateLimitError> {
        let now = self.clock.now();
        let mut usage = BTreeMap::new();
        for window in Window::ALL {
            let count = self.tracker.trim_and_count(identifier, &window, now).await?;
            usage.insert(window.name, count);
        }
        Ok(usage)
    }

    /// Deletes every window record for the identifier, including the
    /// counters it accrued under each of `route_prefixes`.
    pub async fn reset(&self, identifier: &str, route_prefixes: &[String]) -> Result<(), RateLimitError> {
        let identifiers = std::iter::once(identifier.to_string())
            .chain(route_prefixes.iter().map(|prefix| route_scoped(identifier, prefix)))
            .collect::<Vec<_>>();
        self.tracker.clear(&identifiers, &Window::ALL).await?;
        tracing::info!(identifier, route_scopes = route_prefixes.len(), "rate limit state reset");
        Ok(())
    }

    pub async fn store_healthy(&self) -> bool {
        self.tracker.ping().await.is_ok()
    }

    pub fn store_name(&self) -> &'static str {
        self.tracker.store().name()
    }
}

fn deny(window: &Window, limit: u64, oldest: f64, now: f64) -> RateLimitDecision {
    let reset_at = oldest + window.duration();
    let retry_after = ((reset_at - now).ceil() as u64).clamp(1, window.duration_secs);

    RateLimitDecision {
        limited: true,
        limit,
        remaining: 0,
        reset: reset_at.ceil() as u64,
        retry_after,
        window: Some(window.name),
        degraded: false,
    }
}
