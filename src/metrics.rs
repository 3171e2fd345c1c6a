use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    checks_total: AtomicU64,
    admitted_total: AtomicU64,
    limited_total: AtomicU64,
    exempt_total: AtomicU64,
    store_errors_total: AtomicU64,
    failed_open_total: AtomicU64,
}

impl RateLimitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checked(&self) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admitted(&self) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn limited(&self) {
        self.limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exempt(&self) {
        self.exempt_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_error(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed_open(&self) {
        self.failed_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE ratelimit_checks_total counter\n",
                "ratelimit_checks_total {}\n",
                "# TYPE ratelimit_admitted_total counter\n",
                "ratelimit_admitted_total {}\n",
                "# TYPE ratelimit_limited_total counter\n",
                "ratelimit_limited_total {}\n",
                "# TYPE ratelimit_exempt_total counter\n",
                "ratelimit_exempt_total {}\n",
                "# TYPE ratelimit_store_errors_total counter\n",
                "ratelimit_store_errors_total {}\n",
                "# TYPE ratelimit_failed_open_total counter\n",
                "ratelimit_failed_open_total {}\n"
            ),
            self.checks_total.load(Ordering::Relaxed),
            self.admitted_total.load(Ordering::Relaxed),
            self.limited_total.load(Ordering::Relaxed),
            self.exempt_total.load(Ordering::Relaxed),
            self.store_errors_total.load(Ordering::Relaxed),
            self.failed_open_total.load(Ordering::Relaxed),
        )
    }
}
