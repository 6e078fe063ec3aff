use crate::config::RetryBudgetConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Budget-relevant classification of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Success,
    Failure,
}

impl UpstreamOutcome {
    /// Map an upstream status code to a budget outcome.
    ///
    /// 2xx and client errors count as success (a 4xx is the client's fault,
    /// not the endpoint's), 429 and server errors count as failure. 413
    /// escalates to the whole request and is never recorded — returns `None`.
    pub fn from_status(status: u16) -> Option<UpstreamOutcome> {
        match status {
            413 => None,
            429 => Some(UpstreamOutcome::Failure),
            200..=299 => Some(UpstreamOutcome::Success),
            400..=499 => Some(UpstreamOutcome::Success),
            _ => Some(UpstreamOutcome::Failure),
        }
    }
}

/// Per-endpoint error-rate accounting over a bucketed sliding window.
///
/// Each endpoint URL gets `window_size` fixed-size buckets spanning `ttl`
/// seconds in total. Counters are atomics; a bucket is lazily reset when the
/// window rotates past it, which gives TTL expiry without a sweeper task.
/// Updates are best-effort — the budget never fails a request on its own.
pub struct RetryBudget {
    windows: DashMap<String, Arc<EndpointWindow>>,
    cfg: RetryBudgetConfig,
    bucket_ms: u64,
}

struct EndpointWindow {
    buckets: Vec<Bucket>,
    started: Instant,
}

struct Bucket {
    /// Absolute slot number this bucket currently holds counts for.
    slot: AtomicU64,
    errors: AtomicU32,
    total: AtomicU32,
}

impl RetryBudget {
    pub fn new(cfg: RetryBudgetConfig) -> Self {
        let bucket_ms = (cfg.ttl * 1000 / cfg.window_size as u64).max(1);
        Self {
            windows: DashMap::new(),
            cfg,
            bucket_ms,
        }
    }

    /// Record an upstream outcome for `url`.
    pub fn record(&self, url: &str, outcome: UpstreamOutcome) {
        let window = self.get_or_create(url);
        let slot = self.current_slot(&window);
        let bucket = &window.buckets[(slot % window.buckets.len() as u64) as usize];

        // Rotate: only one caller wins the reset for a stale bucket.
        let seen = bucket.slot.load(Ordering::Acquire);
        if seen != slot
            && bucket
                .slot
                .compare_exchange(seen, slot, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.errors.store(0, Ordering::Relaxed);
            bucket.total.store(0, Ordering::Relaxed);
        }

        bucket.total.fetch_add(1, Ordering::Relaxed);
        if outcome == UpstreamOutcome::Failure {
            bucket.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Windowed error ratio for `url`, in percent. 0 when nothing is
    /// recorded or everything has expired.
    pub fn error_ratio(&self, url: &str) -> f64 {
        let window = match self.windows.get(url) {
            Some(w) => w.value().clone(),
            None => return 0.0,
        };
        let current = self.current_slot(&window);
        let oldest_live = current.saturating_sub(window.buckets.len() as u64 - 1);

        let mut errors = 0u64;
        let mut total = 0u64;
        for bucket in &window.buckets {
            let slot = bucket.slot.load(Ordering::Acquire);
            if slot < oldest_live || slot > current {
                continue;
            }
            errors += bucket.errors.load(Ordering::Relaxed) as u64;
            total += bucket.total.load(Ordering::Relaxed) as u64;
        }
        if total == 0 {
            return 0.0;
        }
        errors as f64 * 100.0 / total as f64
    }

    /// Whether fetches to `url` should be short-circuited to a synthetic
    /// no-content outcome.
    pub fn should_cut(&self, url: &str) -> bool {
        let ratio = self.error_ratio(url);
        if ratio > self.cfg.threshold {
            metrics::counter!(
                "federator_budget_cutoffs_total",
                "endpoint" => url.to_string(),
            )
            .increment(1);
            tracing::warn!(
                endpoint = url,
                error_ratio = ratio,
                "budget: endpoint cut off"
            );
            return true;
        }
        false
    }

    fn current_slot(&self, window: &EndpointWindow) -> u64 {
        window.started.elapsed().as_millis() as u64 / self.bucket_ms
    }

    fn get_or_create(&self, url: &str) -> Arc<EndpointWindow> {
        if let Some(entry) = self.windows.get(url) {
            return entry.value().clone();
        }
        let size = self.cfg.window_size;
        self.windows
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointWindow {
                    buckets: (0..size)
                        .map(|_| Bucket {
                            slot: AtomicU64::new(0),
                            errors: AtomicU32::new(0),
                            total: AtomicU32::new(0),
                        })
                        .collect(),
                    started: Instant::now(),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(threshold: f64, ttl: u64, window_size: usize) -> RetryBudget {
        RetryBudget::new(RetryBudgetConfig {
            threshold,
            ttl,
            window_size,
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            UpstreamOutcome::from_status(200),
            Some(UpstreamOutcome::Success)
        );
        assert_eq!(
            UpstreamOutcome::from_status(404),
            Some(UpstreamOutcome::Success)
        );
        assert_eq!(
            UpstreamOutcome::from_status(429),
            Some(UpstreamOutcome::Failure)
        );
        assert_eq!(
            UpstreamOutcome::from_status(500),
            Some(UpstreamOutcome::Failure)
        );
        assert_eq!(UpstreamOutcome::from_status(413), None);
    }

    #[test]
    fn test_empty_budget_never_cuts() {
        let b = budget(1.0, 3600, 20);
        assert!(!b.should_cut("http://eida.ethz.ch/q"));
        assert_eq!(b.error_ratio("http://eida.ethz.ch/q"), 0.0);
    }

    #[test]
    fn test_cut_over_threshold() {
        let b = budget(50.0, 3600, 20);
        let url = "http://eida.ethz.ch/q";

        b.record(url, UpstreamOutcome::Failure);
        assert_eq!(b.error_ratio(url), 100.0);
        assert!(b.should_cut(url));

        // Successes dilute the ratio below the threshold.
        for _ in 0..3 {
            b.record(url, UpstreamOutcome::Success);
        }
        assert_eq!(b.error_ratio(url), 25.0);
        assert!(!b.should_cut(url));
    }

    #[test]
    fn test_per_endpoint_isolation() {
        let b = budget(1.0, 3600, 20);
        b.record("http://a.example.org/q", UpstreamOutcome::Failure);
        assert!(b.should_cut("http://a.example.org/q"));
        assert!(!b.should_cut("http://b.example.org/q"));
    }

    #[test]
    fn test_window_expiry() {
        // 1 s TTL over 2 buckets — a failure ages out after ~1 s.
        let b = budget(1.0, 1, 2);
        let url = "http://eida.ethz.ch/q";
        b.record(url, UpstreamOutcome::Failure);
        assert!(b.should_cut(url));

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(b.error_ratio(url), 0.0);
        assert!(!b.should_cut(url));
    }
}
