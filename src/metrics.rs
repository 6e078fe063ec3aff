use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). Federated
/// responses stream for a while, so the tail reaches further than a plain
/// proxy's would.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros can be used
/// anywhere in the codebase; the `PrometheusHandle` is retained solely for
/// rendering the admin `/metrics` endpoint. Installation is best-effort so
/// that test binaries constructing several contexts do not panic — without
/// a recorder the macros are no-ops and `render` returns nothing.
#[derive(Clone)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .ok();

        if handle.is_some() {
            describe_metrics();
        }
        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

fn describe_metrics() {
    describe_counter!(
        "federator_requests_total",
        Unit::Count,
        "Client requests processed, by service and status"
    );
    describe_histogram!(
        "federator_request_duration_seconds",
        Unit::Seconds,
        "Total client request duration"
    );
    describe_gauge!(
        "federator_requests_in_flight",
        Unit::Count,
        "Client requests currently being processed"
    );
    describe_counter!(
        "federator_routing_requests_total",
        Unit::Count,
        "Requests issued to the routing service"
    );
    describe_counter!(
        "federator_endpoint_requests_total",
        Unit::Count,
        "Requests issued to data endpoints, by endpoint and status"
    );
    describe_counter!(
        "federator_budget_cutoffs_total",
        Unit::Count,
        "Endpoint fetches short-circuited by the retry budget"
    );
    describe_counter!(
        "federator_cache_total",
        Unit::Count,
        "Response cache lookups, by result"
    );
    describe_counter!(
        "federator_connections_total",
        Unit::Count,
        "Downstream connections accepted"
    );
    describe_gauge!(
        "federator_connections_active",
        Unit::Count,
        "Active downstream connections"
    );
}
