use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static INSTALLED: OnceLock<Metrics> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`. Repeated
/// installs return the original handle (the process recorder is global).
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        INSTALLED
            .get_or_init(|| {
                let handle = PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder");

                describe_metrics();
                Metrics { handle }
            })
            .clone()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register HELP / TYPE lines for every metric the gateway emits.
fn describe_metrics() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Upstream exchange duration"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );
    describe_counter!(
        "gateway_upstream_errors_total",
        Unit::Count,
        "Upstream transport failures answered with 502"
    );

    // rate limiting
    describe_counter!(
        "gateway_rate_limit_allowed_total",
        Unit::Count,
        "Requests admitted by the limiter"
    );
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Requests rejected by the limiter"
    );
    describe_counter!(
        "gateway_rate_limit_fail_open_total",
        Unit::Count,
        "Requests admitted because the window store was unavailable"
    );

    // events & analytics
    describe_counter!(
        "gateway_events_dropped_total",
        Unit::Count,
        "Events dropped on full subscriber queues"
    );
    describe_counter!(
        "gateway_analytics_logged_total",
        Unit::Count,
        "Events persisted to the analytics store"
    );
    describe_counter!(
        "gateway_analytics_dropped_total",
        Unit::Count,
        "Events lost to sink backpressure or failed flushes"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // rules
    describe_gauge!(
        "gateway_config_rules_total",
        Unit::Count,
        "Number of rules currently loaded"
    );
    describe_counter!(
        "gateway_rule_swaps_total",
        Unit::Count,
        "Rule set hot-swap events"
    );
}
