use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through the admission pipeline: identity,
/// the matched rule (if any), and timing state for metrics and the access
/// log.
pub struct RequestContext {
    pub method: String,
    /// Request path, no query string.
    pub path: String,
    /// Derived client identity (socket host or trusted X-Forwarded-For).
    pub client_id: String,
    /// Name of the matched rule; empty on the global fallback path.
    pub rule_name: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_id: String) -> Self {
        Self {
            method,
            path,
            client_id,
            rule_name: String::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Build a JSON error response and record metrics in one place, the
    /// single exit point for all error paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.record_request_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a completed request.
    pub fn finalize_metrics(&self, resp_status: u16) {
        self.record_request_metrics(resp_status);
    }

    fn record_request_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "rule" => self.rule_name.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "rule" => self.rule_name.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!("gateway_upstream_request_duration_seconds")
                .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}
