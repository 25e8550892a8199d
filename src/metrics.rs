//! Prometheus metrics for handled requests.
//!
//! Defines metrics for:
//! - Request latency by transport type, method+route, and client id
//! - Request counts by transport type, method+route, client id, and status
//!
//! The collectors are registered against an injected [`prometheus::Registry`]
//! rather than a process-wide singleton, so tests can run with private
//! registries and fakes.

use std::time::Duration;

use http::StatusCode;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::errors::Result;

/// Transport-type label value for HTTP servers.
pub const TYPE_HTTP: &str = "http";

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Request histogram and counter shared by all concurrent requests.
///
/// Cloning is cheap; the underlying collectors are reference counted and
/// safe for concurrent observe/increment.
#[derive(Clone)]
pub struct ServerMetrics {
    handle_seconds: HistogramVec,
    handled_total: IntCounterVec,
}

impl ServerMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let handle_seconds = HistogramVec::new(
            HistogramOpts::new("server_handle_seconds", "Request latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["type", "method", "aid"],
        )?;
        registry.register(Box::new(handle_seconds.clone()))?;

        let handled_total = IntCounterVec::new(
            Opts::new("server_handled_total", "Total requests handled"),
            &["type", "method", "aid", "code"],
        )?;
        registry.register(Box::new(handled_total.clone()))?;

        Ok(Self {
            handle_seconds,
            handled_total,
        })
    }

    /// Record one handled request: latency into the histogram, one counter
    /// increment labelled with the status text.
    pub fn observe_handled(&self, method_route: &str, aid: &str, elapsed: Duration, status: StatusCode) {
        self.handle_seconds
            .with_label_values(&[TYPE_HTTP, method_route, aid])
            .observe(elapsed.as_secs_f64());
        self.handled_total
            .with_label_values(&[TYPE_HTTP, method_route, aid, status_text(status)])
            .inc();
    }

    /// Record a request whose handler chain failed before producing a response.
    pub fn observe_failed(&self, method_route: &str, aid: &str, elapsed: Duration) {
        self.handle_seconds
            .with_label_values(&[TYPE_HTTP, method_route, aid])
            .observe(elapsed.as_secs_f64());
        self.handled_total
            .with_label_values(&[TYPE_HTTP, method_route, aid, "error"])
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn handled_count(&self, method_route: &str, aid: &str, code: &str) -> u64 {
        self.handled_total
            .with_label_values(&[TYPE_HTTP, method_route, aid, code])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn latency_sample_count(&self, method_route: &str, aid: &str) -> u64 {
        self.handle_seconds
            .with_label_values(&[TYPE_HTTP, method_route, aid])
            .get_sample_count()
    }
}

/// Status label carried on the counter, e.g. `"OK"` or `"Not Found"`.
fn status_text(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_uses_canonical_reason() {
        assert_eq!(status_text(StatusCode::OK), "OK");
        assert_eq!(status_text(StatusCode::NOT_FOUND), "Not Found");
        assert_eq!(status_text(StatusCode::INTERNAL_SERVER_ERROR), "Internal Server Error");
    }

    #[test]
    fn registers_against_private_registry() {
        let registry = Registry::new();
        let metrics = ServerMetrics::new(&registry).unwrap();
        metrics.observe_handled("GET./", "", Duration::from_millis(2), StatusCode::OK);

        assert_eq!(metrics.handled_count("GET./", "", "OK"), 1);
        assert_eq!(metrics.latency_sample_count("GET./", ""), 1);
        // The registry sees both collectors.
        assert_eq!(registry.gather().len(), 2);
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        ServerMetrics::new(&registry).unwrap();
        assert!(ServerMetrics::new(&registry).is_err());
    }
}
