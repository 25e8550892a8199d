//! Request middleware: recovery/access-log, metrics, and tracing.
//!
//! The server wrapper attaches these to every inbound request, outermost
//! first: access log, metrics, tracing. The access log stays outermost so it
//! also absorbs panics raised by the inner middleware, not just handlers.
//! Each layer forwards to the inner service exactly once.

mod access_log;
mod metrics;
mod trace;

pub use access_log::AccessLogLayer;
pub use metrics::MetricsLayer;
pub use trace::TracingLayer;

use axum::extract::MatchedPath;
use http::Request;

/// Route template for the request, falling back to the raw URI path when no
/// route matched. The template keeps metric label cardinality bounded for
/// parameterized routes.
pub(crate) fn matched_route<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn matched_route_falls_back_to_uri_path() {
        let req = Request::builder()
            .uri("/raw/path?query=1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(matched_route(&req), "/raw/path");
    }
}
