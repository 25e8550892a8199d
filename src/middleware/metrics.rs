//! Request metrics middleware.
//!
//! Records, once the downstream chain completes:
//! - `server_handle_seconds`: latency histogram keyed by transport type,
//!   `"{METHOD}.{route}"`, and the `AID` client-id header
//! - `server_handled_total`: counter keyed the same plus the status text

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Request, Response};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use super::matched_route;
use crate::metrics::ServerMetrics;

const AID_HEADER: &str = "AID";

/// Tower layer for recording request metrics.
#[derive(Clone)]
pub struct MetricsLayer {
    metrics: ServerMetrics,
}

impl MetricsLayer {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// Middleware service that records request metrics on completion.
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: ServerMetrics,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method_route = format!("{}.{}", req.method(), matched_route(&req));
        let aid = req
            .headers()
            .get(AID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        MetricsFuture {
            inner: self.inner.call(req),
            beg: Instant::now(),
            method_route,
            aid,
            metrics: self.metrics.clone(),
        }
    }
}

pin_project! {
    /// Future wrapper that records metrics when the response is ready.
    pub struct MetricsFuture<F> {
        #[pin]
        inner: F,
        beg: Instant,
        method_route: String,
        aid: String,
        metrics: ServerMetrics,
    }
}

impl<F, ResBody, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                let elapsed = this.beg.elapsed();
                match &result {
                    Ok(response) => this.metrics.observe_handled(
                        this.method_route,
                        this.aid,
                        elapsed,
                        response.status(),
                    ),
                    Err(_) => this.metrics.observe_failed(this.method_route, this.aid, elapsed),
                }
                Poll::Ready(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use http::StatusCode;
    use prometheus::Registry;
    use tower::ServiceExt;

    fn test_metrics() -> ServerMetrics {
        ServerMetrics::new(&Registry::new()).unwrap()
    }

    #[tokio::test]
    async fn records_one_observation_and_one_increment() {
        let metrics = test_metrics();
        let app = Router::new()
            .route("/foo", get(|| async { "ok" }))
            .layer(MetricsLayer::new(metrics.clone()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/foo")
                    .header("AID", "client-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(metrics.handled_count("GET./foo", "client-1", "OK"), 1);
        assert_eq!(metrics.latency_sample_count("GET./foo", "client-1"), 1);
    }

    #[tokio::test]
    async fn labels_use_route_template_for_parameterized_paths() {
        let metrics = test_metrics();
        let app = Router::new()
            .route("/items/:id", get(|| async { "item" }))
            .layer(MetricsLayer::new(metrics.clone()));

        app.oneshot(Request::builder().uri("/items/42").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(metrics.handled_count("GET./items/:id", "", "OK"), 1);
    }

    #[tokio::test]
    async fn unmatched_requests_are_metered() {
        let metrics = test_metrics();
        let app = Router::new()
            .route("/foo", get(|| async { "ok" }))
            .layer(MetricsLayer::new(metrics.clone()));

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(metrics.handled_count("GET./nope", "", "Not Found"), 1);
        assert_eq!(metrics.latency_sample_count("GET./nope", ""), 1);
    }

    #[tokio::test]
    async fn missing_aid_header_records_empty_client_id() {
        let metrics = test_metrics();
        let app = Router::new()
            .route("/foo", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .layer(MetricsLayer::new(metrics.clone()));

        app.oneshot(Request::builder().uri("/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(metrics.handled_count("GET./foo", "", "Not Found"), 1);
    }
}
