//! Distributed-tracing middleware.
//!
//! Opens a `"{METHOD} {route}"` server span per request, parented on any
//! trace context found in the incoming headers, tagged with the URL, method,
//! and resolved peer address. The span covers the whole downstream chain and
//! closes when the response future finishes.

use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use http::{HeaderMap, Request};
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use tower::{Layer, Service};
use tracing::instrument::Instrumented;
use tracing::{info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::matched_route;
use crate::remote::remote_addr;

/// Tower layer for per-request server spans.
#[derive(Debug, Clone, Default)]
pub struct TracingLayer;

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

/// Middleware service that instruments the downstream chain with a span.
#[derive(Debug, Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for TracingService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Instrumented<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let route = matched_route(&req);
        let method = req.method().clone();
        let name = format!("{method} {route}");
        let fallback = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default();
        let peer = remote_addr(req.headers(), &fallback);

        let span = info_span!(
            "http.request",
            otel.name = %name,
            otel.kind = "server",
            component = "http",
            http.url = %route,
            http.method = %method,
            peer.address = %peer,
        );
        span.set_parent(global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(req.headers()))
        }));

        self.inner.call(req).instrument(span)
    }
}

/// Text-map carrier over HTTP headers for context extraction.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}
