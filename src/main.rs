//! Servekit - managed HTTP server with access logging, metrics, and tracing.
//!
//! Bootstrap glue: initializes structured logging, loads configuration,
//! wires a Prometheus registry into the server wrapper, registers the demo
//! routes, and hands the wrapper to the managed lifecycle runner, which
//! drives serve and graceful stop around process signals.

mod config;
mod errors;
mod metrics;
mod middleware;
mod remote;
mod server;

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::server::{HttpServer, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment and optional config file
    let config = Config::from_env()?;

    // Initialize tracing with JSON output for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    info!(?config, "configuration loaded");

    // Request metrics live in an injected registry, not a global
    let registry = Registry::new();
    let server_metrics = ServerMetrics::new(&registry)?;

    let http_server = Arc::new(HttpServer::new(config.clone(), server_metrics));

    http_server.route(Method::GET, "/", || async { (StatusCode::OK, "hello go-restful") })?;

    let metrics_registry = registry.clone();
    http_server.route(Method::GET, "/metrics", move || {
        let registry = metrics_registry.clone();
        async move {
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
        }
    })?;

    info!(service = %http_server.info().name, address = %config.address(), "starting server");
    server::run(http_server, Duration::from_secs(config.graceful_timeout_secs)).await?;
    info!("server shutdown complete");
    Ok(())
}
