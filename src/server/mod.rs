//! HTTP server wrapper with a managed lifecycle.
//!
//! [`HttpServer`] owns an axum router, attaches the access-log, metrics and
//! tracing middleware to every inbound request, and implements the [`Server`]
//! trait so the host application can drive heterogeneous server kinds through
//! one capability set: serve, stop, graceful stop, info.
//!
//! State machine: Constructed (router ready, no listener) -> Serving
//! (listener bound) -> Stopped | GracefullyStopped. The listener is created
//! exactly once, inside `serve`.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::handler::Handler;
use axum::routing::{on, MethodFilter};
use axum::Router;
use http::Method;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::{Result, ServerError};
use crate::metrics::ServerMetrics;
use crate::middleware::{AccessLogLayer, MetricsLayer, TracingLayer};

/// Lifecycle capability set the host application manages servers through.
/// The HTTP wrapper is one variant among several.
#[async_trait]
pub trait Server: Send + Sync {
    /// Bind the configured address and serve until stopped. Returns the
    /// terminal listener error; `Ok(())` only on a clean shutdown.
    async fn serve(&self) -> Result<()>;

    /// Close the listener immediately, abandoning in-flight requests.
    async fn stop(&self) -> Result<()>;

    /// Stop accepting new connections and wait for in-flight requests to
    /// finish, up to `deadline`. Once the deadline elapses, remaining
    /// connections are forcibly closed and an error is returned.
    async fn graceful_stop(&self, deadline: Instant) -> Result<()>;

    /// Snapshot of the service for registration and balancing.
    fn info(&self) -> ServiceInfo;
}

/// Service registration snapshot, computed on demand from configuration.
///
/// Health and enable flags default to "not ready": this wrapper performs no
/// health registration of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub weight: f64,
    pub enable: bool,
    pub healthy: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Constructed,
    Serving,
    Stopped,
    GracefullyStopped,
}

/// HTTP server wrapper around an axum router.
pub struct HttpServer {
    config: Config,
    metrics: ServerMetrics,
    router: Mutex<Option<Router>>,
    routes: Mutex<Vec<(Method, String)>>,
    state: Mutex<State>,
    local_addr: OnceLock<SocketAddr>,
    graceful_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl HttpServer {
    /// Create a server in the Constructed state with an empty router.
    pub fn new(config: Config, metrics: ServerMetrics) -> Self {
        let (graceful_tx, _) = watch::channel(false);
        let (force_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Self {
            config,
            metrics,
            router: Mutex::new(Some(Router::new())),
            routes: Mutex::new(Vec::new()),
            state: Mutex::new(State::Constructed),
            local_addr: OnceLock::new(),
            graceful_tx,
            force_tx,
            done_tx,
        }
    }

    /// Register a handler for `method` on `path`. Valid until `serve` runs.
    pub fn route<H, T>(&self, method: Method, path: &str, handler: H) -> Result<()>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|e| ServerError::Route(e.to_string()))?;

        let mut router = self.router.lock().unwrap();
        let taken = router.take().ok_or(ServerError::AlreadyStarted)?;
        *router = Some(taken.route(path, on(filter, handler)));

        self.routes.lock().unwrap().push((method, path.to_owned()));
        Ok(())
    }

    /// Address the listener is bound to, once serving.
    #[allow(dead_code)] // exercised by lifecycle tests
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn set_state(&self, next: State) {
        *self.state.lock().unwrap() = next;
    }

    /// Mark serving finished and wake anyone draining. Keeps a state already
    /// set by `stop`/`graceful_stop`.
    fn finish(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Serving {
                *state = State::Stopped;
            }
        }
        self.done_tx.send_replace(true);
    }
}

#[async_trait]
impl Server for HttpServer {
    async fn serve(&self) -> Result<()> {
        let router = self
            .router
            .lock()
            .unwrap()
            .take()
            .ok_or(ServerError::AlreadyStarted)?;
        self.set_state(State::Serving);

        for (method, path) in self.routes.lock().unwrap().iter() {
            info!(method = %method, path = %path, "add route");
        }

        // Routing runs before these layers, so matched requests carry the
        // route template for labels and span names; unmatched ones fall back
        // to the raw path and are metered and traced all the same.
        let mut app = router
            .layer(TracingLayer)
            .layer(MetricsLayer::new(self.metrics.clone()));
        if self.config.enable_content_encoding {
            app = app.layer(CompressionLayer::new());
        }
        // The access log stays outermost so it also absorbs panics raised by
        // the inner middleware.
        let app = app.layer(AccessLogLayer::new(self.config.slow_query_threshold_ms));

        let listener = match TcpListener::bind(self.config.address()).await {
            Ok(listener) => listener,
            Err(source) => {
                self.finish();
                return Err(ServerError::Bind {
                    addr: self.config.address(),
                    source,
                });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.finish();
                return Err(ServerError::Io(e));
            }
        };
        let _ = self.local_addr.set(addr);
        info!(address = %addr, "server listening");

        let mut graceful_rx = self.graceful_tx.subscribe();
        let shutdown = async move {
            let _ = graceful_rx.wait_for(|stop| *stop).await;
        };
        let mut force_rx = self.force_tx.subscribe();

        let serving = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .into_future();

        let result = tokio::select! {
            served = serving => served.map_err(ServerError::Io),
            _ = async { let _ = force_rx.wait_for(|stop| *stop).await; } => Ok(()),
        };

        self.finish();
        result
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Serving {
                return Err(ServerError::NotServing);
            }
            *state = State::Stopped;
        }

        self.force_tx.send_replace(true);
        let mut done_rx = self.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
        Ok(())
    }

    async fn graceful_stop(&self, deadline: Instant) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != State::Serving {
                return Err(ServerError::NotServing);
            }
        }

        self.graceful_tx.send_replace(true);
        let mut done_rx = self.done_tx.subscribe();
        // Collapse to a bool so no watch::Ref is held across the await below.
        let drained = timeout_at(deadline, done_rx.wait_for(|done| *done))
            .await
            .is_ok();
        if drained {
            self.set_state(State::GracefullyStopped);
            Ok(())
        } else {
            self.set_state(State::Stopped);
            self.force_tx.send_replace(true);
            let _ = done_rx.wait_for(|done| *done).await;
            Err(ServerError::GracefulStopTimeout)
        }
    }

    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.config.name.clone(),
            scheme: "http".to_owned(),
            host: self.config.host.clone(),
            port: self.config.port,
            weight: 0.0,
            enable: false,
            healthy: false,
            metadata: HashMap::new(),
        }
    }
}

/// Managed-serve call: drive a server through its lifecycle. Serves until
/// the process receives a shutdown signal, then drains for up to `drain`
/// before forcing the listener closed. A serve error (for example a failed
/// bind) is returned to the caller, which should treat it as fatal.
pub async fn run<S>(server: Arc<S>, drain: Duration) -> Result<()>
where
    S: Server + 'static,
{
    let serve_server = Arc::clone(&server);
    let mut serve_task = tokio::spawn(async move { serve_server.serve().await });

    tokio::select! {
        joined = &mut serve_task => {
            return joined.map_err(|e| ServerError::Runtime(e.to_string()))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(ServerError::Io)?;
            info!("shutdown signal received");
        }
    }

    if let Err(e) = server.graceful_stop(Instant::now() + drain).await {
        warn!(error = %e, "graceful stop failed");
    }
    serve_task
        .await
        .map_err(|e| ServerError::Runtime(e.to_string()))?
}
