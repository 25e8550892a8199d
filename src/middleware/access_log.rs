//! Recovery and access-log middleware.
//!
//! Times each request and emits one structured `access` event per request
//! with cost, method, status code, and host fields. Panics from the inner
//! service are fully absorbed: the payload becomes an `err` field, a capped
//! stack trace becomes `stack`, the event is logged at error level, and the
//! client gets a 500. A panic in one request never affects another.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{header, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{error, info};

/// Stack traces attached to panic logs are capped at this many bytes.
const STACK_CAPTURE_BYTES: usize = 4096;

thread_local! {
    /// Backtrace captured by the panic hook, taken by the recovery path.
    static PANIC_STACK: RefCell<Option<String>> = RefCell::new(None);
}

static INSTALL_HOOK: Once = Once::new();

/// Install a panic hook that records the backtrace at the panic site, so
/// recovered panics log where they happened rather than where they were
/// caught. Chains to the previously installed hook.
fn install_panic_stack_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_STACK.with(|slot| {
                *slot.borrow_mut() = Some(capture_stack());
            });
            previous(info);
        }));
    });
}

/// Consume the stack recorded by the hook for the current thread. Unwinding
/// resumes on the panicking thread, so the slot is read before any other
/// panic can overwrite it.
fn take_panic_stack() -> Option<String> {
    PANIC_STACK.with(|slot| slot.borrow_mut().take())
}

/// Layer applying [`AccessLogService`] with the configured slow-request
/// threshold in milliseconds (<= 0 disables the check).
#[derive(Debug, Clone)]
pub struct AccessLogLayer {
    slow_query_threshold_ms: i64,
}

impl AccessLogLayer {
    pub fn new(slow_query_threshold_ms: i64) -> Self {
        install_panic_stack_hook();
        Self {
            slow_query_threshold_ms,
        }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            slow_query_threshold_ms: self.slow_query_threshold_ms,
        }
    }
}

/// Middleware service that logs one access record per request and recovers
/// panics from the chain beneath it.
#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    slow_query_threshold_ms: i64,
}

impl<S> Service<Request<Body>> for AccessLogService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Take the service that was polled ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let threshold = self.slow_query_threshold_ms;

        Box::pin(async move {
            let beg = Instant::now();
            let method = req.method().to_string();
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();

            match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(Ok(response)) => {
                    AccessRecord::completed(beg.elapsed(), &method, response.status(), &host, threshold)
                        .emit();
                    Ok(response)
                }
                Ok(Err(never)) => match never {},
                Err(payload) => {
                    let err = panic_message(payload.as_ref());
                    let stack = take_panic_stack().unwrap_or_else(capture_stack);
                    AccessRecord::panicked(
                        beg.elapsed(),
                        &method,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &host,
                        threshold,
                        err,
                        stack,
                    )
                    .emit();

                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        })
    }
}

/// One request's access-log fields, built on completion.
struct AccessRecord {
    cost: f64,
    method: String,
    code: u16,
    host: String,
    slow: Option<u64>,
    err: Option<String>,
    stack: Option<String>,
}

impl AccessRecord {
    fn completed(
        elapsed: Duration,
        method: &str,
        code: StatusCode,
        host: &str,
        slow_query_threshold_ms: i64,
    ) -> Self {
        Self {
            cost: elapsed.as_secs_f64(),
            method: method.to_owned(),
            code: code.as_u16(),
            host: host.to_owned(),
            slow: slow_field(elapsed, slow_query_threshold_ms),
            err: None,
            stack: None,
        }
    }

    fn panicked(
        elapsed: Duration,
        method: &str,
        code: StatusCode,
        host: &str,
        slow_query_threshold_ms: i64,
        err: String,
        stack: String,
    ) -> Self {
        Self {
            cost: elapsed.as_secs_f64(),
            method: method.to_owned(),
            code: code.as_u16(),
            host: host.to_owned(),
            slow: slow_field(elapsed, slow_query_threshold_ms),
            err: Some(err),
            stack: Some(stack),
        }
    }

    fn emit(&self) {
        let stack = self.stack.as_deref().unwrap_or_default();
        match (&self.err, self.slow) {
            (Some(err), Some(slow)) => error!(
                cost = self.cost,
                method = %self.method,
                code = self.code,
                host = %self.host,
                slow,
                err = %err,
                stack = %stack,
                "access"
            ),
            (Some(err), None) => error!(
                cost = self.cost,
                method = %self.method,
                code = self.code,
                host = %self.host,
                err = %err,
                stack = %stack,
                "access"
            ),
            (None, Some(slow)) => info!(
                cost = self.cost,
                method = %self.method,
                code = self.code,
                host = %self.host,
                slow,
                "access"
            ),
            (None, None) => info!(
                cost = self.cost,
                method = %self.method,
                code = self.code,
                host = %self.host,
                "access"
            ),
        }
    }
}

fn slow_field(elapsed: Duration, slow_query_threshold_ms: i64) -> Option<u64> {
    let cost_ms = elapsed.as_millis() as i64;
    (slow_query_threshold_ms > 0 && cost_ms > slow_query_threshold_ms).then_some(cost_ms as u64)
}

/// String form of a panic payload, mirroring error conversion: `&str` and
/// `String` payloads pass through, anything else gets a placeholder.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn capture_stack() -> String {
    let mut stack = Backtrace::force_capture().to_string();
    if stack.len() > STACK_CAPTURE_BYTES {
        let mut end = STACK_CAPTURE_BYTES;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn boom() -> &'static str {
        panic!("boom")
    }

    #[tokio::test]
    async fn absorbs_panics_from_handlers() {
        let app = Router::new()
            .route("/boom", get(boom))
            .layer(AccessLogLayer::new(0));

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn passes_successful_responses_through() {
        let app = Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(AccessLogLayer::new(10));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[test]
    fn panic_record_carries_error_and_stack() {
        let record = AccessRecord::panicked(
            Duration::from_millis(3),
            "GET",
            StatusCode::INTERNAL_SERVER_ERROR,
            "localhost",
            0,
            "boom".to_owned(),
            capture_stack(),
        );

        assert_eq!(record.err.as_deref(), Some("boom"));
        let stack = record.stack.as_deref().unwrap_or_default();
        assert!(!stack.is_empty());
        assert!(stack.len() <= STACK_CAPTURE_BYTES);
    }

    #[test]
    fn hook_records_stack_at_panic_site() {
        install_panic_stack_hook();

        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());

        let stack = take_panic_stack().unwrap();
        assert!(!stack.is_empty());

        // The slot is consumed on take.
        assert!(take_panic_stack().is_none());
    }

    #[test]
    fn slow_field_requires_threshold_exceeded() {
        assert_eq!(slow_field(Duration::from_millis(5), 10), None);
        assert_eq!(slow_field(Duration::from_millis(5), 1), Some(5));

        // Zero and negative thresholds disable the check entirely.
        assert_eq!(slow_field(Duration::from_millis(5), 0), None);
        assert_eq!(slow_field(Duration::from_millis(5), -1), None);
    }

    #[test]
    fn panic_payload_message_forms() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
