//! Request deadlines and the buffering timeout guard.
//!
//! A request runs in its own local task and writes its status, headers and
//! body into a [`CaptureBuffer`] instead of the connection. [`TimeoutGuard`]
//! races that task against the deadline and is the only place that decides
//! what reaches the client:
//!
//! - handler finishes first: the captured response is flushed verbatim
//! - deadline first: the buffer is closed, later handler writes are dropped,
//!   and a fixed 504 body is sent instead
//! - handler panics: the panic is resumed on the caller so the outer
//!   recovery middleware turns it into a 500
//!
//! Actix routing needs sole ownership of the request, so the middleware never
//! keeps a copy of it. A finished handler hands its `HttpRequest` back with
//! the response. When the deadline wins the handler still owns the request,
//! and the 504 travels outward as a [`DeadlineExceeded`] error instead.
//!
//! The deadline is also stored in request extensions as a [`RequestDeadline`]
//! so downstream calls (verifier, upstream model, cache) can bound themselves
//! with [`bounded`] and give up when the request does.

use std::cell::RefCell;
use std::future::{ready, Future, Ready};
use std::pin::pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use actix_web::http::StatusCode;
use actix_web::{HttpMessage, HttpRequest, HttpResponse, ResponseError};
use bytes::{Bytes, BytesMut};
use futures::future::{poll_fn, LocalBoxFuture};
use tokio::time::{error::Elapsed, Instant};

use crate::error::GatewayError;
use crate::metrics::GUARD_TIMEOUTS;

/// Exact body written when a request runs out of time.
pub const TIMEOUT_BODY: &str =
    r#"{"error":"Gateway Timeout","message":"Request exceeded maximum allowed time"}"#;

pub const TIMEOUT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Absolute deadline for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline(Instant);

impl RequestDeadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    /// `now + timeout`, unless an existing deadline is already earlier.
    /// Nested guards can only shorten a request's budget.
    pub fn derive(existing: Option<RequestDeadline>, timeout: Duration) -> Self {
        let proposed = Self::after(timeout);
        match existing {
            Some(current) if current.0 <= proposed.0 => current,
            _ => proposed,
        }
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Deadline stored on the request by [`RequestTimeout`], if any.
    pub fn of(req: &HttpRequest) -> Option<Self> {
        req.extensions().get::<Self>().copied()
    }
}

/// Run `fut` until `limit` elapses or the request deadline passes, whichever
/// comes first.
pub async fn bounded<F: Future>(
    deadline: Option<RequestDeadline>,
    limit: Duration,
    fut: F,
) -> Result<F::Output, Elapsed> {
    let own = Instant::now() + limit;
    let at = match deadline {
        Some(d) if d.instant() < own => d.instant(),
        _ => own,
    };
    tokio::time::timeout_at(at, fut).await
}

#[derive(Default)]
struct Captured {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    closed: bool,
}

/// Response sink shared between a running handler and its guard.
///
/// Writes after [`close`](Self::close) are accepted and discarded; they
/// return `false` so a writer can stop early.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Captured>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the status. Only the first call has an effect.
    pub fn set_status(&self, status: StatusCode) -> bool {
        let mut captured = self.lock();
        if captured.closed || captured.status.is_some() {
            return false;
        }
        captured.status = Some(status);
        true
    }

    pub fn append_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut captured = self.lock();
        if captured.closed {
            return false;
        }
        captured.headers.append(name, value);
        true
    }

    pub fn write(&self, chunk: &[u8]) -> bool {
        let mut captured = self.lock();
        if captured.closed {
            return false;
        }
        if captured.status.is_none() {
            captured.status = Some(StatusCode::OK);
        }
        captured.body.extend_from_slice(chunk);
        true
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes written so far.
    pub fn body_len(&self) -> usize {
        self.lock().body.len()
    }

    /// Close the buffer and turn its contents into the real response.
    pub fn flush(&self) -> HttpResponse {
        let mut captured = self.lock();
        captured.closed = true;
        let status = captured.status.unwrap_or(StatusCode::OK);
        let body: Bytes = std::mem::take(&mut captured.body).freeze();
        let mut response = HttpResponse::with_body(status, BoxBody::new(body));
        let headers = response.headers_mut();
        for (name, value) in captured.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        response
    }
}

/// Fixed 504 sent when the deadline wins.
pub fn timeout_response() -> HttpResponse {
    HttpResponse::GatewayTimeout()
        .insert_header((CONTENT_TYPE, TIMEOUT_CONTENT_TYPE))
        .body(TIMEOUT_BODY)
}

/// The deadline passed while the handler still held the request.
#[derive(Debug, thiserror::Error)]
#[error("request exceeded its deadline")]
pub struct DeadlineExceeded;

impl ResponseError for DeadlineExceeded {
    fn status_code(&self) -> StatusCode {
        StatusCode::GATEWAY_TIMEOUT
    }

    fn error_response(&self) -> HttpResponse {
        timeout_response()
    }
}

/// Races one request's handler against its deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    deadline: RequestDeadline,
}

impl TimeoutGuard {
    pub fn new(deadline: RequestDeadline) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> RequestDeadline {
        self.deadline
    }

    /// Run `handler` on a local task writing into `capture`, and produce the
    /// one response the client will see.
    ///
    /// Must be called from within a local task set (any actix runtime).
    /// A handler that loses the race keeps running detached; its output is
    /// discarded by the closed buffer.
    pub async fn run<F>(&self, capture: CaptureBuffer, handler: F) -> HttpResponse
    where
        F: Future<Output = ()> + 'static,
    {
        let mut task = actix_web::rt::spawn(handler);
        tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(()) => capture.flush(),
                Err(e) if e.is_panic() => {
                    capture.close();
                    std::panic::resume_unwind(e.into_panic())
                }
                Err(e) => {
                    capture.close();
                    tracing::error!(error = %e, "request task was cancelled");
                    HttpResponse::InternalServerError().json(serde_json::json!({
                        "error": "Internal Server Error",
                        "message": "An internal error occurred"
                    }))
                }
            },
            _ = tokio::time::sleep_until(self.deadline.instant()) => {
                capture.close();
                GUARD_TIMEOUTS.inc();
                tracing::warn!(
                    captured_bytes = capture.body_len(),
                    "request exceeded its deadline, discarding handler output"
                );
                timeout_response()
            }
        }
    }
}

/// Middleware applying a [`TimeoutGuard`] to every request it wraps.
///
/// Registered once on the app with the global timeout and again on slower
/// scopes; the inner registration can only shorten the deadline.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout {
    timeout: Duration,
}

impl RequestTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestTimeout
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = actix_web::Error;
    type Transform = RequestTimeoutMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestTimeoutMiddleware {
            service: Rc::new(service),
            timeout: self.timeout,
        }))
    }
}

pub struct RequestTimeoutMiddleware<S> {
    service: Rc<S>,
    timeout: Duration,
}

impl<S, B> Service<ServiceRequest> for RequestTimeoutMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let existing = req.extensions().get::<RequestDeadline>().copied();
        let deadline = RequestDeadline::derive(existing, self.timeout);
        req.extensions_mut().insert(deadline);

        let service = Rc::clone(&self.service);
        let capture = CaptureBuffer::new();
        let sink = capture.clone();
        let handed_back: Rc<RefCell<Option<Result<HttpRequest, actix_web::Error>>>> =
            Rc::default();
        let slot = Rc::clone(&handed_back);

        let handler = async move {
            match service.call(req).await {
                Ok(res) => {
                    let (http_req, response) = res.into_parts();
                    *slot.borrow_mut() = Some(Ok(http_req));
                    drain_into(response.map_into_boxed_body(), &sink).await;
                }
                Err(e) => *slot.borrow_mut() = Some(Err(e)),
            }
        };

        Box::pin(async move {
            let response = TimeoutGuard::new(deadline).run(capture, handler).await;
            let outcome = handed_back.borrow_mut().take();
            match outcome {
                Some(Ok(http_req)) => Ok(ServiceResponse::new(http_req, response)),
                Some(Err(e)) => Err(e),
                None if response.status() == StatusCode::GATEWAY_TIMEOUT => {
                    Err(DeadlineExceeded.into())
                }
                None => Err(GatewayError::Internal("request task was cancelled".into()).into()),
            }
        })
    }
}

/// Copy a response into the capture buffer chunk by chunk, stopping as soon
/// as the buffer is closed.
async fn drain_into(response: HttpResponse, sink: &CaptureBuffer) {
    sink.set_status(response.status());
    for (name, value) in response.headers().iter() {
        sink.append_header(name.clone(), value.clone());
    }
    let mut body = pin!(response.into_body());
    loop {
        match poll_fn(|cx| body.as_mut().poll_next(cx)).await {
            Some(Ok(chunk)) => {
                if !sink.write(&chunk) {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "response body stream failed");
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, web, App};

    /// Status and body, whether the app answered directly or through an error.
    async fn settle(
        outcome: Result<ServiceResponse<impl MessageBody>, actix_web::Error>,
    ) -> (StatusCode, Bytes) {
        match outcome {
            Ok(res) => (res.status(), actix_test::read_body(res).await),
            Err(e) => {
                let res = e.error_response();
                let status = res.status();
                (status, actix_web::body::to_bytes(res.into_body()).await.unwrap())
            }
        }
    }

    #[test]
    fn test_derive_keeps_earlier_deadline() {
        let early = RequestDeadline::after(Duration::from_secs(1));
        let derived = RequestDeadline::derive(Some(early), Duration::from_secs(30));
        assert_eq!(derived, early);

        let late = RequestDeadline::after(Duration::from_secs(60));
        let derived = RequestDeadline::derive(Some(late), Duration::from_secs(5));
        assert!(derived.instant() < late.instant());

        let fresh = RequestDeadline::derive(None, Duration::from_secs(5));
        assert!(fresh.remaining() <= Duration::from_secs(5));
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_capture_drops_writes_after_close() {
        let capture = CaptureBuffer::new();
        assert!(capture.set_status(StatusCode::CREATED));
        assert!(!capture.set_status(StatusCode::OK));
        assert!(capture.write(b"hello"));
        capture.close();
        assert!(!capture.write(b" world"));
        assert!(!capture.append_header(
            HeaderName::from_static("x-late"),
            HeaderValue::from_static("1")
        ));
        assert_eq!(capture.body_len(), 5);
    }

    #[actix_rt::test]
    async fn test_capture_flush_keeps_status_headers_body() {
        let capture = CaptureBuffer::new();
        capture.set_status(StatusCode::ACCEPTED);
        capture.append_header(
            HeaderName::from_static("x-test"),
            HeaderValue::from_static("a"),
        );
        capture.append_header(
            HeaderName::from_static("x-test"),
            HeaderValue::from_static("b"),
        );
        capture.write(b"part1,");
        capture.write(b"part2");

        let response = capture.flush();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get_all("x-test").count(), 2);
        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"part1,part2"));
        assert!(capture.is_closed());
    }

    #[actix_rt::test]
    async fn test_guard_flushes_completed_handler() {
        let capture = CaptureBuffer::new();
        let sink = capture.clone();
        let guard = TimeoutGuard::new(RequestDeadline::after(Duration::from_secs(5)));
        let response = guard
            .run(capture, async move {
                sink.set_status(StatusCode::IM_A_TEAPOT);
                sink.write(b"short and stout");
            })
            .await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"short and stout"));
    }

    #[actix_rt::test]
    async fn test_guard_times_out_and_discards_late_writes() {
        let capture = CaptureBuffer::new();
        let sink = capture.clone();
        let late_write_rejected = Rc::new(std::cell::Cell::new(false));
        let flag = Rc::clone(&late_write_rejected);

        let guard = TimeoutGuard::new(RequestDeadline::after(Duration::from_millis(50)));
        let response = guard
            .run(capture.clone(), async move {
                sink.set_status(StatusCode::OK);
                sink.write(b"partial ");
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.set(!sink.write(b"too late"));
            })
            .await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            TIMEOUT_CONTENT_TYPE
        );
        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(TIMEOUT_BODY.as_bytes()));

        // Let the detached handler finish its late write.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(late_write_rejected.get());
        assert!(capture.is_closed());
        assert_eq!(capture.body_len(), "partial ".len());
    }

    #[actix_rt::test]
    async fn test_guard_resumes_handler_panic() {
        use futures::FutureExt;

        let guard = TimeoutGuard::new(RequestDeadline::after(Duration::from_secs(5)));
        let outcome = std::panic::AssertUnwindSafe(guard.run(CaptureBuffer::new(), async {
            panic!("handler blew up");
        }))
        .catch_unwind()
        .await;
        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"handler blew up"));
    }

    #[actix_rt::test]
    async fn test_bounded_respects_earlier_request_deadline() {
        let deadline = RequestDeadline::after(Duration::from_millis(20));
        let result = bounded(
            Some(deadline),
            Duration::from_secs(10),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;
        assert!(result.is_err());

        let ok = bounded(None, Duration::from_secs(1), async { 7 }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    async fn slow() -> HttpResponse {
        tokio::time::sleep(Duration::from_millis(300)).await;
        HttpResponse::Ok().body("slow result")
    }

    async fn fast(req: HttpRequest) -> HttpResponse {
        let remaining = RequestDeadline::of(&req)
            .map(|d| d.remaining().as_millis())
            .unwrap_or(0);
        HttpResponse::Ok()
            .insert_header(("x-remaining-ms", remaining.to_string()))
            .body("fast result")
    }

    #[actix_rt::test]
    async fn test_middleware_passes_fast_handler_through() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestTimeout::new(Duration::from_secs(5)))
                .route("/fast", web::get().to(fast)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/fast").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-remaining-ms"));
        let body = actix_test::read_body(resp).await;
        assert_eq!(body, Bytes::from_static(b"fast result"));
    }

    #[actix_rt::test]
    async fn test_middleware_keeps_path_params_routable() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestTimeout::new(Duration::from_secs(5)))
                .service(
                    web::scope("/items")
                        .wrap(RequestTimeout::new(Duration::from_secs(5)))
                        .route(
                            "/{id}",
                            web::get().to(|id: web::Path<String>| async move {
                                HttpResponse::Ok().body(id.into_inner())
                            }),
                        ),
                ),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/items/abc").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(actix_test::read_body(resp).await, Bytes::from_static(b"abc"));
    }

    #[actix_rt::test]
    async fn test_middleware_times_out_slow_handler() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestTimeout::new(Duration::from_millis(50)))
                .route("/slow", web::get().to(slow)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/slow").to_request();
        let outcome = actix_test::try_call_service(&app, req).await;
        let err = outcome.err().expect("slow handler should lose the race");
        assert!(err.as_error::<DeadlineExceeded>().is_some());

        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            TIMEOUT_CONTENT_TYPE
        );
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, Bytes::from_static(TIMEOUT_BODY.as_bytes()));
    }

    #[actix_rt::test]
    async fn test_nested_timeout_only_shortens() {
        let app = actix_test::init_service(
            App::new().wrap(RequestTimeout::new(Duration::from_millis(50))).service(
                web::scope("/api")
                    .wrap(RequestTimeout::new(Duration::from_secs(30)))
                    .route("/slow", web::get().to(slow))
                    .route("/fast", web::get().to(fast)),
            ),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/api/slow").to_request();
        let (status, body) = settle(actix_test::try_call_service(&app, req).await).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body, Bytes::from_static(TIMEOUT_BODY.as_bytes()));

        let req = actix_test::TestRequest::get().uri("/api/fast").to_request();
        let resp = actix_test::call_service(&app, req).await;
        let remaining: u128 = resp
            .headers()
            .get("x-remaining-ms")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(remaining <= 50, "inner guard extended the deadline to {remaining}ms");
    }
}
