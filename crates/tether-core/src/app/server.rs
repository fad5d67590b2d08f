//! Runtime Server - Lambda Runtime API emulation
//!
//! ## Endpoints
//! - `GET  /:worker_id/:api_version/runtime/invocation/next` - long-poll for the next invocation
//! - `POST /:worker_id/:api_version/runtime/invocation/:request_id/response` - success
//! - `POST /:worker_id/:api_version/runtime/invocation/:request_id/error` - failure
//! - `POST /:worker_id/:api_version/runtime/init/error` - handler failed to load
//!
//! workerID ごとに 1 本の lane を持ちます。
//! `idle → queued → claimed (GET next) → resolved (response / error) → idle`
//! claimed は lane あたり高々 1 つ。未 claim の invocation は到着順に並びます。

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Subscription};
use crate::domain::{
    Event, EventKind, Invocation, InvocationError, RequestId, TetherError, WorkerId,
};

pub const DEFAULT_API_VERSION: &str = "2018-06-01";

/// Error types reported when a lane is drained.
pub const EXIT_ERROR: &str = "Runtime.ExitError";
pub const START_ERROR: &str = "Runtime.StartError";

/// Request body limit for the runtime API routes.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub api_version: String,
    /// Used for `Lambda-Runtime-Deadline-Ms` when the invocation carries no deadline.
    pub invocation_timeout: Duration,
    /// `None`: `GET .../next` waits until an invocation arrives or the server shuts down.
    pub poll_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            invocation_timeout: Duration::from_secs(900),
            poll_timeout: None,
        }
    }
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Invocation>,
    claimed: Option<Invocation>,
    /// Set when the lane is dropped after a failed start; pollers get 410.
    closed: bool,
    /// The current worker has claimed at least one invocation.
    progressed: bool,
}

impl LaneState {
    fn contains(&self, request_id: &RequestId) -> bool {
        self.claimed
            .as_ref()
            .is_some_and(|inv| &inv.request_id == request_id)
            || self.queue.iter().any(|inv| &inv.request_id == request_id)
    }
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

/// Observable state of one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSnapshot {
    pub queued: Vec<RequestId>,
    pub claimed: Option<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gone {
    Stopped,
    Exited,
}

struct ServerState {
    bus: Arc<Bus>,
    options: ServerOptions,
    lanes: Mutex<HashMap<WorkerId, Arc<Lane>>>,
    shutdown: CancellationToken,
}

impl ServerState {
    fn lane(&self, worker_id: &WorkerId) -> Arc<Lane> {
        Arc::clone(self.lanes.lock().entry(worker_id.clone()).or_default())
    }

    fn existing_lane(&self, worker_id: &WorkerId) -> Option<Arc<Lane>> {
        self.lanes.lock().get(worker_id).cloned()
    }

    fn enqueue(&self, invocation: &Invocation) {
        let lane = self.lane(&invocation.worker_id);
        {
            let mut state = lane.state.lock();
            // 再アナウンスされた invocation は二重に積まない
            if state.contains(&invocation.request_id) {
                return;
            }
            state.queue.push_back(invocation.clone());
        }
        tracing::debug!(
            worker_id = %invocation.worker_id,
            request_id = %invocation.request_id,
            "invocation queued"
        );
        lane.notify.notify_waiters();
    }

    /// The worker process is gone and its claimed invocation fails.
    ///
    /// - stopped (rebuild): the queue head is announced again for a fresh worker
    /// - exited after claiming work: same, the next worker makes progress too
    /// - exited without claiming anything: the queue fails with `Runtime.ExitError`
    fn worker_gone(&self, worker_id: &WorkerId, gone: Gone) {
        let Some(lane) = self.existing_lane(worker_id) else {
            return;
        };
        let (claimed, head, failed) = {
            let mut state = lane.state.lock();
            let claimed = state.claimed.take();
            let retry = gone == Gone::Stopped || state.progressed;
            state.progressed = false;
            if retry {
                (claimed, state.queue.front().cloned(), Vec::new())
            } else {
                (claimed, None, state.queue.drain(..).collect::<Vec<_>>())
            }
        };
        lane.notify.notify_waiters();

        let reason = match gone {
            Gone::Stopped => "worker stopped before responding",
            Gone::Exited => "worker exited before responding",
        };
        if let Some(invocation) = claimed {
            self.publish_error(&invocation, InvocationError::new(EXIT_ERROR, reason));
        }
        // 何も取らずに落ちる worker を起動し直し続けないように、待ちごと失敗させる
        for invocation in failed {
            self.publish_error(
                &invocation,
                InvocationError::new(EXIT_ERROR, "worker exited before claiming an invocation"),
            );
        }
        if let Some(invocation) = head {
            tracing::debug!(worker_id = %worker_id, request_id = %invocation.request_id, "re-announcing queued invocation");
            self.bus.publish(Event::FunctionInvoked(invocation));
        }
    }

    /// Drop `request_id` from the lane, queued or claimed. Returns whether it was there.
    fn cancel(&self, worker_id: &WorkerId, request_id: &RequestId) -> bool {
        let Some(lane) = self.existing_lane(worker_id) else {
            return false;
        };
        let removed = {
            let mut state = lane.state.lock();
            let before = state.queue.len();
            state.queue.retain(|inv| &inv.request_id != request_id);
            let mut removed = state.queue.len() != before;
            if state
                .claimed
                .as_ref()
                .is_some_and(|inv| &inv.request_id == request_id)
            {
                state.claimed = None;
                removed = true;
            }
            removed
        };
        if removed {
            tracing::debug!(worker_id = %worker_id, request_id = %request_id, "invocation cancelled");
            lane.notify.notify_waiters();
        }
        removed
    }

    /// The worker never came up. Everything on its lane fails.
    fn worker_failed(&self, worker_id: &WorkerId, error: &str) {
        let Some(lane) = self.lanes.lock().remove(worker_id) else {
            return;
        };
        let pending: Vec<Invocation> = {
            let mut state = lane.state.lock();
            state.closed = true;
            state.claimed.take().into_iter().chain(state.queue.drain(..)).collect()
        };
        lane.notify.notify_waiters();
        for invocation in pending {
            self.publish_error(&invocation, InvocationError::new(START_ERROR, error));
        }
    }

    fn publish_error(&self, invocation: &Invocation, error: InvocationError) {
        tracing::warn!(
            worker_id = %invocation.worker_id,
            request_id = %invocation.request_id,
            error_type = %error.error_type,
            "invocation failed"
        );
        self.bus.publish(Event::FunctionError {
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
            request_id: invocation.request_id.clone(),
            error,
        });
    }

    /// Take the claimed invocation if it is `request_id`.
    fn resolve(&self, worker_id: &WorkerId, request_id: &RequestId) -> Result<Invocation, Response> {
        let lane = self
            .existing_lane(worker_id)
            .ok_or_else(|| invalid_request(format!("unknown worker {worker_id}")))?;
        let invocation = {
            let mut state = lane.state.lock();
            let in_flight = state
                .claimed
                .as_ref()
                .is_some_and(|claimed| &claimed.request_id == request_id);
            if in_flight { state.claimed.take() } else { None }
        };
        let invocation = invocation.ok_or_else(|| {
            invalid_request(format!(
                "request {request_id} is not in flight on worker {worker_id}"
            ))
        })?;
        lane.notify.notify_waiters();
        Ok(invocation)
    }
}

pub struct RuntimeServer {
    state: Arc<ServerState>,
    subscriptions: Vec<Subscription>,
}

impl RuntimeServer {
    /// Create the server and attach it to the bus.
    ///
    /// Invocations are queued synchronously on publish, so a `function.invoked`
    /// published after this returns is never lost.
    pub fn new(bus: Arc<Bus>, options: ServerOptions, shutdown: CancellationToken) -> Self {
        let state = Arc::new(ServerState {
            bus: Arc::clone(&bus),
            options,
            lanes: Mutex::new(HashMap::new()),
            shutdown,
        });

        let mut subscriptions = Vec::new();
        {
            let state = Arc::downgrade(&state);
            subscriptions.push(bus.subscribe(EventKind::FunctionInvoked, move |event| {
                if let (Some(state), Event::FunctionInvoked(invocation)) = (state.upgrade(), event) {
                    state.enqueue(invocation);
                }
            }));
        }
        for kind in [EventKind::WorkerStopped, EventKind::WorkerExited] {
            let state = Arc::downgrade(&state);
            subscriptions.push(bus.subscribe(kind, move |event| {
                let Some(state) = state.upgrade() else {
                    return;
                };
                match event {
                    Event::WorkerStopped { worker_id, .. } => state.worker_gone(worker_id, Gone::Stopped),
                    Event::WorkerExited { worker_id, .. } => state.worker_gone(worker_id, Gone::Exited),
                    _ => {}
                }
            }));
        }
        {
            let state = Arc::downgrade(&state);
            subscriptions.push(bus.subscribe(EventKind::WorkerFailed, move |event| {
                if let (Some(state), Event::WorkerFailed { worker_id, error, .. }) = (state.upgrade(), event) {
                    state.worker_failed(worker_id, error);
                }
            }));
        }

        Self {
            state,
            subscriptions,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/:worker_id/:api_version/runtime/invocation/next",
                get(next_invocation),
            )
            .route(
                "/:worker_id/:api_version/runtime/invocation/:request_id/response",
                post(invocation_response),
            )
            .route(
                "/:worker_id/:api_version/runtime/invocation/:request_id/error",
                post(invocation_error),
            )
            .route(
                "/:worker_id/:api_version/runtime/init/error",
                post(init_error),
            )
            // Lambda のレスポンス上限 (6MB) より余裕を持たせる
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on `listener` until the shutdown token is cancelled.
    pub fn serve(&self, listener: TcpListener) -> JoinHandle<Result<(), TetherError>> {
        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| TetherError::Server(e.to_string()))
        })
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TetherError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::Server(format!("failed to bind {addr}: {e}")))
    }

    pub fn lane(&self, worker_id: &WorkerId) -> Option<LaneSnapshot> {
        let lane = self.state.existing_lane(worker_id)?;
        let state = lane.state.lock();
        Some(LaneSnapshot {
            queued: state.queue.iter().map(|inv| inv.request_id.clone()).collect(),
            claimed: state.claimed.as_ref().map(|inv| inv.request_id.clone()),
        })
    }

    /// Remove an invocation nobody waits for any more. A worker that still
    /// holds it gets 400 when it reports back.
    pub fn cancel(&self, worker_id: &WorkerId, request_id: &RequestId) -> bool {
        self.state.cancel(worker_id, request_id)
    }

    /// Detach from the bus.
    pub fn detach(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.state.bus.unsubscribe(&subscription);
        }
    }
}

impl Drop for RuntimeServer {
    fn drop(&mut self) {
        self.detach();
    }
}

fn invalid_request(message: String) -> Response {
    tracing::debug!(%message, "rejected runtime api call");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "errorType": "InvalidRequestID", "errorMessage": message })),
    )
        .into_response()
}

fn check_version(state: &ServerState, api_version: &str) -> Result<(), Response> {
    if api_version == state.options.api_version {
        return Ok(());
    }
    Err((
        StatusCode::NOT_FOUND,
        Json(json!({
            "errorType": "UnknownApiVersion",
            "errorMessage": format!("unsupported api version {api_version}"),
        })),
    )
        .into_response())
}

async fn next_invocation(
    State(state): State<Arc<ServerState>>,
    Path((worker_id, api_version)): Path<(String, String)>,
) -> Response {
    if let Err(response) = check_version(&state, &api_version) {
        return response;
    }
    let worker_id = WorkerId::new(worker_id);
    let lane = state.lane(&worker_id);
    let deadline = state
        .options
        .poll_timeout
        .map(|timeout| tokio::time::Instant::now() + timeout);

    loop {
        // 取りこぼし防止: 状態を見る前に待機を登録しておく
        let notified = lane.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut lane_state = lane.state.lock();
            if lane_state.closed {
                return (
                    StatusCode::GONE,
                    Json(json!({ "errorType": "WorkerGone", "errorMessage": "worker lane closed" })),
                )
                    .into_response();
            }
            if lane_state.claimed.is_none()
                && let Some(invocation) = lane_state.queue.pop_front()
            {
                lane_state.claimed = Some(invocation.clone());
                lane_state.progressed = true;
                drop(lane_state);
                tracing::debug!(
                    worker_id = %worker_id,
                    request_id = %invocation.request_id,
                    "invocation claimed"
                );
                return invocation_response_for(&state.options, &invocation);
            }
        }

        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = &mut notified => {}
            _ = state.shutdown.cancelled() => {
                return (StatusCode::SERVICE_UNAVAILABLE, "runtime server shutting down").into_response();
            }
            _ = timeout => {
                return (StatusCode::GATEWAY_TIMEOUT, "no invocation available").into_response();
            }
        }
    }
}

/// Body = event payload, context in the `Lambda-Runtime-*` headers.
fn invocation_response_for(options: &ServerOptions, invocation: &Invocation) -> Response {
    let context = &invocation.context;
    let deadline = context.deadline_ms.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_millis() + options.invocation_timeout.as_millis() as i64
    });
    let arn = context.invoked_function_arn.clone().unwrap_or_else(|| {
        format!(
            "arn:aws:lambda:us-east-1:000000000000:function:{}",
            invocation.function_id
        )
    });
    let json_header = |value: &Option<serde_json::Value>| {
        value
            .as_ref()
            .map_or_else(|| "null".to_string(), |v| v.to_string())
    };

    let mut entries = vec![
        ("lambda-runtime-aws-request-id", invocation.request_id.to_string()),
        ("lambda-runtime-deadline-ms", deadline.to_string()),
        ("lambda-runtime-invoked-function-arn", arn),
        ("lambda-runtime-client-context", json_header(&context.client_context)),
        ("lambda-runtime-cognito-identity", json_header(&context.identity)),
    ];
    if let Some(group) = &context.log_group_name {
        entries.push(("lambda-runtime-log-group-name", group.clone()));
    }
    if let Some(stream) = &context.log_stream_name {
        entries.push(("lambda-runtime-log-stream-name", stream.clone()));
    }

    let mut headers = HeaderMap::new();
    for (name, value) in entries {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => {
                tracing::warn!(header = name, "dropping header with invalid characters");
            }
        }
    }
    (StatusCode::OK, headers, Json(invocation.payload.clone())).into_response()
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "status": "OK" }))).into_response()
}

async fn invocation_response(
    State(state): State<Arc<ServerState>>,
    Path((worker_id, api_version, request_id)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    if let Err(response) = check_version(&state, &api_version) {
        return response;
    }
    let worker_id = WorkerId::new(worker_id);
    let request_id = RequestId::new(request_id);
    let invocation = match state.resolve(&worker_id, &request_id) {
        Ok(invocation) => invocation,
        Err(response) => return response,
    };

    let body = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    tracing::debug!(worker_id = %worker_id, request_id = %request_id, "invocation succeeded");
    state.bus.publish(Event::FunctionSuccess {
        worker_id,
        function_id: invocation.function_id,
        request_id,
        body,
    });
    accepted()
}

async fn invocation_error(
    State(state): State<Arc<ServerState>>,
    Path((worker_id, api_version, request_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_version(&state, &api_version) {
        return response;
    }
    let worker_id = WorkerId::new(worker_id);
    let request_id = RequestId::new(request_id);
    let invocation = match state.resolve(&worker_id, &request_id) {
        Ok(invocation) => invocation,
        Err(response) => return response,
    };
    state.publish_error(&invocation, parse_error(&headers, &body));
    accepted()
}

async fn init_error(
    State(state): State<Arc<ServerState>>,
    Path((worker_id, api_version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_version(&state, &api_version) {
        return response;
    }
    let worker_id = WorkerId::new(worker_id);
    let error = parse_error(&headers, &body);
    tracing::warn!(worker_id = %worker_id, error_type = %error.error_type, message = %error.error_message, "worker init failed");

    // 初期化エラーは next より前に来るので、claim 済みがなければ先頭の invocation に帰属させる
    let invocation = state.existing_lane(&worker_id).and_then(|lane| {
        let invocation = {
            let mut lane_state = lane.state.lock();
            lane_state
                .claimed
                .take()
                .or_else(|| lane_state.queue.pop_front())
        };
        lane.notify.notify_waiters();
        invocation
    });
    if let Some(invocation) = invocation {
        state.publish_error(&invocation, error);
    }
    accepted()
}

/// Lenient decoding of an error body. The error type falls back to the
/// `Lambda-Runtime-Function-Error-Type` header.
fn parse_error(headers: &HeaderMap, body: &[u8]) -> InvocationError {
    let mut error: InvocationError = serde_json::from_slice(body).unwrap_or_else(|_| {
        InvocationError::new("", String::from_utf8_lossy(body).into_owned())
    });
    if error.error_type.is_empty() {
        error.error_type = headers
            .get("lambda-runtime-function-error-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("Runtime.Unknown")
            .to_string();
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventReceiver;
    use crate::domain::FunctionId;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    struct Fixture {
        bus: Arc<Bus>,
        server: RuntimeServer,
        shutdown: CancellationToken,
        events: EventReceiver,
    }

    fn fixture_with(options: ServerOptions) -> Fixture {
        let bus = Bus::new();
        let shutdown = CancellationToken::new();
        let server = RuntimeServer::new(bus.clone(), options, shutdown.clone());
        let events = bus.channel(&[
            EventKind::FunctionSuccess,
            EventKind::FunctionError,
            EventKind::FunctionInvoked,
        ]);
        Fixture {
            bus,
            server,
            shutdown,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ServerOptions::default())
    }

    fn invoke(bus: &Bus, worker: &str, request: &str, payload: serde_json::Value) {
        bus.publish(Event::FunctionInvoked(Invocation::new("f1", worker, request, payload)));
    }

    fn get_next(worker: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/{worker}/2018-06-01/runtime/invocation/next"))
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: String, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Drain `function.invoked` echoes and return the next success/error event.
    fn next_outcome(events: &mut EventReceiver) -> Option<Event> {
        while let Some(event) = events.try_recv() {
            if event.kind() != EventKind::FunctionInvoked {
                return Some(event);
            }
        }
        None
    }

    #[tokio::test]
    async fn next_blocks_until_an_invocation_arrives() {
        let fx = fixture();
        let router = fx.server.router();
        let pending = tokio::spawn(router.oneshot(get_next("w1")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        invoke(&fx.bus, "w1", "r1", json!({ "hello": "world" }));
        let response = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["lambda-runtime-aws-request-id"], "r1");
        assert!(response.headers().contains_key("lambda-runtime-deadline-ms"));
        assert_eq!(
            response.headers()["lambda-runtime-invoked-function-arn"],
            "arn:aws:lambda:us-east-1:000000000000:function:f1"
        );
        assert_eq!(body_json(response).await, json!({ "hello": "world" }));
        assert_eq!(
            fx.server.lane(&WorkerId::new("w1")).unwrap().claimed,
            Some(RequestId::new("r1"))
        );
    }

    #[tokio::test]
    async fn response_round_trip_publishes_success_once() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        let response = router.clone().oneshot(get_next("w1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(post(
                "/w1/2018-06-01/runtime/invocation/r1/response".into(),
                json!({ "ok": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            next_outcome(&mut fx.events),
            Some(Event::FunctionSuccess {
                worker_id: WorkerId::new("w1"),
                function_id: FunctionId::new("f1"),
                request_id: RequestId::new("r1"),
                body: json!({ "ok": true }),
            })
        );

        // a second response for the same request is rejected and publishes nothing
        let response = router
            .oneshot(post(
                "/w1/2018-06-01/runtime/invocation/r1/response".into(),
                json!({ "ok": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(next_outcome(&mut fx.events), None);
    }

    #[tokio::test]
    async fn mismatched_request_id_is_rejected() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        router.clone().oneshot(get_next("w1")).await.unwrap();

        let response = router
            .oneshot(post(
                "/w1/2018-06-01/runtime/invocation/other/response".into(),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorType"], "InvalidRequestID");
        assert_eq!(next_outcome(&mut fx.events), None);
        assert_eq!(
            fx.server.lane(&WorkerId::new("w1")).unwrap().claimed,
            Some(RequestId::new("r1"))
        );
    }

    #[tokio::test]
    async fn error_route_publishes_function_error() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        router.clone().oneshot(get_next("w1")).await.unwrap();

        let response = router
            .oneshot(post(
                "/w1/2018-06-01/runtime/invocation/r1/error".into(),
                json!({ "errorType": "TypeError", "errorMessage": "boom", "trace": ["at handler"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let Some(Event::FunctionError { request_id, error, .. }) = next_outcome(&mut fx.events) else {
            panic!("expected function.error");
        };
        assert_eq!(request_id, RequestId::new("r1"));
        assert_eq!(error.error_type, "TypeError");
        assert_eq!(error.error_message, "boom");
        assert_eq!(error.trace, vec!["at handler"]);
    }

    #[tokio::test]
    async fn one_claimed_invocation_per_lane_in_fifo_order() {
        let fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!(1));
        invoke(&fx.bus, "w1", "r2", json!(2));

        let first = router.clone().oneshot(get_next("w1")).await.unwrap();
        assert_eq!(first.headers()["lambda-runtime-aws-request-id"], "r1");

        let second = tokio::spawn(router.clone().oneshot(get_next("w1")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        router
            .clone()
            .oneshot(post("/w1/2018-06-01/runtime/invocation/r1/response".into(), json!(null)))
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.headers()["lambda-runtime-aws-request-id"], "r2");
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let fx = fixture();
        let router = fx.server.router();
        let blocked = tokio::spawn(router.clone().oneshot(get_next("w1")));

        invoke(&fx.bus, "w2", "r9", json!({}));
        let response = tokio::time::timeout(Duration::from_secs(2), router.oneshot(get_next("w2")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.headers()["lambda-runtime-aws-request-id"], "r9");
        assert!(!blocked.is_finished());
        blocked.abort();
    }

    #[tokio::test]
    async fn unknown_api_version_is_not_found() {
        let fx = fixture();
        let response = fx
            .server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/w1/2015-03-31/runtime/invocation/next")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_timeout_returns_gateway_timeout() {
        let fx = fixture_with(ServerOptions {
            poll_timeout: Some(Duration::from_millis(30)),
            ..ServerOptions::default()
        });
        let response = fx.server.router().oneshot(get_next("w1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_pollers() {
        let fx = fixture();
        let pending = tokio::spawn(fx.server.router().oneshot(get_next("w1")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.shutdown.cancel();
        let response = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn worker_exit_fails_claimed_and_reannounces_queued() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        invoke(&fx.bus, "w1", "r2", json!({}));
        router.clone().oneshot(get_next("w1")).await.unwrap();
        while fx.events.try_recv().is_some() {}

        fx.bus.publish(Event::WorkerExited {
            worker_id: WorkerId::new("w1"),
            function_id: FunctionId::new("f1"),
            code: Some(1),
        });

        let Some(Event::FunctionError { request_id, error, .. }) = fx.events.try_recv() else {
            panic!("expected function.error");
        };
        assert_eq!(request_id, RequestId::new("r1"));
        assert_eq!(error.error_type, EXIT_ERROR);

        let Some(Event::FunctionInvoked(invocation)) = fx.events.try_recv() else {
            panic!("expected re-announced invocation");
        };
        assert_eq!(invocation.request_id, RequestId::new("r2"));
        // not queued twice
        let lane = fx.server.lane(&WorkerId::new("w1")).unwrap();
        assert_eq!(lane.queued, vec![RequestId::new("r2")]);
        assert_eq!(lane.claimed, None);
    }

    #[tokio::test]
    async fn worker_exit_before_any_claim_fails_the_queue() {
        let mut fx = fixture();
        invoke(&fx.bus, "w1", "r1", json!({}));
        invoke(&fx.bus, "w1", "r2", json!({}));
        while fx.events.try_recv().is_some() {}

        fx.bus.publish(Event::WorkerExited {
            worker_id: WorkerId::new("w1"),
            function_id: FunctionId::new("f1"),
            code: Some(1),
        });

        let mut failed = Vec::new();
        while let Some(event) = fx.events.try_recv() {
            let Event::FunctionError { request_id, error, .. } = event else {
                panic!("unexpected {event:?}");
            };
            assert_eq!(error.error_type, EXIT_ERROR);
            failed.push(request_id);
        }
        assert_eq!(failed, vec![RequestId::new("r1"), RequestId::new("r2")]);

        // the lane stays usable for the next worker
        let lane = fx.server.lane(&WorkerId::new("w1")).unwrap();
        assert!(lane.queued.is_empty());
        invoke(&fx.bus, "w1", "r3", json!({}));
        let response = fx.server.router().oneshot(get_next("w1")).await.unwrap();
        assert_eq!(response.headers()["lambda-runtime-aws-request-id"], "r3");
    }

    #[tokio::test]
    async fn worker_stop_before_any_claim_reannounces_the_head() {
        let mut fx = fixture();
        invoke(&fx.bus, "w1", "r1", json!({}));
        while fx.events.try_recv().is_some() {}

        fx.bus.publish(Event::WorkerStopped {
            worker_id: WorkerId::new("w1"),
            function_id: FunctionId::new("f1"),
        });

        let Some(Event::FunctionInvoked(invocation)) = fx.events.try_recv() else {
            panic!("expected re-announced invocation");
        };
        assert_eq!(invocation.request_id, RequestId::new("r1"));
        assert_eq!(fx.events.try_recv(), None);
        assert_eq!(
            fx.server.lane(&WorkerId::new("w1")).unwrap().queued,
            vec![RequestId::new("r1")]
        );
    }

    #[tokio::test]
    async fn response_larger_than_two_megabytes_is_accepted() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        router.clone().oneshot(get_next("w1")).await.unwrap();

        let blob = "x".repeat(3 * 1024 * 1024);
        let response = router
            .oneshot(post(
                "/w1/2018-06-01/runtime/invocation/r1/response".into(),
                json!({ "blob": blob }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let Some(Event::FunctionSuccess { request_id, body, .. }) = next_outcome(&mut fx.events) else {
            panic!("expected function.success");
        };
        assert_eq!(request_id, RequestId::new("r1"));
        assert_eq!(body["blob"].as_str().map(str::len), Some(3 * 1024 * 1024));
        assert_eq!(fx.server.lane(&WorkerId::new("w1")).unwrap().claimed, None);
    }

    #[tokio::test]
    async fn cancel_drops_queued_and_claimed_invocations() {
        let mut fx = fixture();
        let router = fx.server.router();
        invoke(&fx.bus, "w1", "r1", json!({}));
        invoke(&fx.bus, "w1", "r2", json!({}));
        invoke(&fx.bus, "w1", "r3", json!({}));
        router.clone().oneshot(get_next("w1")).await.unwrap();

        let w1 = WorkerId::new("w1");
        assert!(fx.server.cancel(&w1, &RequestId::new("r2")));
        assert!(fx.server.cancel(&w1, &RequestId::new("r1")));
        assert!(!fx.server.cancel(&w1, &RequestId::new("r1")));
        assert!(!fx.server.cancel(&WorkerId::new("w9"), &RequestId::new("r3")));
        assert_eq!(
            fx.server.lane(&w1).unwrap(),
            LaneSnapshot {
                queued: vec![RequestId::new("r3")],
                claimed: None,
            }
        );

        // the late answer for the cancelled request is rejected
        let response = router
            .clone()
            .oneshot(post("/w1/2018-06-01/runtime/invocation/r1/response".into(), json!(1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(next_outcome(&mut fx.events), None);

        let response = router.oneshot(get_next("w1")).await.unwrap();
        assert_eq!(response.headers()["lambda-runtime-aws-request-id"], "r3");
    }

    #[tokio::test]
    async fn failed_start_fails_everything_on_the_lane() {
        let mut fx = fixture();
        invoke(&fx.bus, "w1", "r1", json!({}));
        invoke(&fx.bus, "w1", "r2", json!({}));
        while fx.events.try_recv().is_some() {}

        fx.bus.publish(Event::WorkerFailed {
            worker_id: WorkerId::new("w1"),
            function_id: FunctionId::new("f1"),
            error: "no artifact available for function=f1".into(),
        });

        let mut failed = Vec::new();
        while let Some(Event::FunctionError { request_id, error, .. }) = fx.events.try_recv() {
            assert_eq!(error.error_type, START_ERROR);
            failed.push(request_id);
        }
        assert_eq!(failed, vec![RequestId::new("r1"), RequestId::new("r2")]);
        assert!(fx.server.lane(&WorkerId::new("w1")).is_none());
    }

    #[tokio::test]
    async fn init_error_fails_the_pending_invocation() {
        let mut fx = fixture();
        invoke(&fx.bus, "w1", "r1", json!({}));
        let response = fx
            .server
            .router()
            .oneshot(post(
                "/w1/2018-06-01/runtime/init/error".into(),
                json!({ "errorType": "Runtime.ImportModuleError", "errorMessage": "Cannot find module" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let Some(Event::FunctionError { request_id, error, .. }) = next_outcome(&mut fx.events) else {
            panic!("expected function.error");
        };
        assert_eq!(request_id, RequestId::new("r1"));
        assert_eq!(error.error_type, "Runtime.ImportModuleError");
    }

    #[test]
    fn error_type_falls_back_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "lambda-runtime-function-error-type",
            HeaderValue::from_static("Unhandled"),
        );
        let error = parse_error(&headers, br#"{"errorMessage":"x"}"#);
        assert_eq!(error.error_type, "Unhandled");

        let error = parse_error(&HeaderMap::new(), b"plain text");
        assert_eq!(error.error_type, "Runtime.Unknown");
        assert_eq!(error.error_message, "plain text");
    }
}
