// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use lobby_common::{
    BotsResponse, CreateLobbyRequest, CreateLobbyResponse, HealthResponse, LobbyInfoRequest,
    LobbyInfoResponse, STATUS_HEALTHY, STATUS_SUCCESS,
};
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::Service;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{DispatchError, LobbyDispatcher},
    registry::BotRegistry,
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

const UNAUTHORIZED_MESSAGE: &str = "Unauthorized: Invalid or missing API key";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<BotRegistry>,
    dispatcher: Arc<LobbyDispatcher>,
    api_key: Option<Arc<str>>,
}

impl AppState {
    /// A blank key disables authentication.
    pub fn new(
        registry: Arc<BotRegistry>,
        dispatcher: Arc<LobbyDispatcher>,
        api_key: Option<&str>,
    ) -> Self {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(Arc::from);
        Self {
            registry,
            dispatcher,
            api_key,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/bots", get(bots_handler))
        .route("/lobby/create", post(create_lobby_handler))
        .route(
            "/lobby/info",
            get(lobby_info_query_handler).post(lobby_info_body_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Connection-level limits for [`serve`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Bound on receiving a complete request head, including the wait for
    /// the next request on a kept-alive connection.
    pub header_read_timeout: Duration,
    /// Connections with no bytes moving in either direction for this long
    /// are closed.
    pub idle_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            header_read_timeout: REQUEST_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// Accepts connections until `shutdown` fires, then lets open connections
/// finish their current request and waits for them.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) {
    let connections = TaskTracker::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(error = %error, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            },
        };
        connections.spawn(serve_connection(
            stream,
            peer,
            app.clone(),
            limits,
            shutdown.clone(),
        ));
    }

    connections.close();
    info!(open = connections.len(), "http listener closed; draining connections");
    connections.wait().await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%peer, error = %error, "failed to set TCP_NODELAY");
    }
    let activity = Activity::new();
    let io = TokioIo::new(TrackedIo {
        inner: stream,
        activity: activity.clone(),
    });
    let service = service_fn(move |request: axum::http::Request<Incoming>| {
        app.clone().call(request)
    });

    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read_timeout)
        .keep_alive(true)
        .serve_connection(io, service);
    tokio::pin!(connection);

    let mut closing = false;
    loop {
        let idle_deadline = activity.last() + limits.idle_timeout;
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(error) = result {
                    debug!(%peer, error = %error, "connection closed with error");
                }
                return;
            }
            _ = shutdown.cancelled(), if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = tokio::time::sleep_until(idle_deadline), if !closing => {
                if activity.last() + limits.idle_timeout <= Instant::now() {
                    debug!(%peer, "closing idle connection");
                    closing = true;
                    connection.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

/// Last time any bytes moved on a connection.
#[derive(Clone)]
struct Activity {
    epoch: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(millis, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_millis.load(Ordering::Relaxed))
    }
}

struct TrackedIo<T> {
    inner: T,
    activity: Activity,
}

impl<T: AsyncRead + Unpin> AsyncRead for TrackedIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.touch();
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TrackedIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(written)) if written > 0) {
            self.activity.touch();
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let provided = presented_key(request.headers()).unwrap_or_default();
    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        next.run(request).await
    } else {
        ApiError::unauthorized().into_response()
    }
}

/// `X-API-Key` wins over `Authorization: Bearer`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let direct = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    if direct.is_some() {
        return direct;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|value| !value.is_empty())
}

/// Runs over every byte of `expected` no matter where the first mismatch
/// is. A length mismatch only changes the result.
fn constant_time_eq(provided: &[u8], expected: &[u8]) -> bool {
    let mut diff = provided.len() ^ expected.len();
    for (index, byte) in expected.iter().enumerate() {
        let other = provided.get(index).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: STATUS_HEALTHY.to_string(),
        time: Utc::now(),
    })
}

async fn bots_handler(State(state): State<AppState>) -> Json<BotsResponse> {
    let mut bots = BTreeMap::new();
    for (username, status) in state.registry.snapshot().await {
        debug!(
            username = %username,
            state = %status.state,
            since = %status.since,
            backoff_attempts = status.backoff_attempts,
            "bot status"
        );
        bots.insert(username, status.is_ready());
    }
    Json(BotsResponse { bots })
}

async fn create_lobby_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateLobbyResponse>), ApiError> {
    let request: CreateLobbyRequest = decode_body(&body)?;
    let created = state.dispatcher.create_lobby(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateLobbyResponse {
            status: STATUS_SUCCESS.to_string(),
            message: "Lobby creation initiated".to_string(),
            lobby_name: created.lobby.lobby_name,
            lobby_id: created.lobby.lobby_id,
            bot_used: created.bot_used,
        }),
    ))
}

async fn lobby_info_query_handler(
    State(state): State<AppState>,
    Query(request): Query<LobbyInfoRequest>,
) -> Result<Json<LobbyInfoResponse>, ApiError> {
    lobby_info(&state, &request.lobby_id).await
}

async fn lobby_info_body_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<LobbyInfoResponse>, ApiError> {
    let request: LobbyInfoRequest = decode_body(&body)?;
    lobby_info(&state, &request.lobby_id).await
}

async fn lobby_info(state: &AppState, lobby_id: &str) -> Result<Json<LobbyInfoResponse>, ApiError> {
    let found = state.dispatcher.lobby_info(lobby_id).await?;
    Ok(Json(LobbyInfoResponse {
        status: STATUS_SUCCESS.to_string(),
        lobby_id: found.lobby.lobby_id.clone(),
        bot_used: found.bot_used,
        lobby: found.lobby,
    }))
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|error| ApiError::bad_request(format!("Invalid request body: {error}")))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError {
        status: StatusCode::METHOD_NOT_ALLOWED,
        message: "Method not allowed".to_string(),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: UNAUTHORIZED_MESSAGE.to_string(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        let message = error.to_string();
        match error {
            DispatchError::BadRequest(_) => Self::bad_request(message),
            DispatchError::NoAvailableBot | DispatchError::BotNotReady => {
                Self::service_unavailable(message)
            }
            DispatchError::LobbyNotFound => Self::not_found(message),
            DispatchError::Upstream => Self::bad_gateway(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (self.status, self.message).into_response()
    }
}
