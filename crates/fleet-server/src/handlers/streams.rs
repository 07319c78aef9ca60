//! Session-creating endpoints: terminal exec, stats, log tail, image pull

use super::{ApiError, ApiResult};
use crate::extractors::{client_ip, AuthUser};
use crate::services::{
    CreateSessionRequest, RecordingContext, SessionGuard, SessionOutput, StreamSession,
};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use fleet_core::{CloseReason, FleetError, StreamError, StreamOperation};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Optional routing hint
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub session_id: String,
    pub ws_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Open a recorded terminal session. The client then connects to `ws_url`.
pub async fn create_exec(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Path((instance_id, container_id)): Path<(String, String)>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<(StatusCode, Json<ExecResponse>)> {
    if req.rows == 0 || req.cols == 0 {
        return Err(FleetError::InvalidRequest("rows and cols must be positive".into()).into());
    }

    let mut request = CreateSessionRequest::new(&instance_id, StreamOperation::Exec)
        .container(&container_id)
        .param("shell", &req.shell)
        .param("rows", req.rows.to_string())
        .param("cols", req.cols.to_string());
    request.agent_id = req.agent_id.clone();

    let session = state.registry.create_session(request).await?;
    if let Err(e) = state.registry.dispatcher().dispatch(&session).await {
        state.registry.close_session(&session.id);
        return Err(e.into());
    }

    let context = RecordingContext {
        user_id: user.user_id.clone(),
        username: user.name.clone(),
        client_ip: client_ip(&headers),
        shell: req.shell,
        rows: req.rows,
        cols: req.cols,
    };
    state.recorder.start(&session, context).await;

    info!(
        session_id = %session.id,
        user_id = %user.user_id,
        instance_id = %instance_id,
        container_id = %container_id,
        "Terminal session opened"
    );

    Ok((
        StatusCode::CREATED,
        Json(ExecResponse {
            ws_url: format!(
                "{}/api/v1/terminal/{}/ws",
                state.config.public_url.trim_end_matches('/'),
                session.id
            ),
            session_id: session.id.clone(),
            expires_at: session.expires_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub stream: bool,
}

pub async fn stats(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((instance_id, container_id)): Path<(String, String)>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Response> {
    let request = CreateSessionRequest::new(&instance_id, StreamOperation::GetStats)
        .container(&container_id)
        .param("stream", query.stream.to_string());
    let (session, output, guard) = open_session(&state, request).await?;

    if query.stream {
        return Ok(sse_response(session, output, guard, state.config.sessions.ready_timeout()));
    }

    let body = first_frame(&session, output, state.config.sessions.ready_timeout()).await?;
    drop(guard);
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub tail: Option<String>,
    #[serde(default)]
    pub timestamps: bool,
}

pub async fn logs(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((instance_id, container_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let request = CreateSessionRequest::new(&instance_id, StreamOperation::GetLogs)
        .container(&container_id)
        .param("follow", query.follow.to_string())
        .param("tail", query.tail.unwrap_or_else(|| "all".to_string()))
        .param("timestamps", query.timestamps.to_string());
    let (session, output, guard) = open_session(&state, request).await?;
    Ok(sse_response(session, output, guard, state.config.sessions.ready_timeout()))
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub image: String,
    #[serde(default)]
    pub tag: Option<String>,
}

pub async fn pull_image(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(instance_id): Path<String>,
    Json(req): Json<PullRequest>,
) -> ApiResult<Response> {
    if req.image.trim().is_empty() {
        return Err(FleetError::InvalidRequest("image is required".into()).into());
    }
    let image = match req.tag.as_deref() {
        Some(tag) if !tag.is_empty() => format!("{}:{}", req.image, tag),
        _ => req.image.clone(),
    };

    let request = CreateSessionRequest::new(&instance_id, StreamOperation::PullImage).image(image);
    let (session, output, guard) = open_session(&state, request).await?;
    Ok(sse_response(session, output, guard, state.config.sessions.ready_timeout()))
}

/// Create a session, take its output and queue the agent task. The session
/// is closed when the returned guard drops.
async fn open_session(
    state: &AppState,
    request: CreateSessionRequest,
) -> ApiResult<(Arc<StreamSession>, SessionOutput, SessionGuard)> {
    let session = state.registry.create_session(request).await?;
    let guard = SessionGuard::new(state.registry.clone(), session.id.clone());

    let output = session
        .take_output()
        .ok_or_else(|| ApiError::conflict("Session output already taken"))?;
    state.registry.dispatcher().dispatch(&session).await?;

    Ok((session, output, guard))
}

/// Wait for the first frame of a one-shot operation
async fn first_frame(
    session: &StreamSession,
    mut output: SessionOutput,
    timeout: Duration,
) -> ApiResult<String> {
    session.wait_for_ready(timeout).await?;

    let frame = tokio::time::timeout(timeout, async {
        tokio::select! {
            biased;
            Some(data) = output.data.recv() => Ok(data.data),
            Some(error) = output.error.recv() => Err(ApiError::new(
                StatusCode::BAD_GATEWAY,
                error.code,
                error.message,
            )),
            _ = output.close.recv() => Err(FleetError::Stream(
                "agent closed the stream without data".into(),
            )
            .into()),
        }
    })
    .await;

    match frame {
        Ok(res) => res,
        Err(_) => Err(FleetError::AgentNotReady(session.id.clone()).into()),
    }
}

struct SseRelay {
    session: Arc<StreamSession>,
    output: SessionOutput,
    ready_timeout: Duration,
    waiting: bool,
    done: bool,
    _guard: SessionGuard,
}

fn json_event(name: Option<&str>, payload: &impl Serialize) -> Event {
    let event = match name {
        Some(name) => Event::default().event(name),
        None => Event::default(),
    };
    match serde_json::to_string(payload) {
        Ok(json) => event.data(json),
        Err(e) => event.data(format!("{{\"error\":\"{}\"}}", e)),
    }
}

impl SseRelay {
    async fn next_event(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }

        if self.waiting {
            self.waiting = false;
            if let Err(e) = self.session.wait_for_ready(self.ready_timeout).await {
                self.done = true;
                warn!(session_id = %self.session.id, "SSE stream aborted: {}", e);
                return Some(json_event(
                    Some("error"),
                    &StreamError::new(e.code(), e.to_string()),
                ));
            }
        }

        tokio::select! {
            biased;
            data = self.output.data.recv() => match data {
                Some(data) => Some(json_event(None, &data)),
                None => {
                    self.done = true;
                    // Senders are gone; a buffered error or reason still wins
                    if let Ok(error) = self.output.error.try_recv() {
                        return Some(json_event(Some("error"), &error));
                    }
                    let reason = self.output.close.try_recv().unwrap_or(CloseReason {
                        reason: "closed".to_string(),
                        exit_code: None,
                    });
                    Some(json_event(Some("close"), &reason))
                }
            },
            Some(error) = self.output.error.recv() => {
                self.done = true;
                Some(json_event(Some("error"), &error))
            },
            Some(reason) = self.output.close.recv() => {
                self.done = true;
                Some(json_event(Some("close"), &reason))
            },
        }
    }
}

fn sse_response(
    session: Arc<StreamSession>,
    output: SessionOutput,
    guard: SessionGuard,
    ready_timeout: Duration,
) -> Response {
    debug!(session_id = %session.id, operation = %session.operation, "Starting SSE stream");
    let relay = SseRelay {
        session,
        output,
        ready_timeout,
        waiting: true,
        done: false,
        _guard: guard,
    };

    let stream = futures::stream::unfold(relay, |mut relay| async move {
        relay
            .next_event()
            .await
            .map(|event| (Ok::<_, Infallible>(event), relay))
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}
