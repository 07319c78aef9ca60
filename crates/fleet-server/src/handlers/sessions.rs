//! Session inspection and explicit close

use super::ApiResult;
use crate::extractors::AuthUser;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, StreamOperation};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub instance_id: String,
    pub agent_id: String,
    pub operation: StreamOperation,
    pub container_id: String,
    pub ready: bool,
    pub recording: bool,
    pub dropped_frames: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn get(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let session = state.registry.lookup(&id)?;
    Ok(Json(SessionInfo {
        session_id: session.id.clone(),
        instance_id: session.instance_id.clone(),
        agent_id: session.agent_id.clone(),
        operation: session.operation,
        container_id: session.container_id.clone(),
        ready: session.is_ready(),
        recording: state.recorder.recording(&session.id).is_some(),
        dropped_frames: session.dropped_frames(),
        created_at: session.created_at,
        expires_at: session.expires_at,
    }))
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.registry.close_session(&id) {
        return Err(FleetError::SessionNotFound(id).into());
    }
    state.recorder.finalize(&id).await;
    info!(session_id = %id, user_id = %user.user_id, "Session closed by request");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::services::CreateSessionRequest;
    use crate::testing::{self, TestApp, INSTANCE_ID};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleet_core::StreamOperation;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_delete_closes_then_404s() {
        let tmp = tempfile::tempdir().unwrap();
        let TestApp {
            state,
            router,
            agent: _agent,
            user_token,
        } = testing::app(tmp.path()).await;
        let session = state
            .registry
            .create_session(CreateSessionRequest::new(INSTANCE_ID, StreamOperation::GetLogs))
            .await
            .unwrap();

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/sessions/{}", session.id))
                .header("Authorization", format!("Bearer {}", user_token))
                .body(Body::empty())
                .unwrap()
        };

        let response = router.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(session.is_closed());

        let response = router.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.sessions_created, 1);
        assert_eq!(snapshot.sessions_closed, 1);
    }
}
