//! Recording metadata and playback download

use super::{ApiError, ApiResult};
use crate::extractors::AuthUser;
use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::ports::RecordingStore;
use fleet_core::TerminalRecording;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub instance_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecordingListResponse {
    pub recordings: Vec<TerminalRecording>,
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<RecordingListResponse>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let recordings = state
        .db
        .list_recordings(query.instance_id.as_deref(), limit)
        .await?;
    Ok(Json(RecordingListResponse { recordings }))
}

fn not_found(id: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "RECORDING_NOT_FOUND",
        format!("Recording not found: {}", id),
    )
}

pub async fn get(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<TerminalRecording>> {
    state
        .db
        .get_recording(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

/// Stream the stored asciicast file
pub async fn download(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let recording = state
        .db
        .get_recording(&id)
        .await?
        .ok_or_else(|| not_found(&id))?;

    let Some(path) = recording.storage_path else {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "RECORDING_IN_PROGRESS",
            "Recording has not been finalized yet",
        ));
    };

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        tracing::warn!("Recording file {} unavailable: {}", path, e);
        ApiError::new(
            StatusCode::GONE,
            "RECORDING_FILE_MISSING",
            "Recording file is no longer available",
        )
    })?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-asciicast".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.cast\"", recording.id),
            ),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use crate::services::{CreateSessionRequest, RecordingContext};
    use crate::testing::{self, TestApp, INSTANCE_ID};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleet_core::recording::parse_cast;
    use fleet_core::{Direction, StreamOperation};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_download_after_finalize() {
        let tmp = tempfile::tempdir().unwrap();
        let TestApp {
            state,
            router,
            agent: _agent,
            user_token,
        } = testing::app(tmp.path()).await;
        let session = state
            .registry
            .create_session(CreateSessionRequest::new(INSTANCE_ID, StreamOperation::Exec))
            .await
            .unwrap();
        let recording = state
            .recorder
            .start(
                &session,
                RecordingContext {
                    user_id: "u1".into(),
                    username: "alice".into(),
                    client_ip: None,
                    shell: "/bin/sh".into(),
                    rows: 24,
                    cols: 80,
                },
            )
            .await
            .unwrap();
        recording.record_frame(Direction::Output, "hello\r\n");

        let request = |uri: String| {
            Request::builder()
                .uri(uri)
                .header("Authorization", format!("Bearer {}", user_token))
                .body(Body::empty())
                .unwrap()
        };
        let download_uri = format!("/api/v1/recordings/{}/download", recording.id);

        let response = router
            .clone()
            .oneshot(request(download_uri.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        assert!(state.recorder.finalize(&session.id).await);

        let response = router
            .clone()
            .oneshot(request(download_uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let (_, frames) = parse_cast(&body).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello\r\n");

        let response = router
            .oneshot(request(format!(
                "/api/v1/recordings?instance_id={}",
                INSTANCE_ID
            )))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["recordings"][0]["id"], recording.id.as_str());
    }
}
