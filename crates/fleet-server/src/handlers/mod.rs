//! HTTP handlers

pub mod agent;
pub mod recordings;
pub mod sessions;
pub mod streams;
pub mod terminal;

use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::FleetError;
use serde_json::json;

/// Error response: status plus `{error, code}` body
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        let status = match &e {
            FleetError::InstanceNotFound(_)
            | FleetError::AgentNotFound(_)
            | FleetError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::SessionExpired(_) | FleetError::SessionClosed(_) => StatusCode::GONE,
            FleetError::HostUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::AgentNotReady(_) => StatusCode::GATEWAY_TIMEOUT,
            FleetError::AlreadyAttached(_) => StatusCode::CONFLICT,
            FleetError::HeartbeatTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            FleetError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            FleetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FleetError::Stream(_) | FleetError::Transport(_) => StatusCode::BAD_GATEWAY,
            FleetError::Recording(_)
            | FleetError::Io(_)
            | FleetError::Serialization(_)
            | FleetError::Database(_)
            | FleetError::Config(_) => {
                tracing::error!("Internal error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.code(), e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (FleetError::SessionNotFound("s".into()), StatusCode::NOT_FOUND),
            (FleetError::SessionExpired("s".into()), StatusCode::GONE),
            (FleetError::HostUnreachable("h".into()), StatusCode::SERVICE_UNAVAILABLE),
            (FleetError::AgentNotReady("s".into()), StatusCode::GATEWAY_TIMEOUT),
            (FleetError::AlreadyAttached("s".into()), StatusCode::CONFLICT),
            (FleetError::Database("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let code = err.code();
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }
}
