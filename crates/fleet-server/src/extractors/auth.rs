//! Auth extractors for protected routes

use crate::handlers::ApiError;
use crate::services::{Claims, PrincipalKind};
use crate::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{header::HeaderMap, request::Parts, Uri},
};
use serde::Deserialize;

/// Authenticated operator
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub name: String,
}

/// Authenticated remote agent
#[derive(Clone, Debug)]
pub struct AgentAuth {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Token from the `Authorization` header, or from `?token=` for WebSocket
/// clients that cannot set headers
pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(token) = bearer_token(headers) {
        return Some(token.to_string());
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|q| q.0.token)
        .filter(|t| !t.is_empty())
}

/// Client address as reported by the fronting proxy
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .or_else(|| headers.get("X-Real-IP").and_then(|h| h.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Validate `token` and require it was issued to `kind`
pub fn authorize(
    state: &AppState,
    token: Option<String>,
    kind: PrincipalKind,
) -> Result<Claims, ApiError> {
    let token = token.ok_or_else(|| ApiError::unauthorized("Missing token"))?;
    let claims = state
        .auth_service
        .validate_token(&token)
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;
    if claims.kind != kind {
        return Err(ApiError::unauthorized("Token not valid for this endpoint"));
    }
    Ok(claims)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = request_token(&parts.headers, &parts.uri);
        let claims = authorize(state, token, PrincipalKind::User)?;
        Ok(AuthUser {
            user_id: claims.sub,
            name: claims.name,
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = request_token(&parts.headers, &parts.uri);
        let claims = authorize(state, token, PrincipalKind::Agent)?;
        Ok(AgentAuth {
            agent_id: claims.sub,
        })
    }
}
