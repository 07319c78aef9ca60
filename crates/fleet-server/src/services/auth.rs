//! Bearer token validation (HS256 JWT)

use chrono::{Duration, Utc};
use fleet_core::{FleetError, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Who a token was issued to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Operator using the API or a terminal
    User,
    /// Remote agent; the subject is the agent ID
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: String,
    pub kind: PrincipalKind,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let validation = Validation::default();
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| FleetError::AuthenticationFailed(format!("invalid token: {}", e)))?;

        Ok(token_data.claims)
    }

    /// Mint a token. Login flows live elsewhere; this serves operators
    /// bootstrapping agents and tests.
    pub fn issue_token(
        &self,
        sub: &str,
        name: &str,
        kind: PrincipalKind,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            name: name.to_string(),
            kind,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| FleetError::AuthenticationFailed(format!("failed to sign token: {}", e)))
    }
}
