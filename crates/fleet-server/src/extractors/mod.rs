//! Request extractors

pub mod auth;

pub use auth::{authorize, client_ip, request_token, AgentAuth, AuthUser};
