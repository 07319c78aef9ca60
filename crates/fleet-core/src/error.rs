//! Error types for the fleet control plane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    // Routing
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    // Session lifecycle
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Agent not ready for session {0}")]
    AgentNotReady(String),

    #[error("Session {0} already has an agent stream attached")]
    AlreadyAttached(String),

    #[error("Session timed out after {0} seconds of inactivity")]
    HeartbeatTimeout(u64),

    // Relay
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Durability
    #[error("Recording error: {0}")]
    Recording(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    // Boundary
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl FleetError {
    /// Stable machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            FleetError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            FleetError::HostUnreachable(_) => "HOST_UNREACHABLE",
            FleetError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            FleetError::SessionExpired(_) => "SESSION_EXPIRED",
            FleetError::SessionClosed(_) => "SESSION_CLOSED",
            FleetError::AgentNotReady(_) => "AGENT_NOT_READY",
            FleetError::AlreadyAttached(_) => "ALREADY_ATTACHED",
            FleetError::HeartbeatTimeout(_) => "SESSION_TIMEOUT",
            FleetError::Stream(_) => "STREAM_ERROR",
            FleetError::Transport(_) => "TRANSPORT_ERROR",
            FleetError::Recording(_) => "RECORDING_ERROR",
            FleetError::Io(_) => "IO_ERROR",
            FleetError::Serialization(_) => "SERIALIZATION_ERROR",
            FleetError::Database(_) => "DATABASE_ERROR",
            FleetError::AuthenticationFailed(_) => "UNAUTHORIZED",
            FleetError::InvalidRequest(_) => "INVALID_REQUEST",
            FleetError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}
