//! Business logic services

pub mod auth;
pub mod connections;
pub mod dispatcher;
pub mod recorder;
pub mod session_registry;
pub mod stream_adapter;
pub mod sweeper;

pub use auth::{AuthService, Claims, PrincipalKind};
pub use connections::ConnectionManager;
pub use dispatcher::TaskDispatcher;
pub use recorder::{Recorder, RecordingContext, SessionRecording};
pub use session_registry::{
    CreateSessionRequest, SessionGuard, SessionOutput, SessionRegistry, StreamSession,
};
