//! Recording metadata persistence

use crate::Result;
use async_trait::async_trait;
use fleet_types::{RecordingCompletion, TerminalRecording};

/// Append-only store of terminal recording metadata
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn create_recording(&self, recording: &TerminalRecording) -> Result<()>;
    async fn get_recording(&self, id: &str) -> Result<Option<TerminalRecording>>;
    async fn get_recording_by_session(&self, session_id: &str) -> Result<Option<TerminalRecording>>;

    /// Write the end fields. Returns `false` when the row was already
    /// finalized (or is missing) and nothing changed.
    async fn complete_recording(&self, id: &str, completion: &RecordingCompletion) -> Result<bool>;

    async fn list_recordings(
        &self,
        instance_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TerminalRecording>>;
}
