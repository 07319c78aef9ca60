//! Terminal session recorder
//!
//! Each recorded session buffers an asciicast document in memory. On
//! finalization the document is written to
//! `<recordings_dir>/<YYYY-MM-DD>/<recording_id>.cast` and the metadata row
//! is completed.

use crate::metrics::StreamMetrics;
use crate::services::{SessionRegistry, StreamSession};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_core::ports::RecordingStore;
use fleet_core::recording::CastBuffer;
use fleet_core::{
    CastHeader, Direction, FleetError, RecordingCompletion, Result, TerminalRecording,
    RECORDING_FORMAT,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Who opened the terminal and how
#[derive(Debug, Clone)]
pub struct RecordingContext {
    pub user_id: String,
    pub username: String,
    pub client_ip: Option<String>,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
}

/// Live recording of one session
pub struct SessionRecording {
    pub id: String,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    started: Instant,
    buffer: Mutex<CastBuffer>,
    truncation_logged: AtomicBool,
}

impl SessionRecording {
    /// Append a frame stamped with the time since the session started
    pub fn record_frame(&self, direction: Direction, data: &str) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let pushed = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(elapsed, direction, data);

        match pushed {
            Ok(true) => {}
            Ok(false) => {
                if !self.truncation_logged.swap(true, Ordering::Relaxed) {
                    warn!(
                        recording_id = %self.id,
                        session_id = %self.session_id,
                        "Recording reached its size cap, further frames are dropped"
                    );
                }
            }
            Err(e) => warn!(recording_id = %self.id, "Failed to encode recording frame: {}", e),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_truncated()
    }

    fn contents(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_bytes()
            .to_vec()
    }
}

pub struct Recorder {
    store: Arc<dyn RecordingStore>,
    recordings_dir: PathBuf,
    enabled: bool,
    max_buffer_bytes: Option<usize>,
    active: DashMap<String, Arc<SessionRecording>>,
    metrics: Arc<StreamMetrics>,
}

impl Recorder {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        recordings_dir: PathBuf,
        enabled: bool,
        max_buffer_bytes: Option<usize>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            store,
            recordings_dir,
            enabled,
            max_buffer_bytes,
            active: DashMap::new(),
            metrics,
        }
    }

    /// Begin recording `session`. Returns `None` when recording is disabled
    /// or the header could not be encoded.
    pub async fn start(
        &self,
        session: &StreamSession,
        context: RecordingContext,
    ) -> Option<Arc<SessionRecording>> {
        if !self.enabled {
            return None;
        }

        let header = CastHeader::new(
            context.cols,
            context.rows,
            session.created_at.timestamp(),
            format!("{}/{}", session.instance_id, session.container_id),
            &context.shell,
        );
        let buffer = match CastBuffer::new(&header, self.max_buffer_bytes) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(session_id = %session.id, "Failed to start recording: {}", e);
                return None;
            }
        };

        let recording = Arc::new(SessionRecording {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            start_time: session.created_at,
            started: session.started(),
            buffer: Mutex::new(buffer),
            truncation_logged: AtomicBool::new(false),
        });

        let row = TerminalRecording {
            id: recording.id.clone(),
            session_id: session.id.clone(),
            instance_id: session.instance_id.clone(),
            container_id: session.container_id.clone(),
            user_id: context.user_id,
            username: context.username,
            client_ip: context.client_ip,
            shell: context.shell,
            rows: context.rows,
            cols: context.cols,
            start_time: session.created_at,
            end_time: None,
            duration: None,
            format: RECORDING_FORMAT.to_string(),
            storage_path: None,
            file_size: None,
        };
        // Keep recording in memory even without a row; finalize will skip it
        if let Err(e) = self.store.create_recording(&row).await {
            error!(
                session_id = %session.id,
                recording_id = %recording.id,
                "Failed to persist recording metadata: {}",
                e
            );
        }

        self.active.insert(session.id.clone(), recording.clone());
        info!(
            session_id = %session.id,
            recording_id = %recording.id,
            "Recording started"
        );
        Some(recording)
    }

    pub fn recording(&self, session_id: &str) -> Option<Arc<SessionRecording>> {
        self.active.get(session_id).map(|r| r.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Persist the recording of `session_id`. Runs at most once per session;
    /// later calls return `false`. Errors are logged, never returned.
    pub async fn finalize(&self, session_id: &str) -> bool {
        let Some((_, recording)) = self.active.remove(session_id) else {
            return false;
        };

        match self.persist(&recording).await {
            Ok(Some(completion)) => {
                self.metrics.recording_finalized();
                info!(
                    session_id = %session_id,
                    recording_id = %recording.id,
                    path = %completion.storage_path,
                    bytes = completion.file_size,
                    duration = completion.duration,
                    truncated = recording.is_truncated(),
                    "Recording finalized"
                );
                true
            }
            Ok(None) => {
                debug!(
                    session_id = %session_id,
                    recording_id = %recording.id,
                    "No open recording row, nothing to finalize"
                );
                false
            }
            Err(e) => {
                self.metrics.recording_failed();
                error!(
                    session_id = %session_id,
                    recording_id = %recording.id,
                    "Failed to finalize recording: {}",
                    e
                );
                false
            }
        }
    }

    async fn persist(&self, recording: &SessionRecording) -> Result<Option<RecordingCompletion>> {
        let Some(row) = self.store.get_recording(&recording.id).await? else {
            return Ok(None);
        };
        if row.is_finalized() {
            return Ok(None);
        }

        let dir = self
            .recordings_dir
            .join(recording.start_time.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.cast", recording.id));
        let tmp = dir.join(format!("{}.cast.tmp", recording.id));
        let contents = recording.contents();
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let completion = RecordingCompletion {
            end_time: Utc::now(),
            duration: recording.started.elapsed().as_secs_f64(),
            storage_path: path.to_string_lossy().into_owned(),
            file_size: contents.len() as i64,
        };
        if !self
            .store
            .complete_recording(&recording.id, &completion)
            .await?
        {
            return Err(FleetError::Recording(format!(
                "recording {} was completed concurrently",
                recording.id
            )));
        }
        Ok(Some(completion))
    }

    /// Finalize recordings whose session is no longer registered
    pub async fn sweep_orphans(&self, registry: &SessionRegistry) -> usize {
        let orphans: Vec<String> = self
            .active
            .iter()
            .filter(|entry| !registry.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut finalized = 0;
        for session_id in orphans {
            if self.finalize(&session_id).await {
                finalized += 1;
            }
        }
        finalized
    }
}
