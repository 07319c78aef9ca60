//! Process-wide stream counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StreamMetrics {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_expired: AtomicU64,
    frames_dropped: AtomicU64,
    input_dropped: AtomicU64,
    recordings_finalized: AtomicU64,
    recordings_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
    pub frames_dropped: u64,
    pub input_dropped: u64,
    pub recordings_finalized: u64,
    pub recordings_failed: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_expired(&self) {
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_dropped(&self) {
        self.input_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recording_finalized(&self) {
        self.recordings_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recording_failed(&self) {
        self.recordings_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            input_dropped: self.input_dropped.load(Ordering::Relaxed),
            recordings_finalized: self.recordings_finalized.load(Ordering::Relaxed),
            recordings_failed: self.recordings_failed.load(Ordering::Relaxed),
        }
    }
}
