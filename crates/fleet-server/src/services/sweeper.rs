//! Periodic cleanup of expired sessions and abandoned recordings

use crate::services::{Recorder, SessionRegistry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One sweep pass. Returns (expired sessions, finalized orphan recordings).
pub async fn sweep_once(registry: &SessionRegistry, recorder: &Recorder) -> (usize, usize) {
    let expired = registry.sweep_expired(Utc::now());
    let orphans = recorder.sweep_orphans(registry).await;
    if expired > 0 || orphans > 0 {
        info!(
            expired_sessions = expired,
            orphan_recordings = orphans,
            remaining = registry.len(),
            active_recordings = recorder.active_count(),
            "Session sweep"
        );
    } else {
        debug!(
            remaining = registry.len(),
            active_recordings = recorder.active_count(),
            "Session sweep, nothing to do"
        );
    }
    (expired, orphans)
}

pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    recorder: Arc<Recorder>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    sweep_once(&registry, &recorder).await;
                }
            }
        }
        debug!("Session sweeper stopped");
    })
}
