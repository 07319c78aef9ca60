//! In-memory table of live stream sessions
//!
//! A session owns the four channels relaying one remote operation between the
//! agent side (stream adapter) and the client side (terminal gateway, SSE or
//! one-shot handlers). The registry creates sessions, hands out shared
//! handles and tears them down exactly once.

use crate::config::SessionConfig;
use crate::metrics::StreamMetrics;
use crate::services::TaskDispatcher;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_core::{
    CloseReason, FleetError, InputFrame, Result, StreamData, StreamError, StreamOperation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parameters of a new session
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub instance_id: String,
    /// Optional hint; must match the agent owning the instance
    pub agent_id: Option<String>,
    pub operation: StreamOperation,
    pub container_id: String,
    pub image_id: String,
    pub params: HashMap<String, String>,
}

impl CreateSessionRequest {
    pub fn new(instance_id: impl Into<String>, operation: StreamOperation) -> Self {
        Self {
            instance_id: instance_id.into(),
            agent_id: None,
            operation,
            container_id: String::new(),
            image_id: String::new(),
            params: HashMap::new(),
        }
    }

    pub fn container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    pub fn image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = image_id.into();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

struct SessionSenders {
    data: mpsc::Sender<StreamData>,
    error: mpsc::Sender<StreamError>,
    close: mpsc::Sender<CloseReason>,
    input: mpsc::Sender<InputFrame>,
}

/// Client-side receiving ends of a session. Taken once by whoever serves
/// the client.
pub struct SessionOutput {
    pub data: mpsc::Receiver<StreamData>,
    pub error: mpsc::Receiver<StreamError>,
    pub close: mpsc::Receiver<CloseReason>,
}

pub struct StreamSession {
    pub id: String,
    pub instance_id: String,
    pub agent_id: String,
    pub host_id: String,
    pub operation: StreamOperation,
    pub container_id: String,
    pub image_id: String,
    pub params: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    started: Instant,

    senders: Mutex<Option<SessionSenders>>,
    output: Mutex<Option<SessionOutput>>,
    input: Mutex<Option<mpsc::Receiver<InputFrame>>>,

    ready: watch::Sender<bool>,
    cancel: CancellationToken,
    attached: AtomicBool,
    dropped: AtomicU64,
    metrics: Arc<StreamMetrics>,
}

impl StreamSession {
    /// Instant the session was created; recording timestamps are relative to it
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Data frames discarded because the client fell behind
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn sender<T>(
        &self,
        pick: impl FnOnce(&SessionSenders) -> mpsc::Sender<T>,
    ) -> Result<mpsc::Sender<T>> {
        lock(&self.senders)
            .as_ref()
            .map(pick)
            .ok_or_else(|| FleetError::SessionClosed(self.id.clone()))
    }

    /// Deliver an output chunk to the client side.
    ///
    /// Interactive sessions wait for room (yielding only to cancellation);
    /// the others drop the chunk when the channel is full.
    pub async fn send_data(&self, data: StreamData) -> Result<()> {
        let tx = self.sender(|s| s.data.clone())?;

        if self.operation.is_interactive() {
            return tokio::select! {
                _ = self.cancel.cancelled() => Err(FleetError::SessionClosed(self.id.clone())),
                res = tx.send(data) => res.map_err(|_| FleetError::SessionClosed(self.id.clone())),
            };
        }

        match tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.frame_dropped();
                warn!(
                    session_id = %self.id,
                    operation = %self.operation,
                    dropped,
                    "Data channel full, dropping frame"
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::SessionClosed(self.id.clone())),
        }
    }

    /// Report a terminal error. Only the first one is kept.
    pub fn send_error(&self, error: StreamError) -> Result<()> {
        let tx = self.sender(|s| s.error.clone())?;
        match tx.try_send(error) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(error)) => {
                debug!(session_id = %self.id, code = %error.code, "Error already pending, discarding");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::SessionClosed(self.id.clone())),
        }
    }

    /// Report the end of the stream. Only the first one is kept.
    pub fn send_close(&self, reason: CloseReason) -> Result<()> {
        let tx = self.sender(|s| s.close.clone())?;
        match tx.try_send(reason) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(FleetError::SessionClosed(self.id.clone())),
        }
    }

    /// Queue client input for the agent, waiting for room
    pub async fn send_input(&self, frame: InputFrame) -> Result<()> {
        let tx = self.sender(|s| s.input.clone())?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FleetError::SessionClosed(self.id.clone())),
            res = tx.send(frame) => res.map_err(|_| FleetError::SessionClosed(self.id.clone())),
        }
    }

    /// Like [`send_input`](Self::send_input) but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` when the frame was dropped.
    pub async fn send_input_timeout(&self, frame: InputFrame, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.send_input(frame)).await {
            Ok(res) => res.map(|_| true),
            Err(_) => {
                self.metrics.input_dropped();
                warn!(
                    session_id = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Agent is not consuming input, dropping frame"
                );
                Ok(false)
            }
        }
    }

    /// Wait until the agent attached its stream
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let ready = async move {
            rx.wait_for(|ready| *ready)
                .await
                .map(|_| ())
                .map_err(|_| FleetError::SessionClosed(self.id.clone()))
        };

        tokio::select! {
            biased;
            res = tokio::time::timeout(timeout, ready) => match res {
                Ok(res) => res,
                Err(_) => Err(FleetError::AgentNotReady(self.id.clone())),
            },
            _ = self.cancel.cancelled() => Err(FleetError::SessionClosed(self.id.clone())),
        }
    }

    pub fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            debug!(session_id = %self.id, "Session ready");
        }
    }

    /// Claim the agent side of the session. Only the first caller wins.
    pub fn try_attach(&self) -> bool {
        !self.attached.swap(true, Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn take_output(&self) -> Option<SessionOutput> {
        lock(&self.output).take()
    }

    pub fn take_input(&self) -> Option<mpsc::Receiver<InputFrame>> {
        lock(&self.input).take()
    }

    /// Cancel the session and release its senders. Returns `false` if it
    /// was already closed.
    fn close(&self) -> bool {
        self.cancel.cancel();
        lock(&self.senders).take().is_some()
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("operation", &self.operation)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<StreamSession>>,
    dispatcher: Arc<TaskDispatcher>,
    config: SessionConfig,
    metrics: Arc<StreamMetrics>,
}

impl SessionRegistry {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        config: SessionConfig,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            dispatcher,
            config,
            metrics,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Resolve the route for `request` and register a new session for it
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<Arc<StreamSession>> {
        let route = self.dispatcher.resolve(&request.instance_id).await?;

        if let Some(hint) = request.agent_id.as_deref() {
            if hint != route.agent_id {
                return Err(FleetError::InvalidRequest(format!(
                    "instance {} is not managed by agent {}",
                    route.instance_id, hint
                )));
            }
        }

        if !self.dispatcher.is_host_online(&route.host_id).await {
            return Err(FleetError::HostUnreachable(route.host_id));
        }

        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl())
            .map_err(|e| FleetError::Config(format!("invalid session ttl: {}", e)))?;

        let session = loop {
            let id = Uuid::new_v4().to_string();
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    warn!(session_id = %id, "Session ID collision, regenerating");
                    continue;
                }
                Entry::Vacant(entry) => {
                    let session = Arc::new(self.build_session(
                        id,
                        &request,
                        route.agent_id.clone(),
                        route.host_id.clone(),
                        created_at,
                        created_at + ttl,
                    ));
                    entry.insert(session.clone());
                    break session;
                }
            }
        };

        self.metrics.session_created();
        info!(
            session_id = %session.id,
            instance_id = %session.instance_id,
            host_id = %session.host_id,
            operation = %session.operation,
            "Stream session created"
        );
        Ok(session)
    }

    fn build_session(
        &self,
        id: String,
        request: &CreateSessionRequest,
        agent_id: String,
        host_id: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StreamSession {
        let (data_tx, data_rx) = mpsc::channel(self.config.data_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (input_tx, input_rx) = mpsc::channel(self.config.input_capacity.max(1));
        let (ready, _) = watch::channel(false);

        StreamSession {
            id,
            instance_id: request.instance_id.clone(),
            agent_id,
            host_id,
            operation: request.operation,
            container_id: request.container_id.clone(),
            image_id: request.image_id.clone(),
            params: request.params.clone(),
            created_at,
            expires_at,
            started: Instant::now(),
            senders: Mutex::new(Some(SessionSenders {
                data: data_tx,
                error: error_tx,
                close: close_tx,
                input: input_tx,
            })),
            output: Mutex::new(Some(SessionOutput {
                data: data_rx,
                error: error_rx,
                close: close_rx,
            })),
            input: Mutex::new(Some(input_rx)),
            ready,
            cancel: CancellationToken::new(),
            attached: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            metrics: self.metrics.clone(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Fetch a session that is still usable
    pub fn lookup(&self, id: &str) -> Result<Arc<StreamSession>> {
        let session = self
            .get(id)
            .ok_or_else(|| FleetError::SessionNotFound(id.to_string()))?;
        if session.is_expired(Utc::now()) || session.is_closed() {
            return Err(FleetError::SessionExpired(id.to_string()));
        }
        Ok(session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close and remove a session. Safe to call any number of times.
    pub fn close_session(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        if session.close() {
            self.metrics.session_closed();
            info!(
                session_id = %id,
                dropped_frames = session.dropped_frames(),
                "Stream session closed"
            );
        }
        true
    }

    /// Close every session whose TTL elapsed at `now`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| s.is_expired(now)) {
                session.close();
                self.metrics.session_expired();
                debug!(session_id = %id, "Expired session swept");
                swept += 1;
            }
        }
        swept
    }
}

/// Closes its session when dropped
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close_session(&self.session_id);
    }
}
