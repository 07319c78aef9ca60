//! Agent-facing WebSocket endpoints
//!
//! `/agent/connect` is the per-host control channel that receives tasks.
//! `/agent/stream/:session_id` carries the frames of one session.

use super::{ApiError, ApiResult};
use crate::extractors::AgentAuth;
use crate::services::stream_adapter;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use fleet_core::ports::InstanceDirectory;
use fleet_core::{AgentFrame, ControlEvent, ControlMessage, FleetError, StreamError};
use futures::{future, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error code delivered to a session whose task the agent refused
pub const TASK_REJECTED: &str = "TASK_REJECTED";

pub async fn connect(
    State(state): State<AppState>,
    agent: AgentAuth,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let record = state
        .db
        .get_agent(&agent.agent_id)
        .await?
        .ok_or_else(|| FleetError::AgentNotFound(agent.agent_id.clone()))?;

    Ok(ws.on_upgrade(move |socket| handle_control(socket, state, record.id, record.host_id)))
}

async fn handle_control(socket: WebSocket, state: AppState, agent_id: String, host_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    state
        .connections
        .register_host(&host_id, &connection_id, tx.clone())
        .await;
    if let Err(e) = state.db.touch_agent(&agent_id).await {
        warn!("Failed to update last_seen for agent {}: {}", agent_id, e);
    }

    // Forward control messages from the channel to the socket
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode control message: {}", e),
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlEvent>(&text) {
                Ok(ControlEvent::Ping) => {
                    let _ = tx.send(ControlMessage::Pong);
                    if let Err(e) = state.db.touch_agent(&agent_id).await {
                        debug!("Failed to update last_seen for agent {}: {}", agent_id, e);
                    }
                }
                Ok(ControlEvent::TaskRejected { task_id, message }) => {
                    reject_task(&state, &host_id, &task_id, message);
                }
                Err(e) => warn!("Agent {} sent an unknown control message: {}", agent_id, e),
            },
            Ok(Message::Close(_)) => {
                info!("Agent {} closed its control connection", agent_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Agent {} control connection error: {}", agent_id, e);
                break;
            }
        }
    }

    state
        .connections
        .unregister_host(&host_id, &connection_id)
        .await;
    drop(tx);
    forward_task.abort();
}

fn reject_task(state: &AppState, host_id: &str, task_id: &str, message: String) {
    let Some(session) = state.registry.get(task_id) else {
        debug!("Rejected task {} has no live session", task_id);
        return;
    };
    if session.host_id != host_id {
        warn!(
            "Host {} tried to reject task {} owned by host {}",
            host_id, task_id, session.host_id
        );
        return;
    }

    warn!(session_id = %task_id, "Agent rejected task: {}", message);
    let _ = session.send_error(StreamError::new(TASK_REJECTED, message));
    state.registry.close_session(task_id);
}

pub async fn stream(
    State(state): State<AppState>,
    agent: AgentAuth,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = state.registry.lookup(&session_id)?;
    if session.agent_id != agent.agent_id {
        return Err(ApiError::unauthorized("Session belongs to another agent"));
    }
    if session.is_attached() {
        return Err(FleetError::AlreadyAttached(session_id).into());
    }

    // The claim waits for a completed upgrade so a failed handshake leaves
    // the session attachable
    Ok(ws.on_upgrade(move |socket| async move {
        if !session.try_attach() {
            debug!(session_id = %session.id, "Stream already attached, dropping socket");
            return;
        }
        session.mark_ready();

        let (sink, stream) = socket.split();
        let frames_in = Box::pin(
            stream
                .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
                .filter_map(|msg| {
                    future::ready(match msg {
                        Ok(Message::Text(text)) => match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => Some(Ok(frame)),
                            Err(e) => {
                                warn!("Dropping malformed agent frame: {}", e);
                                None
                            }
                        },
                        Ok(_) => None,
                        Err(e) => Some(Err(FleetError::Transport(e.to_string()))),
                    })
                }),
        );
        let frames_out = sink
            .sink_map_err(|e| FleetError::Transport(e.to_string()))
            .with(|frame: AgentFrame| {
                future::ready(
                    serde_json::to_string(&frame)
                        .map(Message::Text)
                        .map_err(FleetError::from),
                )
            });

        stream_adapter::run(session, frames_in, frames_out).await;
    }))
}
