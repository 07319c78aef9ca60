//! Terminal WebSocket gateway
//!
//! Bridges a browser terminal to an exec session. Every check happens before
//! the upgrade so a rejected client gets a plain HTTP status. After the
//! upgrade three tasks share one cancellation token: the output relay, the
//! input relay and the heartbeat monitor. Whichever ends first cancels the
//! others, then the recording is finalized and the session closed.

use super::{ApiError, ApiResult};
use crate::extractors::{authorize, request_token};
use crate::services::{PrincipalKind, SessionOutput, SessionRecording, StreamSession};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Uri},
    response::Response,
};
use fleet_core::{
    Direction, FleetError, InputFrame, StreamOperation, TerminalClientMessage,
    TerminalServerMessage,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type Outbox = mpsc::UnboundedSender<TerminalServerMessage>;

pub async fn handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = state.registry.lookup(&session_id)?;
    let claims = authorize(&state, request_token(&headers, &uri), PrincipalKind::User)?;

    if session.operation != StreamOperation::Exec {
        return Err(FleetError::InvalidRequest(format!(
            "session {} is not a terminal session",
            session_id
        ))
        .into());
    }
    let output = session
        .take_output()
        .ok_or_else(|| ApiError::conflict("Terminal already connected"))?;

    info!(
        session_id = %session.id,
        user_id = %claims.sub,
        "Terminal client connecting"
    );
    Ok(ws.on_upgrade(move |socket| run_gateway(socket, state, session, output)))
}

async fn run_gateway(
    socket: WebSocket,
    state: AppState,
    session: Arc<StreamSession>,
    output: SessionOutput,
) {
    let (ws_sink, ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<TerminalServerMessage>();
    let writer = tokio::spawn(write_socket(ws_sink, rx));

    let cancel = session.cancel_token().child_token();
    let recording = state.recorder.recording(&session.id);

    match session
        .wait_for_ready(state.config.sessions.ready_timeout())
        .await
    {
        Ok(()) => {
            let _ = tx.send(TerminalServerMessage::Output {
                data: format!("Connected to container {}\r\n", session.container_id),
            });

            let heartbeat = Arc::new(Mutex::new(Instant::now()));
            let output_task = tokio::spawn(relay_output(
                output,
                tx.clone(),
                recording.clone(),
                cancel.clone(),
            ));
            let input_task = tokio::spawn(relay_input(
                ws_stream,
                session.clone(),
                tx.clone(),
                recording,
                heartbeat.clone(),
                cancel.clone(),
                state.config.sessions.input_send_timeout(),
            ));
            let monitor_task = tokio::spawn(monitor_heartbeat(
                session.id.clone(),
                heartbeat,
                tx.clone(),
                cancel.clone(),
                state.config.terminal.heartbeat_interval(),
                state.config.terminal.inactivity_timeout(),
            ));

            cancel.cancelled().await;

            let _ = output_task.await;
            input_task.abort();
            monitor_task.abort();
            let _ = input_task.await;
            let _ = monitor_task.await;
        }
        Err(e) => {
            warn!(session_id = %session.id, "Terminal attach failed: {}", e);
            let _ = tx.send(TerminalServerMessage::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
        }
    }

    state.recorder.finalize(&session.id).await;
    state.registry.close_session(&session.id);

    // Let the writer flush the final error/exit and send the close frame
    drop(tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(session_id = %session.id, "Terminal socket flush timed out");
    }
    info!(session_id = %session.id, "Terminal session ended");
}

async fn write_socket(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<TerminalServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Ok(json) = serde_json::to_string(&msg) {
            if sink.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

fn emit(tx: &Outbox, recording: &Option<Arc<SessionRecording>>, data: String) -> bool {
    if let Some(recording) = recording {
        recording.record_frame(Direction::Output, &data);
    }
    tx.send(TerminalServerMessage::Output { data }).is_ok()
}

/// Agent output -> client. Pending data always goes out before an error or
/// exit message.
async fn relay_output(
    mut output: SessionOutput,
    tx: Outbox,
    recording: Option<Arc<SessionRecording>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            data = output.data.recv() => match data {
                Some(data) => {
                    if !emit(&tx, &recording, data.data) {
                        break;
                    }
                }
                None => {
                    // Session closed under us; report why if the agent said so
                    if let Ok(error) = output.error.try_recv() {
                        let _ = tx.send(TerminalServerMessage::Error {
                            code: error.code,
                            message: error.message,
                        });
                    } else if let Ok(reason) = output.close.try_recv() {
                        let _ = tx.send(TerminalServerMessage::Exit {
                            exit_code: reason.exit_code.unwrap_or(0),
                        });
                    }
                    break;
                }
            },
            Some(error) = output.error.recv() => {
                while let Ok(data) = output.data.try_recv() {
                    emit(&tx, &recording, data.data);
                }
                let _ = tx.send(TerminalServerMessage::Error {
                    code: error.code,
                    message: error.message,
                });
                break;
            },
            Some(reason) = output.close.recv() => {
                while let Ok(data) = output.data.try_recv() {
                    emit(&tx, &recording, data.data);
                }
                let _ = tx.send(TerminalServerMessage::Exit {
                    exit_code: reason.exit_code.unwrap_or(0),
                });
                break;
            },
        }
    }
    cancel.cancel();
}

fn touch(heartbeat: &Mutex<Instant>) {
    *heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
}

/// Client messages -> agent
async fn relay_input(
    mut ws_stream: SplitStream<WebSocket>,
    session: Arc<StreamSession>,
    tx: Outbox,
    recording: Option<Arc<SessionRecording>>,
    heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_stream.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                debug!(session_id = %session.id, "Terminal client disconnected");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session_id = %session.id, "Terminal socket error: {}", e);
                break;
            }
        };

        let frame = match serde_json::from_str::<TerminalClientMessage>(&text) {
            Ok(TerminalClientMessage::Input { data }) => {
                touch(&heartbeat);
                if let Some(recording) = &recording {
                    recording.record_frame(Direction::Input, &data);
                }
                InputFrame::Stdin { data }
            }
            Ok(TerminalClientMessage::Resize { rows, cols }) => {
                touch(&heartbeat);
                InputFrame::Resize { rows, cols }
            }
            Ok(TerminalClientMessage::Ping) => {
                touch(&heartbeat);
                let _ = tx.send(TerminalServerMessage::Pong);
                continue;
            }
            Err(e) => {
                debug!(session_id = %session.id, "Ignoring terminal message: {}", e);
                continue;
            }
        };

        if session.send_input_timeout(frame, send_timeout).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}

async fn monitor_heartbeat(
    session_id: String,
    heartbeat: Arc<Mutex<Instant>>,
    tx: Outbox,
    cancel: CancellationToken,
    every: Duration,
    inactivity_timeout: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let idle = heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if idle > inactivity_timeout {
            let err = FleetError::HeartbeatTimeout(inactivity_timeout.as_secs());
            warn!(session_id = %session_id, "Terminal idle for {:?}, closing", idle);
            let _ = tx.send(TerminalServerMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            });
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::services::{stream_adapter, CreateSessionRequest, RecordingContext, StreamSession};
    use crate::testing::{self, INSTANCE_ID};
    use crate::AppState;
    use fleet_core::ports::RecordingStore;
    use fleet_core::recording::parse_cast;
    use fleet_core::{
        AgentFrame, DataType, Direction, FleetError, StreamOperation, TerminalServerMessage,
    };
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn exec_session(state: &AppState) -> Arc<StreamSession> {
        let session = state
            .registry
            .create_session(
                CreateSessionRequest::new(INSTANCE_ID, StreamOperation::Exec).container("c1"),
            )
            .await
            .unwrap();
        state
            .recorder
            .start(
                &session,
                RecordingContext {
                    user_id: "u1".into(),
                    username: "alice".into(),
                    client_ip: None,
                    shell: "/bin/sh".into(),
                    rows: 24,
                    cols: 80,
                },
            )
            .await
            .unwrap();
        session
    }

    async fn connect(addr: SocketAddr, session_id: &str, token: &str) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/api/v1/terminal/{}/ws?token={}",
            addr, session_id, token
        ))
        .await
        .unwrap();
        ws
    }

    async fn next_message(ws: &mut Client) -> Option<TerminalServerMessage> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await
                .unwrap()?;
            match msg {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn wait_closed(state: &AppState, session_id: &str) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while state.registry.contains(session_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// The gateway finalizes before it closes the session, so once the
    /// session is gone the row must be complete and the file on disk
    async fn assert_finalized(state: &AppState, session_id: &str) {
        wait_closed(state, session_id).await;
        let row = state
            .db
            .get_recording_by_session(session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_finalized());
        let path = row.storage_path.unwrap();
        assert!(tokio::fs::metadata(&path).await.unwrap().is_file());
        assert!(state.recorder.recording(session_id).is_none());
    }

    #[tokio::test]
    async fn test_terminal_round_trip_is_recorded_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;

        // Fake agent: a channel pair standing in for its stream socket
        let (agent_tx, agent_rx) = fmpsc::unbounded();
        let (to_agent_tx, mut to_agent_rx) = fmpsc::unbounded::<AgentFrame>();
        assert!(session.try_attach());
        session.mark_ready();
        tokio::spawn(stream_adapter::run(
            session.clone(),
            agent_rx,
            to_agent_tx.sink_map_err(|e| FleetError::Transport(e.to_string())),
        ));

        let mut ws = connect(addr, &session.id, &app.user_token).await;
        match next_message(&mut ws).await {
            Some(TerminalServerMessage::Output { data }) => assert!(data.contains("Connected")),
            other => panic!("unexpected {:?}", other),
        }

        ws.send(Message::Text(r#"{"type":"input","data":"ls\n"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            to_agent_rx.next().await.unwrap(),
            AgentFrame::Stdin { data: "ls\n".into() }
        );

        agent_tx
            .unbounded_send(Ok(AgentFrame::Data {
                data_type: DataType::Stdout,
                data: "file1\n".into(),
            }))
            .unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            Some(TerminalServerMessage::Output {
                data: "file1\n".into()
            })
        );

        ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_message(&mut ws).await, Some(TerminalServerMessage::Pong));

        agent_tx
            .unbounded_send(Ok(AgentFrame::Exit { exit_code: Some(0) }))
            .unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            Some(TerminalServerMessage::Exit { exit_code: 0 })
        );
        assert_eq!(next_message(&mut ws).await, None);

        wait_closed(&state, &session.id).await;
        let row = state
            .db
            .get_recording_by_session(&session.id)
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_finalized());

        let bytes = tokio::fs::read(row.storage_path.unwrap()).await.unwrap();
        let (header, frames) = parse_cast(&bytes).unwrap();
        assert_eq!(header.env["SHELL"], "/bin/sh");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].direction, Direction::Input);
        assert_eq!(frames[0].data, "ls\n");
        assert_eq!(frames[1].direction, Direction::Output);
        assert_eq!(frames[1].data, "file1\n");
        assert!(frames[1].elapsed >= frames[0].elapsed);
    }

    #[tokio::test]
    async fn test_idle_terminal_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;
        session.mark_ready();

        let mut ws = connect(addr, &session.id, &app.user_token).await;
        assert!(matches!(
            next_message(&mut ws).await,
            Some(TerminalServerMessage::Output { .. })
        ));

        // Stay silent past the inactivity threshold
        match next_message(&mut ws).await {
            Some(TerminalServerMessage::Error { code, .. }) => assert_eq!(code, "SESSION_TIMEOUT"),
            other => panic!("expected timeout error, got {:?}", other),
        }
        assert_eq!(next_message(&mut ws).await, None);

        assert_finalized(&state, &session.id).await;
    }

    #[tokio::test]
    async fn test_client_disconnect_finalizes_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;
        session.mark_ready();

        let mut ws = connect(addr, &session.id, &app.user_token).await;
        assert!(matches!(
            next_message(&mut ws).await,
            Some(TerminalServerMessage::Output { .. })
        ));
        ws.close(None).await.unwrap();

        assert_finalized(&state, &session.id).await;
    }

    #[tokio::test]
    async fn test_agent_error_reaches_client_and_finalizes() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;

        let (agent_tx, agent_rx) = fmpsc::unbounded();
        assert!(session.try_attach());
        session.mark_ready();
        tokio::spawn(stream_adapter::run(
            session.clone(),
            agent_rx,
            futures::sink::drain().sink_map_err(|e| match e {}),
        ));

        let mut ws = connect(addr, &session.id, &app.user_token).await;
        assert!(matches!(
            next_message(&mut ws).await,
            Some(TerminalServerMessage::Output { .. })
        ));

        agent_tx
            .unbounded_send(Ok(AgentFrame::Error {
                code: "EXEC_FAILED".into(),
                message: "no such container".into(),
            }))
            .unwrap();
        match next_message(&mut ws).await {
            Some(TerminalServerMessage::Error { code, message }) => {
                assert_eq!(code, "EXEC_FAILED");
                assert_eq!(message, "no such container");
            }
            other => panic!("expected agent error, got {:?}", other),
        }
        assert_eq!(next_message(&mut ws).await, None);

        assert_finalized(&state, &session.id).await;
    }

    #[tokio::test]
    async fn test_expired_session_is_gone_before_upgrade() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = testing::server_config(tmp.path());
        config.sessions.ttl_secs = 0;
        let app = testing::app_with_config(config).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;

        let url = format!(
            "ws://{}/api/v1/terminal/{}/ws?token={}",
            addr, session.id, app.user_token
        );
        match tokio_tungstenite::connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 410),
            Ok(_) => panic!("expired session was upgraded"),
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[tokio::test]
    async fn test_agent_never_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;

        let mut ws = connect(addr, &session.id, &app.user_token).await;
        match next_message(&mut ws).await {
            Some(TerminalServerMessage::Error { code, .. }) => assert_eq!(code, "AGENT_NOT_READY"),
            other => panic!("expected not-ready error, got {:?}", other),
        }
        assert_eq!(next_message(&mut ws).await, None);
        wait_closed(&state, &session.id).await;
    }

    #[tokio::test]
    async fn test_rejections_happen_before_upgrade() {
        let tmp = tempfile::tempdir().unwrap();
        let app = testing::app(tmp.path()).await;
        let state = app.state.clone();
        let addr = testing::spawn_app(state.clone()).await;
        let session = exec_session(&state).await;

        let status = |url: String| async move {
            match tokio_tungstenite::connect_async(url).await {
                Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
                Ok(_) => 101,
                Err(e) => panic!("unexpected error {}", e),
            }
        };

        let unknown = format!(
            "ws://{}/api/v1/terminal/nope/ws?token={}",
            addr, app.user_token
        );
        assert_eq!(status(unknown).await, 404);

        let no_token = format!("ws://{}/api/v1/terminal/{}/ws", addr, session.id);
        assert_eq!(status(no_token).await, 401);

        let agent_token = testing::agent_token(&state, testing::AGENT_ID);
        let wrong_kind = format!(
            "ws://{}/api/v1/terminal/{}/ws?token={}",
            addr, session.id, agent_token
        );
        assert_eq!(status(wrong_kind).await, 401);
        assert!(state.registry.contains(&session.id));
    }
}
