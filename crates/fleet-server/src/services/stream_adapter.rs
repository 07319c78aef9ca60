//! Remote stream adapter
//!
//! Pumps one agent stream into a session: agent frames go to the session's
//! output channels, client input (exec only) goes back to the agent.

use crate::services::StreamSession;
use fleet_core::{
    AgentFrame, CloseReason, FleetError, InputFrame, Result, StreamData, StreamError,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay until the agent finishes, the transport fails or the session is
/// cancelled.
pub async fn run<S, K>(session: Arc<StreamSession>, mut frames_in: S, mut frames_out: K)
where
    S: Stream<Item = Result<AgentFrame>> + Unpin,
    K: Sink<AgentFrame, Error = FleetError> + Unpin,
{
    let cancel = session.cancel_token().child_token();
    let input = if session.operation.is_interactive() {
        let input = session.take_input();
        if input.is_none() {
            warn!(session_id = %session.id, "Input channel already taken, agent gets no input");
        }
        input
    } else {
        None
    };

    info!(session_id = %session.id, operation = %session.operation, "Agent stream attached");

    tokio::join!(
        read_loop(&session, &mut frames_in, &cancel),
        write_loop(&session, input, &mut frames_out, &cancel),
    );

    info!(session_id = %session.id, "Agent stream detached");
}

async fn read_loop<S>(session: &StreamSession, frames_in: &mut S, cancel: &CancellationToken)
where
    S: Stream<Item = Result<AgentFrame>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames_in.next() => next,
        };

        let delivered = match next {
            Some(Ok(AgentFrame::Data { data_type, data })) => {
                session.send_data(StreamData::new(data_type, data)).await
            }
            Some(Ok(AgentFrame::Error { code, message })) => {
                warn!(session_id = %session.id, code = %code, "Agent reported error: {}", message);
                let _ = session.send_error(StreamError::new(code, message));
                break;
            }
            Some(Ok(AgentFrame::Exit { exit_code })) => {
                debug!(session_id = %session.id, ?exit_code, "Agent finished");
                let _ = session.send_close(CloseReason::completed(exit_code));
                break;
            }
            Some(Ok(other)) => {
                debug!(session_id = %session.id, "Ignoring unexpected agent frame: {:?}", other);
                Ok(())
            }
            Some(Err(e)) => {
                warn!(session_id = %session.id, "Agent stream failed: {}", e);
                let _ = session.send_error(StreamError::new(e.code(), e.to_string()));
                break;
            }
            None => {
                let _ = session.send_close(CloseReason::completed(None));
                break;
            }
        };

        if delivered.is_err() {
            debug!(session_id = %session.id, "Session closed, stopping agent read loop");
            break;
        }
    }

    cancel.cancel();
}

async fn write_loop<K>(
    session: &StreamSession,
    input: Option<mpsc::Receiver<InputFrame>>,
    frames_out: &mut K,
    cancel: &CancellationToken,
) where
    K: Sink<AgentFrame, Error = FleetError> + Unpin,
{
    let Some(mut input) = input else {
        return;
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = input.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = frames_out.send(AgentFrame::from(frame)) => sent,
        };
        if let Err(e) = sent {
            warn!(session_id = %session.id, "Failed to forward input to agent: {}", e);
            let _ = session.send_error(StreamError::new(e.code(), e.to_string()));
            cancel.cancel();
            break;
        }
    }
}
