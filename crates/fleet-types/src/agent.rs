//! Agent wire protocol
//!
//! Agents keep one control WebSocket per host open to the control plane and
//! open one stream WebSocket per session they attach to. Both carry one JSON
//! object per text frame.

use super::{DataType, InputFrame, StreamOperation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Work item handed to an agent. The task ID is the session ID the agent
/// must attach its stream to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub task_type: StreamOperation,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Control plane -> agent control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Task(AgentTask),
    Pong,
}

/// Agent -> control plane control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Ping,
    /// The agent could not start the task (container gone, operation unsupported)
    TaskRejected { task_id: String, message: String },
}

/// Frames carried on a per-session agent stream, in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    // agent -> control plane
    Data {
        data_type: DataType,
        data: String,
    },
    Error {
        code: String,
        message: String,
    },
    Exit {
        #[serde(default)]
        exit_code: Option<i32>,
    },

    // control plane -> agent
    Stdin {
        data: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
}

impl From<InputFrame> for AgentFrame {
    fn from(frame: InputFrame) -> Self {
        match frame {
            InputFrame::Stdin { data } => AgentFrame::Stdin { data },
            InputFrame::Resize { rows, cols } => AgentFrame::Resize { rows, cols },
        }
    }
}
