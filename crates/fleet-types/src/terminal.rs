//! Terminal WebSocket control protocol (browser <-> gateway)

use serde::{Deserialize, Serialize};

/// Client -> gateway messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Ping,
}

/// Gateway -> client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerMessage {
    Output { data: String },
    Error { code: String, message: String },
    Pong,
    Exit { exit_code: i32 },
}
