//! Stream session payload types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Operation a stream session relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOperation {
    /// Interactive terminal inside a container
    Exec,
    GetLogs,
    GetStats,
    PullImage,
}

impl StreamOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOperation::Exec => "exec",
            StreamOperation::GetLogs => "get_logs",
            StreamOperation::GetStats => "get_stats",
            StreamOperation::PullImage => "pull_image",
        }
    }

    /// Interactive operations carry client input back to the agent and
    /// must not lose output frames.
    pub fn is_interactive(&self) -> bool {
        matches!(self, StreamOperation::Exec)
    }
}

impl std::fmt::Display for StreamOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exec" => Ok(StreamOperation::Exec),
            "get_logs" => Ok(StreamOperation::GetLogs),
            "get_stats" => Ok(StreamOperation::GetStats),
            "pull_image" => Ok(StreamOperation::PullImage),
            other => Err(format!("unknown stream operation: {}", other)),
        }
    }
}

/// Tag attached to every data chunk flowing from agent to client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Stdout,
    Stderr,
    /// Echo of terminal input
    Stdin,
    Progress,
    Stats,
    Log,
}

/// Agent -> client payload chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamData {
    pub data_type: DataType,
    pub data: String,
}

impl StreamData {
    pub fn new(data_type: DataType, data: impl Into<String>) -> Self {
        Self {
            data_type,
            data: data.into(),
        }
    }
}

/// Terminal error reported for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub code: String,
    pub message: String,
}

impl StreamError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Why a session stream ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    pub reason: String,
    pub exit_code: Option<i32>,
}

impl CloseReason {
    pub const COMPLETED: &'static str = "completed";

    pub fn completed(exit_code: Option<i32>) -> Self {
        Self {
            reason: Self::COMPLETED.to_string(),
            exit_code,
        }
    }
}

/// Client -> agent frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputFrame {
    Stdin { data: String },
    Resize { rows: u16, cols: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_round_trip_through_from_str() {
        for op in [
            StreamOperation::Exec,
            StreamOperation::GetLogs,
            StreamOperation::GetStats,
            StreamOperation::PullImage,
        ] {
            assert_eq!(op.as_str().parse::<StreamOperation>(), Ok(op));
        }
        assert!("attach".parse::<StreamOperation>().is_err());
    }

    #[test]
    fn test_only_exec_is_interactive() {
        assert!(StreamOperation::Exec.is_interactive());
        assert!(!StreamOperation::GetStats.is_interactive());
        assert!(!StreamOperation::GetLogs.is_interactive());
    }
}
