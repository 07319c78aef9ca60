//! Terminal recording types (asciinema v2)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Storage format of every terminal recording
pub const RECORDING_FORMAT: &str = "asciinema";

/// asciicast schema version written in every header
pub const CAST_VERSION: u8 = 2;

/// Durable metadata of one recorded terminal session.
///
/// `end_time`, `duration`, `storage_path` and `file_size` stay `None` until the
/// session is finalized, and are written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecording {
    pub id: String,
    pub session_id: String,
    pub instance_id: String,
    pub container_id: String,
    pub user_id: String,
    pub username: String,
    pub client_ip: Option<String>,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds
    pub duration: Option<f64>,
    pub format: String,
    pub storage_path: Option<String>,
    pub file_size: Option<i64>,
}

impl TerminalRecording {
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Final values written when a recording is persisted
#[derive(Debug, Clone)]
pub struct RecordingCompletion {
    pub end_time: DateTime<Utc>,
    pub duration: f64,
    pub storage_path: String,
    pub file_size: i64,
}

/// Frame direction code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "o")]
    Output,
    #[serde(rename = "i")]
    Input,
}

/// One captured event, serialized as `[elapsed, "o"|"i", data]`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingFrame {
    /// Seconds since the session started
    pub elapsed: f64,
    pub direction: Direction,
    pub data: String,
}

impl Serialize for RecordingFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.elapsed, self.direction, &self.data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecordingFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (elapsed, direction, data) = <(f64, Direction, String)>::deserialize(deserializer)?;
        Ok(Self {
            elapsed,
            direction,
            data,
        })
    }
}

/// First line of an asciicast v2 file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    /// Unix seconds of session creation
    pub timestamp: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CastHeader {
    pub fn new(width: u16, height: u16, timestamp: i64, title: String, shell: &str) -> Self {
        let mut env = HashMap::new();
        env.insert("SHELL".to_string(), shell.to_string());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        Self {
            version: CAST_VERSION,
            width,
            height,
            timestamp,
            title,
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_serializes_as_tuple() {
        let frame = RecordingFrame {
            elapsed: 1.5,
            direction: Direction::Input,
            data: "ls\n".to_string(),
        };
        assert_eq!(serde_json::to_string(&frame).unwrap(), r#"[1.5,"i","ls\n"]"#);

        let parsed: RecordingFrame = serde_json::from_str(r#"[0.25,"o","file1\n"]"#).unwrap();
        assert_eq!(parsed.direction, Direction::Output);
        assert_eq!(parsed.data, "file1\n");
    }

    #[test]
    fn test_header_carries_shell_env() {
        let header = CastHeader::new(80, 24, 1_700_000_000, "web1".to_string(), "/bin/sh");
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["width"], 80);
        assert_eq!(value["env"]["SHELL"], "/bin/sh");
    }
}
