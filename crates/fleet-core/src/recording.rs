//! asciicast v2 codec
//!
//! A recording is one JSON header line followed by one JSON array per frame.
//! [`CastBuffer`] builds the file in memory while a session runs and
//! [`CastReader`] streams it back line by line.

use crate::{FleetError, Result};
use fleet_types::{CastHeader, Direction, RecordingFrame};
use std::io::BufRead;

/// In-memory asciicast document.
///
/// The header is written once at construction. Frames are append-only and
/// their timestamps never go backwards.
#[derive(Debug)]
pub struct CastBuffer {
    bytes: Vec<u8>,
    last_elapsed: f64,
    frames: usize,
    max_bytes: Option<usize>,
    truncated: bool,
}

impl CastBuffer {
    pub fn new(header: &CastHeader, max_bytes: Option<usize>) -> Result<Self> {
        let mut bytes = serde_json::to_vec(header)?;
        bytes.push(b'\n');
        Ok(Self {
            bytes,
            last_elapsed: 0.0,
            frames: 0,
            max_bytes,
            truncated: false,
        })
    }

    /// Append a frame. Returns `false` if it was dropped because the buffer
    /// reached its cap.
    pub fn push(&mut self, elapsed: f64, direction: Direction, data: &str) -> Result<bool> {
        if self.truncated {
            return Ok(false);
        }

        // Clock reads from two relay tasks can race; keep the file monotonic.
        let elapsed = if elapsed < self.last_elapsed {
            self.last_elapsed
        } else {
            elapsed
        };

        let frame = RecordingFrame {
            elapsed: round_micros(elapsed),
            direction,
            data: data.to_string(),
        };
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');

        if let Some(max) = self.max_bytes {
            if self.bytes.len() + line.len() > max {
                self.truncated = true;
                return Ok(false);
            }
        }

        self.bytes.extend_from_slice(&line);
        self.last_elapsed = elapsed;
        self.frames += 1;
        Ok(true)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

fn round_micros(secs: f64) -> f64 {
    (secs * 1_000_000.0).round() / 1_000_000.0
}

/// Streaming reader over a stored asciicast file
pub struct CastReader<R> {
    header: CastHeader,
    lines: std::io::Lines<R>,
}

impl<R: BufRead> CastReader<R> {
    /// Read and validate the header line
    pub fn new(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let first = lines
            .next()
            .ok_or_else(|| FleetError::Recording("empty recording".to_string()))??;
        let header: CastHeader = serde_json::from_str(&first)?;
        if header.version != fleet_types::CAST_VERSION {
            return Err(FleetError::Recording(format!(
                "unsupported asciicast version {}",
                header.version
            )));
        }
        Ok(Self { header, lines })
    }

    pub fn header(&self) -> &CastHeader {
        &self.header
    }
}

impl<R: BufRead> Iterator for CastReader<R> {
    type Item = Result<RecordingFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(FleetError::from));
        }
    }
}

/// Parse a whole recording held in memory
pub fn parse_cast(bytes: &[u8]) -> Result<(CastHeader, Vec<RecordingFrame>)> {
    let reader = CastReader::new(bytes)?;
    let header = reader.header().clone();
    let frames = reader.collect::<Result<Vec<_>>>()?;
    Ok((header, frames))
}
