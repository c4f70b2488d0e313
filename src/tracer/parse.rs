//! Decoding of replayed trace lines.
//!
//! Each non-blank line is one JSON object: either a decoded event record or
//! a lost-event report emitted by the trace session. Blank lines and lines
//! starting with `#` carry nothing and decode to [`ReplayLine::Skip`].

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use super::event::{EventRecord, FieldValue, Provider};

/// Errors that can occur while decoding a replay line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("record has neither an event nor a lost report")]
    Empty,
}

/// One decoded replay line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayLine {
    Event(EventRecord),
    /// Events and buffers the OS reported as lost since the previous report.
    Lost { events: u64, buffers: u64 },
    Skip,
}

#[derive(Deserialize)]
struct RawLine {
    provider: Option<String>,
    #[serde(default)]
    id: u16,
    #[serde(default)]
    opcode: u8,
    #[serde(default)]
    version: u8,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    tid: u32,
    #[serde(default)]
    ts: u64,
    #[serde(default)]
    task: String,
    #[serde(default)]
    fields: HashMap<String, FieldValue>,
    lost: Option<RawLost>,
}

#[derive(Deserialize)]
struct RawLost {
    #[serde(default)]
    events: u64,
    #[serde(default)]
    buffers: u64,
}

/// Parse one line of a replay file.
pub fn parse_line(line: &str) -> Result<ReplayLine, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(ReplayLine::Skip);
    }

    let raw: RawLine = serde_json::from_str(trimmed)?;

    if let Some(lost) = raw.lost {
        return Ok(ReplayLine::Lost {
            events: lost.events,
            buffers: lost.buffers,
        });
    }

    let name = raw.provider.ok_or(ParseError::Empty)?;
    let provider =
        Provider::from_str(&name).ok_or(ParseError::UnknownProvider { name: name.clone() })?;

    Ok(ReplayLine::Event(EventRecord {
        provider,
        id: raw.id,
        opcode: raw.opcode,
        version: raw.version,
        pid: raw.pid,
        tid: raw.tid,
        timestamp: raw.ts,
        task: raw.task,
        fields: raw.fields,
    }))
}
