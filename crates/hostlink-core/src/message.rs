//! Message records exchanged between a session and its remote scripts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handle identifying a script within its session, assigned by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptHandle(pub u32);

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind discriminator carried by every message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentMessageKind {
    /// Payload addressed to or emitted by a script.
    Script,
    /// Payload belonging to the debugger channel.
    Debugger,
}

/// Raised when a record carries a kind value this client does not know.
#[derive(Debug, Error)]
#[error("unknown message kind: {0}")]
pub struct UnknownMessageKind(pub u32);

impl From<AgentMessageKind> for u32 {
    fn from(kind: AgentMessageKind) -> Self {
        match kind {
            AgentMessageKind::Script => 1,
            AgentMessageKind::Debugger => 2,
        }
    }
}

impl TryFrom<u32> for AgentMessageKind {
    type Error = UnknownMessageKind;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Script),
            2 => Ok(Self::Debugger),
            other => Err(UnknownMessageKind(other)),
        }
    }
}

/// Wire shape of a message record: `(kind, script, text, has_data, data)`.
type RecordTuple = (u32, u32, String, bool, Vec<u8>);

/// The atomic, immutable unit exchanged between a session and a script.
///
/// `text` is a JSON-encoded payload; `data` is an optional out-of-band
/// binary payload whose presence is flagged by `has_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordTuple", into = "RecordTuple")]
pub struct AgentMessageRecord {
    pub kind: AgentMessageKind,
    pub script: ScriptHandle,
    pub text: String,
    pub has_data: bool,
    pub data: Bytes,
}

impl AgentMessageRecord {
    /// Build a script-kind record carrying `text` and an optional binary payload.
    #[must_use]
    pub fn script_message(script: ScriptHandle, text: String, data: Option<Bytes>) -> Self {
        let has_data = data.is_some();
        Self {
            kind: AgentMessageKind::Script,
            script,
            text,
            has_data,
            data: data.unwrap_or_default(),
        }
    }

    /// Size estimate used for outbound batching: payload text plus binary length.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        self.text.len() + self.data.len()
    }
}

impl TryFrom<RecordTuple> for AgentMessageRecord {
    type Error = UnknownMessageKind;

    fn try_from((kind, script, text, has_data, data): RecordTuple) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: AgentMessageKind::try_from(kind)?,
            script: ScriptHandle(script),
            text,
            has_data,
            data: Bytes::from(data),
        })
    }
}

impl From<AgentMessageRecord> for RecordTuple {
    fn from(record: AgentMessageRecord) -> Self {
        (
            record.kind.into(),
            record.script.0,
            record.text,
            record.has_data,
            record.data.to_vec(),
        )
    }
}

/// Type tag of the JSON payloads a script emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Send,
    Error,
    Log,
}

/// Severity of a log record emitted by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}
