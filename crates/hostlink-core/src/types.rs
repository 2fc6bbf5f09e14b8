//! Session, process and option value types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque handle identifying a session on the host, stable across
/// reconnection and transport migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a session detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    ApplicationRequested,
    ProcessReplaced,
    ProcessTerminated,
    ConnectionTerminated,
    DeviceLost,
}

/// Raised when a detach notification carries an unknown reason code.
#[derive(Debug, Error)]
#[error("unknown detach reason: {0}")]
pub struct UnknownDetachReason(pub u32);

impl From<DetachReason> for u32 {
    fn from(reason: DetachReason) -> Self {
        match reason {
            DetachReason::ApplicationRequested => 1,
            DetachReason::ProcessReplaced => 2,
            DetachReason::ProcessTerminated => 3,
            DetachReason::ConnectionTerminated => 4,
            DetachReason::DeviceLost => 5,
        }
    }
}

impl TryFrom<u32> for DetachReason {
    type Error = UnknownDetachReason;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ApplicationRequested),
            2 => Ok(Self::ProcessReplaced),
            3 => Ok(Self::ProcessTerminated),
            4 => Ok(Self::ConnectionTerminated),
            5 => Ok(Self::DeviceLost),
            other => Err(UnknownDetachReason(other)),
        }
    }
}

/// Crash details attached to a detach notification when the remote process
/// went down abnormally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crash {
    pub pid: u32,
    pub process_name: String,
    pub summary: String,
    pub report: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Crash {
    /// Decode the wire crash tuple, where an all-zero pid means "no crash".
    #[must_use]
    pub fn from_wire(
        pid: u32,
        process_name: String,
        summary: String,
        report: String,
        parameters: Map<String, Value>,
    ) -> Option<Self> {
        if pid == 0 {
            return None;
        }
        Some(Self {
            pid,
            process_name,
            summary,
            report,
            parameters,
        })
    }
}

/// One process reported by the host's enumeration query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Runtime realm to attach within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
    Native,
    Emulated,
}

/// Options accepted by attach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<Realm>,
    /// Seconds the session may survive a dropped transport; zero or absent
    /// means the session dies with its transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_timeout: Option<u32>,
}

/// Detail level for process enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Minimal,
    Metadata,
    Full,
}

/// Options accepted by process enumeration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessQueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

/// Script engine to run a created script on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRuntime {
    Default,
    Qjs,
    V8,
}

/// Options accepted by script creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ScriptRuntime>,
}

/// Relay flavor for TURN servers used during peer negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayKind {
    TurnUdp,
    TurnTcp,
    TurnTls,
}

/// A TURN relay the peer connection may fall back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub address: String,
    pub username: String,
    pub password: String,
    pub kind: RelayKind,
}

impl Relay {
    /// TURN URL for this relay, e.g. `turn:host:3478?transport=udp`.
    #[must_use]
    pub fn url(&self) -> String {
        match self.kind {
            RelayKind::TurnUdp => format!("turn:{}?transport=udp", self.address),
            RelayKind::TurnTcp => format!("turn:{}?transport=tcp", self.address),
            RelayKind::TurnTls => format!("turns:{}?transport=tcp", self.address),
        }
    }
}

/// Options accepted by peer connection setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stun_server: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relays: Vec<Relay>,
}

/// STUN URL for the given server address.
#[must_use]
pub fn stun_url(address: &str) -> String {
    format!("stun:{address}?transport=udp")
}
