//! Core value types for the hostlink session layer.
//!
//! This crate provides the leaf building blocks shared by the transport
//! boundary and the session layer:
//! - `Signal` - Typed publish/subscribe with deterministic delivery
//! - `AgentMessageRecord` - The atomic unit exchanged with remote scripts
//! - Session/process value types (handles, detach reasons, crash info)

pub mod message;
pub mod signal;
pub mod types;

pub use message::{AgentMessageKind, AgentMessageRecord, LogLevel, MessageType, ScriptHandle};
pub use signal::{HandlerId, Signal};
pub use types::{
    AttachOptions, Crash, DetachReason, PeerOptions, ProcessInfo, ProcessQueryOptions, Realm,
    Relay, RelayKind, Scope, ScriptOptions, ScriptRuntime, SessionHandle,
};
