//! Client-side session and messaging layer for instrumentation hosts.
//!
//! This crate provides the core protocol layer:
//! - `Client` - Entry point owning the shared host connection
//! - `Session` - The attached/interrupted/detached state machine with
//!   ordered, at-least-once outbound delivery across reconnection and
//!   transport migration (including the peer-to-peer fallback)
//! - `Script` - One loaded unit of remote code with a request/response
//!   call boundary on top of free-form messages

pub mod client;
mod delivery;
pub mod errors;
mod peer_link;
pub mod script;
pub mod session;

pub use client::{Client, ClientOptions};
pub use errors::{AttachError, ConnectionError, RpcError, ScriptError, SessionError};
pub use script::{RpcResult, Script, ScriptExports};
pub use session::{Session, SessionState};

pub use hostlink_core::{
    AgentMessageKind, AgentMessageRecord, AttachOptions, Crash, DetachReason, LogLevel,
    MessageType, PeerOptions, ProcessInfo, ProcessQueryOptions, Realm, Relay, RelayKind, Scope,
    ScriptHandle, ScriptOptions, ScriptRuntime, SessionHandle, Signal,
};
