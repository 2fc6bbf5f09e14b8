//! Error taxonomy for the session layer.

use serde_json::{Map, Value};
use thiserror::Error;

use hostlink_transport::{BusError, PeerConnectionError};

/// The host could not be reached or refused the handshake.
#[derive(Debug, Error)]
#[error("unable to connect to host: {0}")]
pub struct ConnectionError(#[from] pub BusError);

/// Attaching to a process failed.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("no such process: {0}")]
    ProcessNotFound(u32),
    #[error("permission denied attaching to process {0}")]
    PermissionDenied(u32),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("unable to attach: {0}")]
    Bus(#[from] BusError),
}

/// An operation on a session failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is detached; it cannot be used again.
    #[error("session is gone")]
    Gone,
    /// A transport handoff failed. Local state was rolled back.
    #[error("transport migration failed: {0}")]
    Migration(String),
    #[error(transparent)]
    Peer(#[from] PeerConnectionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// An operation on a script failed.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("unable to create script: {0}")]
    Create(#[source] BusError),
    #[error("unable to load script: {0}")]
    Load(#[source] BusError),
    #[error("unable to unload script: {0}")]
    Unload(#[source] BusError),
    #[error("unable to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// The script is destroyed; pending and future calls settle with this.
    #[error("script is destroyed")]
    Destroyed,
    /// The owning session is gone.
    #[error("session is gone")]
    SessionGone,
    /// The name collides with result-chaining methods and is not callable.
    #[error("'{0}' is a reserved method name")]
    ReservedMethodName(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// An exception reported by the remote side of an RPC call, rebuilt from the
/// `(message, name, stack, properties)` it sent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RpcError {
    pub message: String,
    pub name: Option<String>,
    pub stack: Option<String>,
    pub properties: Map<String, Value>,
}
