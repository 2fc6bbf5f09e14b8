//! The bus boundary: an opaque bidirectional call/event channel reaching the
//! instrumentation host.
//!
//! Implementations wrap whatever wire protocol actually reaches the host; the
//! session layer only depends on these traits. One `HostConnection` is shared
//! by every session of a client; each session additionally holds its own
//! `AgentTransport`, which is the handle replaced during transport migration.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use hostlink_core::{
    AgentMessageRecord, AttachOptions, Crash, DetachReason, PeerOptions, ProcessInfo,
    ProcessQueryOptions, ScriptHandle, ScriptOptions, SessionHandle,
};

/// Failure reported by the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The underlying connection is gone.
    #[error("connection closed")]
    Closed,
    /// The remote side rejected the call with a named error.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    /// The transport failed to carry the call.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The remote side sent something this client cannot interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Events delivered by a live host connection.
#[derive(Debug)]
pub enum HostEvent {
    /// The host reports that a session detached.
    SessionDetached {
        id: SessionHandle,
        reason: DetachReason,
        crash: Option<Crash>,
    },
    /// The underlying stream closed; every session loses its transport.
    Closed,
}

/// Connectivity candidate notifications emitted by a session's transport
/// during peer negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSignal {
    NewCandidates(Vec<String>),
    GatheringDone,
}

/// Factory for host connections. One `connect` call corresponds to one
/// physical connection (including any authentication handshake).
#[async_trait]
pub trait HostBus: Send + Sync {
    /// Establish a connection to the host.
    ///
    /// # Errors
    /// Returns an error if the host is unreachable or authentication fails.
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn HostConnection>, mpsc::UnboundedReceiver<HostEvent>), BusError>;
}

/// A live connection to the instrumentation host.
#[async_trait]
pub trait HostConnection: Send + Sync {
    /// Query the processes visible to the host.
    ///
    /// # Errors
    /// Returns an error if the host rejects the query or the call fails.
    async fn enumerate_processes(
        &self,
        options: &ProcessQueryOptions,
    ) -> Result<Vec<ProcessInfo>, BusError>;

    /// Open a session against `pid`.
    ///
    /// # Errors
    /// Returns an error if the process does not exist or access is denied.
    async fn attach(&self, pid: u32, options: &AttachOptions) -> Result<SessionHandle, BusError>;

    /// Re-open an interrupted session identified by its stable handle.
    ///
    /// # Errors
    /// Returns an error if the session expired or the call fails.
    async fn reattach(&self, id: &SessionHandle) -> Result<(), BusError>;

    /// Bind a call handle to the session identified by `id`.
    ///
    /// # Errors
    /// Returns an error if the session is unknown or the call fails.
    async fn link_session(&self, id: &SessionHandle) -> Result<Arc<dyn AgentTransport>, BusError>;

    /// Expose `sink` as the inbound message endpoint for session `id`.
    fn register_sink(&self, id: &SessionHandle, sink: Arc<dyn MessageSink>);
}

/// Per-session call surface. Exactly one of these is active per session at
/// any instant; migration atomically replaces it.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Close the remote session.
    ///
    /// # Errors
    /// Returns an error if the call fails; callers closing best-effort swallow it.
    async fn close(&self) -> Result<(), BusError>;

    /// Resume a re-attached session, reporting the highest inbound batch id
    /// this client has processed. Returns the highest batch id the remote
    /// side had transmitted (`0` if none).
    ///
    /// # Errors
    /// Returns an error if the session cannot be resumed.
    async fn resume(&self, last_rx_batch_id: u32) -> Result<u32, BusError>;

    /// Create a script from source, returning its handle.
    ///
    /// # Errors
    /// Returns an error if the remote side rejects the script.
    async fn create_script(
        &self,
        source: &str,
        options: &ScriptOptions,
    ) -> Result<ScriptHandle, BusError>;

    /// Destroy a script.
    ///
    /// # Errors
    /// Returns an error if the remote side rejects the destroy.
    async fn destroy_script(&self, id: ScriptHandle) -> Result<(), BusError>;

    /// Load a created script into the target process.
    ///
    /// # Errors
    /// Returns an error if the remote side rejects the load.
    async fn load_script(&self, id: ScriptHandle) -> Result<(), BusError>;

    /// Deliver a batch of outbound records. `batch_id` is `0` for
    /// fire-and-forget batches and the last record's serial otherwise.
    ///
    /// # Errors
    /// Returns an error if the batch was not acknowledged.
    async fn post_messages(
        &self,
        records: &[AgentMessageRecord],
        batch_id: u32,
    ) -> Result<(), BusError>;

    /// Offer a peer connection, returning the remote answer SDP.
    ///
    /// # Errors
    /// Returns an error if the host rejects the offer.
    async fn offer_peer_connection(
        &self,
        offer_sdp: &str,
        options: &PeerOptions,
    ) -> Result<String, BusError>;

    /// Forward local connectivity candidates to the host.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    async fn add_candidates(&self, candidate_sdps: &[String]) -> Result<(), BusError>;

    /// Tell the host that local candidate gathering finished.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    async fn notify_candidate_gathering_done(&self) -> Result<(), BusError>;

    /// Ask the remote session to start buffering for a transport handoff.
    ///
    /// # Errors
    /// Returns an error if migration cannot begin.
    async fn begin_migration(&self) -> Result<(), BusError>;

    /// Finalize a transport handoff previously begun.
    ///
    /// # Errors
    /// Returns an error if migration cannot be committed.
    async fn commit_migration(&self) -> Result<(), BusError>;

    /// Subscribe to connectivity candidates announced by the remote side.
    fn subscribe_candidates(&self) -> mpsc::UnboundedReceiver<CandidateSignal>;
}

/// Inbound sink this core exposes so the bus can deliver message batches
/// into a session.
pub trait MessageSink: Send + Sync {
    fn post_messages(&self, records: Vec<AgentMessageRecord>, batch_id: u32);
}
