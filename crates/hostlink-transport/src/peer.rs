//! Peer-to-peer negotiation boundary and candidate batching.
//!
//! The ICE/SDP engine itself is an external capability; this module defines
//! the trait surface the session layer drives (create offer, set remote
//! description, add candidate, data channel opened) plus the
//! `IceCandidateQueue` used to batch candidate exchange.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{AgentTransport, MessageSink};

/// Delay candidates are accumulated for before being flushed as one batch.
const CANDIDATE_DEBOUNCE: Duration = Duration::from_millis(10);

/// Failure in peer negotiation or on the data channel.
#[derive(Debug, Error)]
pub enum PeerConnectionError {
    /// No peer negotiation capability was configured on the client.
    #[error("peer connections are not supported by this client")]
    Unsupported,
    /// Offer/answer or candidate exchange failed.
    #[error("unable to establish peer connection: {0}")]
    Negotiation(String),
    /// The data channel failed after negotiation.
    #[error("data channel failure: {0}")]
    DataChannel(String),
    /// The peer connection went away before setup finished.
    #[error("peer connection closed")]
    Closed,
}

/// One ICE server handed to the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// A server requiring no credentials (STUN).
    #[must_use]
    pub fn new(urls: String) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

/// Events surfaced by an in-progress peer connection attempt.
pub enum PeerEvent {
    /// A local connectivity candidate became available.
    LocalCandidate(String),
    /// Local candidate gathering finished.
    LocalGatheringDone,
    /// The data channel opened; the session can now bind a transport to it.
    ChannelOpen(Arc<dyn PeerChannel>),
    /// The data channel failed.
    ChannelError(String),
    /// The peer connection dropped.
    Disconnected,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(sdp) => f.debug_tuple("LocalCandidate").field(sdp).finish(),
            Self::LocalGatheringDone => f.write_str("LocalGatheringDone"),
            Self::ChannelOpen(_) => f.write_str("ChannelOpen(..)"),
            Self::ChannelError(message) => f.debug_tuple("ChannelError").field(message).finish(),
            Self::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Opens peer connections. Configured once per client.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    /// Start a peer connection attempt against the given ICE servers.
    ///
    /// # Errors
    /// Returns an error if the negotiation engine cannot be started.
    async fn open(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerConnectionError>;
}

/// One peer connection attempt, driven by the session layer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce the local offer SDP (setting the local description).
    ///
    /// # Errors
    /// Returns an error if offer creation fails.
    async fn create_offer(&self) -> Result<String, PeerConnectionError>;

    /// Apply the remote answer SDP.
    ///
    /// # Errors
    /// Returns an error if the answer is rejected.
    async fn set_remote_description(&self, answer_sdp: &str) -> Result<(), PeerConnectionError>;

    /// Feed one remote connectivity candidate into the engine.
    ///
    /// # Errors
    /// Returns an error if the candidate is rejected.
    async fn add_remote_candidate(&self, candidate_sdp: &str) -> Result<(), PeerConnectionError>;

    /// Signal that the remote side finished gathering candidates.
    ///
    /// # Errors
    /// Returns an error if the engine rejects the notification.
    async fn end_of_remote_candidates(&self) -> Result<(), PeerConnectionError>;

    /// Tear the connection down. Safe to call more than once.
    fn close(&self);
}

/// An opened data channel, ready to carry a session transport.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Bind an agent transport to the channel and expose `sink` as the
    /// inbound message endpoint on it.
    ///
    /// # Errors
    /// Returns an error if the channel handshake fails.
    async fn open_session(
        &self,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Arc<dyn AgentTransport>, PeerConnectionError>;
}

/// What an `IceCandidateQueue` delivers to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateBatch {
    /// Candidates accumulated during one debounce window.
    Add(Vec<String>),
    /// Gathering finished; sent at most once, after any pending batch.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatheringState {
    Gathering,
    Gathered,
    Notified,
}

struct QueueInner {
    session_started: bool,
    gathering: GatheringState,
    pending: Vec<String>,
    timer_generation: u64,
    timer_armed: bool,
}

/// Batches connectivity candidates instead of forwarding them one-by-one.
///
/// Candidates accumulate until a short debounce window elapses, and nothing
/// is delivered before `notify_session_started` (descriptions exchanged).
/// A `None` candidate marks gathering complete; the terminal
/// [`CandidateBatch::Done`] is delivered exactly once.
#[derive(Clone)]
pub struct IceCandidateQueue {
    inner: Arc<Mutex<QueueInner>>,
    tx: mpsc::UnboundedSender<CandidateBatch>,
}

impl IceCandidateQueue {
    /// Create a queue and the receiver its batches are delivered on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CandidateBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Mutex::new(QueueInner {
                session_started: false,
                gathering: GatheringState::Gathering,
                pending: Vec::new(),
                timer_generation: 0,
                timer_armed: false,
            })),
            tx,
        };
        (queue, rx)
    }

    /// Add a candidate, or mark gathering complete with `None`.
    pub fn add(&self, candidate: Option<String>) {
        let arm = {
            let mut inner = self.inner.lock().unwrap();
            match candidate {
                Some(candidate) => inner.pending.push(candidate),
                None => {
                    if inner.gathering == GatheringState::Gathering {
                        inner.gathering = GatheringState::Gathered;
                    }
                }
            }
            if inner.timer_armed {
                None
            } else {
                inner.timer_armed = true;
                inner.timer_generation += 1;
                Some(inner.timer_generation)
            }
        };
        if let Some(generation) = arm {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CANDIDATE_DEBOUNCE).await;
                queue.flush_timer(generation);
            });
        }
    }

    /// Mark the negotiation session as started and flush immediately.
    pub fn notify_session_started(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session_started = true;
            // Invalidate any armed debounce timer; we flush right away.
            inner.timer_armed = false;
            inner.timer_generation += 1;
        }
        self.flush();
    }

    fn flush_timer(&self, generation: u64) {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.timer_armed || inner.timer_generation != generation {
                return;
            }
        }
        self.flush();
    }

    fn flush(&self) {
        let (batch, done) = {
            let mut inner = self.inner.lock().unwrap();
            inner.timer_armed = false;
            if !inner.session_started {
                return;
            }
            let batch = std::mem::take(&mut inner.pending);
            let done = inner.gathering == GatheringState::Gathered;
            if done {
                inner.gathering = GatheringState::Notified;
            }
            (batch, done)
        };
        if !batch.is_empty() {
            let _ = self.tx.send(CandidateBatch::Add(batch));
        }
        if done {
            let _ = self.tx.send(CandidateBatch::Done);
        }
    }
}
