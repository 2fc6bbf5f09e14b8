//! External transport boundaries for the hostlink session layer.
//!
//! Provides:
//! - `bus` - The opaque call/event channel reaching the instrumentation host
//! - `peer` - The peer-to-peer negotiation capability and candidate batching

pub mod bus;
pub mod peer;

pub use bus::{AgentTransport, BusError, CandidateSignal, HostBus, HostConnection, HostEvent, MessageSink};
pub use peer::{
    CandidateBatch, IceCandidateQueue, IceServer, PeerChannel, PeerConnection,
    PeerConnectionError, PeerDialer, PeerEvent,
};
