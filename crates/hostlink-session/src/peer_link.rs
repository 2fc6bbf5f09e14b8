//! Peer-to-peer transport setup: negotiation sequencing, candidate exchange
//! and the migration handoff onto an opened data channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use hostlink_core::PeerOptions;
use hostlink_core::types::stun_url;
use hostlink_transport::{
    AgentTransport, CandidateBatch, CandidateSignal, IceCandidateQueue, IceServer, PeerChannel,
    PeerConnection, PeerConnectionError, PeerEvent,
};

use crate::errors::SessionError;
use crate::session::Session;

impl Session {
    /// Negotiate a direct data-channel transport and migrate the session
    /// onto it. The existing transport stays authoritative until the remote
    /// side commits the handoff, and is restored if any step after
    /// begin-migration fails.
    ///
    /// Requires the session to be attached and the client to be configured
    /// with a peer dialer.
    ///
    /// # Errors
    /// [`SessionError::Peer`] on negotiation or channel failure,
    /// [`SessionError::Migration`] when the handoff itself fails (always
    /// rolled back).
    pub async fn setup_peer_connection(&self, options: PeerOptions) -> Result<(), SessionError> {
        let controller = self.controller().ok_or(SessionError::Gone)?;
        let dialer = controller
            .peer_dialer()
            .ok_or(PeerConnectionError::Unsupported)?;
        let server_transport = self.active_transport();
        let ice_servers = ice_servers_for(&options);
        let (peer, peer_events) = dialer.open(&ice_servers).await?;

        let result = self
            .drive_peer_setup(&server_transport, &peer, peer_events, options)
            .await;
        if result.is_err() {
            peer.close();
        }
        result
    }

    async fn drive_peer_setup(
        &self,
        server_transport: &Arc<dyn AgentTransport>,
        peer: &Arc<dyn PeerConnection>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        options: PeerOptions,
    ) -> Result<(), SessionError> {
        // Local candidates flow to the host, batched and with mDNS
        // candidates dropped; the host expects `a=`-prefixed SDP fragments.
        let (local_queue, mut local_batches) = IceCandidateQueue::new();
        {
            let transport = server_transport.clone();
            tokio::spawn(async move {
                while let Some(batch) = local_batches.recv().await {
                    match batch {
                        CandidateBatch::Add(candidates) => {
                            let sdps: Vec<String> = candidates
                                .iter()
                                .filter(|candidate| !is_mdns_candidate(candidate))
                                .map(|candidate| format!("a={candidate}"))
                                .collect();
                            if sdps.is_empty() {
                                continue;
                            }
                            if let Err(e) = transport.add_candidates(&sdps).await {
                                tracing::debug!(error = %e, "failed to forward local candidates");
                            }
                        }
                        CandidateBatch::Done => {
                            if let Err(e) = transport.notify_candidate_gathering_done().await {
                                tracing::debug!(error = %e, "failed to notify gathering done");
                            }
                        }
                    }
                }
            });
        }

        // Remote candidates flow into the negotiation engine.
        let (remote_queue, mut remote_batches) = IceCandidateQueue::new();
        {
            let peer = peer.clone();
            tokio::spawn(async move {
                while let Some(batch) = remote_batches.recv().await {
                    match batch {
                        CandidateBatch::Add(candidates) => {
                            for candidate in candidates {
                                if let Err(e) = peer.add_remote_candidate(&candidate).await {
                                    tracing::debug!(error = %e, "failed to add remote candidate");
                                }
                            }
                        }
                        CandidateBatch::Done => {
                            if let Err(e) = peer.end_of_remote_candidates().await {
                                tracing::debug!(error = %e, "failed to signal end of candidates");
                            }
                        }
                    }
                }
            });
        }

        // Candidate announcements from the host feed the remote queue.
        {
            let mut signals = server_transport.subscribe_candidates();
            let remote_queue = remote_queue.clone();
            tokio::spawn(async move {
                while let Some(signal) = signals.recv().await {
                    match signal {
                        CandidateSignal::NewCandidates(sdps) => {
                            for sdp in sdps {
                                remote_queue.add(Some(strip_sdp_attribute(&sdp).to_string()));
                            }
                        }
                        CandidateSignal::GatheringDone => remote_queue.add(None),
                    }
                }
            });
        }

        // Peer events drive local gathering and, once the data channel
        // opens, the migration handoff. `ready` settles exactly once.
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SessionError>>();
        {
            let session = self.this();
            let peer = peer.clone();
            let server_transport = server_transport.clone();
            let local_queue = local_queue.clone();
            let options = options.clone();
            tokio::spawn(async move {
                let mut ready = Some(ready_tx);
                while let Some(event) = peer_events.recv().await {
                    match event {
                        PeerEvent::LocalCandidate(candidate) => local_queue.add(Some(candidate)),
                        PeerEvent::LocalGatheringDone => local_queue.add(None),
                        PeerEvent::ChannelOpen(channel) => {
                            let Some(session) = session.upgrade() else {
                                break;
                            };
                            let outcome = session
                                .migrate_to_peer(&server_transport, &channel, &peer, &options)
                                .await;
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(outcome);
                            }
                        }
                        PeerEvent::ChannelError(message) => {
                            if let Some(tx) = ready.take() {
                                let _ =
                                    tx.send(Err(PeerConnectionError::DataChannel(message).into()));
                            }
                        }
                        PeerEvent::Disconnected => {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(PeerConnectionError::Negotiation(
                                    "peer connection disconnected".to_string(),
                                )
                                .into()));
                            }
                            if let Some(session) = session.upgrade() {
                                session.handle_peer_closure(&peer);
                            }
                        }
                    }
                }
            });
        }

        let offer = peer.create_offer().await?;
        let answer = server_transport
            .offer_peer_connection(&offer, &options)
            .await?;
        peer.set_remote_description(&answer).await?;
        local_queue.notify_session_started();
        remote_queue.notify_session_started();

        ready_rx
            .await
            .map_err(|_| SessionError::Peer(PeerConnectionError::Closed))?
    }

    async fn migrate_to_peer(
        &self,
        server_transport: &Arc<dyn AgentTransport>,
        channel: &Arc<dyn PeerChannel>,
        connection: &Arc<dyn PeerConnection>,
        options: &PeerOptions,
    ) -> Result<(), SessionError> {
        let transport = channel.open_session(self.sink()).await?;
        server_transport
            .begin_migration()
            .await
            .map_err(|e| SessionError::Migration(e.to_string()))?;
        self.begin_migration(transport);
        match server_transport.commit_migration().await {
            Ok(()) => {
                self.store_peer_link(connection.clone(), options.clone());
                Ok(())
            }
            Err(e) => {
                self.cancel_migration();
                Err(SessionError::Migration(e.to_string()))
            }
        }
    }
}

fn ice_servers_for(options: &PeerOptions) -> Vec<IceServer> {
    let mut servers = Vec::new();
    if let Some(stun) = &options.stun_server {
        servers.push(IceServer::new(stun_url(stun)));
    }
    for relay in &options.relays {
        servers.push(IceServer {
            urls: relay.url(),
            username: Some(relay.username.clone()),
            credential: Some(relay.password.clone()),
        });
    }
    servers
}

/// Candidates advertising mDNS hostnames are useless to the remote side.
fn is_mdns_candidate(candidate: &str) -> bool {
    candidate
        .split(' ')
        .nth(4)
        .is_some_and(|address| address.ends_with(".local"))
}

fn strip_sdp_attribute(sdp: &str) -> &str {
    sdp.strip_prefix("a=").unwrap_or(sdp)
}

#[cfg(test)]
mod tests {
    use hostlink_core::{Relay, RelayKind};

    use super::*;

    #[test]
    fn mdns_candidates_are_detected_by_their_address_token() {
        let mdns = "candidate:1 1 udp 2113937151 1f2e3d4c.local 54321 typ host";
        assert!(is_mdns_candidate(mdns));

        let routable = "candidate:1 1 udp 2113937151 192.168.1.4 54321 typ host";
        assert!(!is_mdns_candidate(routable));
    }

    #[test]
    fn sdp_attribute_prefix_is_stripped_once() {
        assert_eq!(strip_sdp_attribute("a=candidate:1"), "candidate:1");
        assert_eq!(strip_sdp_attribute("candidate:1"), "candidate:1");
    }

    #[test]
    fn ice_servers_include_stun_and_relays() {
        let options = PeerOptions {
            stun_server: Some("stun.example.com".to_string()),
            relays: vec![Relay {
                address: "relay.example.com:3478".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
                kind: RelayKind::TurnTcp,
            }],
        };
        let servers = ice_servers_for(&options);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, "stun:stun.example.com?transport=udp");
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].urls, "turn:relay.example.com:3478?transport=tcp");
        assert_eq!(servers[1].username.as_deref(), Some("user"));
        assert_eq!(servers[1].credential.as_deref(), Some("secret"));
    }
}
