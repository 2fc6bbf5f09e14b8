//! Top-level entry point: owns the lazily-created host connection and the
//! registry of live sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use hostlink_core::{AttachOptions, DetachReason, ProcessInfo, ProcessQueryOptions, SessionHandle};
use hostlink_transport::{BusError, HostBus, HostConnection, HostEvent, PeerDialer};

use crate::errors::{AttachError, ConnectionError};
use crate::session::{Session, SessionHost};

/// Construction-time configuration for a [`Client`].
#[derive(Default)]
pub struct ClientOptions {
    /// Peer negotiation capability; without one, `setup_peer_connection`
    /// reports peer connections as unsupported.
    pub peer_dialer: Option<Arc<dyn PeerDialer>>,
}

/// Client of one instrumentation host.
///
/// The host connection is created on first use and shared by every session;
/// when its underlying stream closes, every live session receives a
/// synthetic `ConnectionTerminated` detach and the cached connection is
/// dropped so the next operation reconnects.
pub struct Client {
    bus: Arc<dyn HostBus>,
    peer_dialer: Option<Arc<dyn PeerDialer>>,
    connection: tokio::sync::Mutex<Option<Arc<dyn HostConnection>>>,
    sessions: Mutex<HashMap<SessionHandle, Arc<Session>>>,
    this: Weak<Client>,
}

impl Client {
    /// Create a client speaking to the host reachable through `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn HostBus>, options: ClientOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bus,
            peer_dialer: options.peer_dialer,
            connection: tokio::sync::Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Query the processes visible to the host.
    ///
    /// # Errors
    /// Returns an error if the host cannot be reached or rejects the query.
    pub async fn enumerate_processes(
        &self,
        options: ProcessQueryOptions,
    ) -> Result<Vec<ProcessInfo>, ConnectionError> {
        let connection = self.get_host_connection().await?;
        connection
            .enumerate_processes(&options)
            .await
            .map_err(ConnectionError)
    }

    /// Attach to `pid`, returning a live session registered with this client
    /// until it is destroyed.
    ///
    /// # Errors
    /// [`AttachError::ProcessNotFound`] / [`AttachError::PermissionDenied`]
    /// when the host refuses, or a connection failure.
    pub async fn attach(
        &self,
        pid: u32,
        options: AttachOptions,
    ) -> Result<Arc<Session>, AttachError> {
        let connection = self.get_host_connection().await?;
        let id = connection
            .attach(pid, &options)
            .await
            .map_err(|e| classify_attach_error(pid, e))?;
        let transport = connection.link_session(&id).await?;

        let persist_timeout = options.persist_timeout.unwrap_or(0);
        let controller: Weak<dyn SessionHost> = self.this.clone();
        let session = Session::new(controller, transport, pid, id.clone(), persist_timeout);
        connection.register_sink(&id, session.sink());

        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session.clone());
        let client = self.this.clone();
        session.destroyed().connect(move |_| {
            if let Some(client) = client.upgrade() {
                client.sessions.lock().unwrap().remove(&id);
            }
        });
        Ok(session)
    }

    /// Number of sessions currently registered.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// The shared host connection, created on first use. Concurrent callers
    /// during creation all await the same attempt.
    pub(crate) async fn get_host_connection(
        &self,
    ) -> Result<Arc<dyn HostConnection>, ConnectionError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let (connection, events) = self.bus.connect().await?;
        let client = self.this.clone();
        tokio::spawn(async move {
            Self::run_host_events(client, events).await;
        });
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn run_host_events(client: Weak<Client>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            let Some(client) = client.upgrade() else {
                return;
            };
            match event {
                HostEvent::SessionDetached { id, reason, crash } => {
                    let session = client.sessions.lock().unwrap().get(&id).cloned();
                    if let Some(session) = session {
                        session.on_detached(reason, crash);
                    }
                }
                HostEvent::Closed => {
                    client.handle_connection_closed().await;
                    return;
                }
            }
        }
        // The bus dropped its event channel without a close notification;
        // the connection is unusable either way.
        if let Some(client) = client.upgrade() {
            client.handle_connection_closed().await;
        }
    }

    async fn handle_connection_closed(&self) {
        *self.connection.lock().await = None;
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.on_detached(DetachReason::ConnectionTerminated, None);
        }
    }
}

#[async_trait]
impl SessionHost for Client {
    async fn host_connection(&self) -> Result<Arc<dyn HostConnection>, ConnectionError> {
        self.get_host_connection().await
    }

    fn peer_dialer(&self) -> Option<Arc<dyn PeerDialer>> {
        self.peer_dialer.clone()
    }
}

fn classify_attach_error(pid: u32, error: BusError) -> AttachError {
    match &error {
        BusError::Remote { name, .. } if name.ends_with("ProcessNotFound") => {
            AttachError::ProcessNotFound(pid)
        }
        BusError::Remote { name, .. } if name.ends_with("PermissionDenied") => {
            AttachError::PermissionDenied(pid)
        }
        _ => AttachError::Bus(error),
    }
}
