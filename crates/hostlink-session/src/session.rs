//! The session state machine and its at-least-once ordered delivery protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use hostlink_core::{
    AgentMessageKind, AgentMessageRecord, Crash, DetachReason, PeerOptions, ScriptHandle,
    ScriptOptions, SessionHandle, Signal,
};
use hostlink_transport::{AgentTransport, HostConnection, MessageSink, PeerConnection, PeerDialer};

use crate::delivery::{DeliveryQueue, MAX_BATCH_BYTES, PendingMessage};
use crate::errors::{ConnectionError, ScriptError, SessionError};
use crate::script::{Script, ScriptHost};

/// Capabilities a session needs from its owning client: re-establishing the
/// shared host connection and reaching the optional peer dialer.
#[async_trait]
pub(crate) trait SessionHost: Send + Sync {
    async fn host_connection(&self) -> Result<Arc<dyn HostConnection>, ConnectionError>;
    fn peer_dialer(&self) -> Option<Arc<dyn PeerDialer>>;
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Live: calls and deliveries flow.
    Attached,
    /// The transport dropped but the session persists on the host; reach
    /// `Attached` again via [`Session::resume`].
    Interrupted,
    /// Terminal.
    Detached,
}

struct SessionInner {
    state: SessionState,
    active: Arc<dyn AgentTransport>,
    /// Retained only while a migration may still be rolled back, and while a
    /// committed peer transport needs a degradation target.
    obsolete: Option<Arc<dyn AgentTransport>>,
    queue: DeliveryQueue,
    pending_deliveries: usize,
    last_rx_batch_id: u32,
    scripts: HashMap<ScriptHandle, Arc<Script>>,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_options: Option<PeerOptions>,
}

/// One attached logical session against a remote process.
///
/// Created by `Client::attach`; survives transport loss when constructed
/// with a non-zero persist timeout, in which case queued deliveries and
/// scripts outlive the interruption and [`Session::resume`] re-establishes
/// the link under the same stable handle.
pub struct Session {
    pid: u32,
    id: SessionHandle,
    persist_timeout: u32,
    controller: Weak<dyn SessionHost>,
    this: Weak<Session>,
    inner: Mutex<SessionInner>,
    detached: Signal<(DetachReason, Option<Crash>)>,
    destroyed: Signal<()>,
}

impl Session {
    pub(crate) fn new(
        controller: Weak<dyn SessionHost>,
        transport: Arc<dyn AgentTransport>,
        pid: u32,
        id: SessionHandle,
        persist_timeout: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            pid,
            id,
            persist_timeout,
            controller,
            this: this.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Attached,
                active: transport,
                obsolete: None,
                queue: DeliveryQueue::new(),
                pending_deliveries: 0,
                last_rx_batch_id: 0,
                scripts: HashMap::new(),
                peer: None,
                peer_options: None,
            }),
            detached: Signal::new(),
            destroyed: Signal::new(),
        })
    }

    /// Process id this session is attached to.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stable session handle, unchanged across resume and migration.
    #[must_use]
    pub fn id(&self) -> &SessionHandle {
        &self.id
    }

    /// Seconds the session survives a dropped transport; zero means it dies
    /// with its transport.
    #[must_use]
    pub fn persist_timeout(&self) -> u32 {
        self.persist_timeout
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Whether the session is currently unusable (interrupted or detached).
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.state() != SessionState::Attached
    }

    /// Fires on every detach event, including interruptions, with the reason
    /// and crash details when the remote process crashed.
    #[must_use]
    pub fn detached(&self) -> &Signal<(DetachReason, Option<Crash>)> {
        &self.detached
    }

    /// Fires exactly once, when the session reaches its terminal state.
    #[must_use]
    pub fn destroyed(&self) -> &Signal<()> {
        &self.destroyed
    }

    /// Detach from the process. Always reaches the terminal state; the
    /// remote session is closed best-effort.
    pub fn detach(&self) {
        self.destroy(DetachReason::ApplicationRequested, None);
    }

    /// Re-establish an interrupted session under its stable handle.
    ///
    /// A no-op on an attached session (no remote call is issued). The remote
    /// side reports the highest batch id it had already received, and every
    /// queued message known to be delivered is discarded before deliveries
    /// restart.
    ///
    /// # Errors
    /// [`SessionError::Gone`] on a detached session; otherwise any failure
    /// re-establishing the link.
    pub async fn resume(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Attached => return Ok(()),
            SessionState::Detached => return Err(SessionError::Gone),
            SessionState::Interrupted => {}
        }
        let controller = self.controller.upgrade().ok_or(SessionError::Gone)?;
        let connection = controller.host_connection().await?;
        connection.reattach(&self.id).await?;
        let transport = connection.link_session(&self.id).await?;
        connection.register_sink(&self.id, self.sink());
        self.begin_migration(transport);

        let peer_options = self.inner.lock().unwrap().peer_options.clone();
        if let Some(options) = peer_options {
            self.setup_peer_connection(options).await?;
        }

        let (active, last_rx) = {
            let inner = self.inner.lock().unwrap();
            (inner.active.clone(), inner.last_rx_batch_id)
        };
        let last_tx = active.resume(last_rx).await?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.discard_delivered(last_tx);
            if inner.peer.is_none() {
                // The pre-interruption transport is dead; nothing to roll
                // back to. With a peer link it stays as degradation target.
                inner.obsolete = None;
            }
            inner.state = SessionState::Attached;
        }
        self.maybe_deliver();
        Ok(())
    }

    /// Create a script from source. The script is owned by this session and
    /// is force-destroyed with it.
    ///
    /// # Errors
    /// [`ScriptError::SessionGone`] on a detached session, or
    /// [`ScriptError::Create`] when the remote side rejects the source.
    pub async fn create_script(
        &self,
        source: &str,
        options: ScriptOptions,
    ) -> Result<Arc<Script>, ScriptError> {
        let transport = {
            let inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Detached {
                return Err(ScriptError::SessionGone);
            }
            inner.active.clone()
        };
        let handle = transport
            .create_script(source, &options)
            .await
            .map_err(ScriptError::Create)?;

        let host: Weak<dyn ScriptHost> = self.this.clone();
        let script = Script::new(host, handle);
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(handle, script.clone());

        let session = self.this.clone();
        script.destroyed().connect(move |_| {
            if let Some(session) = session.upgrade() {
                session.inner.lock().unwrap().scripts.remove(&handle);
            }
        });
        Ok(script)
    }

    /// Inbound sink handed to the bus (and to peer channels) so batches can
    /// be delivered into this session.
    pub(crate) fn sink(&self) -> Arc<dyn MessageSink> {
        Arc::new(SessionSink {
            session: self.this.clone(),
        })
    }

    pub(crate) fn this(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub(crate) fn controller(&self) -> Option<Arc<dyn SessionHost>> {
        self.controller.upgrade()
    }

    pub(crate) fn active_transport(&self) -> Arc<dyn AgentTransport> {
        self.inner.lock().unwrap().active.clone()
    }

    /// Stash the active transport and install a new one. All calls issued
    /// from now on target `transport`; the old handle is retained only for
    /// rollback or degradation.
    pub(crate) fn begin_migration(&self, transport: Arc<dyn AgentTransport>) {
        let mut inner = self.inner.lock().unwrap();
        inner.obsolete = Some(std::mem::replace(&mut inner.active, transport));
    }

    /// Roll a begun migration back, restoring the stashed transport.
    pub(crate) fn cancel_migration(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.obsolete.take() {
            inner.active = previous;
        }
    }

    /// Record a committed peer link so a later closure can be matched to it,
    /// and remember the options for re-establishment after resume.
    pub(crate) fn store_peer_link(
        &self,
        connection: Arc<dyn PeerConnection>,
        options: PeerOptions,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.peer = Some(connection);
        inner.peer_options = Some(options);
    }

    /// React to the committed peer transport dropping: persistent sessions
    /// degrade to interrupted with the prior transport restored as active;
    /// non-persistent sessions are destroyed.
    pub(crate) fn handle_peer_closure(&self, closed: &Arc<dyn PeerConnection>) {
        let interrupted = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.peer {
                Some(current) if Arc::ptr_eq(current, closed) => {}
                _ => return,
            }
            inner.peer = None;
            if self.persist_timeout != 0 {
                if inner.state != SessionState::Attached {
                    return;
                }
                inner.state = SessionState::Interrupted;
                if let Some(previous) = inner.obsolete.take() {
                    inner.active = previous;
                }
                true
            } else {
                false
            }
        };
        if interrupted {
            self.detached
                .emit(&(DetachReason::ConnectionTerminated, None));
        } else {
            self.destroy(DetachReason::ConnectionTerminated, None);
        }
    }

    /// Handle a detach notification. `ConnectionTerminated` on a persistent
    /// attached session interrupts it, leaving scripts and the delivery
    /// queue intact; every other case is terminal.
    pub(crate) fn on_detached(&self, reason: DetachReason, crash: Option<Crash>) {
        if self.persist_timeout != 0 && reason == DetachReason::ConnectionTerminated {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != SessionState::Attached {
                    return;
                }
                inner.state = SessionState::Interrupted;
            }
            self.detached.emit(&(reason, None));
        } else {
            self.destroy(reason, crash);
        }
    }

    fn destroy(&self, reason: DetachReason, crash: Option<Crash>) {
        let (scripts, close_transport, peer) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Detached {
                return;
            }
            inner.state = SessionState::Detached;
            inner.queue.clear();
            let scripts: Vec<Arc<Script>> = inner.scripts.drain().map(|(_, s)| s).collect();
            let close_transport =
                (reason == DetachReason::ApplicationRequested).then(|| inner.active.clone());
            let peer = inner.peer.take();
            (scripts, close_transport, peer)
        };
        for script in scripts {
            script.destroy_local();
        }
        if let Some(transport) = close_transport {
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    tracing::debug!(error = %e, "failed to close remote session");
                }
            });
        }
        if let Some(peer) = peer {
            peer.close();
        }
        self.detached.emit(&(reason, crash));
        self.destroyed.emit(&());
    }

    /// Append a record to the delivery queue and try to drain. Records
    /// posted to a detached session are dropped.
    pub(crate) fn post_record(&self, record: AgentMessageRecord) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Detached {
                return;
            }
            inner.queue.push(record);
        }
        self.maybe_deliver();
    }

    /// Drain one batch if attached and anything is queued. Reliable batches
    /// may overlap in flight; ordering is restored on requeue.
    fn maybe_deliver(&self) {
        enum Plan {
            FireAndForget(Vec<AgentMessageRecord>, Arc<dyn AgentTransport>),
            Reliable(Vec<PendingMessage>, Arc<dyn AgentTransport>),
        }

        let plan = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Attached || inner.queue.is_empty() {
                return;
            }
            let mut batch = inner.queue.take_batch(MAX_BATCH_BYTES);
            if self.persist_timeout == 0 {
                Plan::FireAndForget(
                    batch.into_iter().map(|message| message.record).collect(),
                    inner.active.clone(),
                )
            } else {
                for message in &mut batch {
                    message.delivery_attempts += 1;
                }
                inner.pending_deliveries += 1;
                Plan::Reliable(batch, inner.active.clone())
            }
        };

        match plan {
            Plan::FireAndForget(records, transport) => {
                tokio::spawn(async move {
                    if let Err(e) = transport.post_messages(&records, 0).await {
                        tracing::warn!(error = %e, "dropped unacknowledged message batch");
                    }
                });
            }
            Plan::Reliable(batch, transport) => {
                let Some(session) = self.this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    session.deliver_batch(batch, transport).await;
                });
            }
        }
    }

    async fn deliver_batch(
        self: Arc<Self>,
        batch: Vec<PendingMessage>,
        transport: Arc<dyn AgentTransport>,
    ) {
        let Some(last) = batch.last() else { return };
        let batch_id = last.serial;
        let records: Vec<AgentMessageRecord> =
            batch.iter().map(|message| message.record.clone()).collect();

        let result = transport.post_messages(&records, batch_id).await;

        let mut inner = self.inner.lock().unwrap();
        inner.pending_deliveries -= 1;
        match result {
            Ok(()) => {
                if inner.pending_deliveries == 0 && inner.queue.is_empty() {
                    inner.queue.reset_serial();
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, batch_id, "delivery failed, requeueing batch");
                inner.queue.requeue(batch);
            }
        }
    }

    /// Inbound dispatch: route script-kind records to their scripts, then
    /// record the batch id as seen. Records for unknown scripts are dropped.
    fn dispatch_messages(&self, records: Vec<AgentMessageRecord>, batch_id: u32) {
        let deliveries: Vec<(Arc<Script>, AgentMessageRecord)> = {
            let inner = self.inner.lock().unwrap();
            records
                .into_iter()
                .filter(|record| record.kind == AgentMessageKind::Script)
                .filter_map(|record| {
                    inner
                        .scripts
                        .get(&record.script)
                        .map(|script| (script.clone(), record))
                })
                .collect()
        };
        for (script, record) in deliveries {
            let data = record.has_data.then(|| record.data.clone());
            match serde_json::from_str::<Value>(&record.text) {
                Ok(message) => script.dispatch_message(message, data),
                Err(e) => {
                    tracing::warn!(script = %record.script, error = %e, "discarding malformed message payload");
                }
            }
        }
        self.inner.lock().unwrap().last_rx_batch_id = batch_id;
    }
}

impl ScriptHost for Session {
    fn post_record(&self, record: AgentMessageRecord) {
        Session::post_record(self, record);
    }

    fn transport(&self) -> Arc<dyn AgentTransport> {
        self.active_transport()
    }
}

struct SessionSink {
    session: Weak<Session>,
}

impl MessageSink for SessionSink {
    fn post_messages(&self, records: Vec<AgentMessageRecord>, batch_id: u32) {
        if let Some(session) = self.session.upgrade() {
            session.dispatch_messages(records, batch_id);
        }
    }
}
