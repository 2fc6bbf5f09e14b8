//! In-memory doubles for the bus and peer boundaries.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hostlink_core::{
    AgentMessageRecord, AttachOptions, PeerOptions, ProcessInfo, ProcessQueryOptions,
    ScriptHandle, ScriptOptions, SessionHandle,
};
use hostlink_transport::{
    AgentTransport, BusError, CandidateSignal, HostBus, HostConnection, HostEvent, IceServer,
    MessageSink, PeerChannel, PeerConnection, PeerConnectionError, PeerDialer, PeerEvent,
};

use hostlink_session::{Client, ClientOptions, Session};

/// A client attached to the mock host, ready for driving scenarios.
pub struct Harness {
    pub bus: Arc<MockBus>,
    pub client: Arc<Client>,
    pub session: Arc<Session>,
}

impl Harness {
    /// Attach to pid 4242 with the given persist timeout.
    pub async fn attach(persist_timeout: Option<u32>) -> Self {
        Self::attach_with_dialer(persist_timeout, None).await
    }

    pub async fn attach_with_dialer(
        persist_timeout: Option<u32>,
        peer_dialer: Option<Arc<MockPeerDialer>>,
    ) -> Self {
        init_tracing();
        let bus = MockBus::new();
        let client = Client::new(
            bus.clone(),
            ClientOptions {
                peer_dialer: peer_dialer.map(|dialer| dialer as Arc<dyn PeerDialer>),
            },
        );
        let session = client
            .attach(
                4242,
                AttachOptions {
                    realm: None,
                    persist_timeout,
                },
            )
            .await
            .expect("attach failed");
        Self {
            bus,
            client,
            session,
        }
    }

    pub fn connection(&self) -> Arc<MockConnection> {
        self.bus.connection.clone()
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        self.bus.connection.transport(0)
    }
}

/// Build an inbound script-kind record carrying `payload` as JSON text.
pub fn inbound(script: ScriptHandle, payload: &serde_json::Value) -> AgentMessageRecord {
    AgentMessageRecord::script_message(script, payload.to_string(), None)
}

/// Same, with an out-of-band binary payload attached.
pub fn inbound_with_data(
    script: ScriptHandle,
    payload: &serde_json::Value,
    data: &[u8],
) -> AgentMessageRecord {
    AgentMessageRecord::script_message(
        script,
        payload.to_string(),
        Some(bytes::Bytes::copy_from_slice(data)),
    )
}

/// Route tracing output to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `predicate` holds, failing the test after a generous timeout.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// Let already-spawned tasks (deliveries, requeues) settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub struct MockBus {
    pub connection: Arc<MockConnection>,
    pub connects: AtomicUsize,
    pub connect_delay: Option<Duration>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Self::with_delay(None)
    }

    pub fn with_delay(connect_delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            connection: Arc::new(MockConnection::new()),
            connects: AtomicUsize::new(0),
            connect_delay,
        })
    }
}

#[async_trait]
impl HostBus for MockBus {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn HostConnection>, mpsc::UnboundedReceiver<HostEvent>), BusError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.connection.events.lock().unwrap() = Some(tx);
        Ok((self.connection.clone() as Arc<dyn HostConnection>, rx))
    }
}

pub struct MockConnection {
    pub events: Mutex<Option<mpsc::UnboundedSender<HostEvent>>>,
    pub sinks: Mutex<HashMap<SessionHandle, Arc<dyn MessageSink>>>,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
    pub reattaches: Mutex<Vec<SessionHandle>>,
    /// Value the next linked transport reports from `resume`.
    pub resume_reply: AtomicU32,
    /// When set, the next linked transport starts out failing every post.
    pub link_failing_posts: AtomicBool,
}

impl MockConnection {
    fn new() -> Self {
        Self {
            events: Mutex::new(None),
            sinks: Mutex::new(HashMap::new()),
            transports: Mutex::new(Vec::new()),
            reattaches: Mutex::new(Vec::new()),
            resume_reply: AtomicU32::new(0),
            link_failing_posts: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: HostEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_closed(&self) {
        self.emit(HostEvent::Closed);
    }

    /// Deliver an inbound batch into the sink registered for `id`.
    pub fn deliver(&self, id: &SessionHandle, records: Vec<AgentMessageRecord>, batch_id: u32) {
        let sink = self.sinks.lock().unwrap().get(id).cloned();
        sink.expect("no sink registered").post_messages(records, batch_id);
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }

    pub fn last_transport(&self) -> Arc<MockTransport> {
        self.transports.lock().unwrap().last().unwrap().clone()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl HostConnection for MockConnection {
    async fn enumerate_processes(
        &self,
        _options: &ProcessQueryOptions,
    ) -> Result<Vec<ProcessInfo>, BusError> {
        Ok(vec![
            ProcessInfo {
                pid: 1,
                name: "init".to_string(),
                parameters: serde_json::Map::new(),
            },
            ProcessInfo {
                pid: 4242,
                name: "target".to_string(),
                parameters: serde_json::Map::new(),
            },
        ])
    }

    async fn attach(&self, pid: u32, _options: &AttachOptions) -> Result<SessionHandle, BusError> {
        if pid == 99_999_999 {
            return Err(BusError::Remote {
                name: "host.error.ProcessNotFound".to_string(),
                message: format!("unable to find process with pid {pid}"),
            });
        }
        Ok(SessionHandle(format!("session-{pid}")))
    }

    async fn reattach(&self, id: &SessionHandle) -> Result<(), BusError> {
        self.reattaches.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn link_session(&self, _id: &SessionHandle) -> Result<Arc<dyn AgentTransport>, BusError> {
        let transport = Arc::new(MockTransport::new());
        transport
            .resume_reply
            .store(self.resume_reply.load(Ordering::SeqCst), Ordering::SeqCst);
        if self.link_failing_posts.load(Ordering::SeqCst) {
            transport.fail_posts.store(true, Ordering::SeqCst);
        }
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }

    fn register_sink(&self, id: &SessionHandle, sink: Arc<dyn MessageSink>) {
        self.sinks.lock().unwrap().insert(id.clone(), sink);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedBatch {
    pub records: Vec<AgentMessageRecord>,
    pub batch_id: u32,
}

pub struct MockTransport {
    pub posts: Mutex<Vec<PostedBatch>>,
    /// Outcomes for upcoming posts, consumed front-first. Empty means the
    /// standing `fail_posts` flag decides.
    pub post_results: Mutex<VecDeque<Result<(), ()>>>,
    pub fail_posts: AtomicBool,
    pub closes: AtomicUsize,
    pub resumes: Mutex<Vec<u32>>,
    pub resume_reply: AtomicU32,
    pub created_scripts: Mutex<Vec<String>>,
    pub loads: Mutex<Vec<ScriptHandle>>,
    pub destroys: Mutex<Vec<ScriptHandle>>,
    pub fail_destroy_script: AtomicBool,
    next_script: AtomicU32,
    pub offers: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<Vec<String>>>,
    pub gathering_done: AtomicUsize,
    pub begin_migrations: AtomicUsize,
    pub commit_migrations: AtomicUsize,
    pub fail_commit_migration: AtomicBool,
    pub candidate_signals: Mutex<Option<mpsc::UnboundedSender<CandidateSignal>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            post_results: Mutex::new(VecDeque::new()),
            fail_posts: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            resumes: Mutex::new(Vec::new()),
            resume_reply: AtomicU32::new(0),
            created_scripts: Mutex::new(Vec::new()),
            loads: Mutex::new(Vec::new()),
            destroys: Mutex::new(Vec::new()),
            fail_destroy_script: AtomicBool::new(false),
            next_script: AtomicU32::new(1),
            offers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            gathering_done: AtomicUsize::new(0),
            begin_migrations: AtomicUsize::new(0),
            commit_migrations: AtomicUsize::new(0),
            fail_commit_migration: AtomicBool::new(false),
            candidate_signals: Mutex::new(None),
        }
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn post(&self, index: usize) -> PostedBatch {
        self.posts.lock().unwrap()[index].clone()
    }

    pub fn emit_candidates(&self, signal: CandidateSignal) {
        if let Some(tx) = self.candidate_signals.lock().unwrap().as_ref() {
            let _ = tx.send(signal);
        }
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn close(&self) -> Result<(), BusError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, last_rx_batch_id: u32) -> Result<u32, BusError> {
        self.resumes.lock().unwrap().push(last_rx_batch_id);
        Ok(self.resume_reply.load(Ordering::SeqCst))
    }

    async fn create_script(
        &self,
        source: &str,
        _options: &ScriptOptions,
    ) -> Result<ScriptHandle, BusError> {
        self.created_scripts.lock().unwrap().push(source.to_string());
        Ok(ScriptHandle(self.next_script.fetch_add(1, Ordering::SeqCst)))
    }

    async fn destroy_script(&self, id: ScriptHandle) -> Result<(), BusError> {
        self.destroys.lock().unwrap().push(id);
        if self.fail_destroy_script.load(Ordering::SeqCst) {
            return Err(BusError::Transport("injected destroy failure".to_string()));
        }
        Ok(())
    }

    async fn load_script(&self, id: ScriptHandle) -> Result<(), BusError> {
        self.loads.lock().unwrap().push(id);
        Ok(())
    }

    async fn post_messages(
        &self,
        records: &[AgentMessageRecord],
        batch_id: u32,
    ) -> Result<(), BusError> {
        self.posts.lock().unwrap().push(PostedBatch {
            records: records.to_vec(),
            batch_id,
        });
        let scripted = self.post_results.lock().unwrap().pop_front();
        let ok = match scripted {
            Some(result) => result.is_ok(),
            None => !self.fail_posts.load(Ordering::SeqCst),
        };
        if ok {
            Ok(())
        } else {
            Err(BusError::Transport("injected post failure".to_string()))
        }
    }

    async fn offer_peer_connection(
        &self,
        offer_sdp: &str,
        _options: &PeerOptions,
    ) -> Result<String, BusError> {
        self.offers.lock().unwrap().push(offer_sdp.to_string());
        Ok("answer-sdp".to_string())
    }

    async fn add_candidates(&self, candidate_sdps: &[String]) -> Result<(), BusError> {
        self.candidates.lock().unwrap().push(candidate_sdps.to_vec());
        Ok(())
    }

    async fn notify_candidate_gathering_done(&self) -> Result<(), BusError> {
        self.gathering_done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn begin_migration(&self) -> Result<(), BusError> {
        self.begin_migrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_migration(&self) -> Result<(), BusError> {
        self.commit_migrations.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit_migration.load(Ordering::SeqCst) {
            return Err(BusError::Transport("injected commit failure".to_string()));
        }
        Ok(())
    }

    fn subscribe_candidates(&self) -> mpsc::UnboundedReceiver<CandidateSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.candidate_signals.lock().unwrap() = Some(tx);
        rx
    }
}

pub struct MockPeerDialer {
    pub connection: Arc<MockPeerConnection>,
    pub events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    pub opens: AtomicUsize,
    pub ice_servers: Mutex<Vec<Vec<IceServer>>>,
}

impl MockPeerDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connection: Arc::new(MockPeerConnection::new()),
            events: Mutex::new(None),
            opens: AtomicUsize::new(0),
            ice_servers: Mutex::new(Vec::new()),
        })
    }

    pub fn send_event(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn has_listener(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }
}

#[async_trait]
impl PeerDialer for MockPeerDialer {
    async fn open(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PeerConnectionError>
    {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.ice_servers.lock().unwrap().push(ice_servers.to_vec());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok((self.connection.clone() as Arc<dyn PeerConnection>, rx))
    }
}

pub struct MockPeerConnection {
    pub offers: AtomicUsize,
    pub answers: Mutex<Vec<String>>,
    pub remote_candidates: Mutex<Vec<String>>,
    pub end_of_candidates: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockPeerConnection {
    fn new() -> Self {
        Self {
            offers: AtomicUsize::new(0),
            answers: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            end_of_candidates: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok("offer-sdp".to_string())
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<(), PeerConnectionError> {
        self.answers.lock().unwrap().push(answer_sdp.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate_sdp: &str) -> Result<(), PeerConnectionError> {
        self.remote_candidates
            .lock()
            .unwrap()
            .push(candidate_sdp.to_string());
        Ok(())
    }

    async fn end_of_remote_candidates(&self) -> Result<(), PeerConnectionError> {
        self.end_of_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockPeerChannel {
    pub transport: Arc<MockTransport>,
}

impl MockPeerChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transport: Arc::new(MockTransport::new()),
        })
    }
}

#[async_trait]
impl PeerChannel for MockPeerChannel {
    async fn open_session(
        &self,
        _sink: Arc<dyn MessageSink>,
    ) -> Result<Arc<dyn AgentTransport>, PeerConnectionError> {
        Ok(self.transport.clone() as Arc<dyn AgentTransport>)
    }
}
