// src/network/mod.rs
// Session-oriented request/response exchange between peers.
//
// Every exchange step runs on its own transport stream: the initiator writes
// one request message, the receiver validates the header, reads the payload,
// lets the protocol handler decide, and writes back exactly one response
// (ACK, NACK or BUSY). Session state ties the steps of one exchange together.

pub mod codec;
pub mod dht;
pub mod discovery;
pub mod handler;
pub mod load_monitor;
pub mod memory;
pub mod message;
pub mod ranking;
pub mod rate_limiter;
pub mod session;
pub mod tcp;
pub mod transport;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::NetworkError;

pub use self::handler::{handler_fn, HandlerResponse, MessageHandler, PingHandler};
pub use self::message::{new_session_id, protocols, Message, MessageHeader, RequestSequence, ResponseType, SequenceError};
pub use self::ranking::{NodeId, PeerId};
pub use self::rate_limiter::{Admission, GuardConfig, WindowPolicy};
pub use self::transport::{InboundStream, StreamAcceptor, Transport};

use self::codec::MessageWriter;
use self::load_monitor::LoadMonitor;
use self::rate_limiter::AbuseGuard;
use self::session::{Claim, SessionState, SessionTable};

/// Bounded retry of requests answered with BUSY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Runtime settings of the session layer
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub guard: GuardConfig,
    /// Receiver sessions above this count make the node refuse new ones
    pub max_open_sessions: usize,
    pub max_lag: Duration,
    pub lag_sample_interval: Duration,
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub replication_factor: usize,
    pub max_candidates: usize,
    pub max_message_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            max_open_sessions: 10,
            max_lag: Duration::from_millis(70),
            lag_sample_interval: Duration::from_millis(500),
            response_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            session_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            replication_factor: 5,
            max_candidates: 100,
            max_message_bytes: codec::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    sessions: SessionTable,
    guard: Mutex<AbuseGuard>,
    load: LoadMonitor,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    sequences: DashMap<String, RequestSequence>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One node's session engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct NetworkService {
    inner: Arc<Inner>,
}

impl NetworkService {
    pub fn new(transport: Arc<dyn Transport>, config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let guard = AbuseGuard::new(config.guard);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                sessions: SessionTable::new(),
                guard: Mutex::new(guard),
                load: LoadMonitor::new(),
                handlers: DashMap::new(),
                sequences: DashMap::new(),
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.transport.local_peer_id()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    pub fn load_monitor(&self) -> &LoadMonitor {
        &self.inner.load
    }

    /// Spawn the lag sampler and the idle-session sweeper.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(
            inner
                .load
                .spawn(inner.config.lag_sample_interval, inner.shutdown_tx.subscribe()),
        );

        let weak = Arc::downgrade(inner);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let sweep_every = inner.config.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.sweep(Instant::now());
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("session sweeper shutting down");
                        break;
                    }
                }
            }
        }));

        tracing::info!(peer = %self.local_peer_id(), "Network service started");
    }

    /// Stop background tasks, refuse new work and drop every open session.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = inner.shutdown_tx.send(());
        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        inner.transport.close().await;
        let dropped = inner.sessions.clear();
        tracing::info!(sessions = dropped, "Network service stopped");
    }

    /// Serve `protocol` with the default request sequence.
    pub async fn register_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), NetworkError> {
        self.register_handler_with_sequence(protocol, RequestSequence::default(), handler)
            .await
    }

    pub async fn register_handler_with_sequence(
        &self,
        protocol: &str,
        sequence: RequestSequence,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), NetworkError> {
        self.inner.sequences.insert(protocol.to_string(), sequence);
        self.inner.handlers.insert(protocol.to_string(), handler);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let acceptor: StreamAcceptor = Arc::new(move |inbound: InboundStream| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.serve(inbound).await;
                }
            }
            .boxed()
        });
        self.inner.transport.handle(protocol, acceptor).await?;
        tracing::info!(protocol = %protocol, "Registered protocol handler");
        Ok(())
    }

    /// Request sequence used when talking `protocol` to remote peers we do
    /// not serve ourselves.
    pub fn register_sequence(&self, protocol: &str, sequence: RequestSequence) {
        self.inner.sequences.insert(protocol.to_string(), sequence);
    }

    /// Send one request and wait for its response.
    ///
    /// `Ok(None)` means the response was invalid (malformed header, not a
    /// response type, or an untracked session) and was discarded.
    pub async fn send_message(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: Message,
    ) -> Result<Option<Message>, NetworkError> {
        self.inner.send_message(protocol, remote, message).await
    }

    /// `send_message`, repeating the same request while the peer answers BUSY.
    pub async fn send_message_with_retry(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: Message,
    ) -> Result<Option<Message>, NetworkError> {
        let policy = self.inner.config.retry;
        let session_id = message.session_id().to_string();
        let backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.delay)
            .with_max_interval(policy.delay)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(policy.deadline))
            .build();

        let mut attempts = 0u32;
        let result = backoff::future::retry(backoff, || {
            attempts += 1;
            let attempt = attempts;
            let message = message.clone();
            async move {
                match self.send_message(protocol, remote, message).await {
                    Ok(Some(response)) if response.response_type() == Some(ResponseType::Busy) => {
                        tracing::debug!(
                            peer = %remote,
                            protocol = %protocol,
                            attempt,
                            "Peer busy, retrying"
                        );
                        if attempt >= policy.max_attempts {
                            Err(backoff::Error::permanent(NetworkError::Busy { attempts: attempt }))
                        } else {
                            Err(backoff::Error::transient(NetworkError::Busy { attempts: attempt }))
                        }
                    }
                    Ok(response) => Ok(response),
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        if let Err(NetworkError::Busy { .. }) = &result {
            self.inner.sessions.remove_sender(&session_id);
        }
        result
    }

    /// Remove a session by id, sender side first.
    pub fn remove_session(&self, session_id: &str) {
        if let Some(role) = self.inner.sessions.remove(session_id) {
            tracing::debug!(session_id = %session_id, role = ?role, "Session removed");
        }
    }

    /// True while at least one peer is reachable.
    pub fn health_check(&self) -> bool {
        self.inner.transport.connection_count() > 0
    }

    /// The node is refusing new sessions.
    pub fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    pub async fn find_nodes(&self, key: &str, protocol: &str, limit: usize) -> Vec<PeerId> {
        discovery::find_nodes(
            &*self.inner.transport,
            key,
            protocol,
            limit,
            self.inner.config.max_candidates,
        )
        .await
    }

    /// Peers for every keyword at the configured replication factor, merged.
    pub async fn find_nodes_for_keywords(&self, keywords: &[String], protocol: &str) -> Vec<PeerId> {
        discovery::find_nodes_for_keywords(
            &*self.inner.transport,
            keywords,
            protocol,
            self.inner.config.replication_factor,
            self.inner.config.max_candidates,
        )
        .await
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.transport.known_peers().await
    }

    /// Currently blacklisted peer count
    pub fn blacklisted_count(&self) -> usize {
        self.inner.guard.lock().blacklisted_count()
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.inner.guard.lock().is_blacklisted(peer, Instant::now())
    }
}

impl Inner {
    fn sequence_for(&self, protocol: &str) -> RequestSequence {
        self.sequences
            .get(protocol)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    fn is_busy(&self) -> bool {
        self.load.is_overloaded(self.config.max_lag)
            || self.sessions.receiver_count() > self.config.max_open_sessions
    }

    fn sweep(&self, now: Instant) {
        let swept = self.sessions.sweep_idle(self.config.session_ttl, now);
        self.guard.lock().prune(now);
        if swept > 0 {
            tracing::debug!(sessions = swept, "Swept idle sessions");
        }
    }

    /// Decide whether an inbound request may proceed. `Ok(opened)` reserves
    /// the step; `Err` is the response to send instead.
    fn check_request(
        &self,
        remote: &PeerId,
        protocol: &str,
        header: &MessageHeader,
        sequence: &RequestSequence,
    ) -> Result<bool, ResponseType> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ResponseType::Busy);
        }

        let session_id = header.session_id.as_str();
        let message_type = header.message_type.as_str();

        let in_flight = self.sessions.is_in_flight(session_id, remote);
        let admission = self.guard.lock().admit(remote, in_flight, Instant::now());
        if admission.is_rejected() {
            return Err(ResponseType::Nack);
        }

        if session_id.is_empty() || !sequence.contains(message_type) {
            tracing::debug!(
                peer = %remote,
                protocol = %protocol,
                "Invalid header received: sessionId={:?} messageType={:?}",
                session_id,
                message_type
            );
            self.sessions.remove_receiver_of(session_id, remote);
            return Err(ResponseType::Nack);
        }

        match self.sessions.peek(session_id, remote, message_type, sequence) {
            Claim::OutOfOrder { expected } => {
                tracing::debug!(
                    peer = %remote,
                    protocol = %protocol,
                    session_id = %session_id,
                    "Out of order message {}, expected {:?}",
                    message_type,
                    expected
                );
                self.sessions.remove_receiver_of(session_id, remote);
                return Err(ResponseType::Nack);
            }
            Claim::Foreign => return Err(ResponseType::Nack),
            Claim::InProgress => return Err(ResponseType::Busy),
            Claim::Opened if self.is_busy() => {
                tracing::debug!(
                    peer = %remote,
                    protocol = %protocol,
                    "Node busy, declining session {}",
                    session_id
                );
                return Err(ResponseType::Busy);
            }
            Claim::Opened | Claim::Continued => {}
        }

        match self
            .sessions
            .claim(session_id, remote, protocol, message_type, sequence)
        {
            Claim::Opened => Ok(true),
            Claim::Continued => Ok(false),
            Claim::InProgress => Err(ResponseType::Busy),
            Claim::OutOfOrder { .. } => {
                self.sessions.remove_receiver_of(session_id, remote);
                Err(ResponseType::Nack)
            }
            Claim::Foreign => Err(ResponseType::Nack),
        }
    }

    /// Serve one inbound exchange step.
    async fn serve(self: Arc<Self>, inbound: InboundStream) {
        let InboundStream {
            stream,
            remote_peer,
            protocol,
        } = inbound;
        let (mut reader, mut writer) = transport::framed(stream);

        let header = match codec::read_header(&mut reader).await {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(peer = %remote_peer, protocol = %protocol, "Dropping stream: {}", e);
                return;
            }
        };
        tracing::debug!(
            peer = %remote_peer,
            protocol = %protocol,
            event = "received",
            message_type = %header.message_type,
            session_id = %header.session_id,
            "Received message"
        );

        let sequence = self.sequence_for(&protocol);
        let opened = match self.check_request(&remote_peer, &protocol, &header, &sequence) {
            Ok(opened) => opened,
            Err(response) => {
                let reply = Message::response(header.session_id.clone(), response);
                send_reply(&mut writer, &reply, &remote_peer, &protocol).await;
                return;
            }
        };

        let session_id = header.session_id.clone();
        let outcome = match codec::read_payload(&mut reader, self.config.max_message_bytes).await {
            Ok(data) => {
                let message = Message { header, data };
                self.dispatch(&protocol, message, &remote_peer).await
            }
            Err(e) => {
                tracing::warn!(
                    peer = %remote_peer,
                    protocol = %protocol,
                    session_id = %session_id,
                    "Failed to read payload: {}",
                    e
                );
                HandlerResponse::nack()
            }
        };

        // The transition is applied before the response goes out so that the
        // peer's next step always sees the advanced session.
        let state = self
            .sessions
            .complete(&session_id, outcome.response, opened, &sequence);
        let reply = Message::new(session_id.clone(), outcome.response.as_str(), outcome.data);
        if !send_reply(&mut writer, &reply, &remote_peer, &protocol).await && state != SessionState::Terminated {
            self.sessions.remove_receiver_of(&session_id, &remote_peer);
        }
    }

    async fn dispatch(&self, protocol: &str, message: Message, remote: &PeerId) -> HandlerResponse {
        let handler = self.handlers.get(protocol).map(|h| h.value().clone());
        let Some(handler) = handler else {
            tracing::warn!(protocol = %protocol, "No handler registered");
            return HandlerResponse::nack();
        };

        let session_id = message.session_id().to_string();
        match handler.handle(message, remote.clone()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    peer = %remote,
                    protocol = %protocol,
                    session_id = %session_id,
                    "Handler failed: {:#}",
                    e
                );
                HandlerResponse::nack()
            }
        }
    }

    async fn send_message(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: Message,
    ) -> Result<Option<Message>, NetworkError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown);
        }
        if message.session_id().is_empty() {
            return Err(NetworkError::InvalidMessage("empty session id".into()));
        }

        let session_id = message.session_id().to_string();
        self.sessions.open_sender(&session_id, remote, protocol);
        tracing::debug!(
            peer = %remote,
            protocol = %protocol,
            event = "sending",
            message_type = %message.message_type(),
            session_id = %session_id,
            "Sending message"
        );

        let timeout = self.config.response_timeout;
        let response = match tokio::time::timeout(timeout, self.exchange(protocol, remote, &message)).await {
            Err(_) => {
                self.sessions.remove_sender(&session_id);
                tracing::warn!(peer = %remote, protocol = %protocol, "No response within {:?}", timeout);
                return Err(NetworkError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                self.sessions.remove_sender(&session_id);
                return Err(e);
            }
            Ok(Ok(None)) => return Ok(None),
            Ok(Ok(Some(response))) => response,
        };

        tracing::debug!(
            peer = %remote,
            protocol = %protocol,
            event = "response",
            message_type = %response.message_type(),
            session_id = %session_id,
            "Received response"
        );

        match response.response_type() {
            Some(ResponseType::Nack) => {
                self.sessions.remove_sender(&session_id);
            }
            Some(ResponseType::Ack) if self.sequence_for(protocol).last() == message.message_type() => {
                self.sessions.remove_sender(&session_id);
            }
            _ => {}
        }
        Ok(Some(response))
    }

    /// Dial, write the request and read the response. A receiver may answer
    /// before draining our payload, so a failed write still tries the read.
    async fn exchange(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: &Message,
    ) -> Result<Option<Message>, NetworkError> {
        let stream = self.transport.dial(remote, protocol).await?;
        let (mut reader, mut writer) = transport::framed(stream);

        let written = codec::write_message(&mut writer, message).await;
        let header = match codec::read_header(&mut reader).await {
            Ok(header) => header,
            Err(e) => {
                written?;
                return Err(e.into());
            }
        };

        if header.response_type().is_none()
            || header.session_id != message.session_id()
            || !self.sessions.has_sender(&header.session_id)
        {
            tracing::debug!(
                peer = %remote,
                protocol = %protocol,
                "Invalid response: sessionId={:?} messageType={:?}",
                header.session_id,
                header.message_type
            );
            return Ok(None);
        }

        let data = codec::read_payload(&mut reader, self.config.max_message_bytes).await?;
        Ok(Some(Message { header, data }))
    }
}

/// Write a response; returns false when the stream was already gone.
async fn send_reply<W>(writer: &mut MessageWriter<W>, reply: &Message, remote: &PeerId, protocol: &str) -> bool
where
    W: AsyncWrite + Unpin,
{
    tracing::debug!(
        peer = %remote,
        protocol = %protocol,
        event = "responding",
        message_type = %reply.message_type(),
        session_id = %reply.session_id(),
        "Sending response"
    );
    match codec::write_message(writer, reply).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(peer = %remote, protocol = %protocol, "Failed to send response: {}", e);
            false
        }
    }
}
