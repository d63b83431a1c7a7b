// src/network/session.rs
// In-flight protocol exchanges, keyed by session id, one table per role.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::message::{RequestSequence, ResponseType};
use super::ranking::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We initiated the exchange
    Sender,
    /// The remote peer initiated the exchange
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Receiver session whose opening request has not been acknowledged yet
    New,
    /// Receiver session waiting for the next request type
    AwaitingNext,
    /// Sender session waiting for responses
    AwaitingResponse,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub role: SessionRole,
    pub remote_peer: PeerId,
    pub protocol: String,
    /// Request types still allowed, head first. `None` while the session is new.
    pub remaining: Option<VecDeque<String>>,
    /// Request type currently being handled
    pub pending: Option<String>,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: &str, role: SessionRole, remote_peer: &PeerId, protocol: &str) -> Self {
        Self {
            id: id.to_string(),
            role,
            remote_peer: remote_peer.clone(),
            protocol: protocol.to_string(),
            remaining: None,
            pending: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        match (self.role, &self.remaining) {
            (SessionRole::Sender, _) => SessionState::AwaitingResponse,
            (SessionRole::Receiver, None) => SessionState::New,
            (SessionRole::Receiver, Some(_)) => SessionState::AwaitingNext,
        }
    }

    /// Request type this session accepts next
    fn expected<'a>(&'a self, sequence: &'a RequestSequence) -> Option<&'a str> {
        match &self.remaining {
            None => Some(sequence.initial()),
            Some(remaining) => remaining.front().map(String::as_str),
        }
    }
}

/// How an inbound request relates to the receiver table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// No session yet and the request opens one
    Opened,
    /// The request is the next expected step of an open session
    Continued,
    /// The previous step of this session is still being handled
    InProgress,
    /// Wrong type for the session's position
    OutOfOrder { expected: String },
    /// The session id belongs to a different peer
    Foreign,
}

fn classify(
    session: Option<&Session>,
    peer: &PeerId,
    message_type: &str,
    sequence: &RequestSequence,
) -> Claim {
    match session {
        None => {
            if sequence.is_initial(message_type) {
                Claim::Opened
            } else {
                Claim::OutOfOrder {
                    expected: sequence.initial().to_string(),
                }
            }
        }
        Some(s) if &s.remote_peer != peer => Claim::Foreign,
        Some(s) if s.pending.is_some() => Claim::InProgress,
        Some(s) => match s.expected(sequence) {
            Some(expected) if expected == message_type => Claim::Continued,
            Some(expected) => Claim::OutOfOrder {
                expected: expected.to_string(),
            },
            None => Claim::OutOfOrder {
                expected: String::new(),
            },
        },
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    senders: DashMap<String, Session>,
    receivers: DashMap<String, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- sender side ----

    /// Get-or-create the sender session; true when it was created.
    pub fn open_sender(&self, session_id: &str, peer: &PeerId, protocol: &str) -> bool {
        match self.senders.entry(session_id.to_string()) {
            Entry::Occupied(mut e) => {
                e.get_mut().last_activity = Instant::now();
                false
            }
            Entry::Vacant(e) => {
                e.insert(Session::new(session_id, SessionRole::Sender, peer, protocol));
                true
            }
        }
    }

    pub fn has_sender(&self, session_id: &str) -> bool {
        self.senders.contains_key(session_id)
    }

    pub fn sender(&self, session_id: &str) -> Option<Session> {
        self.senders.get(session_id).map(|s| s.clone())
    }

    pub fn remove_sender(&self, session_id: &str) -> Option<Session> {
        self.senders.remove(session_id).map(|(_, s)| s)
    }

    // ---- receiver side ----

    /// True when `session_id` is an open receiver session owned by `peer`.
    pub fn is_in_flight(&self, session_id: &str, peer: &PeerId) -> bool {
        !session_id.is_empty()
            && self
                .receivers
                .get(session_id)
                .map(|s| &s.remote_peer == peer)
                .unwrap_or(false)
    }

    /// Classify a request without changing anything
    pub fn peek(
        &self,
        session_id: &str,
        peer: &PeerId,
        message_type: &str,
        sequence: &RequestSequence,
    ) -> Claim {
        let session = self.receivers.get(session_id);
        classify(session.as_deref(), peer, message_type, sequence)
    }

    /// Atomically classify and reserve the step. `Opened` inserts a new
    /// session; accepted claims mark the step pending until `complete`.
    pub fn claim(
        &self,
        session_id: &str,
        peer: &PeerId,
        protocol: &str,
        message_type: &str,
        sequence: &RequestSequence,
    ) -> Claim {
        match self.receivers.entry(session_id.to_string()) {
            Entry::Occupied(mut e) => {
                let claim = classify(Some(e.get()), peer, message_type, sequence);
                if claim == Claim::Continued {
                    let session = e.get_mut();
                    session.pending = Some(message_type.to_string());
                    session.last_activity = Instant::now();
                }
                claim
            }
            Entry::Vacant(e) => {
                let claim = classify(None, peer, message_type, sequence);
                if claim == Claim::Opened {
                    let mut session = Session::new(session_id, SessionRole::Receiver, peer, protocol);
                    session.pending = Some(message_type.to_string());
                    e.insert(session);
                }
                claim
            }
        }
    }

    /// Apply the response sent for a claimed step and return the new state.
    ///
    /// ACK advances (and terminates once nothing is left), NACK terminates,
    /// BUSY leaves the session as it was before the claim.
    pub fn complete(
        &self,
        session_id: &str,
        response: ResponseType,
        opened: bool,
        sequence: &RequestSequence,
    ) -> SessionState {
        let Entry::Occupied(mut e) = self.receivers.entry(session_id.to_string()) else {
            return SessionState::Terminated;
        };

        match response {
            ResponseType::Nack => {
                e.remove();
                SessionState::Terminated
            }
            ResponseType::Busy if opened => {
                e.remove();
                SessionState::Terminated
            }
            ResponseType::Busy => {
                let session = e.get_mut();
                session.pending = None;
                session.last_activity = Instant::now();
                session.state()
            }
            ResponseType::Ack => {
                let session = e.get_mut();
                session.pending = None;
                session.last_activity = Instant::now();
                match session.remaining.as_mut() {
                    None => session.remaining = Some(sequence.after_initial()),
                    Some(remaining) => {
                        remaining.pop_front();
                    }
                }
                let done = session
                    .remaining
                    .as_ref()
                    .map(VecDeque::is_empty)
                    .unwrap_or(false);
                if done {
                    e.remove();
                    SessionState::Terminated
                } else {
                    SessionState::AwaitingNext
                }
            }
        }
    }

    /// Remove the receiver session if it belongs to `peer`
    pub fn remove_receiver_of(&self, session_id: &str, peer: &PeerId) -> bool {
        self.receivers
            .remove_if(session_id, |_, s| &s.remote_peer == peer)
            .is_some()
    }

    pub fn receiver(&self, session_id: &str) -> Option<Session> {
        self.receivers.get(session_id).map(|s| s.clone())
    }

    pub fn remove_receiver(&self, session_id: &str) -> Option<Session> {
        self.receivers.remove(session_id).map(|(_, s)| s)
    }

    // ---- both ----

    /// Remove a session by id, sender table first.
    pub fn remove(&self, session_id: &str) -> Option<SessionRole> {
        if self.remove_sender(session_id).is_some() {
            Some(SessionRole::Sender)
        } else if self.remove_receiver(session_id).is_some() {
            Some(SessionRole::Receiver)
        } else {
            None
        }
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Drop sessions idle for longer than `ttl`; returns how many went.
    pub fn sweep_idle(&self, ttl: Duration, now: Instant) -> usize {
        let before = self.senders.len() + self.receivers.len();
        let fresh = |s: &Session| now.saturating_duration_since(s.last_activity) < ttl;
        self.senders.retain(|_, s| fresh(&*s));
        self.receivers.retain(|_, s| fresh(&*s));
        before.saturating_sub(self.senders.len() + self.receivers.len())
    }

    pub fn clear(&self) -> usize {
        let n = self.senders.len() + self.receivers.len();
        self.senders.clear();
        self.receivers.clear();
        n
    }
}
