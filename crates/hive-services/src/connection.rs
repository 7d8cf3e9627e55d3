//! Peer connection manager: one negotiation state machine per peer.
//!
//! Consumes roster changes, relayed signaling bodies and link events; returns
//! effects for the daemon to carry out. The daemon owns the actual WebRTC
//! objects and reports back through `on_*` calls.
//!
//! Roles: the node that receives `connect-request` is the responder. It
//! replies with `connect-response`, creates the data channel and sends the
//! offer. The requester answers.

use std::collections::{BTreeMap, HashSet};

use hive_core::wire::{Blob, SignalBody};
use hive_core::{ConnectionPhase, ConnectionState, NodeId, SignalingPhase};

/// Work for the link layer, executed in order per peer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// Create the connection and data channel, then produce a local offer.
    CreateOffer,
    /// Create the connection, apply the remote offer, produce a local answer.
    AcceptOffer(Blob),
    ApplyAnswer(Blob),
    AddCandidate(Blob),
    Close,
}

/// What the link layer reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Local offer or answer is ready to be relayed.
    LocalDescription(Blob),
    LocalCandidate(Blob),
    ChannelOpen,
    ChannelClosed,
    Failed(String),
    /// One binary frame from the data channel.
    Frame(bytes::Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEffect {
    /// Relay through the signaling server.
    Signal { to: NodeId, body: SignalBody },
    Link { peer: NodeId, command: LinkCommand },
    StateChanged { peer: NodeId, state: ConnectionState },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no connection record for {0}")]
    UnknownPeer(NodeId),
    #[error("{kind} from {peer} not expected while {phase:?}/{signaling:?}")]
    UnexpectedSignal {
        peer: NodeId,
        kind: &'static str,
        phase: ConnectionPhase,
        signaling: SignalingPhase,
    },
}

impl ConnectionError {
    /// An offer or answer that does not fit the record's state. The record
    /// cannot recover from it and is closed.
    pub fn aborts_negotiation(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedSignal {
                kind: "negotiation-offer" | "negotiation-answer",
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Requester,
    Responder,
}

#[derive(Debug)]
struct PeerRecord {
    role: Role,
    state: ConnectionState,
    remote_description: bool,
    seen_candidates: HashSet<String>,
    pending_candidates: Vec<Blob>,
}

impl PeerRecord {
    fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::default(),
            remote_description: false,
            seen_candidates: HashSet::new(),
            pending_candidates: Vec::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.connection == ConnectionPhase::Closed
    }
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    self_id: Option<NodeId>,
    peers: BTreeMap<NodeId, PeerRecord>,
    effects: Vec<ConnectionEffect>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_self_id(&mut self, id: NodeId) {
        self.self_id = Some(id);
    }

    pub fn state(&self, peer: &NodeId) -> Option<ConnectionState> {
        self.peers.get(peer).map(|r| r.state)
    }

    pub fn states(&self) -> impl Iterator<Item = (&NodeId, &ConnectionState)> {
        self.peers.iter().map(|(id, r)| (id, &r.state))
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.state(peer)
            .is_some_and(|s| s.connection == ConnectionPhase::Connected)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, r)| r.state.connection == ConnectionPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record a smoothed throughput figure. Emits a state change.
    pub fn set_speed(&mut self, peer: &NodeId, speed: f64) -> Vec<ConnectionEffect> {
        if let Some(record) = self.peers.get_mut(peer) {
            record.state.speed = Some(speed);
            let state = record.state;
            self.effects.push(ConnectionEffect::StateChanged {
                peer: peer.clone(),
                state,
            });
        }
        self.take()
    }

    // ── Roster ────────────────────────────────────────────────────────────────

    /// A peer appeared on the roster: request a connection.
    pub fn peer_joined(&mut self, peer: &NodeId) -> Vec<ConnectionEffect> {
        if self.peers.get(peer).is_some_and(|r| !r.is_closed()) {
            return self.take();
        }
        self.peers.insert(peer.clone(), PeerRecord::new(Role::Requester));
        tracing::info!(peer = %peer.short(), "requesting connection");
        self.signal(peer, SignalBody::ConnectRequest);
        self.transition(peer, ConnectionPhase::Requested, SignalingPhase::Stable);
        self.take()
    }

    /// The peer left the signaling server: close and forget it.
    pub fn peer_left(&mut self, peer: &NodeId) -> Vec<ConnectionEffect> {
        if let Some(record) = self.peers.get(peer) {
            if !record.is_closed() {
                self.close(peer, "peer left");
            }
            self.peers.remove(peer);
        }
        self.take()
    }

    // ── Signaling ─────────────────────────────────────────────────────────────

    /// A negotiation body relayed from `from`.
    pub fn on_signal(
        &mut self,
        from: &NodeId,
        body: SignalBody,
    ) -> Result<Vec<ConnectionEffect>, ConnectionError> {
        match body {
            SignalBody::ConnectRequest => self.on_request(from),
            SignalBody::ConnectResponse => {
                let record = self.record(from)?;
                if record.role != Role::Requester {
                    return Err(self.unexpected(from, "connect-response"));
                }
                tracing::debug!(peer = %from.short(), "connection request accepted");
            }
            SignalBody::NegotiationOffer(offer) => self.on_offer(from, offer)?,
            SignalBody::NegotiationAnswer(answer) => self.on_answer(from, answer)?,
            SignalBody::NegotiationCandidate(candidate) => self.on_candidate(from, candidate)?,
            other => {
                tracing::debug!(kind = other.name(), "not a negotiation message");
            }
        }
        Ok(self.take())
    }

    fn on_request(&mut self, from: &NodeId) {
        let glare = match self.peers.get(from) {
            None => false,
            Some(record) if record.is_closed() => false,
            Some(record)
                if record.role == Role::Requester
                    && record.state.connection == ConnectionPhase::Requested =>
            {
                // Both sides asked. The lower id keeps its request.
                if self.self_id.as_ref().is_some_and(|me| me < from) {
                    tracing::debug!(peer = %from.short(), "request glare, keeping ours");
                    return;
                }
                tracing::debug!(peer = %from.short(), "request glare, answering theirs");
                true
            }
            Some(_) => {
                tracing::debug!(peer = %from.short(), "duplicate connection request");
                return;
            }
        };

        let mut record = PeerRecord::new(Role::Responder);
        if glare {
            record.state.connection = ConnectionPhase::Requested;
        }
        self.peers.insert(from.clone(), record);

        tracing::info!(peer = %from.short(), "accepting connection request");
        self.signal(from, SignalBody::ConnectResponse);
        self.transition(from, ConnectionPhase::Requested, SignalingPhase::Stable);
        self.command(from, LinkCommand::CreateOffer);
    }

    fn on_offer(&mut self, from: &NodeId, offer: Blob) -> Result<(), ConnectionError> {
        let fresh = self.peers.get(from).map_or(true, |r| r.is_closed());
        if fresh {
            // Offer without a request from us: the peer learned of us first.
            self.peers.insert(from.clone(), PeerRecord::new(Role::Requester));
        }
        let record = self.record(from)?;
        if record.role != Role::Requester || record.state.signaling != SignalingPhase::Stable {
            return Err(self.unexpected(from, "negotiation-offer"));
        }
        if record.state.connection != ConnectionPhase::Requested && !fresh {
            return Err(self.unexpected(from, "negotiation-offer"));
        }

        self.command(from, LinkCommand::AcceptOffer(offer));
        self.flush_candidates(from);
        self.transition(
            from,
            ConnectionPhase::Negotiating,
            SignalingPhase::HaveRemoteOffer,
        );
        Ok(())
    }

    fn on_answer(&mut self, from: &NodeId, answer: Blob) -> Result<(), ConnectionError> {
        let record = self.record(from)?;
        if record.role != Role::Responder || record.state.signaling != SignalingPhase::HaveLocalOffer {
            return Err(self.unexpected(from, "negotiation-answer"));
        }
        let phase = record.state.connection;
        self.command(from, LinkCommand::ApplyAnswer(answer));
        self.flush_candidates(from);
        self.transition(from, phase, SignalingPhase::Stable);
        Ok(())
    }

    fn on_candidate(&mut self, from: &NodeId, candidate: Blob) -> Result<(), ConnectionError> {
        let record = self
            .peers
            .get_mut(from)
            .filter(|r| !r.is_closed())
            .ok_or_else(|| ConnectionError::UnknownPeer(from.clone()))?;

        if !record.seen_candidates.insert(candidate.canonical()) {
            tracing::trace!(peer = %from.short(), "duplicate candidate");
            return Ok(());
        }
        if !record.remote_description {
            record.pending_candidates.push(candidate);
            return Ok(());
        }
        self.command(from, LinkCommand::AddCandidate(candidate));
        Ok(())
    }

    /// Close a live record after a negotiation error. Not retried until the
    /// peer is sighted again.
    pub fn abort(&mut self, peer: &NodeId, reason: &str) -> Vec<ConnectionEffect> {
        if self.peers.get(peer).is_some_and(|r| !r.is_closed()) {
            self.close(peer, reason);
        }
        self.take()
    }

    // ── Link events ───────────────────────────────────────────────────────────

    pub fn on_link_event(
        &mut self,
        peer: &NodeId,
        event: LinkEvent,
    ) -> Result<Vec<ConnectionEffect>, ConnectionError> {
        let record = self.record(peer)?;
        let (role, phase) = (record.role, record.state.connection);

        match event {
            LinkEvent::LocalDescription(description) => match role {
                Role::Responder => {
                    self.signal(peer, SignalBody::NegotiationOffer(description));
                    self.transition(
                        peer,
                        ConnectionPhase::Negotiating,
                        SignalingPhase::HaveLocalOffer,
                    );
                }
                Role::Requester => {
                    self.signal(peer, SignalBody::NegotiationAnswer(description));
                    self.transition(peer, phase, SignalingPhase::Stable);
                }
            },
            LinkEvent::LocalCandidate(candidate) => {
                self.signal(peer, SignalBody::NegotiationCandidate(candidate));
            }
            LinkEvent::ChannelOpen => {
                tracing::info!(peer = %peer.short(), "channel open");
                self.transition(peer, ConnectionPhase::Connected, SignalingPhase::Stable);
            }
            LinkEvent::ChannelClosed => self.close(peer, "channel closed"),
            LinkEvent::Failed(reason) => {
                tracing::warn!(peer = %peer.short(), reason = %reason, "link failed");
                self.close(peer, "link failed");
            }
            LinkEvent::Frame(_) => {}
        }
        Ok(self.take())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn record(&self, peer: &NodeId) -> Result<&PeerRecord, ConnectionError> {
        self.peers
            .get(peer)
            .filter(|r| !r.is_closed())
            .ok_or_else(|| ConnectionError::UnknownPeer(peer.clone()))
    }

    fn unexpected(&self, peer: &NodeId, kind: &'static str) -> ConnectionError {
        let state = self.state(peer).unwrap_or_default();
        ConnectionError::UnexpectedSignal {
            peer: peer.clone(),
            kind,
            phase: state.connection,
            signaling: state.signaling,
        }
    }

    fn flush_candidates(&mut self, peer: &NodeId) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        record.remote_description = true;
        let pending = std::mem::take(&mut record.pending_candidates);
        for candidate in pending {
            self.command(peer, LinkCommand::AddCandidate(candidate));
        }
    }

    fn close(&mut self, peer: &NodeId, reason: &str) {
        tracing::info!(peer = %peer.short(), reason, "connection closed");
        self.command(peer, LinkCommand::Close);
        self.transition(peer, ConnectionPhase::Closed, SignalingPhase::Closed);
    }

    fn transition(&mut self, peer: &NodeId, connection: ConnectionPhase, signaling: SignalingPhase) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        if record.state.connection == connection && record.state.signaling == signaling {
            return;
        }
        record.state.connection = connection;
        record.state.signaling = signaling;
        let state = record.state;
        tracing::debug!(
            peer = %peer.short(),
            connection = ?state.connection,
            signaling = ?state.signaling,
            "connection state"
        );
        self.effects.push(ConnectionEffect::StateChanged {
            peer: peer.clone(),
            state,
        });
    }

    fn signal(&mut self, to: &NodeId, body: SignalBody) {
        self.effects.push(ConnectionEffect::Signal {
            to: to.clone(),
            body,
        });
    }

    fn command(&mut self, peer: &NodeId, command: LinkCommand) {
        self.effects.push(ConnectionEffect::Link {
            peer: peer.clone(),
            command,
        });
    }

    fn take(&mut self) -> Vec<ConnectionEffect> {
        std::mem::take(&mut self.effects)
    }
}
