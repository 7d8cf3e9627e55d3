//! Signaling client: identity, roster and negotiation relay.
//!
//! Owns no socket. The daemon feeds it every frame read from the rendezvous
//! server and sends whatever envelopes it builds; this keeps the protocol
//! rules (who we are, who is around, what is addressed to us) testable.

use std::collections::BTreeSet;

use hive_core::wire::{SignalBody, SignalEnvelope};
use hive_core::NodeId;

/// What the rest of the node needs to know about a signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    SelfId(NodeId),
    PeerJoined(NodeId),
    PeerLeft(NodeId),
    /// Connection request/response, offer, answer or candidate from a peer.
    Negotiation { from: NodeId, body: SignalBody },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("no identity assigned yet")]
    NoIdentity,
}

#[derive(Debug, Default)]
pub struct SignalingClient {
    self_id: Option<NodeId>,
    /// Peers announced by the latest roster push.
    roster: BTreeSet<NodeId>,
}

impl SignalingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_id(&self) -> Option<&NodeId> {
        self.self_id.as_ref()
    }

    pub fn roster(&self) -> impl Iterator<Item = &NodeId> {
        self.roster.iter()
    }

    /// Process one frame from the server.
    pub fn handle(&mut self, envelope: SignalEnvelope) -> Vec<SignalEvent> {
        let SignalEnvelope { from, to, body } = envelope;

        if let SignalBody::AssignIdentity(id) = body {
            if self.self_id.as_ref() == Some(&id) {
                return Vec::new();
            }
            tracing::info!(id = %id, "identity assigned");
            self.roster.remove(&id);
            self.self_id = Some(id.clone());
            return vec![SignalEvent::SelfId(id)];
        }

        let Some(self_id) = self.self_id.clone() else {
            tracing::debug!(kind = body.name(), "frame before identity, dropping");
            return Vec::new();
        };

        if let Some(to) = &to {
            if *to != self_id {
                tracing::debug!(kind = body.name(), to = %to, "frame addressed elsewhere, dropping");
                return Vec::new();
            }
        }

        match body {
            SignalBody::AssignIdentity(_) => Vec::new(),
            SignalBody::RosterUpdate(peers) => self.apply_roster(&self_id, peers),
            SignalBody::PeerLeft(id) => {
                self.roster.remove(&id);
                if id == self_id {
                    return Vec::new();
                }
                tracing::info!(peer = %id.short(), "peer left");
                vec![SignalEvent::PeerLeft(id)]
            }
            negotiation => match from {
                Some(from) if from != self_id => {
                    tracing::debug!(kind = negotiation.name(), from = %from.short(), "signal received");
                    vec![SignalEvent::Negotiation {
                        from,
                        body: negotiation,
                    }]
                }
                _ => {
                    tracing::debug!(kind = negotiation.name(), "negotiation frame without usable sender");
                    Vec::new()
                }
            },
        }
    }

    fn apply_roster(&mut self, self_id: &NodeId, peers: Vec<NodeId>) -> Vec<SignalEvent> {
        let next: BTreeSet<NodeId> = peers.into_iter().filter(|p| p != self_id).collect();

        let mut events: Vec<SignalEvent> = self
            .roster
            .difference(&next)
            .cloned()
            .map(SignalEvent::PeerLeft)
            .collect();
        events.extend(
            next.difference(&self.roster)
                .cloned()
                .map(SignalEvent::PeerJoined),
        );

        tracing::debug!(
            peers = next.len(),
            changes = events.len(),
            "roster updated"
        );
        self.roster = next;
        events
    }

    /// Build an outgoing envelope from this node to `to`.
    pub fn envelope(&self, to: &NodeId, body: SignalBody) -> Result<SignalEnvelope, SignalError> {
        let from = self.self_id.clone().ok_or(SignalError::NoIdentity)?;
        Ok(SignalEnvelope {
            from: Some(from),
            to: Some(to.clone()),
            body,
        })
    }
}
