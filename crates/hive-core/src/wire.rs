//! Hive wire format: every message that crosses a process boundary.
//!
//! Two protocols share the `{type, from, to, ...}` envelope shape:
//!
//!   signaling:    JSON text frames between a node and the rendezvous server.
//!                  The server relays negotiation messages verbatim.
//!   peer channel: MessagePack binary frames on the direct data channel.
//!                  Payload bytes travel as MessagePack binaries.
//!
//! Both are closed sum types; adding a message kind is a protocol change.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::node::{ModuleState, NodeId, TaskId};

// ── Signaling ─────────────────────────────────────────────────────────────────

/// Session description or NAT-traversal candidate, relayed without inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blob(pub serde_json::Value);

impl Blob {
    /// Canonical text form, used to recognise duplicate candidates.
    pub fn canonical(&self) -> String {
        self.0.to_string()
    }
}

/// One signaling frame.
///
/// `from` is filled by the sending node, `to` names the addressee. Server
/// originated frames (`assign-identity`, `roster-update`, `peer-left`) leave
/// `from` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeId>,
    #[serde(flatten)]
    pub body: SignalBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalBody {
    /// Server → client: the id assigned to this connection.
    AssignIdentity(NodeId),
    /// Server → client: every other node currently on the server.
    RosterUpdate(Vec<NodeId>),
    /// Server → client: a node disconnected from the server.
    PeerLeft(NodeId),
    ConnectRequest,
    ConnectResponse,
    NegotiationOffer(Blob),
    NegotiationAnswer(Blob),
    NegotiationCandidate(Blob),
}

impl SignalBody {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AssignIdentity(_) => "assign-identity",
            Self::RosterUpdate(_) => "roster-update",
            Self::PeerLeft(_) => "peer-left",
            Self::ConnectRequest => "connect-request",
            Self::ConnectResponse => "connect-response",
            Self::NegotiationOffer(_) => "negotiation-offer",
            Self::NegotiationAnswer(_) => "negotiation-answer",
            Self::NegotiationCandidate(_) => "negotiation-candidate",
        }
    }
}

impl SignalEnvelope {
    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Json)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(WireError::Json)
    }
}

// ── Peer channel ──────────────────────────────────────────────────────────────

/// Largest message a data channel accepts (SCTP default max message size).
pub const MAX_CHANNEL_MESSAGE: usize = 65_536;

/// Room left in a fragment frame for the envelope around the chunk bytes.
pub const FRAGMENT_HEADROOM: usize = 4096;

/// Random per-transfer identifier for chunked messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One frame on a peer data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(flatten)]
    pub body: PeerMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum PeerMessage {
    /// One slice of an oversized serialized envelope.
    ChunkFragment(ChunkFragment),
    /// Receiver → sender: transfer reassembled.
    ChunkComplete { transfer_id: TransferId },
    /// Measured throughput between the two ends, MB/s.
    SpeedReport { value: f64 },
    /// Sender's compute module counters.
    ModuleState(ModuleState),
    /// Coordinator → worker: process this payload.
    TaskDispatch {
        task_id: TaskId,
        name: String,
        payload: Bytes,
    },
    /// Worker → coordinator.
    TaskResult {
        task_id: TaskId,
        payload: Bytes,
        elapsed_ms: u64,
    },
    /// Worker → coordinator: the engine rejected the payload.
    TaskFailed { task_id: TaskId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFragment {
    pub transfer_id: TransferId,
    /// Type of the message being carried.
    pub message_type: String,
    pub total: u32,
    pub index: u32,
    pub value: Bytes,
    /// Unix ms when the sender started the transfer.
    pub time: u64,
}

impl PeerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChunkFragment(_) => "chunk-fragment",
            Self::ChunkComplete { .. } => "chunk-complete",
            Self::SpeedReport { .. } => "speed-report",
            Self::ModuleState(_) => "module-state",
            Self::TaskDispatch { .. } => "task-dispatch",
            Self::TaskResult { .. } => "task-result",
            Self::TaskFailed { .. } => "task-failed",
        }
    }
}

impl PeerEnvelope {
    pub fn new(from: NodeId, to: NodeId, body: PeerMessage) -> Self {
        Self { from, to, body }
    }

    /// Serialize to a MessagePack frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(WireError::Encode)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(frame).map_err(WireError::Decode)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid signaling JSON: {0}")]
    Json(serde_json::Error),
    #[error("peer frame encoding failed: {0}")]
    Encode(rmp_serde::encode::Error),
    #[error("peer frame decoding failed: {0}")]
    Decode(rmp_serde::decode::Error),
}
