//! Node identity and the state records every component keys on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier assigned to a node by the signaling server.
///
/// Opaque to Hive; only compared, hashed and ordered (connection glare is
/// resolved by ordering).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        prefix(&self.0, 8)
    }
}

fn prefix(s: &str, chars: usize) -> &str {
    let end = s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a submitted task (hex BLAKE3 of submitter, time and content).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        prefix(&self.0, 16)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-description exchange state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingPhase {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Lifecycle of one peer connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Requested,
    Negotiating,
    Connected,
    Closed,
}

/// Connection view of a node, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    pub signaling: SignalingPhase,
    pub connection: ConnectionPhase,
    /// Smoothed throughput to this node in MB/s. None until measured.
    pub speed: Option<f64>,
}

/// Work counters and capability score of a node's compute module.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    pub queued: u64,
    pub complete: u64,
    /// Self-benchmark score. 0 = not capable (yet) or failed.
    pub benchmark: f64,
}

impl ModuleState {
    /// Outstanding backlog.
    pub fn delta(&self) -> i64 {
        self.queued as i64 - self.complete as i64
    }
}
