//! hive-core: shared identifiers, node state, wire format and configuration.
//! All other Hive crates depend on this one.

pub mod config;
pub mod node;
pub mod wire;

pub use node::{ConnectionPhase, ConnectionState, ModuleState, NodeId, SignalingPhase, TaskId};
pub use wire::{PeerEnvelope, PeerMessage, SignalBody, SignalEnvelope, WireError};
