//! hive-services: the mesh components as I/O-free state machines, plus the
//! compute executor and the stores shared with the API.

pub mod compute_executor;
pub mod connection;
pub mod control;
pub mod mesh;
pub mod module;
pub mod result_store;
pub mod scheduler;
pub mod signaling;
pub mod transport;

pub use connection::{ConnectionEffect, ConnectionError, ConnectionManager, LinkCommand, LinkEvent};
pub use control::{BatchReceipt, ControlCommand, MeshStatus, NodeStatus};
pub use mesh::{MeshEvent, MeshNode, Output};
pub use module::{ComputeEngine, ComputeError, ComputeJob, ComputeOutcome, ModuleTracker};
pub use result_store::{CompletedTask, ResultStore, ResultSummary};
pub use scheduler::{BatchProgress, BatchReport, Scheduler, SchedulingState, SubmittedFile};
pub use signaling::{SignalError, SignalEvent, SignalingClient};
pub use transport::{ChunkedTransport, Pace, SendPacer, TransportError, TransportEvent};
