//! Control surface contract between the presentation layer and the mesh loop.

use hive_core::{ConnectionState, ModuleState, NodeId, TaskId};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::scheduler::{BatchProgress, SchedulingState, SubmittedFile};

/// Requests the API sends into the mesh loop.
#[derive(Debug)]
pub enum ControlCommand {
    Status {
        reply: oneshot::Sender<MeshStatus>,
    },
    SubmitBatch {
        files: Vec<SubmittedFile>,
        reply: oneshot::Sender<BatchReceipt>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub is_self: bool,
    /// None for self.
    pub connection: Option<ConnectionState>,
    pub module: ModuleState,
    /// None while the node is not eligible.
    pub scheduling: Option<SchedulingState>,
    pub assigned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub self_id: Option<NodeId>,
    pub nodes: Vec<NodeStatus>,
    pub batch: BatchProgress,
    pub transfers_in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub task_ids: Vec<TaskId>,
    /// Tasks in the current batch after this submission.
    pub batch_total: usize,
}
