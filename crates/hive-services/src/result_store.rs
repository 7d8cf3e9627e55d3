use bytes::Bytes;
use dashmap::DashMap;
use hive_core::{NodeId, TaskId};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Output of one finished task.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub task_id: TaskId,
    /// Submitted file name.
    pub name: String,
    pub output: Bytes,
    /// Node that produced the result.
    pub node: NodeId,
    pub elapsed_ms: u64,
    /// Unix ms when the result arrived.
    pub completed_at: u64,
}

/// Listing entry without the bytes.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub task_id: TaskId,
    pub name: String,
    pub bytes: usize,
    pub node: NodeId,
    pub elapsed_ms: u64,
    pub completed_at: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Results of the current batch. Written by the mesh loop, read by the API.
#[derive(Clone, Default)]
pub struct ResultStore {
    /// task_id → CompletedTask
    results: Arc<DashMap<TaskId, CompletedTask>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. The first one for a task wins.
    pub fn insert(&self, task_id: TaskId, name: String, output: Bytes, node: NodeId, elapsed_ms: u64) {
        self.results
            .entry(task_id.clone())
            .or_insert_with(|| CompletedTask {
                task_id,
                name,
                output,
                node,
                elapsed_ms,
                completed_at: now_ms(),
            });
    }

    pub fn get(&self, task_id: &TaskId) -> Option<CompletedTask> {
        self.results.get(task_id).map(|r| r.clone())
    }

    /// All results, oldest first.
    pub fn list(&self) -> Vec<ResultSummary> {
        let mut list: Vec<ResultSummary> = self
            .results
            .iter()
            .map(|r| ResultSummary {
                task_id: r.task_id.clone(),
                name: r.name.clone(),
                bytes: r.output.len(),
                node: r.node.clone(),
                elapsed_ms: r.elapsed_ms,
                completed_at: r.completed_at,
            })
            .collect();
        list.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        list
    }

    pub fn clear(&self) {
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
