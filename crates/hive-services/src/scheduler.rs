//! Adaptive task scheduler.
//!
//! Each node gets a backlog threshold from how far its capability sits above or
//! below the mesh average:
//!
//!   d      = ws·(speed − mean_speed)/mean_speed + wb·(bench − mean_bench)/mean_bench
//!   thresh = round(k·d + k)
//!
//! A pending task goes to the eligible node with the smallest backlog
//! (`queued − complete`) that is still below its threshold. Means are taken
//! over eligible nodes only (benchmark > 0, and self or connected). A node
//! with no speed measurement is left out of the speed mean and gets a zero
//! speed term.
//!
//! The scheduler owns the task table and its own view of every node's module
//! state. Assignments bump `queued` in that view right away so one pass does
//! not pile everything onto the same node; reported states merge by taking the
//! larger counter.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hive_core::config::SchedulerConfig;
use hive_core::{ConnectionPhase, ModuleState, NodeId, TaskId};
use serde::Serialize;

/// Failures after which a task is no longer offered.
pub const MAX_TASK_FAILURES: u32 = 3;

/// One file handed in for processing.
#[derive(Debug, Clone)]
pub struct SubmittedFile {
    pub name: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub payload: Bytes,
    pub assigned: Option<NodeId>,
    pub result: Option<Bytes>,
    /// Node whose result was accepted.
    pub completed_by: Option<NodeId>,
    pub failures: u32,
    seq: u64,
}

impl Task {
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    fn is_pending(&self) -> bool {
        self.assigned.is_none() && self.result.is_none() && !self.is_abandoned()
    }

    /// Failed too often to be offered again.
    pub fn is_abandoned(&self) -> bool {
        self.result.is_none() && self.failures >= MAX_TASK_FAILURES
    }
}

/// Decision to run `task_id` on `node`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node: NodeId,
    pub name: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulingState {
    pub deviation: f64,
    pub threshold: i64,
}

/// Everything one scheduling pass decided.
#[derive(Debug, Default)]
pub struct SchedulePass {
    pub scheduling: Vec<(NodeId, SchedulingState)>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub tasks: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub complete: usize,
    pub assigned: usize,
    pub pending: usize,
    pub abandoned: usize,
    pub elapsed_ms: u64,
    pub finished: bool,
}

#[derive(Debug, Default)]
struct NodeView {
    module: ModuleState,
    speed: Option<f64>,
    connected: bool,
    is_self: bool,
}

impl NodeView {
    fn is_eligible(&self) -> bool {
        self.module.benchmark > 0.0 && (self.is_self || self.connected)
    }
}

/// Half-up rounding.
fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

fn relative(value: f64, mean: f64) -> f64 {
    if mean > 0.0 {
        (value - mean) / mean
    } else {
        0.0
    }
}

/// Hex BLAKE3 of submitter, submission time, position and content.
pub fn task_id(submitter: &NodeId, at_ms: u64, seq: u64, payload: &[u8]) -> TaskId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(submitter.as_str().as_bytes());
    hasher.update(&at_ms.to_le_bytes());
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    TaskId::new(hex::encode(hasher.finalize().as_bytes()))
}

pub struct Scheduler {
    config: SchedulerConfig,
    nodes: BTreeMap<NodeId, NodeView>,
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    next_seq: u64,
    batch_started: Option<Instant>,
    batch_reported: bool,
    last_pass: BTreeMap<NodeId, SchedulingState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            nodes: BTreeMap::new(),
            tasks: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
            batch_started: None,
            batch_reported: false,
            last_pass: BTreeMap::new(),
        }
    }

    // ── Node updates ──────────────────────────────────────────────────────────

    pub fn add_node(&mut self, id: &NodeId, is_self: bool) {
        let node = self.nodes.entry(id.clone()).or_default();
        node.is_self |= is_self;
    }

    /// Forget a node. Returns the tasks that went back to pending.
    pub fn remove_node(&mut self, id: &NodeId) -> Vec<TaskId> {
        let reverted = self.revert(id, "node removed");
        self.nodes.remove(id);
        self.last_pass.remove(id);
        reverted
    }

    /// Connection phase from the connection manager. `Closed` voids the
    /// node's assignments.
    pub fn set_connection(&mut self, id: &NodeId, phase: ConnectionPhase) -> Vec<TaskId> {
        let node = self.nodes.entry(id.clone()).or_default();
        node.connected = phase == ConnectionPhase::Connected;
        if phase == ConnectionPhase::Closed {
            return self.revert(id, "connection closed");
        }
        Vec::new()
    }

    pub fn set_speed(&mut self, id: &NodeId, speed: f64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.speed = Some(speed);
        }
    }

    /// Merge a reported module state. A zero benchmark voids the node's
    /// assignments.
    pub fn update_module_state(&mut self, id: &NodeId, reported: ModuleState) -> Vec<TaskId> {
        let node = self.nodes.entry(id.clone()).or_default();
        node.module.queued = node.module.queued.max(reported.queued);
        node.module.complete = node.module.complete.max(reported.complete);
        node.module.benchmark = reported.benchmark;

        if reported.benchmark <= 0.0 {
            return self.revert(id, "node not capable");
        }
        Vec::new()
    }

    fn revert(&mut self, id: &NodeId, reason: &str) -> Vec<TaskId> {
        let reverted: Vec<TaskId> = self
            .tasks
            .iter_mut()
            .filter(|t| t.result.is_none() && t.assigned.as_ref() == Some(id))
            .map(|t| {
                t.assigned = None;
                t.id.clone()
            })
            .collect();

        if let Some(node) = self.nodes.get_mut(id) {
            node.module.queued = node.module.complete;
        }
        if !reverted.is_empty() {
            tracing::info!(node = %id.short(), tasks = reverted.len(), reason, "tasks reverted");
        }
        reverted
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    /// Queue files as new tasks. Starts a new batch if the previous one finished.
    pub fn submit(
        &mut self,
        submitter: &NodeId,
        files: Vec<SubmittedFile>,
        now: Instant,
    ) -> Vec<TaskId> {
        if self.is_finished() {
            self.tasks.clear();
            self.index.clear();
        }
        if self.tasks.is_empty() {
            self.batch_started = Some(now);
            self.batch_reported = false;
        }

        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let seq = self.next_seq;
            self.next_seq += 1;
            let id = task_id(submitter, at_ms, seq, &file.payload);
            self.index.insert(id.clone(), self.tasks.len());
            self.tasks.push(Task {
                id: id.clone(),
                name: file.name,
                payload: file.payload,
                assigned: None,
                result: None,
                completed_by: None,
                failures: 0,
                seq,
            });
            ids.push(id);
        }
        tracing::info!(tasks = ids.len(), total = self.tasks.len(), "batch submitted");
        ids
    }

    /// Accept a result. Only the first result for a task counts.
    pub fn complete(&mut self, task_id: &TaskId, from: &NodeId, result: Bytes) -> bool {
        let Some(task) = self.index.get(task_id).and_then(|&i| self.tasks.get_mut(i)) else {
            tracing::debug!(task = %task_id.short(), "result for unknown task");
            return false;
        };
        if task.result.is_some() {
            tracing::debug!(task = %task_id.short(), from = %from.short(), "duplicate result ignored");
            return false;
        }
        if task.assigned.as_ref() != Some(from) {
            tracing::debug!(task = %task_id.short(), from = %from.short(), "late result accepted");
        }
        task.result = Some(result);
        task.assigned = None;
        task.completed_by = Some(from.clone());
        true
    }

    /// A worker could not process the task: back to pending.
    pub fn fail(&mut self, task_id: &TaskId, from: &NodeId) -> bool {
        let Some(task) = self.index.get(task_id).and_then(|&i| self.tasks.get_mut(i)) else {
            return false;
        };
        if task.result.is_some() || task.assigned.as_ref() != Some(from) {
            return false;
        }
        task.assigned = None;
        task.failures += 1;
        if task.is_abandoned() {
            tracing::warn!(task = %task_id.short(), failures = task.failures, "task abandoned");
        } else {
            tracing::info!(task = %task_id.short(), node = %from.short(), "task failed, back to pending");
        }
        true
    }

    /// Take back an assignment that never reached the worker. Not a failure:
    /// the task goes back to pending and the node's optimistic `queued` bump
    /// is undone.
    pub fn unassign(&mut self, task_id: &TaskId, node_id: &NodeId) -> bool {
        let Some(task) = self.index.get(task_id).and_then(|&i| self.tasks.get_mut(i)) else {
            return false;
        };
        if task.result.is_some() || task.assigned.as_ref() != Some(node_id) {
            return false;
        }
        task.assigned = None;
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.module.queued = node.module.queued.saturating_sub(1).max(node.module.complete);
        }
        tracing::debug!(task = %task_id.short(), node = %node_id.short(), "dispatch undelivered, back to pending");
        true
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    fn scheduling_states(&self) -> Vec<(NodeId, SchedulingState)> {
        let eligible: Vec<(&NodeId, &NodeView)> =
            self.nodes.iter().filter(|(_, n)| n.is_eligible()).collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let speeds: Vec<f64> = eligible.iter().filter_map(|(_, n)| n.speed).collect();
        let mean_speed = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };
        let mean_bench =
            eligible.iter().map(|(_, n)| n.module.benchmark).sum::<f64>() / eligible.len() as f64;

        let k = self.config.backlog_factor;
        eligible
            .into_iter()
            .map(|(id, node)| {
                let speed_term = node
                    .speed
                    .map(|s| self.config.speed_weight * relative(s, mean_speed))
                    .unwrap_or(0.0);
                let bench_term =
                    self.config.benchmark_weight * relative(node.module.benchmark, mean_bench);
                let deviation = speed_term + bench_term;
                let state = SchedulingState {
                    deviation,
                    threshold: round_half_up(k * deviation + k),
                };
                (id.clone(), state)
            })
            .collect()
    }

    /// Run one pass: hand out pending tasks in submission order until no
    /// node is below its threshold.
    pub fn schedule(&mut self) -> SchedulePass {
        let scheduling = self.scheduling_states();
        self.last_pass = scheduling.iter().cloned().collect();

        let mut assignments = Vec::new();
        loop {
            let Some(task_idx) = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.is_pending())
                .min_by_key(|(_, t)| t.seq)
                .map(|(i, _)| i)
            else {
                break;
            };

            let candidate = scheduling
                .iter()
                .filter_map(|(id, state)| {
                    let delta = self.nodes.get(id)?.module.delta();
                    (delta < state.threshold).then_some((id, delta))
                })
                .min_by_key(|(_, delta)| *delta)
                .map(|(id, _)| id.clone());
            let Some(node_id) = candidate else {
                break;
            };

            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.module.queued += 1;
            }
            let task = &mut self.tasks[task_idx];
            task.assigned = Some(node_id.clone());
            tracing::debug!(task = %task.id.short(), node = %node_id.short(), "task assigned");
            assignments.push(Assignment {
                task_id: task.id.clone(),
                node: node_id,
                name: task.name.clone(),
                payload: task.payload.clone(),
            });
        }

        SchedulePass {
            scheduling,
            assignments,
        }
    }

    // ── Batch ─────────────────────────────────────────────────────────────────

    fn is_finished(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(Task::is_complete)
    }

    /// Report batch completion, once per batch.
    pub fn finished(&mut self, now: Instant) -> Option<BatchReport> {
        if self.batch_reported || !self.is_finished() {
            return None;
        }
        self.batch_reported = true;
        let elapsed = self
            .batch_started
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        Some(BatchReport {
            tasks: self.tasks.len(),
            elapsed,
        })
    }

    pub fn progress(&self, now: Instant) -> BatchProgress {
        let complete = self.tasks.iter().filter(|t| t.is_complete()).count();
        let assigned = self
            .tasks
            .iter()
            .filter(|t| t.assigned.is_some() && !t.is_complete())
            .count();
        let abandoned = self.tasks.iter().filter(|t| t.is_abandoned()).count();
        BatchProgress {
            total: self.tasks.len(),
            complete,
            assigned,
            pending: self.tasks.len() - complete - assigned - abandoned,
            abandoned,
            elapsed_ms: self
                .batch_started
                .filter(|_| !self.tasks.is_empty())
                .map(|start| now.saturating_duration_since(start).as_millis() as u64)
                .unwrap_or(0),
            finished: self.is_finished(),
        }
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|&i| self.tasks.get(i))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn module_state(&self, id: &NodeId) -> Option<ModuleState> {
        self.nodes.get(id).map(|n| n.module)
    }

    pub fn scheduling_state(&self, id: &NodeId) -> Option<SchedulingState> {
        self.last_pass.get(id).copied()
    }

    pub fn assigned_to(&self, id: &NodeId) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.assigned.as_ref() == Some(id))
            .count()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }
}
