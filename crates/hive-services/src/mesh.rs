//! Mesh node: signaling, connections, transport, scheduler and the local
//! module wired together as one I/O-free reactor.
//!
//! Every input (signaling frame, link event, compute outcome, control
//! command) is handled to completion and returns the outputs the caller must
//! carry out. The daemon drives one of these from its event loop; the
//! integration tests drive several against each other in memory.

use std::collections::HashSet;
use std::time::Instant;

use bytes::Bytes;
use hive_core::config::HiveConfig;
use hive_core::wire::{PeerEnvelope, PeerMessage, SignalEnvelope};
use hive_core::{ConnectionPhase, ConnectionState, ModuleState, NodeId, TaskId};

use crate::connection::{ConnectionEffect, ConnectionManager, LinkCommand, LinkEvent};
use crate::control::{BatchReceipt, ControlCommand, MeshStatus, NodeStatus};
use crate::module::{ComputeJob, ComputeOutcome, ModuleTracker};
use crate::result_store::ResultStore;
use crate::scheduler::{BatchReport, Scheduler, SchedulingState, SubmittedFile};
use crate::signaling::{SignalEvent, SignalingClient};
use crate::transport::{ChunkedTransport, TransportEvent};

/// Work for the daemon.
#[derive(Debug)]
pub enum Output {
    /// Send to the signaling server.
    Signal(SignalEnvelope),
    Link { peer: NodeId, command: LinkCommand },
    /// Queue on the peer's channel, in order.
    Frames { peer: NodeId, frames: Vec<Bytes> },
    Compute(ComputeJob),
    Event(MeshEvent),
}

/// Presentation events.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    ConnectionState { node: NodeId, state: ConnectionState },
    ModuleState { node: NodeId, state: ModuleState },
    SchedulingState { node: NodeId, state: SchedulingState },
    BatchComplete(BatchReport),
}

pub struct MeshNode {
    signaling: SignalingClient,
    connections: ConnectionManager,
    transport: ChunkedTransport,
    scheduler: Scheduler,
    module: ModuleTracker,
    results: ResultStore,
    /// Peers that have been sent our module state since connecting.
    greeted: HashSet<NodeId>,
    /// Set by anything that can change an assignment decision.
    dirty: bool,
    out: Vec<Output>,
}

impl MeshNode {
    pub fn new(config: &HiveConfig, results: ResultStore) -> Self {
        Self {
            signaling: SignalingClient::new(),
            connections: ConnectionManager::new(),
            transport: ChunkedTransport::new(&config.transport),
            scheduler: Scheduler::new(config.scheduler.clone()),
            module: ModuleTracker::new(),
            results,
            greeted: HashSet::new(),
            dirty: false,
            out: Vec::new(),
        }
    }

    pub fn self_id(&self) -> Option<&NodeId> {
        self.signaling.self_id()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn module_state(&self) -> ModuleState {
        self.module.state()
    }

    // ── Inputs ────────────────────────────────────────────────────────────────

    pub fn on_signal(&mut self, envelope: SignalEnvelope, now: Instant) -> Vec<Output> {
        for event in self.signaling.handle(envelope) {
            match event {
                SignalEvent::SelfId(id) => {
                    self.connections.set_self_id(id.clone());
                    self.transport.set_self_id(id.clone());
                    self.scheduler.add_node(&id, true);
                    self.scheduler.update_module_state(&id, self.module.state());
                    self.emit(MeshEvent::NodeAdded(id.clone()));
                    self.emit(MeshEvent::ModuleState {
                        node: id,
                        state: self.module.state(),
                    });
                    self.dirty = true;
                }
                SignalEvent::PeerJoined(peer) => {
                    self.track_peer(&peer);
                    let effects = self.connections.peer_joined(&peer);
                    self.apply(effects, now);
                }
                SignalEvent::PeerLeft(peer) => {
                    let effects = self.connections.peer_left(&peer);
                    self.apply(effects, now);
                    self.transport.forget_peer(&peer);
                    self.greeted.remove(&peer);
                    if self.scheduler.contains(&peer) {
                        self.scheduler.remove_node(&peer);
                        self.emit(MeshEvent::NodeRemoved(peer));
                    }
                    self.dirty = true;
                }
                SignalEvent::Negotiation { from, body } => {
                    self.track_peer(&from);
                    match self.connections.on_signal(&from, body) {
                        Ok(effects) => self.apply(effects, now),
                        Err(e) => {
                            tracing::warn!(peer = %from.short(), error = %e, "negotiation error");
                            if e.aborts_negotiation() {
                                let effects = self.connections.abort(&from, "negotiation error");
                                self.apply(effects, now);
                            }
                        }
                    }
                }
            }
        }
        self.finish(now)
    }

    pub fn on_link_event(&mut self, peer: &NodeId, event: LinkEvent, now: Instant) -> Vec<Output> {
        match event {
            LinkEvent::Frame(data) => self.on_frame(peer, &data, now),
            other => match self.connections.on_link_event(peer, other) {
                Ok(effects) => self.apply(effects, now),
                Err(e) => tracing::debug!(peer = %peer.short(), error = %e, "stale link event"),
            },
        }
        self.finish(now)
    }

    pub fn on_compute_done(&mut self, outcome: ComputeOutcome, now: Instant) -> Vec<Output> {
        let ComputeOutcome {
            task_id,
            origin,
            result,
            elapsed,
        } = outcome;
        let elapsed_ms = elapsed.as_millis() as u64;

        self.module.finish();
        self.module_changed(now);

        match (origin, result) {
            (None, Ok(payload)) => {
                if let Some(me) = self.self_id().cloned() {
                    self.accept_result(&task_id, &me, payload, elapsed_ms, now);
                }
            }
            (None, Err(e)) => {
                tracing::warn!(task = %task_id.short(), error = %e, "local task failed");
                if let Some(me) = self.self_id().cloned() {
                    self.scheduler.fail(&task_id, &me);
                }
            }
            (Some(coordinator), Ok(payload)) => {
                self.send(
                    &coordinator,
                    PeerMessage::TaskResult {
                        task_id,
                        payload,
                        elapsed_ms,
                    },
                    now,
                );
            }
            (Some(coordinator), Err(e)) => {
                self.send(
                    &coordinator,
                    PeerMessage::TaskFailed {
                        task_id,
                        reason: e.to_string(),
                    },
                    now,
                );
            }
        }
        self.dirty = true;
        self.finish(now)
    }

    /// Self-benchmark finished.
    pub fn on_benchmark(&mut self, score: f64, now: Instant) -> Vec<Output> {
        let state = self.module.set_benchmark(score);
        tracing::info!(benchmark = state.benchmark, "self-benchmark complete");
        self.module_changed(now);
        self.dirty = true;
        self.finish(now)
    }

    pub fn submit(&mut self, files: Vec<SubmittedFile>, now: Instant) -> (BatchReceipt, Vec<Output>) {
        if self.scheduler.progress(now).finished {
            self.results.clear();
        }
        let submitter = self
            .self_id()
            .cloned()
            .unwrap_or_else(|| NodeId::new("local"));
        let task_ids = self.scheduler.submit(&submitter, files, now);
        let receipt = BatchReceipt {
            task_ids,
            batch_total: self.scheduler.tasks().len(),
        };
        self.dirty = true;
        (receipt, self.finish(now))
    }

    pub fn on_control(&mut self, command: ControlCommand, now: Instant) -> Vec<Output> {
        match command {
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status(now));
                Vec::new()
            }
            ControlCommand::SubmitBatch { files, reply } => {
                let (receipt, outputs) = self.submit(files, now);
                let _ = reply.send(receipt);
                outputs
            }
        }
    }

    /// Periodic housekeeping: evict stale transfers.
    pub fn sweep(&mut self, now: Instant) -> Vec<Output> {
        let evicted = self.transport.sweep(now);
        if evicted > 0 {
            tracing::warn!(evicted, "stale transfers evicted");
        }
        self.finish(now)
    }

    pub fn status(&self, now: Instant) -> MeshStatus {
        let me = self.self_id();
        let nodes = self
            .scheduler
            .nodes()
            .map(|id| {
                let is_self = Some(id) == me;
                NodeStatus {
                    id: id.clone(),
                    is_self,
                    connection: self.connections.state(id),
                    module: if is_self {
                        self.module.state()
                    } else {
                        self.scheduler.module_state(id).unwrap_or_default()
                    },
                    scheduling: self.scheduler.scheduling_state(id),
                    assigned: self.scheduler.assigned_to(id),
                }
            })
            .collect();
        MeshStatus {
            self_id: me.cloned(),
            nodes,
            batch: self.scheduler.progress(now),
            transfers_in_flight: self.transport.in_flight(),
        }
    }

    // ── Peer channel ──────────────────────────────────────────────────────────

    fn on_frame(&mut self, peer: &NodeId, data: &[u8], now: Instant) {
        let events = match self.transport.incoming(peer, data, now) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(peer = %peer.short(), error = %e, "bad frame");
                return;
            }
        };
        for event in events {
            match event {
                TransportEvent::Deliver(envelope) => self.deliver(envelope, now),
                TransportEvent::Send { to, frames } => self.push_frames(&to, frames),
                TransportEvent::SpeedMeasured { peer, speed } => self.record_speed(&peer, speed),
            }
        }
    }

    fn deliver(&mut self, envelope: PeerEnvelope, now: Instant) {
        let from = envelope.from;
        match envelope.body {
            PeerMessage::ModuleState(state) => {
                self.scheduler.update_module_state(&from, state);
                self.emit(MeshEvent::ModuleState { node: from, state });
                self.dirty = true;
            }
            PeerMessage::SpeedReport { value } => self.record_speed(&from, value),
            PeerMessage::TaskDispatch {
                task_id,
                name,
                payload,
            } => {
                tracing::debug!(task = %task_id.short(), from = %from.short(), "task received");
                self.module.accept();
                self.module_changed(now);
                self.out.push(Output::Compute(ComputeJob {
                    task_id,
                    name,
                    payload,
                    origin: Some(from),
                }));
            }
            PeerMessage::TaskResult {
                task_id,
                payload,
                elapsed_ms,
            } => {
                self.accept_result(&task_id, &from, payload, elapsed_ms, now);
                self.dirty = true;
            }
            PeerMessage::TaskFailed { task_id, reason } => {
                tracing::warn!(task = %task_id.short(), node = %from.short(), reason = %reason, "remote task failed");
                self.scheduler.fail(&task_id, &from);
                self.dirty = true;
            }
            PeerMessage::ChunkFragment(_) | PeerMessage::ChunkComplete { .. } => {
                tracing::debug!(from = %from.short(), "transport message reached delivery");
            }
        }
    }

    fn accept_result(
        &mut self,
        task_id: &TaskId,
        from: &NodeId,
        payload: Bytes,
        elapsed_ms: u64,
        now: Instant,
    ) {
        if !self.scheduler.complete(task_id, from, payload.clone()) {
            return;
        }
        let name = self
            .scheduler
            .task(task_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        self.results
            .insert(task_id.clone(), name, payload, from.clone(), elapsed_ms);

        if let Some(report) = self.scheduler.finished(now) {
            tracing::info!(
                tasks = report.tasks,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "batch complete"
            );
            self.emit(MeshEvent::BatchComplete(report));
        }
    }

    fn record_speed(&mut self, peer: &NodeId, speed: f64) {
        self.scheduler.set_speed(peer, speed);
        let effects = self.connections.set_speed(peer, speed);
        for effect in effects {
            if let ConnectionEffect::StateChanged { peer, state } = effect {
                self.emit(MeshEvent::ConnectionState { node: peer, state });
            }
        }
        self.dirty = true;
    }

    /// Our counters changed: feed the scheduler and tell every peer.
    fn module_changed(&mut self, now: Instant) {
        let state = self.module.state();
        if let Some(me) = self.self_id().cloned() {
            self.scheduler.update_module_state(&me, state);
            self.emit(MeshEvent::ModuleState { node: me, state });
        }
        for peer in self.connections.connected_peers() {
            self.send(&peer, PeerMessage::ModuleState(state), now);
        }
    }

    fn send(&mut self, peer: &NodeId, body: PeerMessage, now: Instant) -> bool {
        if !self.connections.is_connected(peer) {
            tracing::debug!(peer = %peer.short(), kind = body.name(), "channel not open, dropping");
            return false;
        }
        match self.transport.outgoing(peer, body, now) {
            Ok(frames) => {
                self.out.push(Output::Frames {
                    peer: peer.clone(),
                    frames,
                });
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer.short(), error = %e, "failed to encode message");
                false
            }
        }
    }

    fn push_frames(&mut self, peer: &NodeId, frames: Vec<Bytes>) {
        if self.connections.is_connected(peer) {
            self.out.push(Output::Frames {
                peer: peer.clone(),
                frames,
            });
        }
    }

    // ── Connection effects ────────────────────────────────────────────────────

    fn track_peer(&mut self, peer: &NodeId) {
        if !self.scheduler.contains(peer) {
            self.scheduler.add_node(peer, false);
            self.emit(MeshEvent::NodeAdded(peer.clone()));
        }
    }

    fn apply(&mut self, effects: Vec<ConnectionEffect>, now: Instant) {
        for effect in effects {
            match effect {
                ConnectionEffect::Signal { to, body } => match self.signaling.envelope(&to, body) {
                    Ok(envelope) => self.out.push(Output::Signal(envelope)),
                    Err(e) => tracing::warn!(peer = %to.short(), error = %e, "cannot signal"),
                },
                ConnectionEffect::Link { peer, command } => {
                    self.out.push(Output::Link { peer, command });
                }
                ConnectionEffect::StateChanged { peer, state } => {
                    self.scheduler.set_connection(&peer, state.connection);
                    self.emit(MeshEvent::ConnectionState {
                        node: peer.clone(),
                        state,
                    });
                    match state.connection {
                        ConnectionPhase::Connected if self.greeted.insert(peer.clone()) => {
                            self.send(&peer, PeerMessage::ModuleState(self.module.state()), now);
                        }
                        ConnectionPhase::Closed => {
                            self.greeted.remove(&peer);
                        }
                        _ => {}
                    }
                    self.dirty = true;
                }
            }
        }
    }

    // ── Scheduling ────────────────────────────────────────────────────────────

    fn schedule(&mut self, now: Instant) {
        let me = self.self_id().cloned();
        let pass = self.scheduler.schedule();

        for (node, state) in pass.scheduling {
            self.emit(MeshEvent::SchedulingState { node, state });
        }

        let mut local = false;
        for assignment in pass.assignments {
            if Some(&assignment.node) == me.as_ref() {
                self.module.accept();
                local = true;
                self.out.push(Output::Compute(ComputeJob {
                    task_id: assignment.task_id,
                    name: assignment.name,
                    payload: assignment.payload,
                    origin: None,
                }));
                continue;
            }

            let sent = self.send(
                &assignment.node,
                PeerMessage::TaskDispatch {
                    task_id: assignment.task_id.clone(),
                    name: assignment.name,
                    payload: assignment.payload,
                },
                now,
            );
            if !sent {
                self.scheduler.unassign(&assignment.task_id, &assignment.node);
            }
        }
        if local {
            self.module_changed(now);
        }
    }

    fn emit(&mut self, event: MeshEvent) {
        self.out.push(Output::Event(event));
    }

    fn finish(&mut self, now: Instant) -> Vec<Output> {
        if std::mem::take(&mut self.dirty) {
            self.schedule(now);
        }
        std::mem::take(&mut self.out)
    }
}
