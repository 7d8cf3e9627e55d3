//! Mesh loop: owns the `MeshNode` and is the only place its state changes.
//!
//! Every other task (signaling link, peer links, compute workers, API
//! handlers) talks to it through channels. Outputs are carried out here
//! without awaiting on peers.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use hive_core::{NodeId, SignalEnvelope};
use hive_services::{
    ComputeJob, ComputeOutcome, ControlCommand, LinkEvent, MeshEvent, MeshNode, Output,
};

use crate::rtc::LinkDriver;

/// Transfer eviction check.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// Events from the daemon's I/O tasks.
#[derive(Debug)]
pub enum MeshInput {
    Signal(SignalEnvelope),
    Link {
        peer: NodeId,
        /// Which incarnation of the peer's link produced the event.
        link: u64,
        event: LinkEvent,
    },
    Benchmark(f64),
}

pub struct MeshDriver {
    node: MeshNode,
    links: LinkDriver,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    job_tx: mpsc::UnboundedSender<ComputeJob>,
    inputs: mpsc::UnboundedReceiver<MeshInput>,
    outcomes: mpsc::UnboundedReceiver<ComputeOutcome>,
    control: mpsc::Receiver<ControlCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl MeshDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: MeshNode,
        links: LinkDriver,
        signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
        job_tx: mpsc::UnboundedSender<ComputeJob>,
        inputs: mpsc::UnboundedReceiver<MeshInput>,
        outcomes: mpsc::UnboundedReceiver<ComputeOutcome>,
        control: mpsc::Receiver<ControlCommand>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            node,
            links,
            signal_tx,
            job_tx,
            inputs,
            outcomes,
            control,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut snapshot = tokio::time::interval(SNAPSHOT_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("mesh loop shutting down");
                    self.links.close_all();
                    return Ok(());
                }

                Some(input) = self.inputs.recv() => {
                    let now = Instant::now();
                    let outputs = match input {
                        MeshInput::Signal(envelope) => self.node.on_signal(envelope, now),
                        MeshInput::Link { peer, link, event } => {
                            if !self.links.is_current(&peer, link) {
                                tracing::trace!(peer = %peer.short(), link, "event from retired link ignored");
                                continue;
                            }
                            self.node.on_link_event(&peer, event, now)
                        }
                        MeshInput::Benchmark(score) => self.node.on_benchmark(score, now),
                    };
                    self.dispatch(outputs);
                }

                Some(outcome) = self.outcomes.recv() => {
                    let outputs = self.node.on_compute_done(outcome, Instant::now());
                    self.dispatch(outputs);
                }

                Some(command) = self.control.recv() => {
                    let outputs = self.node.on_control(command, Instant::now());
                    self.dispatch(outputs);
                }

                _ = sweep.tick() => {
                    let outputs = self.node.sweep(Instant::now());
                    self.dispatch(outputs);
                }

                _ = snapshot.tick() => self.log_snapshot(),
            }
        }
    }

    fn dispatch(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Signal(envelope) => {
                    if self.signal_tx.send(envelope).is_err() {
                        tracing::debug!("signaling link down, envelope dropped");
                    }
                }
                Output::Link { peer, command } => self.links.command(peer, command),
                Output::Frames { peer, frames } => self.links.send(&peer, frames),
                Output::Compute(job) => {
                    if self.job_tx.send(job).is_err() {
                        tracing::error!("compute executor gone, job dropped");
                    }
                }
                Output::Event(event) => log_event(&event),
            }
        }
    }

    fn log_snapshot(&self) {
        let status = self.node.status(Instant::now());
        let batch = &status.batch;
        tracing::info!(
            nodes = status.nodes.len(),
            transfers = status.transfers_in_flight,
            tasks = batch.total,
            complete = batch.complete,
            assigned = batch.assigned,
            pending = batch.pending,
            "mesh snapshot"
        );
        for n in &status.nodes {
            tracing::info!(
                node = %n.id.short(),
                is_self = n.is_self,
                link = ?n.connection.map(|c| c.connection),
                speed = ?n.connection.and_then(|c| c.speed),
                queued = n.module.queued,
                complete = n.module.complete,
                benchmark = n.module.benchmark,
                assigned = n.assigned,
                "  node"
            );
        }
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::NodeAdded(node) => tracing::info!(node = %node.short(), "node added"),
        MeshEvent::NodeRemoved(node) => tracing::info!(node = %node.short(), "node removed"),
        MeshEvent::ConnectionState { node, state } => tracing::info!(
            node = %node.short(),
            signaling = ?state.signaling,
            connection = ?state.connection,
            "connection state"
        ),
        MeshEvent::ModuleState { node, state } => tracing::debug!(
            node = %node.short(),
            queued = state.queued,
            complete = state.complete,
            benchmark = state.benchmark,
            "module state"
        ),
        MeshEvent::SchedulingState { node, state } => tracing::debug!(
            node = %node.short(),
            deviation = state.deviation,
            threshold = state.threshold,
            "scheduling state"
        ),
        MeshEvent::BatchComplete(report) => tracing::info!(
            tasks = report.tasks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch complete"
        ),
    }
}
