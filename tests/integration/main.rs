//! Hive integration test harness.
//!
//! Several `MeshNode`s run against each other in memory: a relay stands in
//! for the rendezvous server and a link table stands in for WebRTC. Every
//! output a node produces is carried out here, in FIFO order, until the mesh
//! goes quiet. Compute jobs run a toy engine (ASCII uppercase) either
//! automatically or when a test releases them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hive_core::config::HiveConfig;
use hive_core::wire::{Blob, SignalBody, SignalEnvelope};
use hive_core::NodeId;
use hive_services::{
    BatchReceipt, ComputeError, ComputeJob, ComputeOutcome, LinkCommand, LinkEvent, MeshEvent,
    MeshNode, Output, ResultStore, SubmittedFile,
};

mod batch;
mod failures;
mod negotiation;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on processed inputs before a test is declared livelocked.
const MAX_STEPS: usize = 100_000;

/// Names starting with this always fail in the toy engine.
pub const FAILING_PREFIX: &str = "fail";

pub fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

pub fn file(name: &str, payload: &[u8]) -> SubmittedFile {
    SubmittedFile {
        name: name.to_string(),
        payload: Bytes::copy_from_slice(payload),
    }
}

pub fn files(count: usize) -> Vec<SubmittedFile> {
    (0..count)
        .map(|i| file(&format!("task-{i}.txt"), format!("payload {i}").as_bytes()))
        .collect()
}

enum Input {
    Signal(SignalEnvelope),
    Link { peer: NodeId, event: LinkEvent },
    Compute(ComputeOutcome),
}

pub struct Peer {
    pub node: MeshNode,
    pub results: ResultStore,
    /// Jobs handed to the engine and not yet run.
    pub jobs: VecDeque<ComputeJob>,
    pub events: Vec<MeshEvent>,
    /// Offers this node's link layer produced.
    pub offers_created: usize,
    /// Remote candidates this node's link layer was asked to add.
    pub candidates_added: usize,
}

pub struct Mesh {
    config: HiveConfig,
    peers: BTreeMap<NodeId, Peer>,
    queue: VecDeque<(NodeId, Input)>,
    /// Open links as ordered pairs.
    links: BTreeSet<(NodeId, NodeId)>,
    now: Instant,
    pub auto_compute: bool,
    /// Frames sent toward a peer with no open link.
    pub frames_dropped: usize,
}

fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a < b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Mesh {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
            queue: VecDeque::new(),
            links: BTreeSet::new(),
            now: Instant::now(),
            auto_compute: true,
            frames_dropped: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HiveConfig::default())
    }

    pub fn peer(&self, name: &str) -> &Peer {
        self.peers
            .get(&id(name))
            .unwrap_or_else(|| panic!("no node {name}"))
    }

    pub fn node(&self, name: &str) -> &MeshNode {
        &self.peer(name).node
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.links.contains(&pair(&id(a), &id(b)))
    }

    // ── Rendezvous server ─────────────────────────────────────────────────────

    /// Connect a node to the rendezvous server under `name`.
    pub fn join(&mut self, name: &str) {
        let me = id(name);
        let results = ResultStore::new();
        self.peers.insert(
            me.clone(),
            Peer {
                node: MeshNode::new(&self.config, results.clone()),
                results,
                jobs: VecDeque::new(),
                events: Vec::new(),
                offers_created: 0,
                candidates_added: 0,
            },
        );

        self.server_send(&me, SignalBody::AssignIdentity(me.clone()));
        let everyone: Vec<NodeId> = self.peers.keys().cloned().collect();
        for node in &everyone {
            let others = everyone.iter().filter(|n| *n != node).cloned().collect();
            self.server_send(node, SignalBody::RosterUpdate(others));
        }
    }

    /// Drop a node from the server; the rest hear `peer-left`.
    pub fn leave(&mut self, name: &str) {
        let gone = id(name);
        self.peers.remove(&gone);
        self.links.retain(|(a, b)| *a != gone && *b != gone);
        self.queue.retain(|(to, _)| *to != gone);
        let remaining: Vec<NodeId> = self.peers.keys().cloned().collect();
        for node in &remaining {
            self.server_send(node, SignalBody::PeerLeft(gone.clone()));
        }
    }

    fn server_send(&mut self, to: &NodeId, body: SignalBody) {
        self.queue.push_back((
            to.clone(),
            Input::Signal(SignalEnvelope {
                from: None,
                to: Some(to.clone()),
                body,
            }),
        ));
    }

    // ── Direct inputs ─────────────────────────────────────────────────────────

    pub fn benchmark(&mut self, name: &str, score: f64) {
        let now = self.tick();
        let peer = self.peer_mut(name);
        let outputs = peer.node.on_benchmark(score, now);
        self.carry_out(&id(name), outputs);
    }

    pub fn submit(&mut self, name: &str, batch: Vec<SubmittedFile>) -> BatchReceipt {
        let now = self.tick();
        let peer = self.peer_mut(name);
        let (receipt, outputs) = peer.node.submit(batch, now);
        self.carry_out(&id(name), outputs);
        receipt
    }

    /// Break the link between two nodes; both sides see the channel close.
    pub fn cut(&mut self, a: &str, b: &str) {
        let (a, b) = (id(a), id(b));
        if self.links.remove(&pair(&a, &b)) {
            self.push_link(&a, &b, LinkEvent::ChannelClosed);
            self.push_link(&b, &a, LinkEvent::ChannelClosed);
        }
    }

    /// `a`'s side of the link to `b` gives up, as a writer does when a send
    /// fails. Only `a` hears about it directly.
    pub fn fail_link(&mut self, a: &str, b: &str, reason: &str) {
        self.push_link(&id(a), &id(b), LinkEvent::Failed(reason.to_string()));
    }

    /// Deliver a negotiation frame from `from` to `to` through the relay.
    pub fn relay(&mut self, from: &str, to: &str, body: SignalBody) {
        self.queue.push_back((
            id(to),
            Input::Signal(SignalEnvelope {
                from: Some(id(from)),
                to: Some(id(to)),
                body,
            }),
        ));
    }

    /// Run every job currently queued at `name`.
    pub fn run_jobs(&mut self, name: &str) {
        let me = id(name);
        let jobs: Vec<ComputeJob> = self.peer_mut(name).jobs.drain(..).collect();
        for job in jobs {
            let outcome = run_toy_engine(job);
            self.queue.push_back((me.clone(), Input::Compute(outcome)));
        }
    }

    /// Process until no input is left (and, with `auto_compute`, no job).
    pub fn settle(&mut self) {
        for _ in 0..MAX_STEPS {
            if let Some((to, input)) = self.queue.pop_front() {
                self.process(to, input);
                continue;
            }
            if !self.auto_compute {
                return;
            }
            let busy: Vec<String> = self
                .peers
                .iter()
                .filter(|(_, p)| !p.jobs.is_empty())
                .map(|(id, _)| id.as_str().to_string())
                .collect();
            if busy.is_empty() {
                return;
            }
            for name in busy {
                self.run_jobs(&name);
            }
        }
        panic!("mesh did not settle within {MAX_STEPS} steps");
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    fn tick(&mut self) -> Instant {
        self.now += Duration::from_millis(1);
        self.now
    }

    fn peer_mut(&mut self, name: &str) -> &mut Peer {
        self.peers
            .get_mut(&id(name))
            .unwrap_or_else(|| panic!("no node {name}"))
    }

    fn process(&mut self, to: NodeId, input: Input) {
        let now = self.tick();
        let Some(peer) = self.peers.get_mut(&to) else {
            return;
        };
        let outputs = match input {
            Input::Signal(envelope) => peer.node.on_signal(envelope, now),
            Input::Link { peer: from, event } => peer.node.on_link_event(&from, event, now),
            Input::Compute(outcome) => peer.node.on_compute_done(outcome, now),
        };
        self.carry_out(&to, outputs);
    }

    fn push_link(&mut self, to: &NodeId, peer: &NodeId, event: LinkEvent) {
        self.queue.push_back((
            to.clone(),
            Input::Link {
                peer: peer.clone(),
                event,
            },
        ));
    }

    fn carry_out(&mut self, owner: &NodeId, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Signal(envelope) => {
                    // The server relays negotiation frames verbatim.
                    if let Some(to) = envelope.to.clone() {
                        if self.peers.contains_key(&to) {
                            self.queue.push_back((to, Input::Signal(envelope)));
                        }
                    }
                }
                Output::Link { peer, command } => self.link_command(owner, &peer, command),
                Output::Frames { peer, frames } => {
                    if !self.links.contains(&pair(owner, &peer)) {
                        self.frames_dropped += frames.len();
                        continue;
                    }
                    for frame in frames {
                        self.push_link(&peer, owner, LinkEvent::Frame(frame));
                    }
                }
                Output::Compute(job) => {
                    if let Some(p) = self.peers.get_mut(owner) {
                        p.jobs.push_back(job);
                    }
                }
                Output::Event(event) => {
                    if let Some(p) = self.peers.get_mut(owner) {
                        p.events.push(event);
                    }
                }
            }
        }
    }

    /// Toy link layer: descriptions and candidates come back at once, and
    /// the channel opens on both ends when the offerer applies the answer.
    fn link_command(&mut self, owner: &NodeId, peer: &NodeId, command: LinkCommand) {
        match command {
            LinkCommand::CreateOffer => {
                if let Some(p) = self.peers.get_mut(owner) {
                    p.offers_created += 1;
                }
                self.local_description(owner, peer, "offer");
            }
            LinkCommand::AcceptOffer(_) => self.local_description(owner, peer, "answer"),
            LinkCommand::ApplyAnswer(_) => {
                self.links.insert(pair(owner, peer));
                self.push_link(owner, peer, LinkEvent::ChannelOpen);
                self.push_link(peer, owner, LinkEvent::ChannelOpen);
            }
            LinkCommand::AddCandidate(_) => {
                if let Some(p) = self.peers.get_mut(owner) {
                    p.candidates_added += 1;
                }
            }
            LinkCommand::Close => {
                if self.links.remove(&pair(owner, peer)) {
                    self.push_link(peer, owner, LinkEvent::ChannelClosed);
                }
            }
        }
    }

    fn local_description(&mut self, owner: &NodeId, peer: &NodeId, kind: &str) {
        let description = Blob(serde_json::json!({ "type": kind, "sdp": owner.as_str() }));
        let candidate = Blob(serde_json::json!({
            "candidate": format!("candidate:{} 1 udp 2130706431 10.0.0.1 9 typ host", owner.as_str()),
            "sdpMid": "0",
        }));
        self.push_link(owner, peer, LinkEvent::LocalDescription(description));
        // ICE agents may surface the same candidate more than once.
        self.push_link(owner, peer, LinkEvent::LocalCandidate(candidate.clone()));
        self.push_link(owner, peer, LinkEvent::LocalCandidate(candidate));
    }
}

fn run_toy_engine(job: ComputeJob) -> ComputeOutcome {
    let result = if job.name.starts_with(FAILING_PREFIX) {
        Err(ComputeError::Rejected(format!("{} is poisoned", job.name)))
    } else {
        Ok(Bytes::from(job.payload.to_ascii_uppercase()))
    };
    ComputeOutcome {
        task_id: job.task_id,
        origin: job.origin,
        result,
        elapsed: Duration::from_millis(3),
    }
}

/// A full mesh of `names`, every node benchmarked at 1.0 and connected.
pub fn connected_mesh(names: &[&str]) -> Mesh {
    let mut mesh = Mesh::with_defaults();
    for name in names {
        mesh.join(name);
    }
    mesh.settle();
    for name in names {
        mesh.benchmark(name, 1.0);
    }
    mesh.settle();
    mesh
}
