//! Chunked transport: framing, chunking, reassembly and throughput.
//!
//! Outgoing: an envelope is encoded once; if the frame is larger than
//! `chunk_size` it is split into `ceil(len / chunk_size)` `chunk-fragment`
//! envelopes under a fresh transfer id and a throughput measurement starts.
//!
//! Incoming: fragments go to the reassembler; a completed transfer is decoded,
//! delivered, and acknowledged with `chunk-complete`. The acknowledgment closes
//! the measurement on the sending side, which then reports the speed to both
//! itself (`SpeedMeasured`) and the peer (`speed-report`).
//!
//! Pacing of the resulting frames is the channel writer's job (`SendPacer`).

pub mod pacer;
pub mod reassembly;
pub mod throughput;

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hive_core::config::TransportConfig;
use hive_core::wire::{ChunkFragment, PeerEnvelope, PeerMessage, TransferId, WireError};
use hive_core::NodeId;

pub use pacer::{Pace, SendPacer};
pub use reassembly::{Accepted, Reassembler};
pub use throughput::{megabytes_per_second, ThroughputMeter};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no identity assigned yet")]
    NoIdentity,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("fragment {index}/{total} of {transfer_id} out of range")]
    BadFragment {
        transfer_id: TransferId,
        index: u32,
        total: u32,
    },
    #[error("transfer {transfer_id} announced {got} chunks, buffer has {expected}")]
    TotalMismatch {
        transfer_id: TransferId,
        expected: u32,
        got: u32,
    },
    #[error("frame claims sender {claimed} on the channel of {peer}")]
    SenderMismatch { peer: NodeId, claimed: NodeId },
    #[error("reassembled transfer contained another fragment")]
    NestedFragment,
}

/// Outcome of processing one incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Application message for the node.
    Deliver(PeerEnvelope),
    /// Frames to queue on the channel of `to`.
    Send { to: NodeId, frames: Vec<Bytes> },
    /// New smoothed throughput estimate for `peer`, MB/s.
    SpeedMeasured { peer: NodeId, speed: f64 },
}

/// Split a serialized frame into chunk-size slices. Frames at or below the
/// limit are not split.
pub fn split(frame: &Bytes, chunk_size: usize) -> Option<Vec<Bytes>> {
    if frame.len() <= chunk_size || chunk_size == 0 {
        return None;
    }
    let mut chunks = Vec::with_capacity(frame.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + chunk_size).min(frame.len());
        chunks.push(frame.slice(offset..end));
        offset = end;
    }
    Some(chunks)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ChunkedTransport {
    self_id: Option<NodeId>,
    chunk_size: usize,
    reassembler: Reassembler,
    meter: ThroughputMeter,
}

impl ChunkedTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            self_id: None,
            chunk_size: config.effective_chunk_size(),
            reassembler: Reassembler::new(config.transfer_timeout(), config.max_fragments()),
            meter: ThroughputMeter::new(config.speed_smoothing, config.transfer_timeout()),
        }
    }

    pub fn set_self_id(&mut self, id: NodeId) {
        self.self_id = Some(id);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encode `body` for `to`, chunking if needed.
    pub fn outgoing(
        &mut self,
        to: &NodeId,
        body: PeerMessage,
        now: Instant,
    ) -> Result<Vec<Bytes>, TransportError> {
        let from = self.self_id.clone().ok_or(TransportError::NoIdentity)?;
        let message_type = body.name();
        let frame = PeerEnvelope::new(from.clone(), to.clone(), body).encode()?;

        let Some(chunks) = split(&frame, self.chunk_size) else {
            return Ok(vec![frame]);
        };

        let transfer_id = TransferId::random();
        let total = chunks.len() as u32;
        let time = now_ms();
        tracing::debug!(
            peer = %to.short(),
            kind = message_type,
            bytes = frame.len(),
            chunks = total,
            transfer = %transfer_id,
            "chunking message"
        );

        let frames = chunks
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                PeerEnvelope::new(
                    from.clone(),
                    to.clone(),
                    PeerMessage::ChunkFragment(ChunkFragment {
                        transfer_id: transfer_id.clone(),
                        message_type: message_type.to_string(),
                        total,
                        index: index as u32,
                        value,
                        time,
                    }),
                )
                .encode()
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.meter.start(transfer_id, to, frame.len(), now);
        Ok(frames)
    }

    /// Process one frame received on the channel of `peer`.
    pub fn incoming(
        &mut self,
        peer: &NodeId,
        frame: &[u8],
        now: Instant,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        let envelope = PeerEnvelope::decode(frame)?;
        if envelope.from != *peer {
            return Err(TransportError::SenderMismatch {
                peer: peer.clone(),
                claimed: envelope.from,
            });
        }
        if self.self_id.as_ref() != Some(&envelope.to) {
            tracing::debug!(peer = %peer.short(), to = %envelope.to.short(), "frame for another node");
            return Ok(Vec::new());
        }

        match envelope.body {
            PeerMessage::ChunkFragment(fragment) => {
                let transfer_id = fragment.transfer_id.clone();
                match self.reassembler.accept(peer, fragment, now)? {
                    Accepted::Pending { .. } => Ok(Vec::new()),
                    Accepted::Complete(bytes) => {
                        let inner = PeerEnvelope::decode(&bytes)?;
                        if matches!(inner.body, PeerMessage::ChunkFragment(_)) {
                            return Err(TransportError::NestedFragment);
                        }
                        tracing::debug!(
                            peer = %peer.short(),
                            kind = inner.body.name(),
                            bytes = bytes.len(),
                            "transfer reassembled"
                        );
                        let ack = self.outgoing(peer, PeerMessage::ChunkComplete { transfer_id }, now)?;
                        let mut events = self.dispatch(peer, inner, now)?;
                        events.push(TransportEvent::Send {
                            to: peer.clone(),
                            frames: ack,
                        });
                        Ok(events)
                    }
                }
            }
            _ => self.dispatch(peer, envelope, now),
        }
    }

    fn dispatch(
        &mut self,
        peer: &NodeId,
        envelope: PeerEnvelope,
        now: Instant,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        match envelope.body {
            PeerMessage::ChunkComplete { transfer_id } => {
                let Some(speed) = self.meter.finish(peer, &transfer_id, now) else {
                    return Ok(Vec::new());
                };
                let report = self.outgoing(peer, PeerMessage::SpeedReport { value: speed }, now)?;
                Ok(vec![
                    TransportEvent::SpeedMeasured {
                        peer: peer.clone(),
                        speed,
                    },
                    TransportEvent::Send {
                        to: peer.clone(),
                        frames: report,
                    },
                ])
            }
            _ => Ok(vec![TransportEvent::Deliver(envelope)]),
        }
    }

    /// Evict expired reassembly buffers and stale measurements.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let evicted = self.reassembler.evict_expired(now).len();
        let dropped = self.meter.sweep(now);
        if dropped > 0 {
            tracing::debug!(dropped, "unacknowledged transfers dropped");
        }
        evicted
    }

    pub fn forget_peer(&mut self, peer: &NodeId) {
        self.reassembler.forget(peer);
        self.meter.forget(peer);
    }

    pub fn in_flight(&self) -> usize {
        self.reassembler.in_flight()
    }

    pub fn speed(&self, peer: &NodeId) -> Option<f64> {
        self.meter.estimate(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::wire::MAX_CHANNEL_MESSAGE;
    use hive_core::TaskId;

    fn transport(me: &str, chunk_size: usize) -> ChunkedTransport {
        let config = TransportConfig {
            chunk_size,
            ..TransportConfig::default()
        };
        let mut t = ChunkedTransport::new(&config);
        t.set_self_id(NodeId::new(me));
        t
    }

    fn dispatch(len: usize) -> PeerMessage {
        PeerMessage::TaskDispatch {
            task_id: TaskId::new("t"),
            name: "f".into(),
            payload: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>()),
        }
    }

    fn encoded_len(body: &PeerMessage) -> usize {
        PeerEnvelope::new(NodeId::new("a"), NodeId::new("b"), body.clone())
            .encode()
            .unwrap()
            .len()
    }

    #[test]
    fn split_boundary_is_strictly_greater() {
        let frame = Bytes::from(vec![7u8; 10]);
        assert!(split(&frame, 10).is_none());
        let chunks = split(&frame, 9).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn message_of_exactly_chunk_size_is_sent_whole() {
        let body = dispatch(1000);
        let len = encoded_len(&body);
        let mut a = transport("a", len);
        let frames = a.outgoing(&NodeId::new("b"), body, Instant::now()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            PeerEnvelope::decode(&frames[0]).unwrap().body,
            PeerMessage::TaskDispatch { .. }
        ));
    }

    #[test]
    fn message_one_byte_over_chunk_size_is_two_fragments() {
        let body = dispatch(1000);
        let len = encoded_len(&body);
        let mut a = transport("a", len - 1);
        let frames = a.outgoing(&NodeId::new("b"), body, Instant::now()).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn reassembly_reproduces_payload_for_many_sizes() {
        let chunk_size = 256;
        for len in [1usize, 200, 255, 256, 257, 512, 1000, 4 * 256 + 3] {
            let mut a = transport("a", chunk_size);
            let mut b = transport("b", chunk_size);
            let body = dispatch(len);
            let now = Instant::now();

            let frames = a.outgoing(&NodeId::new("b"), body.clone(), now).unwrap();
            let mut delivered = Vec::new();
            for frame in frames {
                for event in b.incoming(&NodeId::new("a"), &frame, now).unwrap() {
                    if let TransportEvent::Deliver(env) = event {
                        delivered.push(env.body);
                    }
                }
            }
            assert_eq!(delivered, vec![body], "payload of {len} bytes");
            assert_eq!(b.in_flight(), 0);
        }
    }

    #[test]
    fn completion_ack_measures_speed_on_sender() {
        let mut a = transport("a", 128);
        let mut b = transport("b", 128);
        let start = Instant::now();

        let frames = a.outgoing(&NodeId::new("b"), dispatch(2000), start).unwrap();
        assert!(frames.len() > 1);

        let mut ack = Vec::new();
        for frame in frames {
            for event in b.incoming(&NodeId::new("a"), &frame, start).unwrap() {
                if let TransportEvent::Send { frames, .. } = event {
                    ack.extend(frames);
                }
            }
        }
        assert_eq!(ack.len(), 1);

        let events = a
            .incoming(&NodeId::new("b"), &ack[0], start + std::time::Duration::from_millis(10))
            .unwrap();
        let speed = events.iter().find_map(|e| match e {
            TransportEvent::SpeedMeasured { speed, .. } => Some(*speed),
            _ => None,
        });
        assert!(speed.is_some_and(|s| s > 0.0));
        assert_eq!(a.speed(&NodeId::new("b")), speed);

        // The peer hears the figure too.
        let report = events.iter().find_map(|e| match e {
            TransportEvent::Send { frames, .. } => Some(frames[0].clone()),
            _ => None,
        });
        let env = PeerEnvelope::decode(&report.unwrap()).unwrap();
        assert!(matches!(env.body, PeerMessage::SpeedReport { .. }));
    }

    #[test]
    fn frame_with_forged_sender_is_rejected() {
        let mut a = transport("a", 1024);
        let mut b = transport("b", 1024);
        let frames = a
            .outgoing(&NodeId::new("b"), PeerMessage::SpeedReport { value: 1.0 }, Instant::now())
            .unwrap();
        assert!(matches!(
            b.incoming(&NodeId::new("c"), &frames[0], Instant::now()),
            Err(TransportError::SenderMismatch { .. })
        ));
    }

    #[test]
    fn default_fragments_fit_in_a_channel_message() {
        let me = "7f9c2ba4-e88f-4d2a-9b1e-3c5d6a8e0f12";
        let peer = "0b1e4d7a-2c3f-4a6b-8d9e-f1a2b3c4d5e6";
        for chunk_size in [TransportConfig::default().chunk_size, 128 * 1024] {
            let mut a = transport(me, chunk_size);
            let frames = a
                .outgoing(&NodeId::new(peer), dispatch(1024 * 1024), Instant::now())
                .unwrap();
            assert!(frames.len() > 1);
            for frame in &frames {
                assert!(
                    frame.len() <= MAX_CHANNEL_MESSAGE,
                    "{} byte fragment at chunk_size {chunk_size}",
                    frame.len()
                );
            }
        }
    }

    #[test]
    fn fragment_announcing_too_many_chunks_is_rejected() {
        let mut b = transport("b", 1024);
        let frame = PeerEnvelope::new(
            NodeId::new("a"),
            NodeId::new("b"),
            PeerMessage::ChunkFragment(ChunkFragment {
                transfer_id: TransferId::random(),
                message_type: "task-dispatch".into(),
                total: u32::MAX,
                index: 0,
                value: Bytes::from_static(b"x"),
                time: 0,
            }),
        )
        .encode()
        .unwrap();
        assert!(matches!(
            b.incoming(&NodeId::new("a"), &frame, Instant::now()),
            Err(TransportError::BadFragment { .. })
        ));
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn outgoing_requires_identity() {
        let mut t = ChunkedTransport::new(&TransportConfig::default());
        assert!(matches!(
            t.outgoing(&NodeId::new("b"), PeerMessage::SpeedReport { value: 1.0 }, Instant::now()),
            Err(TransportError::NoIdentity)
        ));
    }
}
