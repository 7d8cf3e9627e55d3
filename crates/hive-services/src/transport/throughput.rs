//! Throughput measurement from chunked transfers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hive_core::wire::TransferId;
use hive_core::NodeId;

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// MB/s for `bytes` moved in `elapsed`. Elapsed is clamped to 1 ms.
pub fn megabytes_per_second(bytes: usize, elapsed: Duration) -> f64 {
    let seconds = elapsed.max(Duration::from_millis(1)).as_secs_f64();
    bytes as f64 / MEGABYTE / seconds
}

struct PendingTransfer {
    peer: NodeId,
    bytes: usize,
    started: Instant,
}

/// Tracks transfers awaiting `chunk-complete` and the smoothed estimate per peer.
pub struct ThroughputMeter {
    pending: HashMap<TransferId, PendingTransfer>,
    estimates: HashMap<NodeId, f64>,
    smoothing: f64,
    timeout: Duration,
}

impl ThroughputMeter {
    pub fn new(smoothing: f64, timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            estimates: HashMap::new(),
            smoothing: smoothing.clamp(0.0, 1.0),
            timeout,
        }
    }

    pub fn start(&mut self, id: TransferId, peer: &NodeId, bytes: usize, now: Instant) {
        self.pending.insert(
            id,
            PendingTransfer {
                peer: peer.clone(),
                bytes,
                started: now,
            },
        );
    }

    /// Completion acknowledgment from `peer`. Returns the updated estimate.
    pub fn finish(&mut self, peer: &NodeId, id: &TransferId, now: Instant) -> Option<f64> {
        match self.pending.get(id) {
            Some(p) if p.peer == *peer => {}
            Some(_) => {
                tracing::debug!(peer = %peer.short(), transfer = %id, "ack from wrong peer");
                return None;
            }
            None => {
                tracing::debug!(peer = %peer.short(), transfer = %id, "ack for unknown transfer");
                return None;
            }
        }
        let pending = self.pending.remove(id)?;
        let sample = megabytes_per_second(pending.bytes, now.saturating_duration_since(pending.started));

        let estimate = match self.estimates.get(peer) {
            Some(previous) => self.smoothing * sample + (1.0 - self.smoothing) * previous,
            None => sample,
        };
        self.estimates.insert(peer.clone(), estimate);
        tracing::debug!(
            peer = %peer.short(),
            bytes = pending.bytes,
            sample,
            estimate,
            "throughput measured"
        );
        Some(estimate)
    }

    pub fn estimate(&self, peer: &NodeId) -> Option<f64> {
        self.estimates.get(peer).copied()
    }

    /// Drop measurements whose acknowledgment never came.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        before - self.pending.len()
    }

    pub fn forget(&mut self, peer: &NodeId) {
        self.pending.retain(|_, p| p.peer != *peer);
        self.estimates.remove(peer);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
