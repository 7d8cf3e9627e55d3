//! Receive-side reassembly of chunked transfers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hive_core::wire::{ChunkFragment, TransferId};
use hive_core::NodeId;

use super::TransportError;

/// Result of accepting one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    Pending { received: u32, total: u32 },
    /// All slots filled; the concatenated serialized message.
    Complete(Bytes),
}

struct TransferBuffer {
    total: u32,
    received: u32,
    slots: Vec<Option<Bytes>>,
    deadline: Instant,
}

impl TransferBuffer {
    fn new(total: u32, deadline: Instant) -> Self {
        Self {
            total,
            received: 0,
            slots: vec![None; total as usize],
            deadline,
        }
    }

    fn assemble(self) -> Bytes {
        let len = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        out.freeze()
    }
}

/// In-flight transfers keyed by sender and transfer id.
pub struct Reassembler {
    transfers: HashMap<(NodeId, TransferId), TransferBuffer>,
    timeout: Duration,
    /// Upper bound on `total`; slots are allocated up front.
    max_fragments: u32,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_fragments: u32) -> Self {
        Self {
            transfers: HashMap::new(),
            timeout,
            max_fragments,
        }
    }

    /// Store one fragment. Duplicates overwrite their slot without counting twice.
    pub fn accept(
        &mut self,
        from: &NodeId,
        fragment: ChunkFragment,
        now: Instant,
    ) -> Result<Accepted, TransportError> {
        let ChunkFragment {
            transfer_id,
            total,
            index,
            value,
            ..
        } = fragment;

        if total == 0 || index >= total || total > self.max_fragments {
            return Err(TransportError::BadFragment {
                transfer_id,
                index,
                total,
            });
        }

        let key = (from.clone(), transfer_id);
        let deadline = now + self.timeout;
        let buffer = self
            .transfers
            .entry(key.clone())
            .or_insert_with(|| TransferBuffer::new(total, deadline));

        if buffer.total != total {
            return Err(TransportError::TotalMismatch {
                transfer_id: key.1,
                expected: buffer.total,
                got: total,
            });
        }

        buffer.deadline = deadline;
        let slot = &mut buffer.slots[index as usize];
        if slot.is_none() {
            buffer.received += 1;
        }
        *slot = Some(value);

        if buffer.received < buffer.total {
            return Ok(Accepted::Pending {
                received: buffer.received,
                total: buffer.total,
            });
        }

        match self.transfers.remove(&key) {
            Some(buffer) => Ok(Accepted::Complete(buffer.assemble())),
            None => Ok(Accepted::Pending {
                received: total,
                total,
            }),
        }
    }

    /// Drop buffers whose deadline has passed. Returns the evicted ids.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<TransferId> {
        let mut evicted = Vec::new();
        self.transfers.retain(|(from, id), buffer| {
            if buffer.deadline > now {
                return true;
            }
            tracing::warn!(
                peer = %from.short(),
                transfer = %id,
                received = buffer.received,
                total = buffer.total,
                "transfer expired, discarding"
            );
            evicted.push(id.clone());
            false
        });
        evicted
    }

    /// Drop everything from a departed peer.
    pub fn forget(&mut self, peer: &NodeId) {
        self.transfers.retain(|(from, _), _| from != peer);
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    pub fn received(&self, from: &NodeId, id: &TransferId) -> Option<u32> {
        self.transfers
            .get(&(from.clone(), id.clone()))
            .map(|b| b.received)
    }
}
