//! Send-side pacing over a data channel's buffered amount.

use std::collections::VecDeque;

use bytes::Bytes;

/// Next step for a channel writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pace {
    Send(Bytes),
    /// Wait for the channel's buffer-low signal, then call `resume`.
    Stall,
    /// Queue empty.
    Idle,
}

/// FIFO of outgoing frames for one channel.
///
/// A stall is edge-triggered: once stalled, `next` keeps returning `Stall`
/// until exactly one `resume` call, regardless of the buffered amount.
#[derive(Debug)]
pub struct SendPacer {
    queue: VecDeque<Bytes>,
    low_water: usize,
    stalled: bool,
}

impl SendPacer {
    pub fn new(low_water: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            low_water,
            stalled: false,
        }
    }

    pub fn push(&mut self, frame: Bytes) {
        self.queue.push_back(frame);
    }

    pub fn extend(&mut self, frames: impl IntoIterator<Item = Bytes>) {
        self.queue.extend(frames);
    }

    /// `buffered` is the channel's current outstanding send buffer.
    pub fn next(&mut self, buffered: usize) -> Pace {
        if self.stalled {
            return Pace::Stall;
        }
        if self.queue.is_empty() {
            return Pace::Idle;
        }
        if buffered > self.low_water {
            tracing::trace!(buffered, queued = self.queue.len(), "send stalled");
            self.stalled = true;
            return Pace::Stall;
        }
        match self.queue.pop_front() {
            Some(frame) => Pace::Send(frame),
            None => Pace::Idle,
        }
    }

    /// Buffer-low signal. Returns whether it ended a stall.
    pub fn resume(&mut self) -> bool {
        std::mem::replace(&mut self.stalled, false)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
