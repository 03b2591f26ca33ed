// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

/// One broadcast message retained for replay.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub data: Bytes,
    pub seq_num: u64,
    pub at: Instant,
}

/// Bounded FIFO of broadcast messages with monotonically increasing sequence
/// numbers, retained in memory so a late-joining viewer can reconstruct the
/// conversation. On overflow the oldest entries are evicted.
///
/// The owning host guards this with its buffer mutex; sequence numbers are
/// assigned under that lock, so seq order equals enqueue order even with
/// concurrent broadcasters.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: VecDeque<BufferedMessage>,
    capacity: usize,
    seq: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity.min(1024)), capacity, seq: 0 }
    }

    /// Append a message, assigning it the next sequence number (0-based),
    /// and evict from the head until the length is back within capacity.
    pub fn append(&mut self, data: Bytes) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        self.buf.push_back(BufferedMessage { data, seq_num: seq, at: Instant::now() });
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
        seq
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Sequence number of the oldest retained message, if any.
    pub fn first_seq(&self) -> Option<u64> {
        self.buf.front().map(|m| m.seq_num)
    }

    /// Total messages ever appended.
    pub fn total_appended(&self) -> u64 {
        self.seq
    }

    /// Clone the current contents in append order.
    ///
    /// Replay works from this snapshot so the buffer lock is not held across
    /// the (potentially slow) per-viewer sends.
    pub fn snapshot(&self) -> Vec<BufferedMessage> {
        self.buf.iter().cloned().collect()
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
