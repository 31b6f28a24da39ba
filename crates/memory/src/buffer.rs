//! Short-term conversation buffer.
//!
//! Consolidation works on a [`BufferSnapshot`]: a claimed prefix of the
//! buffer.  While a snapshot is outstanding no second snapshot can be taken,
//! turns appended afterwards are not part of it, and on
//! [`ShortTermBuffer::acknowledge`] exactly the snapshot's turns are dropped.
//! A failed run calls [`ShortTermBuffer::release`] and the buffer is as if
//! the snapshot was never taken.
//!
//! Sequence numbers are transcript positions.  The persisted
//! [`BufferState`] records how far consolidation has consumed the
//! transcript, so unconsolidated turns are reloaded after a restart.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::schema::Turn;

#[derive(Debug, Clone)]
struct BufferedTurn {
    seq: u64,
    turn: Turn,
}

/// A consistent prefix of the buffer handed to one consolidation run.
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    through_seq: u64,
    pub turns: Vec<Turn>,
}

impl BufferSnapshot {
    /// Transcript position of the first turn not covered by this snapshot.
    pub fn consumed_through(&self) -> u64 {
        self.through_seq + 1
    }
}

/// Durable consolidation watermark (`buffer.json`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// Transcript turns before this position are consolidated or discarded.
    pub consumed_through: u64,
}

#[derive(Debug)]
pub struct ShortTermBuffer {
    capacity: usize,
    turns: VecDeque<BufferedTurn>,
    next_seq: u64,
    turns_since_consolidation: usize,
    claimed_through: Option<u64>,
}

impl ShortTermBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity + 1),
            next_seq: 0,
            turns_since_consolidation: 0,
            claimed_through: None,
        }
    }

    /// Rebuild the buffer from unconsolidated transcript turns, the last of
    /// which sits just before `end_seq`.  They all count towards the
    /// consolidation threshold.
    pub fn resume(capacity: usize, end_seq: u64, pending: Vec<Turn>) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.next_seq = end_seq.saturating_sub(pending.len() as u64);
        for turn in pending {
            buffer.append(turn);
        }
        buffer.next_seq = end_seq;
        buffer
    }

    /// Position the next appended turn will take.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Drop every turn and reset the counter.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.turns_since_consolidation = 0;
        self.claimed_through = None;
    }

    /// Append a turn, returning the evicted oldest turn when over capacity.
    pub fn append(&mut self, turn: Turn) -> Option<Turn> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.turns.push_back(BufferedTurn { seq, turn });
        self.turns_since_consolidation += 1;

        if self.turns.len() > self.capacity {
            let evicted = self.turns.pop_front().map(|b| b.turn);
            debug!(capacity = self.capacity, "short-term buffer evicted oldest turn");
            return evicted;
        }
        None
    }

    pub fn turns_since_consolidation(&self) -> usize {
        self.turns_since_consolidation
    }

    /// Threshold reached and no run already in flight.
    pub fn should_consolidate(&self, threshold: usize) -> bool {
        threshold > 0
            && self.claimed_through.is_none()
            && self.turns_since_consolidation >= threshold
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_through.is_some()
    }

    /// Claim every buffered turn for a consolidation run.
    ///
    /// `None` when the buffer is empty or a snapshot is already outstanding.
    pub fn snapshot(&mut self) -> Option<BufferSnapshot> {
        if self.claimed_through.is_some() {
            return None;
        }
        let through_seq = self.turns.back()?.seq;
        self.claimed_through = Some(through_seq);
        Some(BufferSnapshot {
            through_seq,
            turns: self.turns.iter().map(|b| b.turn.clone()).collect(),
        })
    }

    /// The run committed: drop the snapshot's turns and restart the counter
    /// from the turns that arrived since.
    pub fn acknowledge(&mut self, snapshot: &BufferSnapshot) {
        self.turns.retain(|b| b.seq > snapshot.through_seq);
        self.turns_since_consolidation = self.turns.len();
        self.claimed_through = None;
    }

    /// The run failed: keep everything, just drop the claim.
    pub fn release(&mut self, _snapshot: &BufferSnapshot) {
        self.claimed_through = None;
    }

    pub fn recent(&self) -> Vec<Turn> {
        self.turns.iter().map(|b| b.turn.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
