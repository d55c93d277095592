//! # Pending Queue Chain
//!
//! A single RF frame carries at most ~7 (index, value) configuration pairs,
//! so one logical operation (pairing, a multi-list `putParamset`) spans
//! several complete exchange sequences. Those sequences are assembled
//! up-front as [`PendingQueue`]s and chained in a FIFO; the live
//! [`BidcosQueue`](crate::queue::BidcosQueue) splices the front pending
//! queue in whenever its own entry list drains, which serializes queued
//! operations per peer instead of letting them race.

use crate::queue::{EntryRing, MessageMatcher, QueueEntry, QueueType};
use crate::BidcosPacket;

/// Maximum number of fully-built queues parked in one chain.
pub const PENDING_CHAIN_SIZE: usize = 8;

/// A fully-assembled, not-yet-live exchange sequence.
///
/// Entries are appended in transmit/expect pairs exactly like a live queue,
/// but nothing is transmitted until the sequence is spliced into a live
/// queue.
#[derive(Clone)]
pub struct PendingQueue {
    pub queue_type: QueueType,
    pub entries: EntryRing,
}

impl PendingQueue {
    pub fn new(queue_type: QueueType) -> Self {
        PendingQueue {
            queue_type,
            entries: EntryRing::new(),
        }
    }

    pub fn push_packet(&mut self, packet: BidcosPacket, stealthy: bool) -> bool {
        self.entries.push_back(QueueEntry::Packet { packet, stealthy, sent: false })
    }

    pub fn push_expected(&mut self, matcher: MessageMatcher) -> bool {
        self.entries.push_back(QueueEntry::Expected(matcher))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered FIFO of pending queues awaiting splice-in.
///
/// A peer has at most one chain outstanding at any time.
#[derive(Clone)]
pub struct PendingQueueChain {
    items: [Option<PendingQueue>; PENDING_CHAIN_SIZE],
    head: usize,
    count: usize,
}

impl PendingQueueChain {
    pub const fn new() -> Self {
        PendingQueueChain {
            items: [const { None }; PENDING_CHAIN_SIZE],
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Appends a pending queue; returns false (and drops it) when full.
    pub fn push_back(&mut self, pending: PendingQueue) -> bool {
        if self.count == PENDING_CHAIN_SIZE {
            return false;
        }
        let slot = (self.head + self.count) % PENDING_CHAIN_SIZE;
        self.items[slot] = Some(pending);
        self.count += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<PendingQueue> {
        if self.count == 0 {
            return None;
        }
        let pending = self.items[self.head].take();
        self.head = (self.head + 1) % PENDING_CHAIN_SIZE;
        self.count -= 1;
        pending
    }

    /// Moves every queue of `other` to the back of this chain.
    pub fn extend(&mut self, mut other: PendingQueueChain) {
        while let Some(pending) = other.pop_front() {
            if !self.push_back(pending) {
                log::log!(log::Level::Error, "Pending queue chain full, dropping queued operation");
                return;
            }
        }
    }
}

impl Default for PendingQueueChain {
    fn default() -> Self {
        Self::new()
    }
}
