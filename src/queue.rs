//! # BidCoS Exchange Queue
//!
//! An ordered sequence of outbound packets interleaved with expected-response
//! placeholders, draining one in-flight exchange at a time.
//!
//! ## Architecture
//!
//! A queue alternates transmit/expect pairs: send, expect-ACK, send,
//! expect-ACK. At most one packet is ever in the "sent, awaiting response"
//! state; a sent packet followed by an expectation is only popped when a
//! satisfying packet arrives (or the pop-wait timer fires), while a sent
//! packet with no expectation behind it is fire-and-forget and advances on
//! its own. When the entry list drains, the next queue from the attached
//! [`PendingQueueChain`] is spliced in, so multi-step operations serialize
//! instead of racing.
//!
//! Queues are assembled with `no_sending` set and go on air via
//! [`BidcosQueue::set_live`]; pushing onto an already-live queue transmits
//! immediately when the new packet becomes eligible.
//!
//! Transmission never blocks: packets are handed to the transport through a
//! non-blocking `try_send` on the TX channel, so the dispatch task driving
//! the queue never waits on I/O. A full TX channel leaves the head unsent
//! and the periodic service sweep retries it.

use embassy_time::{Duration, Instant};
use log::{log, Level};

use crate::packet::{message_type, BidcosPacket};
use crate::pending_queue::PendingQueueChain;
use crate::{OpKind, OutboundPacket, TxPacketQueueSender};

/// Capacity of one queue's entry list.
pub const QUEUE_CAPACITY: usize = 16;

/// Semantic kind of a queue; NACK handling and access checks depend on it.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum QueueType {
    Default,
    Pairing,
    Unpairing,
    Config,
    Peer,
    GetValue,
    SetAesKey,
    Empty,
}

/// Pattern describing the response a queue is waiting for.
///
/// BidCoS responses echo the message counter of the request they answer;
/// when `message_counter` is set, a packet with a different counter is a
/// stale response and does not satisfy the matcher. The subtype byte sits at
/// payload index 1 for CONFIG frames and index 0 everywhere else.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MessageMatcher {
    pub message_type: u8,
    pub subtype: Option<u8>,
    pub message_counter: Option<u8>,
}

impl MessageMatcher {
    pub fn new(message_type: u8) -> Self {
        MessageMatcher {
            message_type,
            subtype: None,
            message_counter: None,
        }
    }

    pub fn with_subtype(message_type: u8, subtype: u8) -> Self {
        MessageMatcher {
            message_type,
            subtype: Some(subtype),
            message_counter: None,
        }
    }

    pub fn with_counter(message_type: u8, message_counter: u8) -> Self {
        MessageMatcher {
            message_type,
            subtype: None,
            message_counter: Some(message_counter),
        }
    }

    pub fn matches(&self, packet: &BidcosPacket) -> bool {
        if packet.message_type != self.message_type {
            return false;
        }
        if let Some(counter) = self.message_counter {
            if packet.message_counter != counter {
                return false;
            }
        }
        if let Some(subtype) = self.subtype {
            let index = if self.message_type == message_type::CONFIG { 1 } else { 0 };
            if packet.payload().len() <= index || packet.payload()[index] != subtype {
                return false;
            }
        }
        true
    }
}

/// One slot in a queue: something to transmit, or a gate to wait behind.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum QueueEntry {
    Packet {
        packet: BidcosPacket,
        /// Send without touching counters or raising send events.
        stealthy: bool,
        /// Head packet has been handed to the transport.
        sent: bool,
    },
    Expected(MessageMatcher),
}

/// Fixed-capacity ring deque of queue entries.
///
/// `push_front` exists for the requeue-and-retry path only; everything else
/// is strict FIFO.
#[derive(Clone)]
pub struct EntryRing {
    items: [Option<QueueEntry>; QUEUE_CAPACITY],
    head: usize,
    count: usize,
}

impl EntryRing {
    pub const fn new() -> Self {
        EntryRing {
            items: [const { None }; QUEUE_CAPACITY],
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

    /// Appends an entry; returns false (and drops it) when the ring is full.
    pub fn push_back(&mut self, entry: QueueEntry) -> bool {
        if self.count == QUEUE_CAPACITY {
            return false;
        }
        let slot = (self.head + self.count) % QUEUE_CAPACITY;
        self.items[slot] = Some(entry);
        self.count += 1;
        true
    }

    pub fn push_front(&mut self, entry: QueueEntry) -> bool {
        if self.count == QUEUE_CAPACITY {
            return false;
        }
        self.head = (self.head + QUEUE_CAPACITY - 1) % QUEUE_CAPACITY;
        self.items[self.head] = Some(entry);
        self.count += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        if self.count == 0 {
            return None;
        }
        let entry = self.items[self.head].take();
        self.head = (self.head + 1) % QUEUE_CAPACITY;
        self.count -= 1;
        entry
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.items[self.head].as_ref()
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        if index >= self.count {
            return None;
        }
        self.items[(self.head + index) % QUEUE_CAPACITY].as_ref()
    }
}

/// Action the dispatcher performs once a queue fully drains.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum DrainAction {
    /// Unpairing finished, remove the peer and raise DeviceRemoved.
    DeletePeer,
    /// A synchronous operation finished, release its waiting caller.
    NotifyOp(OpKind),
}

/// Result of advancing a queue.
#[cfg_attr(feature = "std", derive(Debug))]
pub enum PopResult {
    /// More entries (or spliced pending work) remain.
    Advanced,
    /// Entry list and pending chain are exhausted.
    Drained(Option<DrainAction>),
}

/// A live exchange queue for one peer radio address.
pub struct BidcosQueue {
    pub queue_type: QueueType,
    /// Radio address this queue exchanges with (not a peer id: queues exist
    /// for unpaired senders during pairing).
    pub address: u32,
    entries: EntryRing,
    /// Queue is being assembled and must not transmit yet.
    pub no_sending: bool,
    pending: PendingQueueChain,
    pop_wait_deadline: Option<Instant>,
    last_action: Instant,
    pub on_drained: Option<DrainAction>,
}

impl BidcosQueue {
    pub fn new(queue_type: QueueType, address: u32) -> Self {
        BidcosQueue {
            queue_type,
            address,
            entries: EntryRing::new(),
            no_sending: false,
            pending: PendingQueueChain::new(),
            pop_wait_deadline: None,
            last_action: Instant::now(),
            on_drained: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn entry(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_action(&self) -> Instant {
        self.last_action
    }

    /// True when the head packet has been handed to the transport and its
    /// response is still outstanding.
    pub fn in_flight(&self) -> bool {
        matches!(self.entries.front(), Some(QueueEntry::Packet { sent: true, .. }))
    }

    /// Appends a packet entry.
    ///
    /// On a live queue the packet is transmitted immediately when it lands
    /// at the head, or directly behind a lone expectation; otherwise it
    /// waits behind existing work. A fire-and-forget packet (nothing
    /// expected after it) pushed onto an otherwise empty live queue may
    /// complete the queue on the spot, hence the drain result.
    pub fn push_packet(&mut self, packet: BidcosPacket, stealthy: bool, tx: &TxPacketQueueSender) -> Option<PopResult> {
        self.last_action = Instant::now();
        let len_before = self.entries.len();
        let lone_expected = len_before == 1 && matches!(self.entries.front(), Some(QueueEntry::Expected(_)));
        if !self.entries.push_back(QueueEntry::Packet { packet, stealthy, sent: false }) {
            log!(Level::Error, "Queue for 0x{:06X} is full, dropping packet entry", self.address);
            return None;
        }
        if self.no_sending {
            return None;
        }
        if len_before == 0 {
            return self.pump(tx);
        }
        if lone_expected {
            self.dispatch_entry(1, tx);
        }
        None
    }

    /// Appends an expected-message placeholder; never transmits by itself.
    pub fn push_expected(&mut self, matcher: MessageMatcher) {
        self.last_action = Instant::now();
        if !self.entries.push_back(QueueEntry::Expected(matcher)) {
            log!(Level::Error, "Queue for 0x{:06X} is full, dropping expected entry", self.address);
        }
    }

    /// Requeues an unacknowledged packet at the front and retransmits it.
    ///
    /// Used when the far end answered with a continuation that does not
    /// match the current expectation: the request is not lost, it is sent
    /// again while everything behind the head keeps its order.
    pub fn push_front_packet(&mut self, packet: BidcosPacket, tx: &TxPacketQueueSender) {
        self.last_action = Instant::now();
        self.pop_wait_deadline = None;
        if !self.entries.push_front(QueueEntry::Packet { packet, stealthy: false, sent: false }) {
            log!(Level::Error, "Queue for 0x{:06X} is full, dropping requeued packet", self.address);
            return;
        }
        if !self.no_sending {
            self.dispatch_entry(0, tx);
        }
    }

    /// Re-sends an in-flight head whose response never matched: the sent
    /// packet is replaced by a fresh unsent copy of itself and dispatched
    /// again. Returns false when the head is not an in-flight packet.
    pub fn requeue_head(&mut self, tx: &TxPacketQueueSender) -> bool {
        let Some(QueueEntry::Packet { packet, sent: true, .. }) = self.entries.front() else {
            return false;
        };
        let packet = packet.clone();
        self.entries.pop_front();
        self.push_front_packet(packet, tx);
        true
    }

    /// Attaches a pending chain; an empty live queue immediately splices in
    /// the chain's front queue.
    pub fn attach_chain(&mut self, chain: PendingQueueChain, tx: &TxPacketQueueSender) -> Option<PopResult> {
        self.last_action = Instant::now();
        self.pending = chain;
        if self.entries.is_empty() && !self.no_sending {
            return self.pump(tx);
        }
        None
    }

    /// Appends the queues of `chain` behind an already-attached chain.
    pub fn extend_chain(&mut self, chain: PendingQueueChain, tx: &TxPacketQueueSender) -> Option<PopResult> {
        self.last_action = Instant::now();
        self.pending.extend(chain);
        if self.entries.is_empty() && !self.no_sending {
            return self.pump(tx);
        }
        None
    }

    /// Arms the fallback timer that auto-pops the head when no satisfying
    /// response arrives within `duration`.
    pub fn pop_wait(&mut self, duration: Duration) {
        self.pop_wait_deadline = Some(Instant::now() + duration);
    }

    pub fn pop_wait_deadline(&self) -> Option<Instant> {
        self.pop_wait_deadline
    }

    /// Removes the head entry and advances.
    ///
    /// This is the only way past a satisfied expectation or an acknowledged
    /// packet. A running pop-wait timer is cancelled. Draining the entry
    /// list splices in the next pending queue; draining everything reports
    /// the drain action.
    pub fn pop(&mut self, tx: &TxPacketQueueSender) -> PopResult {
        self.last_action = Instant::now();
        self.pop_wait_deadline = None;
        self.entries.pop_front();
        match self.pump(tx) {
            Some(result) => result,
            None => PopResult::Advanced,
        }
    }

    /// Satisfies the queue's current expectation with an inbound packet.
    ///
    /// Handles both shapes the head can take: a sent packet gated by the
    /// expectation behind it, or a bare expectation at the head. Returns
    /// `None` when the packet does not satisfy the queue.
    pub fn try_satisfy(&mut self, packet: &BidcosPacket, tx: &TxPacketQueueSender) -> Option<PopResult> {
        let gated = self.in_flight()
            && matches!(self.entries.get(1), Some(QueueEntry::Expected(matcher)) if matcher.matches(packet));
        if gated {
            self.last_action = Instant::now();
            self.pop_wait_deadline = None;
            self.entries.pop_front();
            self.entries.pop_front();
            return Some(self.pump(tx).unwrap_or(PopResult::Advanced));
        }
        if matches!(self.entries.front(), Some(QueueEntry::Expected(matcher)) if matcher.matches(packet)) {
            return Some(self.pop(tx));
        }
        None
    }

    /// Drops every entry and pending queue. Used on NACK aborts.
    pub fn clear(&mut self) {
        self.last_action = Instant::now();
        self.pop_wait_deadline = None;
        self.entries = EntryRing::new();
        self.pending = PendingQueueChain::new();
    }

    /// Marks an assembled queue live and starts transmitting.
    pub fn set_live(&mut self, tx: &TxPacketQueueSender) -> Option<PopResult> {
        self.no_sending = false;
        self.pump(tx)
    }

    /// Periodic sweep: fires the pop-wait timer and retries a head packet a
    /// previously full TX channel left unsent.
    pub fn service(&mut self, now: Instant, tx: &TxPacketQueueSender) -> Option<PopResult> {
        if let Some(deadline) = self.pop_wait_deadline {
            if now >= deadline {
                log!(Level::Debug, "Pop-wait expired for queue 0x{:06X}, advancing", self.address);
                return Some(self.pop(tx));
            }
        }
        if self.no_sending {
            return None;
        }
        self.pump(tx)
    }

    /// Drives the queue forward as far as it can go without input:
    /// transmits an unsent head, advances past fire-and-forget sends,
    /// splices pending queues, and reports final drain.
    fn pump(&mut self, tx: &TxPacketQueueSender) -> Option<PopResult> {
        loop {
            match self.entries.front() {
                None => {
                    if !self.splice_one_pending() {
                        return Some(PopResult::Drained(self.on_drained.take()));
                    }
                }
                Some(QueueEntry::Expected(_)) => return None,
                Some(QueueEntry::Packet { sent: false, .. }) => {
                    self.dispatch_entry(0, tx);
                    if !self.in_flight() {
                        // TX channel full, retried on the next sweep.
                        return None;
                    }
                }
                Some(QueueEntry::Packet { sent: true, .. }) => {
                    if matches!(self.entries.get(1), Some(QueueEntry::Expected(_))) {
                        // Response outstanding, single in-flight exchange.
                        return None;
                    }
                    self.entries.pop_front();
                }
            }
        }
    }

    /// Moves the front pending queue's entries into the (empty) entry list.
    /// Returns false when the chain is exhausted.
    fn splice_one_pending(&mut self) -> bool {
        let Some(pending) = self.pending.pop_front() else {
            return false;
        };
        self.queue_type = pending.queue_type;
        let mut entries = pending.entries;
        while let Some(entry) = entries.pop_front() {
            if !self.entries.push_back(entry) {
                log!(Level::Error, "Queue for 0x{:06X} overflowed while splicing pending work", self.address);
                break;
            }
        }
        true
    }

    /// Hands the packet at `index` to the transport if it is an unsent
    /// packet entry. Only index 0, or index 1 directly behind a lone
    /// expectation, is ever dispatched, preserving the one-in-flight rule.
    fn dispatch_entry(&mut self, index: usize, tx: &TxPacketQueueSender) {
        debug_assert!(index <= 1);
        if index >= self.entries.count {
            return;
        }
        let address = self.address;
        let slot = (self.entries.head + index) % QUEUE_CAPACITY;
        if let Some(QueueEntry::Packet { packet, stealthy, sent }) = self.entries.items[slot].as_mut() {
            if !*sent {
                let mut outbound = packet.clone();
                outbound.time_sending = Some(Instant::now());
                match tx.try_send(OutboundPacket {
                    packet: outbound,
                    stealthy: *stealthy,
                }) {
                    Ok(()) => *sent = true,
                    Err(_) => {
                        log!(Level::Warn, "TX packet queue full, queue 0x{:06X} will retry", address);
                    }
                }
            }
        }
    }
}
