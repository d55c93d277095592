//! # Queue Manager
//!
//! Registry mapping a peer radio address to at most one live exchange
//! queue. Registration is keyed by address, never by peer identity, because
//! unpaired senders must be tracked while their pairing handshake runs.

use embassy_time::{Duration, Instant};
use log::{log, Level};

use crate::queue::{BidcosQueue, DrainAction, PopResult, QueueType};
use crate::TxPacketQueueSender;

/// Maximum number of concurrently live queues (one per address).
pub const MAX_QUEUES: usize = 8;

/// Queues untouched this long are garbage collected.
pub const QUEUE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Drain/GC outcomes of one service sweep, consumed by the dispatcher.
pub type SweepActions = [Option<(u32, DrainAction)>; MAX_QUEUES];

pub struct QueueManager {
    queues: [Option<BidcosQueue>; MAX_QUEUES],
}

impl QueueManager {
    pub const fn new() -> Self {
        QueueManager {
            queues: [const { None }; MAX_QUEUES],
        }
    }

    pub fn len(&self) -> usize {
        self.queues.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn get(&self, address: u32) -> Option<&BidcosQueue> {
        self.queues.iter().flatten().find(|queue| queue.address == address)
    }

    pub fn get_mut(&mut self, address: u32) -> Option<&mut BidcosQueue> {
        self.queues.iter_mut().flatten().find(|queue| queue.address == address)
    }

    /// Fetches the queue registered for `address`, creating an empty one of
    /// `queue_type` when none exists. An existing queue is returned as-is,
    /// whatever its type: one address never has two live queues.
    pub fn create(&mut self, queue_type: QueueType, address: u32) -> &mut BidcosQueue {
        let mut existing = None;
        let mut free = None;
        let mut oldest: Option<(usize, Instant)> = None;
        for (index, slot) in self.queues.iter().enumerate() {
            match slot {
                Some(queue) if queue.address == address => {
                    existing = Some(index);
                    break;
                }
                Some(queue) => {
                    if oldest.map_or(true, |(_, time)| queue.last_action() < time) {
                        oldest = Some((index, queue.last_action()));
                    }
                }
                None => {
                    if free.is_none() {
                        free = Some(index);
                    }
                }
            }
        }
        let index = match (existing, free, oldest) {
            (Some(index), _, _) => index,
            (None, Some(index), _) => {
                self.queues[index] = Some(BidcosQueue::new(queue_type, address));
                index
            }
            (None, None, Some((index, _))) => {
                log!(Level::Warn, "Queue registry full, evicting least recently active queue");
                self.queues[index] = Some(BidcosQueue::new(queue_type, address));
                index
            }
            // MAX_QUEUES > 0, so one of the arms above always matches.
            (None, None, None) => 0,
        };
        self.queues[index].get_or_insert_with(|| BidcosQueue::new(queue_type, address))
    }

    pub fn remove(&mut self, address: u32) -> Option<BidcosQueue> {
        for slot in self.queues.iter_mut() {
            if slot.as_ref().is_some_and(|queue| queue.address == address) {
                return slot.take();
            }
        }
        None
    }

    /// Shutdown path: forcibly drops every queue without sending anything.
    pub fn dispose(&mut self) {
        for slot in self.queues.iter_mut() {
            if let Some(queue) = slot {
                queue.no_sending = true;
                queue.clear();
            }
            *slot = None;
        }
    }

    /// Earliest pop-wait deadline over all queues, for the dispatch task's
    /// timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .iter()
            .flatten()
            .filter_map(|queue| queue.pop_wait_deadline())
            .min()
    }

    /// Periodic sweep: fires expired pop-waits, retries unsent heads and
    /// garbage-collects idle queues. Drain actions are handed back for the
    /// dispatcher to execute outside the registry borrow.
    pub fn service(&mut self, now: Instant, tx: &TxPacketQueueSender) -> SweepActions {
        let mut actions: SweepActions = [None; MAX_QUEUES];
        for (index, slot) in self.queues.iter_mut().enumerate() {
            let Some(queue) = slot else { continue };
            match queue.service(now, tx) {
                Some(PopResult::Drained(action)) => {
                    if let Some(action) = action {
                        actions[index] = Some((queue.address, action));
                    }
                    *slot = None;
                }
                Some(PopResult::Advanced) => {}
                None => {
                    if now.saturating_duration_since(queue.last_action()) >= QUEUE_IDLE_TIMEOUT {
                        log!(Level::Info, "Dropping idle queue for 0x{:06X}", queue.address);
                        *slot = None;
                    }
                }
            }
        }
        actions
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}
