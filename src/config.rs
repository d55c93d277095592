//! # Configuration Writes and Reads
//!
//! Builders for the multi-index parameter write sub-protocol and the
//! parser for streamed parameter-read responses.
//!
//! ## Write sequence
//!
//! A `putParamset` call arrives as a flat change set of (list, index,
//! value) register bytes for one channel, already converted by an
//! external parameter layer. Per touched list the device expects a
//! CONFIG_START(channel, list), then CONFIG_WRITE_INDEX packets each
//! carrying up to seven (index, value) pairs, then END_CONFIG, every
//! packet acknowledged. Each list becomes one or more pending queues (a
//! cycle is capped so its entries always fit a live queue's ring) so the
//! whole call serializes behind whatever the peer is already doing. An
//! empty change set builds nothing at all, and a set too large for one
//! pending chain is refused before anything is transmitted.
//!
//! ## Read sequence
//!
//! A parameter read streams (index, value) pairs over one or more
//! PARAM_RESPONSE packets. A set continuation bit with a non-zero trailer
//! announces another fragment; an all-zero pair terminates the stream. A
//! fragment may end in the middle of a pair, in which case the dangling
//! index byte is carried over and completed by the next fragment.

use log::{log, Level};

use crate::packet::{config_subtype, control, message_type, BidcosPacket};
use crate::pending_queue::{PendingQueue, PendingQueueChain};
use crate::queue::{MessageMatcher, QueueType, QUEUE_CAPACITY};
use crate::{MessageCounters, ParameterStore};

/// Upper bound of register changes in one `putParamset` call.
pub const MAX_CHANGES: usize = 64;

/// A single RF frame fits seven (index, value) pairs behind the
/// channel/subtype header.
pub const PAIRS_PER_WRITE: usize = 7;

/// One config cycle (START, writes, END) occupies two ring entries per
/// exchange; capping the write packets per cycle keeps a full cycle inside
/// the live queue's entry ring.
const WRITES_PER_CYCLE: usize = QUEUE_CAPACITY / 2 - 2;

/// List 1 register holding the AES_ACTIVE flag.
const REGISTER_AES_ACTIVE: u8 = 0x08;

/// Flat set of register changes for one channel, in caller order.
pub struct ParamChangeSet {
    pub channel: u8,
    changes: [Option<(u8, u8, u8)>; MAX_CHANGES],
    count: usize,
}

impl ParamChangeSet {
    pub fn new(channel: u8) -> Self {
        ParamChangeSet {
            channel,
            changes: [None; MAX_CHANGES],
            count: 0,
        }
    }

    /// Records `value` for register `index` on `list`; returns false when
    /// the set is full.
    pub fn push(&mut self, list: u8, index: u8, value: u8) -> bool {
        if self.count == MAX_CHANGES {
            return false;
        }
        self.changes[self.count] = Some((list, index, value));
        self.count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn iter(&self) -> impl Iterator<Item = (u8, u8, u8)> + '_ {
        self.changes.iter().take(self.count).flatten().copied()
    }

    /// Touched lists in order of first appearance.
    fn lists(&self) -> impl Iterator<Item = u8> + '_ {
        self.changes.iter().take(self.count).flatten().enumerate().filter_map(move |(position, &(list, _, _))| {
            let seen_before = self.iter().take(position).any(|(earlier, _, _)| earlier == list);
            if seen_before {
                None
            } else {
                Some(list)
            }
        })
    }

    /// True when the set turns the AES_ACTIVE register on.
    pub fn activates_aes(&self) -> bool {
        self.iter().any(|(list, index, value)| list == 1 && index == REGISTER_AES_ACTIVE && value != 0)
    }
}

/// Builds the pending queues for one `putParamset` call: per touched
/// list, CONFIG_START, the chunked CONFIG_WRITE_INDEX packets and
/// END_CONFIG, all ACK-gated. A list needing more write packets than one
/// cycle can carry is split into several complete cycles, each properly
/// terminated. An empty change set yields an empty chain; a set needing
/// more queues than one chain holds yields `None` so the caller refuses
/// the whole call instead of writing half of it.
pub fn build_put_paramset_chain(
    set: &ParamChangeSet,
    peer_address: u32,
    central_address: u32,
    counters: &mut MessageCounters,
) -> Option<PendingQueueChain> {
    let mut chain = PendingQueueChain::new();
    for list in set.lists() {
        let total = set.iter().filter(|&(change_list, _, _)| change_list == list).count();
        let mut taken = 0;
        while taken < total {
            let cycle = (total - taken).min(WRITES_PER_CYCLE * PAIRS_PER_WRITE);
            let mut pending = PendingQueue::new(QueueType::Config);
            let mut exchange = |pending: &mut PendingQueue, payload: &[u8]| {
                let counter = counters.next();
                pending.push_packet(
                    BidcosPacket::new(counter, control::BIDIRECTIONAL, message_type::CONFIG, central_address, peer_address, payload),
                    false,
                );
                pending.push_expected(MessageMatcher::with_counter(message_type::ACK, counter));
            };

            exchange(&mut pending, &[set.channel, config_subtype::CONFIG_START, 0x00, 0x00, 0x00, 0x00, list]);

            let mut payload = [0u8; 2 + 2 * PAIRS_PER_WRITE];
            payload[0] = set.channel;
            payload[1] = config_subtype::CONFIG_WRITE_INDEX;
            let mut filled = 0;
            for (_, index, value) in set.iter().filter(|&(change_list, _, _)| change_list == list).skip(taken).take(cycle) {
                payload[2 + 2 * filled] = index;
                payload[3 + 2 * filled] = value;
                filled += 1;
                if filled == PAIRS_PER_WRITE {
                    exchange(&mut pending, &payload);
                    filled = 0;
                }
            }
            if filled > 0 {
                exchange(&mut pending, &payload[..2 + 2 * filled]);
            }

            exchange(&mut pending, &[set.channel, config_subtype::END_CONFIG]);
            if !chain.push_back(pending) {
                log!(Level::Error, "putParamset for 0x{:06X} needs more queues than one chain holds, refusing", peer_address);
                return None;
            }
            taken += cycle;
        }
    }

    if set.activates_aes() {
        if !chain.push_back(aes_key_queue(set.channel, peer_address, central_address, counters)) {
            log!(Level::Error, "putParamset for 0x{:06X} needs more queues than one chain holds, refusing", peer_address);
            return None;
        }
    }
    Some(chain)
}

/// Key-exchange queue spawned when a write turns AES_ACTIVE on: the
/// device is told to adopt the next key index before encrypted traffic
/// starts.
fn aes_key_queue(channel: u8, peer_address: u32, central_address: u32, counters: &mut MessageCounters) -> PendingQueue {
    let mut pending = PendingQueue::new(QueueType::SetAesKey);
    let counter = counters.next();
    pending.push_packet(
        BidcosPacket::new(
            counter,
            control::BIDIRECTIONAL,
            message_type::AES_EXCHANGE,
            central_address,
            peer_address,
            &[channel, 0x01],
        ),
        false,
    );
    pending.push_expected(MessageMatcher::with_counter(message_type::ACK, counter));
    pending
}

/// Chain rotating a device's AES key index on demand.
pub fn build_aes_key_chain(channel: u8, peer_address: u32, central_address: u32, counters: &mut MessageCounters) -> PendingQueueChain {
    let mut chain = PendingQueueChain::new();
    chain.push_back(aes_key_queue(channel, peer_address, central_address, counters));
    chain
}

/// Builds the single-exchange chain for a `requestParamset` read.
pub fn build_param_request_chain(
    channel: u8,
    list: u8,
    peer_address: u32,
    central_address: u32,
    counters: &mut MessageCounters,
) -> PendingQueueChain {
    let mut chain = PendingQueueChain::new();
    let mut pending = PendingQueue::new(QueueType::GetValue);
    let counter = counters.next();
    pending.push_packet(
        BidcosPacket::new(
            counter,
            control::BIDIRECTIONAL,
            message_type::CONFIG,
            central_address,
            peer_address,
            &[channel, config_subtype::PARAM_REQUEST, 0x00, 0x00, 0x00, 0x00, list],
        ),
        false,
    );
    pending.push_expected(MessageMatcher::with_counter(message_type::PARAM_RESPONSE, counter));
    chain.push_back(pending);
    chain
}

/// Progress of a streamed parameter read.
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum ReadProgress {
    /// More fragments are expected.
    Continue,
    /// The all-zero terminator arrived (or the stream ended).
    Complete,
}

/// State of one in-progress parameter read from one device.
pub struct ConfigReadSession {
    pub address: u32,
    pub channel: u8,
    pub list: u8,
    /// Index byte of a pair split across a fragment boundary.
    carried_index: Option<u8>,
}

impl ConfigReadSession {
    pub fn new(address: u32, channel: u8, list: u8) -> Self {
        ConfigReadSession {
            address,
            channel,
            list,
            carried_index: None,
        }
    }

    /// Consumes one PARAM_RESPONSE fragment, committing every complete
    /// (index, value) pair to the store.
    pub fn handle_response(&mut self, packet: &BidcosPacket, store: &dyn ParameterStore) -> ReadProgress {
        let payload = packet.payload();
        if payload.len() < 2 {
            return ReadProgress::Complete;
        }
        // payload[0] repeats the response marker, pairs follow.
        let mut bytes = payload[1..].iter().copied();
        let mut terminated = false;
        loop {
            let index = match self.carried_index.take() {
                Some(index) => index,
                None => match bytes.next() {
                    Some(index) => index,
                    None => break,
                },
            };
            let Some(value) = bytes.next() else {
                self.carried_index = Some(index);
                break;
            };
            if index == 0 && value == 0 {
                terminated = true;
                break;
            }
            store.store_config(self.address, self.channel, self.list, index, value);
        }

        let continues = packet.control_byte & control::BIDIRECTIONAL != 0 && !terminated;
        if continues {
            ReadProgress::Continue
        } else {
            if self.carried_index.take().is_some() {
                log!(Level::Warn, "Parameter read from 0x{:06X} ended with a dangling index byte", self.address);
            }
            ReadProgress::Complete
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::pending_queue::PENDING_CHAIN_SIZE;
    use crate::queue::QueueEntry;

    const CENTRAL: u32 = 0xFD0001;
    const DEVICE: u32 = 0x24C0FF;

    fn payloads(pending: &PendingQueue) -> Vec<Vec<u8>> {
        let mut entries = pending.entries.clone();
        let mut out = Vec::new();
        while let Some(entry) = entries.pop_front() {
            if let QueueEntry::Packet { packet, .. } = entry {
                out.push(packet.payload().to_vec());
            }
        }
        out
    }

    #[test]
    fn ten_changes_chunk_into_seven_and_three_pairs() {
        let mut set = ParamChangeSet::new(1);
        for index in 1..=10u8 {
            assert!(set.push(0, index, index * 2));
        }
        let mut counters = MessageCounters::new(5);
        let mut chain = build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).unwrap();

        assert_eq!(chain.len(), 1, "one list, one pending queue");
        let pending = chain.pop_front().unwrap();
        let packets = payloads(&pending);
        assert_eq!(packets.len(), 4, "START, two WRITE_INDEX, END");
        assert_eq!(packets[0][1], config_subtype::CONFIG_START);
        assert_eq!(packets[0][6], 0, "list id rides in the START trailer");
        assert_eq!(packets[1][1], config_subtype::CONFIG_WRITE_INDEX);
        assert_eq!(packets[1].len(), 2 + 2 * 7);
        assert_eq!(packets[2].len(), 2 + 2 * 3);
        assert_eq!(&packets[2][2..], &[8, 16, 9, 18, 10, 20]);
        assert_eq!(packets[3][1], config_subtype::END_CONFIG);
    }

    #[test]
    fn lists_split_into_separate_pending_queues() {
        let mut set = ParamChangeSet::new(2);
        set.push(0, 1, 0xAA);
        set.push(3, 2, 0xBB);
        set.push(0, 3, 0xCC);
        let mut counters = MessageCounters::new(5);
        let mut chain = build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).unwrap();

        assert_eq!(chain.len(), 2);
        let first = payloads(&chain.pop_front().unwrap());
        assert_eq!(first[0][6], 0);
        assert_eq!(&first[1][2..], &[1, 0xAA, 3, 0xCC], "same-list changes share a write packet");
        let second = payloads(&chain.pop_front().unwrap());
        assert_eq!(second[0][6], 3);
    }

    #[test]
    fn empty_change_set_is_a_no_op() {
        let set = ParamChangeSet::new(1);
        let mut counters = MessageCounters::new(5);
        let chain = build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn aes_activation_appends_a_key_exchange_queue() {
        let mut set = ParamChangeSet::new(1);
        set.push(1, REGISTER_AES_ACTIVE, 0x01);
        let mut counters = MessageCounters::new(5);
        let mut chain = build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).unwrap();

        assert_eq!(chain.len(), 2);
        chain.pop_front();
        let key_queue = chain.pop_front().unwrap();
        assert_eq!(key_queue.queue_type, QueueType::SetAesKey);
        match key_queue.entries.front() {
            Some(QueueEntry::Packet { packet, .. }) => assert_eq!(packet.message_type, message_type::AES_EXCHANGE),
            other => panic!("expected key exchange packet, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn full_change_set_splits_into_complete_cycles() {
        let mut set = ParamChangeSet::new(1);
        for index in 0..MAX_CHANGES as u8 {
            assert!(set.push(0, index + 1, 0xA0));
        }
        let mut counters = MessageCounters::new(5);
        let mut chain = build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).unwrap();

        assert_eq!(chain.len(), 2, "sixty-four changes span two config cycles");
        let mut writes = 0;
        while let Some(pending) = chain.pop_front() {
            let packets = payloads(&pending);
            assert_eq!(packets.first().unwrap()[1], config_subtype::CONFIG_START);
            assert_eq!(packets.last().unwrap()[1], config_subtype::END_CONFIG);
            assert!(packets.len() * 2 <= QUEUE_CAPACITY, "every cycle fits a live queue");
            writes += packets.iter().filter(|p| p[1] == config_subtype::CONFIG_WRITE_INDEX).count();
        }
        assert_eq!(writes, 10, "no write packet is dropped");
    }

    #[test]
    fn set_spanning_too_many_lists_is_refused() {
        let mut set = ParamChangeSet::new(1);
        for list in 0..=PENDING_CHAIN_SIZE as u8 {
            set.push(list, 0x01, 0xFF);
        }
        let mut counters = MessageCounters::new(5);
        assert!(build_put_paramset_chain(&set, DEVICE, CENTRAL, &mut counters).is_none());
    }

    struct RecordingStore {
        committed: std::cell::RefCell<Vec<(u32, u8, u8, u8, u8)>>,
    }

    impl ParameterStore for RecordingStore {
        fn store_config(&self, address: u32, channel: u8, list: u8, index: u8, value: u8) {
            self.committed.borrow_mut().push((address, channel, list, index, value));
        }
    }

    fn response(counter: u8, continues: bool, pairs: &[u8]) -> BidcosPacket {
        let mut payload = Vec::with_capacity(1 + pairs.len());
        payload.push(0x02);
        payload.extend_from_slice(pairs);
        let control = if continues { control::BIDIRECTIONAL } else { 0 };
        BidcosPacket::new(counter, control, message_type::PARAM_RESPONSE, DEVICE, CENTRAL, &payload)
    }

    #[test]
    fn read_commits_pairs_and_stops_on_the_zero_terminator() {
        let mut session = ConfigReadSession::new(DEVICE, 1, 0);
        let store = RecordingStore { committed: Default::default() };

        let progress = session.handle_response(&response(9, true, &[0x01, 0x11, 0x02, 0x22]), &store);
        assert_eq!(progress, ReadProgress::Continue);
        let progress = session.handle_response(&response(9, true, &[0x03, 0x33, 0x00, 0x00]), &store);
        assert_eq!(progress, ReadProgress::Complete, "all-zero pair terminates even with the continuation bit set");

        assert_eq!(
            store.committed.into_inner(),
            vec![(DEVICE, 1, 0, 0x01, 0x11), (DEVICE, 1, 0, 0x02, 0x22), (DEVICE, 1, 0, 0x03, 0x33)]
        );
    }

    #[test]
    fn pair_split_across_fragments_is_carried_over() {
        let mut session = ConfigReadSession::new(DEVICE, 1, 0);
        let store = RecordingStore { committed: Default::default() };

        // First fragment ends after an index byte with no value.
        session.handle_response(&response(9, true, &[0x01, 0x11, 0x05]), &store);
        session.handle_response(&response(9, false, &[0x55, 0x02, 0x22]), &store);

        assert_eq!(
            store.committed.into_inner(),
            vec![(DEVICE, 1, 0, 0x01, 0x11), (DEVICE, 1, 0, 0x05, 0x55), (DEVICE, 1, 0, 0x02, 0x22)]
        );
    }
}
