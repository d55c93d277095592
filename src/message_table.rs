//! # Message Table
//!
//! Ordered dispatch rules for inbound packets: each rule pairs a message
//! type matcher with the access required to process it and the handler that
//! runs on success. Rules are scanned linearly in registration order; a
//! message type of `-1` matches anything, so a wildcard rule registered
//! last becomes the fallback.

use log::{log, Level};

use crate::packet::{message_type, BidcosPacket, NACK};
use crate::queue::{BidcosQueue, QueueEntry, QueueType};
use crate::TxPacketQueueSender;

/// Access requirement bit flags. Apart from [`access::FULL`] (which grants
/// unconditionally) every flag set on a rule must hold for the packet to be
/// processed.
pub mod access {
    pub const NONE: u8 = 0x00;
    pub const FULL: u8 = 0x01;
    /// Packet destination must be the central's own address.
    pub const DEST_IS_ME: u8 = 0x02;
    /// Sender must be a known peer (or the pairing-in-progress candidate).
    pub const PAIRED_TO_SENDER: u8 = 0x04;
    /// Sender must be the central itself.
    pub const CENTRAL: u8 = 0x08;
    /// Only valid while an Unpairing queue is live for the sender.
    pub const UNPAIRING: u8 = 0x10;
}

/// Handlers the dispatcher can route a packet to.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum HandlerId {
    PairingRequest,
    Ack,
    ConfigParamResponse,
    TimeRequest,
    Default,
}

pub struct MessageRule {
    /// Message type to match, -1 is a wildcard.
    pub message_type: i32,
    pub access: u8,
    pub access_pairing: u8,
    pub handler: HandlerId,
}

pub const MAX_RULES: usize = 16;

/// Everything the access check needs to know about the world outside the
/// queue under inspection.
pub struct AccessContext {
    pub central_address: u32,
    pub pairing_mode: bool,
    /// Sender address resolves to a registered peer.
    pub sender_is_paired: bool,
    /// Address of the pairing candidate while a handshake is running.
    pub provisional_address: Option<u32>,
}

enum HeadAction {
    Leave,
    Pop,
    Requeue,
}

pub struct MessageTable {
    rules: [Option<MessageRule>; MAX_RULES],
    count: usize,
}

impl MessageTable {
    pub const fn new() -> Self {
        MessageTable {
            rules: [const { None }; MAX_RULES],
            count: 0,
        }
    }

    /// The standard rule set of a BidCoS central, in the order the original
    /// protocol expects them to be consulted.
    pub fn standard() -> Self {
        let mut table = MessageTable::new();
        table.register(MessageRule {
            message_type: message_type::PAIRING_REQUEST as i32,
            access: access::FULL,
            access_pairing: access::FULL,
            handler: HandlerId::PairingRequest,
        });
        table.register(MessageRule {
            message_type: message_type::ACK as i32,
            access: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            access_pairing: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            handler: HandlerId::Ack,
        });
        table.register(MessageRule {
            message_type: message_type::PARAM_RESPONSE as i32,
            access: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            access_pairing: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            handler: HandlerId::ConfigParamResponse,
        });
        table.register(MessageRule {
            message_type: message_type::TIME_REQUEST as i32,
            access: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            access_pairing: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            handler: HandlerId::TimeRequest,
        });
        table.register(MessageRule {
            message_type: -1,
            access: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            access_pairing: access::DEST_IS_ME | access::PAIRED_TO_SENDER,
            handler: HandlerId::Default,
        });
        table
    }

    pub fn register(&mut self, rule: MessageRule) -> bool {
        if self.count == MAX_RULES {
            log!(Level::Error, "Message table full, dropping rule for type {}", rule.message_type);
            return false;
        }
        self.rules[self.count] = Some(rule);
        self.count += 1;
        true
    }

    /// First rule matching the packet's message type, in registration order.
    pub fn find(&self, packet: &BidcosPacket) -> Option<&MessageRule> {
        self.rules
            .iter()
            .flatten()
            .find(|rule| rule.message_type == -1 || rule.message_type == packet.message_type as i32)
    }

    /// Evaluates whether `packet` may be processed under `rule`.
    ///
    /// Side effect, deliberately kept from the original protocol: when a
    /// packet addressed to the central arrives while the live queue's head
    /// is an unacknowledged packet, or an expectation the packet does not
    /// satisfy, the head is popped first. A resent device packet thereby
    /// overrides a stale head-of-queue state instead of deadlocking the
    /// exchange. A NACK payload takes the same path with a warning, which
    /// is what lets non-pairing queues advance past a rejected write. The
    /// one exception is a sent value request: a mismatching response
    /// requeues and retransmits it instead of dropping it.
    /// Downstream device compatibility depends on this exact tolerance.
    pub fn check_access(
        &self,
        rule: &MessageRule,
        packet: &BidcosPacket,
        queue: Option<&mut BidcosQueue>,
        ctx: &AccessContext,
        tx: &TxPacketQueueSender,
    ) -> bool {
        let queue_type = queue.as_ref().map(|queue| queue.queue_type);
        if let Some(queue) = queue {
            if packet.destination_address == ctx.central_address {
                let gate_matches = matches!(queue.entry(1), Some(QueueEntry::Expected(matcher)) if matcher.matches(packet));
                let head_action = match queue.front() {
                    // A value request whose response never matched is not
                    // lost: it goes back to the front and out again.
                    Some(QueueEntry::Packet { sent: true, .. })
                        if queue.queue_type == QueueType::GetValue && !gate_matches =>
                    {
                        HeadAction::Requeue
                    }
                    Some(QueueEntry::Packet { .. }) => HeadAction::Pop,
                    Some(QueueEntry::Expected(matcher)) if !matcher.matches(packet) => HeadAction::Pop,
                    _ => HeadAction::Leave,
                };
                match head_action {
                    HeadAction::Pop => {
                        if packet.message_type == message_type::ACK && packet.payload().first() == Some(&NACK) {
                            log!(Level::Warn, "Popping queue head for 0x{:06X} past a NACK response", packet.sender_address);
                        }
                        queue.pop(tx);
                    }
                    HeadAction::Requeue => {
                        log!(Level::Debug, "Response mismatch for 0x{:06X}, retransmitting value request", packet.sender_address);
                        queue.requeue_head(tx);
                    }
                    HeadAction::Leave => {}
                }
            }
        }

        let mask = if ctx.pairing_mode { rule.access_pairing } else { rule.access };
        if mask == access::NONE {
            return false;
        }
        if mask & access::FULL != 0 {
            return true;
        }
        if mask & access::DEST_IS_ME != 0 && packet.destination_address != ctx.central_address {
            return false;
        }
        if mask & access::CENTRAL != 0 && packet.sender_address != ctx.central_address {
            return false;
        }
        if mask & access::UNPAIRING != 0 && queue_type != Some(QueueType::Unpairing) {
            return false;
        }
        if mask & access::PAIRED_TO_SENDER != 0 {
            let known = ctx.sender_is_paired
                || (ctx.pairing_mode && ctx.provisional_address == Some(packet.sender_address));
            if !known {
                return false;
            }
        }
        true
    }
}

impl Default for MessageTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::packet::ACK_OK;
    use crate::queue::MessageMatcher;
    use crate::TxPacketQueue;
    use embassy_sync::channel::Channel;

    const CENTRAL: u32 = 0xFD0001;
    const DEVICE: u32 = 0x24C0FF;

    fn tx_channel() -> &'static TxPacketQueue {
        Box::leak(Box::new(Channel::new()))
    }

    fn ctx(pairing_mode: bool, sender_is_paired: bool) -> AccessContext {
        AccessContext {
            central_address: CENTRAL,
            pairing_mode,
            sender_is_paired,
            provisional_address: None,
        }
    }

    fn ack(counter: u8, payload: u8) -> BidcosPacket {
        BidcosPacket::new(counter, 0, message_type::ACK, DEVICE, CENTRAL, &[payload])
    }

    #[test]
    fn find_prefers_registration_order_with_wildcard_fallback() {
        let table = MessageTable::standard();
        let ack_rule = table.find(&ack(1, ACK_OK)).unwrap();
        assert_eq!(ack_rule.handler, HandlerId::Ack);

        let unknown = BidcosPacket::new(1, 0, 0x41, DEVICE, CENTRAL, &[]);
        let fallback = table.find(&unknown).unwrap();
        assert_eq!(fallback.handler, HandlerId::Default);
    }

    #[test]
    fn full_access_grants_unconditionally() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let request = BidcosPacket::new(1, 0x84, message_type::PAIRING_REQUEST, DEVICE, 0, &[0x10]);
        let rule = table.find(&request).unwrap();
        assert!(table.check_access(rule, &request, None, &ctx(false, false), &tx.sender()));
    }

    #[test]
    fn paired_to_sender_denies_unknown_devices() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let packet = ack(1, ACK_OK);
        let rule = table.find(&packet).unwrap();
        assert!(!table.check_access(rule, &packet, None, &ctx(false, false), &tx.sender()));
        assert!(table.check_access(rule, &packet, None, &ctx(false, true), &tx.sender()));
    }

    #[test]
    fn provisional_peer_is_accepted_while_pairing() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let packet = ack(1, ACK_OK);
        let rule = table.find(&packet).unwrap();
        let mut context = ctx(true, false);
        assert!(!table.check_access(rule, &packet, None, &context, &tx.sender()));
        context.provisional_address = Some(DEVICE);
        assert!(table.check_access(rule, &packet, None, &context, &tx.sender()));
    }

    #[test]
    fn dest_is_me_denies_foreign_destination() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let mut packet = ack(1, ACK_OK);
        packet.destination_address = 0x111111;
        let rule = table.find(&packet).unwrap();
        assert!(!table.check_access(rule, &packet, None, &ctx(false, true), &tx.sender()));
    }

    #[test]
    fn stale_head_is_popped_for_packets_targeting_the_central() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let sender = tx.sender();

        let mut queue = BidcosQueue::new(QueueType::Config, DEVICE);
        queue.no_sending = true;
        queue.push_packet(BidcosPacket::new(9, 0, message_type::CONFIG, CENTRAL, DEVICE, &[0x00]), false, &sender);
        queue.push_expected(MessageMatcher::with_counter(message_type::ACK, 9));
        queue.set_live(&sender);
        assert_eq!(queue.len(), 2);

        // The device resends its own request instead of acknowledging ours:
        // the unacknowledged head packet entry is popped first.
        let resent = BidcosPacket::new(3, 0, 0x41, DEVICE, CENTRAL, &[]);
        let rule = table.find(&resent).unwrap();
        assert!(table.check_access(rule, &resent, Some(&mut queue), &ctx(false, true), &sender));
        assert_eq!(queue.len(), 1, "stale head was popped");
    }

    #[test]
    fn matching_expectation_is_left_alone() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let sender = tx.sender();

        let mut queue = BidcosQueue::new(QueueType::Config, DEVICE);
        queue.push_expected(MessageMatcher::with_counter(message_type::ACK, 7));
        let packet = ack(7, ACK_OK);
        let rule = table.find(&packet).unwrap();
        assert!(table.check_access(rule, &packet, Some(&mut queue), &ctx(false, true), &sender));
        assert_eq!(queue.len(), 1, "satisfying expectation is popped later, by the dispatcher");
    }

    #[test]
    fn nack_pops_stale_head_with_tolerance() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let sender = tx.sender();

        let mut queue = BidcosQueue::new(QueueType::Config, DEVICE);
        queue.push_expected(MessageMatcher::with_counter(message_type::ACK, 4));
        // NACK with the wrong counter: stale expectation, popped anyway.
        let packet = ack(5, NACK);
        let rule = table.find(&packet).unwrap();
        assert!(table.check_access(rule, &packet, Some(&mut queue), &ctx(false, true), &sender));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn mismatched_value_response_requeues_the_request() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let sender = tx.sender();

        let mut queue = BidcosQueue::new(QueueType::GetValue, DEVICE);
        queue.no_sending = true;
        queue.push_packet(BidcosPacket::new(6, 0, message_type::CONFIG, CENTRAL, DEVICE, &[0x01, 0x04]), false, &sender);
        queue.push_expected(MessageMatcher::with_counter(message_type::PARAM_RESPONSE, 6));
        queue.set_live(&sender);
        assert_eq!(tx.receiver().try_receive().unwrap().packet.message_counter, 6);

        let unrelated = BidcosPacket::new(3, 0, 0x41, DEVICE, CENTRAL, &[]);
        let rule = table.find(&unrelated).unwrap();
        assert!(table.check_access(rule, &unrelated, Some(&mut queue), &ctx(false, true), &sender));

        // The request went out again and the queue kept both entries.
        assert_eq!(tx.receiver().try_receive().unwrap().packet.message_counter, 6);
        assert_eq!(queue.len(), 2);
        assert!(queue.in_flight());
    }

    #[test]
    fn check_access_is_deterministic() {
        let table = MessageTable::standard();
        let tx = tx_channel();
        let packet = ack(1, ACK_OK);
        let rule = table.find(&packet).unwrap();
        let context = ctx(false, true);
        let first = table.check_access(rule, &packet, None, &context, &tx.sender());
        let second = table.check_access(rule, &packet, None, &context, &tx.sender());
        assert_eq!(first, second);
    }
}
