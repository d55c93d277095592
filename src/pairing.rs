//! # Pairing and Unpairing
//!
//! Builders for the pairing handshake and its follow-up configuration
//! reads.
//!
//! ## Handshake
//!
//! An inbound pairing request (message type 0x00) from an unknown device
//! carries its firmware version, device type and serial number. While the
//! central is in pairing mode it answers with a fixed configuration
//! sequence that writes its own address into the device's pairing
//! registers: CONFIG_START, CONFIG_WRITE_INDEX (central address plus the
//! internal-keys-visible flag), END_CONFIG, each acknowledged by the
//! device. The device-description model then determines the follow-up
//! work, which is parked as pending queues behind the handshake: one
//! parameter read per master list per channel, a peer-list read for every
//! link-capable channel, and an AES activation write for channels that
//! default to encryption.
//!
//! The peer itself is only committed once the handshake's first exchange
//! is acknowledged; a NACK anywhere in a pairing queue aborts the whole
//! queue and leaves no trace of the device.

use log::{log, Level};

use crate::packet::{config_subtype, control, message_type, BidcosPacket, ACK_OK};
use crate::peer::{Peer, PeerRegistry, SERIAL_LENGTH};
use crate::pending_queue::{PendingQueue, PendingQueueChain};
use crate::queue::{BidcosQueue, DrainAction, MessageMatcher, QueueType};
use crate::{DeviceModel, MessageCounters, TxPacketQueueSender};

/// Config register holding the ACL / internal-keys-visible flag.
const REGISTER_ACL_FLAGS: u8 = 0x02;
/// Config registers holding the three central address bytes.
const REGISTER_CENTRAL_HIGH: u8 = 0x0A;
const REGISTER_CENTRAL_MID: u8 = 0x0B;
const REGISTER_CENTRAL_LOW: u8 = 0x0C;
/// Config register holding the AES_ACTIVE flag on list 1.
const REGISTER_AES_ACTIVE: u8 = 0x08;

/// A decoded pairing request.
#[cfg_attr(feature = "std", derive(Debug))]
pub struct PairingRequest {
    pub address: u32,
    pub message_counter: u8,
    pub firmware_version: u8,
    pub device_type: u16,
    pub serial: [u8; SERIAL_LENGTH],
    pub wants_response: bool,
    pub burst: bool,
}

/// Reasons a pairing request is refused before any packet goes out.
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum PairingReject {
    /// The sender address or serial is already paired under a different
    /// identity.
    IdentityConflict,
    /// The device-description resolver knows nothing about this type.
    UnknownDeviceType,
}

/// Decodes the pairing-request payload: firmware version, device type
/// (big-endian) and the ten-character serial number.
pub fn parse_pairing_request(packet: &BidcosPacket) -> Option<PairingRequest> {
    if packet.message_type != message_type::PAIRING_REQUEST {
        return None;
    }
    let payload = packet.payload();
    if payload.len() < 3 + SERIAL_LENGTH {
        log!(Level::Warn, "Pairing request from 0x{:06X} with short payload ({} bytes)", packet.sender_address, payload.len());
        return None;
    }
    let mut serial = [0u8; SERIAL_LENGTH];
    serial.copy_from_slice(&payload[3..3 + SERIAL_LENGTH]);
    Some(PairingRequest {
        address: packet.sender_address,
        message_counter: packet.message_counter,
        firmware_version: payload[0],
        device_type: ((payload[1] as u16) << 8) | payload[2] as u16,
        serial,
        wants_response: packet.wants_response(),
        burst: packet.control_byte & control::BURST != 0,
    })
}

/// Refuses a request whose address or serial is already bound to a
/// different identity. Re-pairing the same device is allowed.
pub fn check_identity(request: &PairingRequest, registry: &PeerRegistry) -> Result<(), PairingReject> {
    if let Some(peer) = registry.by_address(request.address) {
        if peer.serial != request.serial || peer.device_type != request.device_type {
            log!(
                Level::Error,
                "Pairing request from 0x{:06X} conflicts with an existing peer of different serial or type",
                request.address
            );
            return Err(PairingReject::IdentityConflict);
        }
    }
    if let Some(peer) = registry.by_serial(&request.serial) {
        if peer.address != request.address {
            log!(Level::Error, "Serial of pairing request from 0x{:06X} is already bound to 0x{:06X}", request.address, peer.address);
            return Err(PairingReject::IdentityConflict);
        }
    }
    Ok(())
}

/// Builds the provisional peer committed once the handshake is
/// acknowledged.
pub fn provisional_peer(request: &PairingRequest, model: &DeviceModel) -> Peer {
    Peer::new(request.address, request.serial, request.device_type, request.firmware_version, model.channel_count())
}

/// Assembles the full pairing sequence onto `queue`.
///
/// The queue must be freshly created; it is switched to assembly mode,
/// filled with the handshake entries and the per-channel follow-up work,
/// and left for the caller to [`set_live`](BidcosQueue::set_live) after it
/// recorded the provisional peer.
pub fn build_pairing_queue(
    queue: &mut BidcosQueue,
    request: &PairingRequest,
    model: &DeviceModel,
    central_address: u32,
    counters: &mut MessageCounters,
    tx: &TxPacketQueueSender,
) {
    queue.queue_type = QueueType::Pairing;
    queue.no_sending = true;

    let request_control = if request.burst { control::BIDIRECTIONAL | control::BURST } else { control::BIDIRECTIONAL };

    // The device listens for a short window after its request; the ACK
    // must go out verbatim with the request's own counter and must not
    // bump ours.
    if request.wants_response {
        let ack = BidcosPacket::new(request.message_counter, 0, message_type::ACK, central_address, request.address, &[ACK_OK]);
        queue.push_packet(ack, true, tx);
    }

    let mut exchange = |queue: &mut BidcosQueue, payload: &[u8]| {
        let counter = counters.next();
        let packet = BidcosPacket::new(counter, request_control, message_type::CONFIG, central_address, request.address, payload);
        queue.push_packet(packet, false, tx);
        queue.push_expected(MessageMatcher::with_counter(message_type::ACK, counter));
    };

    exchange(queue, &[0x00, config_subtype::CONFIG_START, 0x00, 0x00, 0x00, 0x00, 0x00]);
    exchange(
        queue,
        &[
            0x00,
            config_subtype::CONFIG_WRITE_INDEX,
            REGISTER_ACL_FLAGS,
            0x01,
            REGISTER_CENTRAL_HIGH,
            (central_address >> 16) as u8,
            REGISTER_CENTRAL_MID,
            (central_address >> 8) as u8,
            REGISTER_CENTRAL_LOW,
            central_address as u8,
        ],
    );
    exchange(queue, &[0x00, config_subtype::END_CONFIG]);

    let chain = follow_up_chain(request, model, central_address, request_control, counters);
    queue.attach_chain(chain, tx);
}

/// Builds the post-handshake pending queues: master-list reads, peer-list
/// reads for link-capable channels and AES activation writes.
fn follow_up_chain(
    request: &PairingRequest,
    model: &DeviceModel,
    central_address: u32,
    request_control: u8,
    counters: &mut MessageCounters,
) -> PendingQueueChain {
    let mut chain = PendingQueueChain::new();
    for (channel, channel_model) in model.channels() {
        for list in channel_model.master_lists.iter().flatten() {
            let mut pending = PendingQueue::new(QueueType::Config);
            let counter = counters.next();
            pending.push_packet(BidcosPacket::new(
                counter,
                request_control,
                message_type::CONFIG,
                central_address,
                request.address,
                &[channel, config_subtype::PARAM_REQUEST, 0x00, 0x00, 0x00, 0x00, *list],
            ), false);
            pending.push_expected(MessageMatcher::with_counter(message_type::PARAM_RESPONSE, counter));
            push_pending(&mut chain, pending, request.address);
        }
        if channel_model.has_link_role {
            let mut pending = PendingQueue::new(QueueType::Peer);
            let counter = counters.next();
            pending.push_packet(BidcosPacket::new(
                counter,
                request_control,
                message_type::CONFIG,
                central_address,
                request.address,
                &[channel, config_subtype::PEER_LIST_REQUEST],
            ), false);
            pending.push_expected(MessageMatcher::with_counter(message_type::PARAM_RESPONSE, counter));
            push_pending(&mut chain, pending, request.address);
        }
        if channel_model.aes_default {
            push_pending(
                &mut chain,
                aes_activation_queue(channel, request.address, central_address, request_control, counters),
                request.address,
            );
        }
    }
    chain
}

/// Config write turning AES_ACTIVE on for one channel (list 1).
fn aes_activation_queue(channel: u8, address: u32, central_address: u32, request_control: u8, counters: &mut MessageCounters) -> PendingQueue {
    let mut pending = PendingQueue::new(QueueType::Config);
    let mut exchange = |payload: &[u8]| {
        let counter = counters.next();
        pending.push_packet(
            BidcosPacket::new(counter, request_control, message_type::CONFIG, central_address, address, payload),
            false,
        );
        pending.push_expected(MessageMatcher::with_counter(message_type::ACK, counter));
    };
    exchange(&[channel, config_subtype::CONFIG_START, 0x00, 0x00, 0x00, 0x00, 0x01]);
    exchange(&[channel, config_subtype::CONFIG_WRITE_INDEX, REGISTER_AES_ACTIVE, 0x01]);
    exchange(&[channel, config_subtype::END_CONFIG]);
    pending
}

fn push_pending(chain: &mut PendingQueueChain, pending: PendingQueue, address: u32) {
    if !chain.push_back(pending) {
        log!(Level::Error, "Pairing follow-up chain for 0x{:06X} overflowed", address);
    }
}

/// Assembles the unpairing sequence onto `queue`: a minimal config cycle
/// clearing the pairing registers, completion deletes the peer.
pub fn build_unpairing_queue(
    queue: &mut BidcosQueue,
    peer_address: u32,
    central_address: u32,
    counters: &mut MessageCounters,
    tx: &TxPacketQueueSender,
) {
    queue.queue_type = QueueType::Unpairing;
    queue.no_sending = true;
    queue.on_drained = Some(DrainAction::DeletePeer);

    let mut exchange = |queue: &mut BidcosQueue, payload: &[u8]| {
        let counter = counters.next();
        let packet = BidcosPacket::new(counter, control::BIDIRECTIONAL, message_type::CONFIG, central_address, peer_address, payload);
        queue.push_packet(packet, false, tx);
        queue.push_expected(MessageMatcher::with_counter(message_type::ACK, counter));
    };

    exchange(queue, &[0x00, config_subtype::CONFIG_START, 0x00, 0x00, 0x00, 0x00, 0x00]);
    exchange(
        queue,
        &[
            0x00,
            config_subtype::CONFIG_WRITE_INDEX,
            REGISTER_ACL_FLAGS,
            0x00,
            REGISTER_CENTRAL_HIGH,
            0x00,
            REGISTER_CENTRAL_MID,
            0x00,
            REGISTER_CENTRAL_LOW,
            0x00,
        ],
    );
    exchange(queue, &[0x00, config_subtype::END_CONFIG]);
}
