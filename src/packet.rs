//! # BidCoS Packet Module
//!
//! Wire-format value type for BidCoS radio frames.
//!
//! ## Frame Structure
//!
//! Every frame starts with a length byte counting the bytes that follow it:
//! - Byte 0: Length (9 + payload length)
//! - Byte 1: Message counter (rolling, scoped per sender address)
//! - Byte 2: Control byte (bit flags, see [`control`])
//! - Byte 3: Message type (see [`message_type`])
//! - Bytes 4-6: Sender address (24-bit, big-endian)
//! - Bytes 7-9: Destination address (24-bit, big-endian)
//! - Bytes 10..: Payload (0 to 17 bytes)
//!
//! Receive paths may append one raw RSSI byte after the payload; pass
//! `rssi_appended = true` to [`BidcosPacket::from_bytes`] to strip and
//! convert it.
//!
//! ## Sub-byte Fields
//!
//! BidCoS configuration packs several logical fields into single payload
//! bytes. [`BidcosPacket::get_position`] and [`BidcosPacket::set_position`]
//! address those fields with fractional byte offsets: the integer part is
//! the payload byte index, the tenths digit is the bit offset from the LSB
//! (`1.2` = payload byte 1, bit 2). Sizes work the same way (`0.3` = three
//! bits). Multi-byte fields are big-endian with the addressed byte holding
//! the most significant bits.

use embassy_time::Instant;

/// Maximum payload length carried by a single BidCoS frame.
pub const MAX_PAYLOAD_SIZE: usize = 17;

/// Fixed header length after the length byte: counter, control, type,
/// sender (3), destination (3).
pub const FIXED_HEADER_SIZE: usize = 9;

/// Maximum encoded frame length including the length byte.
pub const MAX_FRAME_SIZE: usize = 1 + FIXED_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// BidCoS message type opcodes handled by the engine.
pub mod message_type {
    pub const PAIRING_REQUEST: u8 = 0x00;
    pub const CONFIG: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const AES_EXCHANGE: u8 = 0x04;
    pub const PARAM_RESPONSE: u8 = 0x10;
    pub const TIME_REQUEST: u8 = 0x3F;
}

/// Sub-commands of the 0x01 CONFIG message, carried in payload byte 1.
pub mod config_subtype {
    pub const PEER_LIST_REQUEST: u8 = 0x03;
    pub const PARAM_REQUEST: u8 = 0x04;
    pub const CONFIG_START: u8 = 0x05;
    pub const END_CONFIG: u8 = 0x06;
    pub const CONFIG_WRITE_INDEX: u8 = 0x08;
}

/// Control byte bit flags.
pub mod control {
    /// Device just woke up and listens for a short window.
    pub const WAKE_UP: u8 = 0x01;
    /// Frame addressed to every listener.
    pub const BROADCAST: u8 = 0x04;
    /// Burst / wake-on-radio preamble requested.
    pub const BURST: u8 = 0x10;
    /// Sender expects a response (bidirectional exchange).
    pub const BIDIRECTIONAL: u8 = 0x20;
}

/// First ACK payload byte meaning "accepted".
pub const ACK_OK: u8 = 0x00;
/// First ACK payload byte meaning "rejected".
pub const NACK: u8 = 0x80;
/// NACK variant sent when the addressed target is not configured.
pub const NACK_TARGET_INVALID: u8 = 0x84;

/// Errors produced when decoding a frame from raw bytes.
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the minimal header-only frame.
    TooShort,
    /// The length byte declares less than the fixed header.
    MalformedLength,
    /// The length byte declares more bytes than were received.
    Truncated,
    /// The declared payload exceeds [`MAX_PAYLOAD_SIZE`].
    PayloadTooLong,
}

/// Encoded wire form of a packet, fixed buffer plus valid length.
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone)]
pub struct Frame {
    pub data: [u8; MAX_FRAME_SIZE],
    pub length: usize,
}

/// Decoded BidCoS packet.
///
/// The message counter is rolling and scoped per sender address; responses
/// echo the counter of the request they answer, which is how the dispatcher
/// tells a resent response from a stale one.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct BidcosPacket {
    pub message_counter: u8,
    pub control_byte: u8,
    pub message_type: u8,
    /// 24-bit sender radio address.
    pub sender_address: u32,
    /// 24-bit destination radio address, 0 for broadcast.
    pub destination_address: u32,
    payload: [u8; MAX_PAYLOAD_SIZE],
    payload_length: usize,
    /// Signal strength in dBm, receive-only.
    pub rssi: Option<i16>,
    pub time_received: Option<Instant>,
    pub time_sending: Option<Instant>,
}

impl PartialEq for BidcosPacket {
    fn eq(&self, other: &Self) -> bool {
        self.message_counter == other.message_counter
            && self.control_byte == other.control_byte
            && self.message_type == other.message_type
            && self.sender_address == other.sender_address
            && self.destination_address == other.destination_address
            && self.payload() == other.payload()
    }
}

impl BidcosPacket {
    /// Creates a packet from already-decoded fields.
    ///
    /// The payload is truncated to [`MAX_PAYLOAD_SIZE`] bytes; callers build
    /// payloads from fixed templates so the limit is never hit in practice.
    pub fn new(message_counter: u8, control_byte: u8, message_type: u8, sender_address: u32, destination_address: u32, payload: &[u8]) -> Self {
        let mut buffer = [0u8; MAX_PAYLOAD_SIZE];
        let length = payload.len().min(MAX_PAYLOAD_SIZE);
        buffer[..length].copy_from_slice(&payload[..length]);
        BidcosPacket {
            message_counter,
            control_byte,
            message_type,
            sender_address: sender_address & 0x00FF_FFFF,
            destination_address: destination_address & 0x00FF_FFFF,
            payload: buffer,
            payload_length: length,
            rssi: None,
            time_received: None,
            time_sending: None,
        }
    }

    /// Decodes a packet from raw frame bytes.
    ///
    /// # Arguments
    /// * `bytes` - Raw frame starting with the length byte
    /// * `rssi_appended` - Whether the transport appended one raw RSSI byte
    ///
    /// # Errors
    /// Returns a [`PacketError`] when the length byte disagrees with the
    /// received byte count or declares an oversized payload.
    pub fn from_bytes(bytes: &[u8], rssi_appended: bool) -> Result<Self, PacketError> {
        let trailer = if rssi_appended { 1 } else { 0 };
        if bytes.len() < 1 + FIXED_HEADER_SIZE + trailer {
            return Err(PacketError::TooShort);
        }
        let declared = bytes[0] as usize;
        if declared < FIXED_HEADER_SIZE {
            return Err(PacketError::MalformedLength);
        }
        if declared + 1 + trailer > bytes.len() {
            return Err(PacketError::Truncated);
        }
        let payload_length = declared - FIXED_HEADER_SIZE;
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLong);
        }

        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload[..payload_length].copy_from_slice(&bytes[10..10 + payload_length]);

        let rssi = if rssi_appended {
            Some(raw_rssi_to_dbm(bytes[1 + declared]))
        } else {
            None
        };

        Ok(BidcosPacket {
            message_counter: bytes[1],
            control_byte: bytes[2],
            message_type: bytes[3],
            sender_address: u32::from(bytes[4]) << 16 | u32::from(bytes[5]) << 8 | u32::from(bytes[6]),
            destination_address: u32::from(bytes[7]) << 16 | u32::from(bytes[8]) << 8 | u32::from(bytes[9]),
            payload,
            payload_length,
            rssi,
            time_received: None,
            time_sending: None,
        })
    }

    /// Encodes the packet into its wire form.
    pub fn to_frame(&self) -> Frame {
        let mut data = [0u8; MAX_FRAME_SIZE];
        data[0] = (FIXED_HEADER_SIZE + self.payload_length) as u8;
        data[1] = self.message_counter;
        data[2] = self.control_byte;
        data[3] = self.message_type;
        data[4] = (self.sender_address >> 16) as u8;
        data[5] = (self.sender_address >> 8) as u8;
        data[6] = self.sender_address as u8;
        data[7] = (self.destination_address >> 16) as u8;
        data[8] = (self.destination_address >> 8) as u8;
        data[9] = self.destination_address as u8;
        data[10..10 + self.payload_length].copy_from_slice(&self.payload[..self.payload_length]);
        Frame {
            data,
            length: 1 + FIXED_HEADER_SIZE + self.payload_length,
        }
    }

    /// The value of the length byte for this packet.
    pub fn length(&self) -> u8 {
        (FIXED_HEADER_SIZE + self.payload_length) as u8
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_length]
    }

    /// Sender expects a response to this frame.
    pub fn wants_response(&self) -> bool {
        self.control_byte & control::BIDIRECTIONAL != 0
    }

    /// Addressed to everyone, either via the broadcast flag or address 0.
    pub fn is_broadcast(&self) -> bool {
        self.destination_address == 0 || self.control_byte & control::BROADCAST != 0
    }

    pub fn is_wake_up(&self) -> bool {
        self.control_byte & control::WAKE_UP != 0
    }

    /// Reads a (possibly sub-byte) payload field at a fractional position.
    ///
    /// `index` and `size` are in byte units; the tenths digit addresses bits
    /// (see module docs). The result is big-endian, LSB-aligned in the last
    /// returned byte.
    ///
    /// Out-of-range reads, and positions whose tenths digit is not a valid
    /// bit offset, return an empty field rather than panicking, because
    /// positions come from device descriptions the engine does not control.
    pub fn get_position(&self, index: f64, size: f64) -> ([u8; 8], usize) {
        let Some((byte_index, bit_offset)) = split_fractional(index) else {
            return ([0u8; 8], 0);
        };
        let Some(bits) = total_bits(size) else {
            return ([0u8; 8], 0);
        };
        let mut out = ([0u8; 8], (bits + 7) / 8);
        if bits == 0 || bits > 56 {
            return ([0u8; 8], 0);
        }
        let span = (bits + bit_offset + 7) / 8;
        if byte_index + span > self.payload_length {
            return ([0u8; 8], 0);
        }

        let mut combined: u64 = 0;
        for i in 0..span {
            combined = combined << 8 | u64::from(self.payload[byte_index + i]);
        }
        // Sub-byte masks follow the tenths-digit rule: a size of 0.n keeps
        // the n low bits, i.e. 0xFF >> (8 - n) for a single byte.
        let value = (combined >> bit_offset) & field_mask(bits);

        let out_len = out.1;
        for i in 0..out_len {
            out.0[i] = (value >> ((out_len - 1 - i) * 8)) as u8;
        }
        out
    }

    /// Writes a (possibly sub-byte) payload field at a fractional position.
    ///
    /// The counterpart of [`get_position`](Self::get_position); bits outside
    /// the addressed field are preserved. Writes beyond the current payload
    /// length grow the payload up to [`MAX_PAYLOAD_SIZE`].
    pub fn set_position(&mut self, index: f64, size: f64, value: &[u8]) {
        let Some((byte_index, bit_offset)) = split_fractional(index) else {
            return;
        };
        let Some(bits) = total_bits(size) else {
            return;
        };
        if bits == 0 || bits > 56 {
            return;
        }
        let span = (bits + bit_offset + 7) / 8;
        if byte_index + span > MAX_PAYLOAD_SIZE {
            return;
        }
        if byte_index + span > self.payload_length {
            self.payload_length = byte_index + span;
        }

        let mut new_value: u64 = 0;
        for byte in value {
            new_value = new_value << 8 | u64::from(*byte);
        }
        new_value &= field_mask(bits);

        let mut combined: u64 = 0;
        for i in 0..span {
            combined = combined << 8 | u64::from(self.payload[byte_index + i]);
        }
        combined &= !(field_mask(bits) << bit_offset);
        combined |= new_value << bit_offset;
        for i in 0..span {
            self.payload[byte_index + i] = (combined >> ((span - 1 - i) * 8)) as u8;
        }
    }
}

/// Converts a raw transceiver RSSI byte to dBm (CC1101 convention).
fn raw_rssi_to_dbm(raw: u8) -> i16 {
    if raw >= 128 {
        (i16::from(raw) - 256) / 2 - 74
    } else {
        i16::from(raw) / 2 - 74
    }
}

/// Splits a fractional byte position into (byte index, bit offset).
/// Tenths digits above 7 address no real bit and are rejected.
fn split_fractional(index: f64) -> Option<(usize, usize)> {
    let byte_index = index as usize;
    let bit_offset = ((index - byte_index as f64) * 10.0 + 0.5) as usize;
    if bit_offset > 7 {
        return None;
    }
    Some((byte_index, bit_offset))
}

/// Total bit count of a fractional size (1.2 = 8 + 2 bits).
fn total_bits(size: f64) -> Option<usize> {
    let whole = size as usize;
    let tenth = ((size - whole as f64) * 10.0 + 0.5) as usize;
    if tenth > 7 {
        return None;
    }
    Some(whole * 8 + tenth)
}

fn field_mask(bits: usize) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}
