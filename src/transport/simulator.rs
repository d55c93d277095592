//! # Simulated Device Transport
//!
//! A scripted remote device standing in for real hardware: it announces
//! itself with a pairing request, acknowledges the configuration
//! sub-protocol, stores written registers and answers parameter reads
//! from them. Enough behavior to drive the whole pairing and paramset
//! machinery on a host without a radio.

use embassy_time::Instant;
use log::{log, Level};

use crate::packet::{config_subtype, control, message_type, BidcosPacket, ACK_OK};
use crate::peer::SERIAL_LENGTH;
use crate::{RxPacketQueueSender, TxPacketQueueReceiver};

/// Number of register lists the simulated device keeps.
const LIST_COUNT: usize = 4;
/// Registers per list.
const REGISTER_COUNT: usize = 32;

/// State of one simulated remote device.
pub struct SimulatedDevice {
    pub address: u32,
    pub serial: [u8; SERIAL_LENGTH],
    pub device_type: u16,
    pub firmware_version: u8,
    registers: [[u8; REGISTER_COUNT]; LIST_COUNT],
    message_counter: u8,
    config_list: u8,
}

impl SimulatedDevice {
    pub const fn new(address: u32, serial: [u8; SERIAL_LENGTH], device_type: u16, firmware_version: u8) -> Self {
        SimulatedDevice {
            address,
            serial,
            device_type,
            firmware_version,
            registers: [[0; REGISTER_COUNT]; LIST_COUNT],
            message_counter: 0,
            config_list: 0,
        }
    }

    pub fn register(&self, list: u8, index: u8) -> u8 {
        if (list as usize) < LIST_COUNT && (index as usize) < REGISTER_COUNT {
            self.registers[list as usize][index as usize]
        } else {
            0
        }
    }

    fn next_counter(&mut self) -> u8 {
        self.message_counter = self.message_counter.wrapping_add(1);
        self.message_counter
    }

    /// The broadcast pairing request the device sends when its config
    /// button is pressed.
    pub fn pairing_request(&mut self) -> BidcosPacket {
        let mut payload = [0u8; 3 + SERIAL_LENGTH];
        payload[0] = self.firmware_version;
        payload[1] = (self.device_type >> 8) as u8;
        payload[2] = self.device_type as u8;
        payload[3..].copy_from_slice(&self.serial);
        let counter = self.next_counter();
        BidcosPacket::new(counter, control::BIDIRECTIONAL, message_type::PAIRING_REQUEST, self.address, 0, &payload)
    }

    /// Scripted reaction to one frame from the central. `None` means the
    /// device stays silent.
    pub fn respond(&mut self, packet: &BidcosPacket) -> Option<BidcosPacket> {
        if packet.destination_address != self.address && !packet.is_broadcast() {
            return None;
        }
        match packet.message_type {
            message_type::CONFIG => self.respond_config(packet),
            message_type::AES_EXCHANGE => Some(self.ack(packet)),
            _ => None,
        }
    }

    fn respond_config(&mut self, packet: &BidcosPacket) -> Option<BidcosPacket> {
        let payload = packet.payload();
        if payload.len() < 2 {
            return None;
        }
        match payload[1] {
            config_subtype::CONFIG_START => {
                self.config_list = payload.get(6).copied().unwrap_or(0);
                Some(self.ack(packet))
            }
            config_subtype::CONFIG_WRITE_INDEX => {
                let list = self.config_list as usize;
                for pair in payload[2..].chunks_exact(2) {
                    if list < LIST_COUNT && (pair[0] as usize) < REGISTER_COUNT {
                        self.registers[list][pair[0] as usize] = pair[1];
                    }
                }
                Some(self.ack(packet))
            }
            config_subtype::END_CONFIG => Some(self.ack(packet)),
            config_subtype::PARAM_REQUEST => {
                let list = payload.get(6).copied().unwrap_or(0);
                Some(self.param_response(packet, list))
            }
            config_subtype::PEER_LIST_REQUEST => Some(self.param_response(packet, 0xFF)),
            _ => Some(self.ack(packet)),
        }
    }

    fn ack(&self, packet: &BidcosPacket) -> BidcosPacket {
        BidcosPacket::new(packet.message_counter, 0, message_type::ACK, self.address, packet.sender_address, &[ACK_OK])
    }

    /// Streams the non-zero registers of `list` as (index, value) pairs
    /// with the all-zero terminator. A single fragment is always enough
    /// for the simulated register file.
    fn param_response(&self, packet: &BidcosPacket, list: u8) -> BidcosPacket {
        let mut payload = [0u8; 17];
        payload[0] = 0x02;
        let mut filled = 1;
        if (list as usize) < LIST_COUNT {
            for (index, &value) in self.registers[list as usize].iter().enumerate() {
                if value != 0 && filled + 4 <= payload.len() {
                    payload[filled] = index as u8;
                    payload[filled + 1] = value;
                    filled += 2;
                }
            }
        }
        // Terminator pair is already zero, reserve its two bytes.
        filled += 2;
        BidcosPacket::new(
            packet.message_counter,
            0,
            message_type::PARAM_RESPONSE,
            self.address,
            packet.sender_address,
            &payload[..filled],
        )
    }
}

/// Simulated device task: announces the device, then answers everything
/// the central transmits.
#[embassy_executor::task]
pub async fn simulated_device_task(mut device: SimulatedDevice, tx_receiver: TxPacketQueueReceiver, rx_sender: RxPacketQueueSender) {
    log!(Level::Info, "Simulated device 0x{:06X} task started", device.address);
    deliver(&rx_sender, device.pairing_request());
    loop {
        let outbound = tx_receiver.receive().await;
        if let Some(reply) = device.respond(&outbound.packet) {
            deliver(&rx_sender, reply);
        }
    }
}

fn deliver(rx_sender: &RxPacketQueueSender, mut packet: BidcosPacket) {
    packet.rssi = Some(-52);
    packet.time_received = Some(Instant::now());
    if rx_sender.try_send(packet).is_err() {
        log!(Level::Warn, "RX queue full, dropping simulated packet");
    }
}
