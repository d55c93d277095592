//! # Peer Registry
//!
//! Paired remote devices, held in a fixed-capacity arena indexed by radio
//! address. Queues never hold references into the arena; they carry the
//! 24-bit address and resolve it on use, so a deleted peer can never leave
//! a dangling back-reference behind.

use log::{log, Level};

use crate::pending_queue::PendingQueueChain;

/// Maximum number of paired devices tracked at once.
pub const MAX_PEERS: usize = 32;

/// BidCoS serial numbers are exactly ten ASCII characters.
pub const SERIAL_LENGTH: usize = 10;

/// A paired remote radio device.
pub struct Peer {
    pub address: u32,
    pub serial: [u8; SERIAL_LENGTH],
    pub device_type: u16,
    pub firmware_version: u8,
    pub channel_count: u8,
    /// Counter of the last packet this peer originated; rolling counters
    /// are monotonic per sender, so equality flags a resent duplicate.
    pub last_inbound_counter: Option<u8>,
    /// Index of the AES key the device currently expects, -1 when none.
    pub aes_key_index: i32,
    /// Configuration writes are parked for this peer and will be promoted
    /// on its next transmission.
    pub config_pending: bool,
    /// Operations queued while the peer has no live queue (or sleeps).
    pub pending_chain: PendingQueueChain,
}

impl Peer {
    pub fn new(address: u32, serial: [u8; SERIAL_LENGTH], device_type: u16, firmware_version: u8, channel_count: u8) -> Self {
        Peer {
            address: address & 0x00FF_FFFF,
            serial,
            device_type,
            firmware_version,
            channel_count,
            last_inbound_counter: None,
            aes_key_index: -1,
            config_pending: false,
            pending_chain: PendingQueueChain::new(),
        }
    }

    /// Records an inbound counter; returns true when the packet is a resend
    /// of the last one seen.
    pub fn note_inbound_counter(&mut self, counter: u8) -> bool {
        let duplicate = self.last_inbound_counter == Some(counter);
        self.last_inbound_counter = Some(counter);
        duplicate
    }
}

/// Fixed arena of peers, addressable by radio address and serial number.
pub struct PeerRegistry {
    peers: [Option<Peer>; MAX_PEERS],
}

impl PeerRegistry {
    pub const fn new() -> Self {
        PeerRegistry {
            peers: [const { None }; MAX_PEERS],
        }
    }

    pub fn len(&self) -> usize {
        self.peers.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.iter().all(|slot| slot.is_none())
    }

    pub fn contains(&self, address: u32) -> bool {
        self.by_address(address).is_some()
    }

    pub fn by_address(&self, address: u32) -> Option<&Peer> {
        self.peers.iter().flatten().find(|peer| peer.address == address)
    }

    pub fn by_address_mut(&mut self, address: u32) -> Option<&mut Peer> {
        self.peers.iter_mut().flatten().find(|peer| peer.address == address)
    }

    pub fn by_serial(&self, serial: &[u8; SERIAL_LENGTH]) -> Option<&Peer> {
        self.peers.iter().flatten().find(|peer| &peer.serial == serial)
    }

    /// Registers a peer. An existing entry with the same address is
    /// replaced; a full arena logs and drops the peer.
    pub fn add(&mut self, peer: Peer) -> bool {
        if let Some(existing) = self.by_address_mut(peer.address) {
            *existing = peer;
            return true;
        }
        for slot in self.peers.iter_mut() {
            if slot.is_none() {
                *slot = Some(peer);
                return true;
            }
        }
        log!(Level::Error, "Peer registry full, cannot register 0x{:06X}", peer.address);
        false
    }

    pub fn remove(&mut self, address: u32) -> Option<Peer> {
        for slot in self.peers.iter_mut() {
            if slot.as_ref().is_some_and(|peer| peer.address == address) {
                return slot.take();
            }
        }
        None
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut().flatten()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn peer(address: u32, serial: &[u8; SERIAL_LENGTH]) -> Peer {
        Peer::new(address, *serial, 0x0039, 0x10, 2)
    }

    #[test]
    fn add_and_lookup_by_address_and_serial() {
        let mut registry = PeerRegistry::new();
        assert!(registry.add(peer(0x24C0FF, b"ABC1234567")));
        assert!(registry.add(peer(0x1122AA, b"DEF7654321")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_address(0x24C0FF).unwrap().device_type, 0x0039);
        assert_eq!(registry.by_serial(b"DEF7654321").unwrap().address, 0x1122AA);
        assert!(registry.by_address(0x999999).is_none());
    }

    #[test]
    fn same_address_replaces_existing_entry() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x24C0FF, b"ABC1234567"));
        let mut replacement = peer(0x24C0FF, b"ABC1234567");
        replacement.firmware_version = 0x20;
        registry.add(replacement);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_address(0x24C0FF).unwrap().firmware_version, 0x20);
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x24C0FF, b"ABC1234567"));
        let removed = registry.remove(0x24C0FF).unwrap();
        assert_eq!(removed.address, 0x24C0FF);
        assert!(registry.is_empty());
        assert!(registry.remove(0x24C0FF).is_none());
    }

    #[test]
    fn duplicate_counter_is_flagged() {
        let mut device = peer(0x24C0FF, b"ABC1234567");
        assert!(!device.note_inbound_counter(7));
        assert!(device.note_inbound_counter(7));
        assert!(!device.note_inbound_counter(8));
    }
}
