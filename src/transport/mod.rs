//! # Test Transports
//!
//! Channel-wired device tasks for host testing. The engine itself never
//! talks to hardware: it hands [`OutboundPacket`](crate::OutboundPacket)s
//! to the TX channel and consumes decoded packets from the RX channel, so
//! any task bridging the two behaves like a radio. The [`echo`] transport
//! loops frames straight back, the [`simulator`] transport plays the role
//! of a remote device that pairs, acknowledges configuration writes and
//! answers parameter reads.

pub mod echo;
pub mod simulator;
