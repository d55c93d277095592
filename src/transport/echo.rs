//! # Echo Transport - Loopback for Smoke Testing
//!
//! The simplest possible transport: every transmitted frame is decoded
//! straight back into the RX channel with a fixed strong RSSI. No remote
//! device exists, so nothing ever acknowledges anything; this is only
//! useful for exercising the frame codec and the TX path end to end.

use embassy_time::Instant;
use log::{log, Level};

use crate::{RxPacketQueueSender, TxPacketQueueReceiver};

/// Echo transport task: loops outbound packets back to the receiver.
#[embassy_executor::task]
pub async fn echo_transport_task(tx_receiver: TxPacketQueueReceiver, rx_sender: RxPacketQueueSender) {
    log!(Level::Info, "Echo transport task started");
    loop {
        let outbound = tx_receiver.receive().await;
        let mut packet = outbound.packet;
        packet.rssi = Some(-40);
        packet.time_received = Some(Instant::now());
        if rx_sender.try_send(packet).is_err() {
            log!(Level::Warn, "RX queue full, dropping echoed packet");
        }
    }
}
