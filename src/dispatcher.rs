//! # Dispatch Task
//!
//! The engine's single long-lived task. It owns every piece of mutable
//! protocol state (queue registry, peer registry, message table, pairing
//! candidate, read session) and multiplexes three inputs with `select`:
//! inbound packets from the transport, commands from the engine front
//! object, and a timer for pop-wait expiry plus idle-queue collection.
//!
//! ## Inbound packet flow
//!
//! duplicate check -> rule lookup -> access check -> queue satisfaction ->
//! handler. The access check may mutate the sender's queue (stale-head
//! pop, value-request retransmit) before the satisfaction step consumes
//! the packet; a NACK aborts a pairing queue but merely advances any
//! other. Handlers never block: every transmission is a `try_send` onto
//! the TX channel and every event a `try_send` onto the event channel.

use embassy_futures::select::{select3, Either3};
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::config::{
    build_aes_key_chain, build_param_request_chain, build_put_paramset_chain, ConfigReadSession, ReadProgress,
};
use crate::message_table::{AccessContext, HandlerId, MessageTable};
use crate::packet::{message_type, BidcosPacket, ACK_OK, NACK};
use crate::pairing::{
    build_pairing_queue, build_unpairing_queue, check_identity, parse_pairing_request, provisional_peer,
};
use crate::peer::{Peer, PeerRegistry};
use crate::pending_queue::PendingQueueChain;
use crate::queue::{DrainAction, MessageMatcher, PopResult, QueueType};
use crate::queue_manager::QueueManager;
use crate::{
    DeviceDescriptionResolver, EngineCommand, EventQueueSender, LinkConfiguration, LinkEvent, MessageCounters, OpKind,
    OpResult, OpResultQueueSender, OutboundPacket, ParameterStore, RxPacketQueueReceiver, CommandQueueReceiver,
    TxPacketQueueSender,
};

/// Fallback service interval when no pop-wait deadline is armed.
const SERVICE_TICK: Duration = Duration::from_millis(500);

/// Protocol state machine driven by the dispatch task.
pub struct Dispatcher {
    central_address: u32,
    response_timeout: Duration,
    time_source: fn() -> u32,
    pairing_mode: bool,
    counters: MessageCounters,
    rules: MessageTable,
    queues: QueueManager,
    peers: PeerRegistry,
    /// Pairing candidate, committed on the first handshake ACK.
    provisional: Option<Peer>,
    read_session: Option<ConfigReadSession>,
    /// (address, channel, index) a getValue call is waiting on.
    value_request: Option<(u32, u8, u8)>,
    resolver: &'static dyn DeviceDescriptionResolver,
    store: &'static dyn ParameterStore,
    tx: TxPacketQueueSender,
    events: EventQueueSender,
    op_results: OpResultQueueSender,
}

impl Dispatcher {
    pub fn new(
        configuration: &LinkConfiguration,
        resolver: &'static dyn DeviceDescriptionResolver,
        store: &'static dyn ParameterStore,
        tx: TxPacketQueueSender,
        events: EventQueueSender,
        op_results: OpResultQueueSender,
        rng_seed: u64,
    ) -> Self {
        Dispatcher {
            central_address: configuration.central_address,
            response_timeout: configuration.response_timeout,
            time_source: configuration.time_source,
            pairing_mode: false,
            counters: MessageCounters::new(rng_seed),
            rules: MessageTable::standard(),
            queues: QueueManager::new(),
            peers: PeerRegistry::new(),
            provisional: None,
            read_session: None,
            value_request: None,
            resolver,
            store,
            tx,
            events,
            op_results,
        }
    }

    pub fn is_pairing_mode(&self) -> bool {
        self.pairing_mode
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, address: u32) -> bool {
        self.peers.contains(address)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues.next_deadline()
    }

    /// Processes one inbound packet through rule lookup, access check,
    /// queue satisfaction and handler dispatch.
    pub fn handle_packet(&mut self, packet: BidcosPacket) {
        if packet.sender_address == self.central_address {
            return;
        }
        // Responses echo our counters and live in a different counter
        // space; the duplicate check only applies to device-originated
        // traffic.
        let response = matches!(packet.message_type, message_type::ACK | message_type::PARAM_RESPONSE);
        if !response {
            if let Some(peer) = self.peers.by_address_mut(packet.sender_address) {
                if peer.note_inbound_counter(packet.message_counter) {
                    log!(Level::Debug, "Dropping resent packet {} from 0x{:06X}", packet.message_counter, packet.sender_address);
                    return;
                }
            }
        }

        let Some(rule) = self.rules.find(&packet) else {
            log!(Level::Info, "No rule for message type 0x{:02X} from 0x{:06X}", packet.message_type, packet.sender_address);
            return;
        };
        let handler = rule.handler;
        let ctx = AccessContext {
            central_address: self.central_address,
            pairing_mode: self.pairing_mode,
            sender_is_paired: self.peers.contains(packet.sender_address),
            provisional_address: self.provisional.as_ref().map(|peer| peer.address),
        };
        if !self.rules.check_access(rule, &packet, self.queues.get_mut(packet.sender_address), &ctx, &self.tx) {
            log!(Level::Debug, "Access denied for message type 0x{:02X} from 0x{:06X}", packet.message_type, packet.sender_address);
            return;
        }

        self.satisfy_queue(&packet);

        match handler {
            HandlerId::PairingRequest => self.handle_pairing_request(&packet),
            HandlerId::Ack => {}
            HandlerId::ConfigParamResponse => self.handle_param_response(&packet),
            HandlerId::TimeRequest => self.handle_time_request(&packet),
            HandlerId::Default => self.handle_default(&packet),
        }

        if self.queues.get(packet.sender_address).is_none() {
            self.promote_parked(packet.sender_address);
        }
    }

    /// Feeds the packet to the sender's queue. A NACK clears a pairing
    /// queue outright; anywhere else it advances past the rejected entry.
    fn satisfy_queue(&mut self, packet: &BidcosPacket) {
        let address = packet.sender_address;
        let Some(queue) = self.queues.get_mut(address) else {
            return;
        };
        let queue_type = queue.queue_type;

        let nack = packet.message_type == message_type::ACK && packet.payload().first().is_some_and(|byte| byte & NACK != 0);
        if nack {
            if queue_type == QueueType::Pairing {
                log!(Level::Error, "Pairing with 0x{:06X} rejected by the device", address);
                queue.clear();
                self.queues.remove(address);
                self.provisional = None;
                self.send_event(LinkEvent::PairingFailed { address });
            } else {
                log!(Level::Warn, "NACK from 0x{:06X}, advancing queue", address);
                if let PopResult::Drained(action) = queue.pop(&self.tx) {
                    self.queue_drained(address, action);
                }
            }
            return;
        }

        match queue.try_satisfy(packet, &self.tx) {
            Some(result) => {
                if queue_type == QueueType::Pairing {
                    self.commit_provisional();
                }
                if let PopResult::Drained(action) = result {
                    self.queue_drained(address, action);
                }
            }
            None => {}
        }
    }

    /// First handshake ACK: the candidate becomes a real peer and pairing
    /// mode turns itself off.
    fn commit_provisional(&mut self) {
        let Some(peer) = self.provisional.take() else {
            return;
        };
        let address = peer.address;
        let device_type = peer.device_type;
        self.peers.add(peer);
        self.pairing_mode = false;
        log!(Level::Info, "Paired device 0x{:06X} (type 0x{:04X})", address, device_type);
        self.send_event(LinkEvent::DeviceAdded { address, device_type });
    }

    fn handle_pairing_request(&mut self, packet: &BidcosPacket) {
        let Some(request) = parse_pairing_request(packet) else {
            return;
        };
        if self.peers.contains(request.address) && check_identity(&request, &self.peers).is_ok() {
            // Already paired; the broadcast is a wake-up opportunity.
            return;
        }
        if !self.pairing_mode {
            log!(Level::Debug, "Ignoring pairing request from 0x{:06X}, pairing mode is off", request.address);
            return;
        }
        if check_identity(&request, &self.peers).is_err() {
            self.send_event(LinkEvent::PairingFailed { address: request.address });
            return;
        }
        let Some(model) = self.resolver.resolve(request.device_type, request.firmware_version) else {
            log!(Level::Error, "Unknown device type 0x{:04X} from 0x{:06X}", request.device_type, request.address);
            self.send_event(LinkEvent::PairingFailed { address: request.address });
            return;
        };

        self.provisional = Some(provisional_peer(&request, &model));
        let central_address = self.central_address;
        let counters = &mut self.counters;
        let queue = self.queues.create(QueueType::Pairing, request.address);
        queue.clear();
        build_pairing_queue(queue, &request, &model, central_address, counters, &self.tx);
        if let Some(PopResult::Drained(action)) = queue.set_live(&self.tx) {
            self.queue_drained(request.address, action);
        }
    }

    fn handle_param_response(&mut self, packet: &BidcosPacket) {
        if let Some((address, channel, index)) = self.value_request {
            if address == packet.sender_address {
                let payload = packet.payload();
                let value = payload
                    .get(1..)
                    .unwrap_or(&[])
                    .chunks_exact(2)
                    .find(|pair| pair[0] == index)
                    .map(|pair| pair[1]);
                if let Some(value) = value {
                    self.value_request = None;
                    self.send_event(LinkEvent::ValueChanged { address, channel, index, value });
                    self.send_op_result(OpResult {
                        kind: OpKind::GetValue,
                        address,
                        ok: true,
                        value: Some(value),
                    });
                }
            }
        }

        let session_matches = self
            .read_session
            .as_ref()
            .is_some_and(|session| session.address == packet.sender_address);
        if !session_matches {
            return;
        }
        let progress = match self.read_session.as_mut() {
            Some(session) => session.handle_response(packet, self.store),
            None => return,
        };
        match progress {
            ReadProgress::Continue => {
                // The satisfied expectation is gone; arm a fresh one for
                // the next fragment, bounded by the pop-wait timer.
                let timeout = self.response_timeout;
                let queue = self.queues.create(QueueType::GetValue, packet.sender_address);
                queue.push_expected(MessageMatcher::new(message_type::PARAM_RESPONSE));
                queue.pop_wait(timeout);
            }
            ReadProgress::Complete => {
                if let Some(session) = self.read_session.take() {
                    self.send_event(LinkEvent::ConfigReadComplete {
                        address: session.address,
                        channel: session.channel,
                        list: session.list,
                    });
                    self.send_op_result(OpResult {
                        kind: OpKind::RequestParamset,
                        address: session.address,
                        ok: true,
                        value: None,
                    });
                }
            }
        }
    }

    fn handle_time_request(&mut self, packet: &BidcosPacket) {
        let now = (self.time_source)();
        let payload = [0x02, 0x00, (now >> 24) as u8, (now >> 16) as u8, (now >> 8) as u8, now as u8];
        let reply = BidcosPacket::new(
            packet.message_counter,
            0,
            message_type::TIME_REQUEST,
            self.central_address,
            packet.sender_address,
            &payload,
        );
        self.send_direct(reply);
    }

    /// Device-initiated traffic with no dedicated handler: acknowledge it
    /// when the device asks for a response.
    fn handle_default(&mut self, packet: &BidcosPacket) {
        if packet.wants_response() {
            let ack = BidcosPacket::new(
                packet.message_counter,
                0,
                message_type::ACK,
                self.central_address,
                packet.sender_address,
                &[ACK_OK],
            );
            self.send_direct(ack);
        }
        if packet.is_wake_up() {
            log!(Level::Debug, "Device 0x{:06X} woke up", packet.sender_address);
        }
    }

    pub fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetPairingMode(enabled) => {
                self.pairing_mode = enabled;
                if !enabled {
                    self.provisional = None;
                }
            }
            EngineCommand::PutParamset { address, set } => {
                if !self.peers.contains(address) {
                    self.refuse(OpKind::PutParamset, address);
                    return;
                }
                if set.is_empty() {
                    self.send_op_result(OpResult { kind: OpKind::PutParamset, address, ok: true, value: None });
                    return;
                }
                let Some(chain) = build_put_paramset_chain(&set, address, self.central_address, &mut self.counters) else {
                    self.refuse(OpKind::PutParamset, address);
                    return;
                };
                self.start_or_park(address, chain, Some(OpKind::PutParamset));
            }
            EngineCommand::RequestParamset { address, channel, list } => {
                if !self.peers.contains(address) {
                    self.refuse(OpKind::RequestParamset, address);
                    return;
                }
                self.read_session = Some(ConfigReadSession::new(address, channel, list));
                let chain = build_param_request_chain(channel, list, address, self.central_address, &mut self.counters);
                // Result is raised when the read terminates, not on drain.
                self.start_or_park(address, chain, None);
            }
            EngineCommand::GetValue { address, channel, list, index } => {
                if !self.peers.contains(address) {
                    self.refuse(OpKind::GetValue, address);
                    return;
                }
                self.value_request = Some((address, channel, index));
                let chain = build_param_request_chain(channel, list, address, self.central_address, &mut self.counters);
                self.start_or_park(address, chain, None);
            }
            EngineCommand::Unpair { address } => {
                if !self.peers.contains(address) {
                    self.refuse(OpKind::Unpair, address);
                    return;
                }
                let central_address = self.central_address;
                let counters = &mut self.counters;
                let queue = self.queues.create(QueueType::Unpairing, address);
                queue.clear();
                build_unpairing_queue(queue, address, central_address, counters, &self.tx);
                if let Some(PopResult::Drained(action)) = queue.set_live(&self.tx) {
                    self.queue_drained(address, action);
                }
            }
            EngineCommand::RotateAesKey { address, channel } => {
                if !self.peers.contains(address) {
                    self.refuse(OpKind::RotateAesKey, address);
                    return;
                }
                let chain = build_aes_key_chain(channel, address, self.central_address, &mut self.counters);
                self.start_or_park(address, chain, Some(OpKind::RotateAesKey));
            }
        }
    }

    /// Attaches a chain to the peer's live queue, or parks it on the peer
    /// while a pairing or unpairing handshake is still running. A second
    /// completion-reporting operation on a queue that already carries one
    /// is refused, so every drain notification reaches its own caller.
    fn start_or_park(&mut self, address: u32, chain: PendingQueueChain, notify: Option<OpKind>) {
        if let Some(queue) = self.queues.get_mut(address) {
            if matches!(queue.queue_type, QueueType::Pairing | QueueType::Unpairing) {
                if let Some(peer) = self.peers.by_address_mut(address) {
                    peer.pending_chain.extend(chain);
                    peer.config_pending = true;
                } else {
                    log!(Level::Warn, "Dropping queued operation for busy unknown address 0x{:06X}", address);
                }
                return;
            }
            if let Some(kind) = notify {
                if matches!(queue.on_drained, Some(DrainAction::NotifyOp(_))) {
                    log!(Level::Warn, "Queue for 0x{:06X} already carries an unfinished operation, refusing", address);
                    self.refuse(kind, address);
                    return;
                }
                queue.on_drained = Some(DrainAction::NotifyOp(kind));
            }
            if let Some(PopResult::Drained(action)) = queue.extend_chain(chain, &self.tx) {
                self.queue_drained(address, action);
            }
            return;
        }
        let queue = self.queues.create(QueueType::Empty, address);
        queue.on_drained = notify.map(DrainAction::NotifyOp);
        if let Some(PopResult::Drained(action)) = queue.attach_chain(chain, &self.tx) {
            self.queue_drained(address, action);
        }
    }

    /// Runs once a queue has exhausted its entries and pending chain.
    fn queue_drained(&mut self, address: u32, action: Option<DrainAction>) {
        self.queues.remove(address);
        match action {
            Some(DrainAction::DeletePeer) => {
                self.peers.remove(address);
                log!(Level::Info, "Unpaired device 0x{:06X}", address);
                self.send_event(LinkEvent::DeviceRemoved { address });
                self.send_op_result(OpResult { kind: OpKind::Unpair, address, ok: true, value: None });
            }
            Some(DrainAction::NotifyOp(kind)) => {
                if kind == OpKind::RotateAesKey {
                    if let Some(peer) = self.peers.by_address_mut(address) {
                        peer.aes_key_index += 1;
                    }
                }
                self.send_op_result(OpResult { kind, address, ok: true, value: None });
            }
            None => {}
        }
        self.promote_parked(address);
    }

    /// Revives operations parked on the peer while its address was busy.
    fn promote_parked(&mut self, address: u32) {
        let (chain, config_pending) = match self.peers.by_address_mut(address) {
            Some(peer) if !peer.pending_chain.is_empty() => {
                let chain = core::mem::take(&mut peer.pending_chain);
                let config_pending = peer.config_pending;
                peer.config_pending = false;
                (chain, config_pending)
            }
            _ => return,
        };
        let queue = self.queues.create(QueueType::Empty, address);
        if config_pending {
            queue.on_drained = Some(DrainAction::NotifyOp(OpKind::PutParamset));
        }
        if let Some(PopResult::Drained(action)) = queue.attach_chain(chain, &self.tx) {
            self.queue_drained(address, action);
        }
    }

    /// Periodic sweep: delegates to the queue registry and executes the
    /// drain actions it reports.
    pub fn service(&mut self, now: Instant) {
        let actions = self.queues.service(now, &self.tx);
        for (address, action) in actions.into_iter().flatten() {
            // The sweep already deregistered the queue.
            match action {
                DrainAction::DeletePeer => self.queue_drained(address, Some(DrainAction::DeletePeer)),
                DrainAction::NotifyOp(kind) => self.queue_drained(address, Some(DrainAction::NotifyOp(kind))),
            }
        }
    }

    fn refuse(&mut self, kind: OpKind, address: u32) {
        log!(Level::Error, "Refusing operation on 0x{:06X}", address);
        self.send_op_result(OpResult { kind, address, ok: false, value: None });
    }

    fn send_direct(&self, mut packet: BidcosPacket) {
        packet.time_sending = Some(Instant::now());
        if self.tx.try_send(OutboundPacket { packet, stealthy: true }).is_err() {
            log!(Level::Warn, "TX packet queue full, dropping direct response");
        }
    }

    fn send_event(&self, event: LinkEvent) {
        if self.events.try_send(event).is_err() {
            log!(Level::Warn, "Event queue full, dropping event");
        }
    }

    fn send_op_result(&self, result: OpResult) {
        if self.op_results.try_send(result).is_err() {
            log!(Level::Warn, "Op-result queue full, dropping result");
        }
    }
}

/// Long-lived dispatch task: packets in, commands in, timer tick.
#[embassy_executor::task]
pub async fn dispatch_task(
    rx_receiver: RxPacketQueueReceiver,
    command_receiver: CommandQueueReceiver,
    tx_sender: TxPacketQueueSender,
    event_sender: EventQueueSender,
    op_result_sender: OpResultQueueSender,
    configuration: LinkConfiguration,
    resolver: &'static dyn DeviceDescriptionResolver,
    store: &'static dyn ParameterStore,
    rng_seed: u64,
) {
    let mut dispatcher = Dispatcher::new(
        &configuration,
        resolver,
        store,
        tx_sender,
        event_sender,
        op_result_sender,
        rng_seed,
    );
    loop {
        let tick = match dispatcher.next_deadline() {
            Some(deadline) => Timer::at(deadline),
            None => Timer::after(SERVICE_TICK),
        };
        match select3(rx_receiver.receive(), command_receiver.receive(), tick).await {
            Either3::First(packet) => dispatcher.handle_packet(packet),
            Either3::Second(command) => dispatcher.handle_command(command),
            Either3::Third(()) => dispatcher.service(Instant::now()),
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::config::ParamChangeSet;
    use crate::packet::{config_subtype, control};
    use crate::{ChannelModel, DeviceModel, EventQueue, OpResultQueue, TxPacketQueue};
    use embassy_sync::channel::Channel;

    const CENTRAL: u32 = 0xFD0001;
    const DEVICE: u32 = 0x24C0FF;

    struct SwitchResolver;

    impl DeviceDescriptionResolver for SwitchResolver {
        fn resolve(&self, device_type: u16, _firmware_version: u8) -> Option<DeviceModel> {
            if device_type != 0x0039 {
                return None;
            }
            let mut model = DeviceModel::new();
            model.set_channel(
                1,
                ChannelModel {
                    master_lists: [Some(0), None, None, None],
                    has_link_role: false,
                    aes_default: false,
                },
            );
            Some(model)
        }
    }

    struct NullStore;

    impl ParameterStore for NullStore {
        fn store_config(&self, _address: u32, _channel: u8, _list: u8, _index: u8, _value: u8) {}
    }

    struct Fixture {
        dispatcher: Dispatcher,
        tx: &'static TxPacketQueue,
        events: &'static EventQueue,
        op_results: &'static OpResultQueue,
    }

    fn fixture() -> Fixture {
        let tx: &'static TxPacketQueue = Box::leak(Box::new(Channel::new()));
        let events: &'static EventQueue = Box::leak(Box::new(Channel::new()));
        let op_results: &'static OpResultQueue = Box::leak(Box::new(Channel::new()));
        let resolver: &'static dyn DeviceDescriptionResolver = Box::leak(Box::new(SwitchResolver));
        let store: &'static dyn ParameterStore = Box::leak(Box::new(NullStore));
        let configuration = LinkConfiguration {
            central_address: CENTRAL,
            response_timeout: Duration::from_secs(5),
            time_source: || 0x1122_3344,
        };
        let dispatcher = Dispatcher::new(
            &configuration,
            resolver,
            store,
            tx.sender(),
            events.sender(),
            op_results.sender(),
            0xC0FFEE,
        );
        Fixture { dispatcher, tx, events, op_results }
    }

    fn pairing_request() -> BidcosPacket {
        let mut payload = [0u8; 13];
        payload[0] = 0x10;
        payload[2] = 0x39;
        payload[3..13].copy_from_slice(b"ABC1234567");
        BidcosPacket::new(0x2A, control::BIDIRECTIONAL, message_type::PAIRING_REQUEST, DEVICE, 0, &payload)
    }

    fn ack(counter: u8, payload: u8) -> BidcosPacket {
        BidcosPacket::new(counter, 0, message_type::ACK, DEVICE, CENTRAL, &[payload])
    }

    fn drain_tx(fixture: &Fixture) -> Vec<OutboundPacket> {
        let mut out = Vec::new();
        while let Ok(item) = fixture.tx.receiver().try_receive() {
            out.push(item);
        }
        out
    }

    fn pair_device(fixture: &mut Fixture) {
        fixture.dispatcher.handle_command(EngineCommand::SetPairingMode(true));
        fixture.dispatcher.handle_packet(pairing_request());
        let sent = drain_tx(fixture);
        let config_start = sent.last().unwrap().packet.clone();
        fixture.dispatcher.handle_packet(ack(config_start.message_counter, ACK_OK));
        // Walk the remaining handshake and the follow-up reads so the
        // pairing queue fully drains.
        loop {
            let sent = drain_tx(fixture);
            let Some(outbound) = sent.last() else { break };
            match outbound.packet.message_type {
                message_type::CONFIG if outbound.packet.payload()[1] == config_subtype::PARAM_REQUEST => {
                    let response = BidcosPacket::new(
                        outbound.packet.message_counter,
                        0,
                        message_type::PARAM_RESPONSE,
                        DEVICE,
                        CENTRAL,
                        &[0x02, 0x00, 0x00],
                    );
                    fixture.dispatcher.handle_packet(response);
                }
                _ => fixture.dispatcher.handle_packet(ack(outbound.packet.message_counter, ACK_OK)),
            }
        }
        while fixture.events.receiver().try_receive().is_ok() {}
    }

    #[test]
    fn pairing_round_trip_commits_the_peer_after_the_first_ack() {
        let mut fixture = fixture();
        fixture.dispatcher.handle_command(EngineCommand::SetPairingMode(true));
        fixture.dispatcher.handle_packet(pairing_request());

        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 2, "immediate ACK plus CONFIG_START");
        assert_eq!(sent[0].packet.message_type, message_type::ACK);
        assert!(sent[0].stealthy);
        assert_eq!(sent[0].packet.message_counter, 0x2A);
        let config_start = &sent[1].packet;
        assert_eq!(config_start.payload()[1], config_subtype::CONFIG_START);
        assert!(!fixture.dispatcher.has_peer(DEVICE), "peer commits only after the first ACK");

        fixture.dispatcher.handle_packet(ack(config_start.message_counter, ACK_OK));
        assert!(fixture.dispatcher.has_peer(DEVICE));
        assert!(!fixture.dispatcher.is_pairing_mode(), "pairing mode turns off after the first round trip");
        assert!(matches!(
            fixture.events.receiver().try_receive(),
            Ok(LinkEvent::DeviceAdded { address: DEVICE, device_type: 0x0039 })
        ));

        // The handshake keeps going with the address write.
        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.payload()[1], config_subtype::CONFIG_WRITE_INDEX);
    }

    #[test]
    fn nack_aborts_pairing_without_committing_a_peer() {
        let mut fixture = fixture();
        fixture.dispatcher.handle_command(EngineCommand::SetPairingMode(true));
        fixture.dispatcher.handle_packet(pairing_request());
        let sent = drain_tx(&fixture);
        let config_start = &sent[1].packet;

        fixture.dispatcher.handle_packet(ack(config_start.message_counter, NACK));

        assert!(!fixture.dispatcher.has_peer(DEVICE));
        assert!(matches!(
            fixture.events.receiver().try_receive(),
            Ok(LinkEvent::PairingFailed { address: DEVICE })
        ));
        assert!(drain_tx(&fixture).is_empty(), "aborted handshake sends nothing further");
    }

    #[test]
    fn unknown_device_type_is_refused() {
        let mut fixture = fixture();
        fixture.dispatcher.handle_command(EngineCommand::SetPairingMode(true));
        let mut payload = [0u8; 13];
        payload[0] = 0x10;
        payload[1] = 0xEE;
        payload[2] = 0xEE;
        payload[3..13].copy_from_slice(b"ZZZ9999999");
        let request = BidcosPacket::new(1, control::BIDIRECTIONAL, message_type::PAIRING_REQUEST, DEVICE, 0, &payload);
        fixture.dispatcher.handle_packet(request);

        assert!(drain_tx(&fixture).is_empty());
        assert!(matches!(
            fixture.events.receiver().try_receive(),
            Ok(LinkEvent::PairingFailed { address: DEVICE })
        ));
    }

    #[test]
    fn duplicate_device_packets_are_dropped() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        let event = BidcosPacket::new(5, control::BIDIRECTIONAL, 0x41, DEVICE, CENTRAL, &[0x01]);
        fixture.dispatcher.handle_packet(event.clone());
        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 1, "device-initiated traffic is acknowledged");
        assert_eq!(sent[0].packet.message_type, message_type::ACK);
        assert_eq!(sent[0].packet.message_counter, 5);

        fixture.dispatcher.handle_packet(event);
        assert!(drain_tx(&fixture).is_empty(), "the resend is dropped before dispatch");
    }

    #[test]
    fn put_paramset_runs_the_config_cycle_and_reports_completion() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        let mut set = ParamChangeSet::new(1);
        for index in 1..=10u8 {
            set.push(0, index, index);
        }
        fixture.dispatcher.handle_command(EngineCommand::PutParamset { address: DEVICE, set });

        let mut write_index_packets = 0;
        loop {
            let sent = drain_tx(&fixture);
            let Some(outbound) = sent.last() else { break };
            if outbound.packet.payload()[1] == config_subtype::CONFIG_WRITE_INDEX {
                write_index_packets += 1;
            }
            fixture.dispatcher.handle_packet(ack(outbound.packet.message_counter, ACK_OK));
        }
        assert_eq!(write_index_packets, 2, "ten pairs chunk into 7 + 3");
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::PutParamset);
        assert!(result.ok);
    }

    #[test]
    fn oversized_paramset_is_refused_before_anything_is_sent() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        let mut set = ParamChangeSet::new(1);
        for list in 0..=crate::pending_queue::PENDING_CHAIN_SIZE as u8 {
            set.push(list, 0x01, 0xFF);
        }
        fixture.dispatcher.handle_command(EngineCommand::PutParamset { address: DEVICE, set });

        assert!(drain_tx(&fixture).is_empty(), "nothing was transmitted");
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::PutParamset);
        assert!(!result.ok);
    }

    #[test]
    fn overlapping_operations_are_refused_until_the_first_completes() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        let mut set = ParamChangeSet::new(1);
        set.push(0, 1, 0x10);
        fixture.dispatcher.handle_command(EngineCommand::PutParamset { address: DEVICE, set });
        let sent = drain_tx(&fixture);
        let start = sent.last().unwrap().packet.clone();

        // A second completion-reporting operation on the busy queue bounces.
        fixture.dispatcher.handle_command(EngineCommand::RotateAesKey { address: DEVICE, channel: 1 });
        let refused = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(refused.kind, OpKind::RotateAesKey);
        assert!(!refused.ok);

        // The first operation still runs to completion and reports itself.
        fixture.dispatcher.handle_packet(ack(start.message_counter, ACK_OK));
        loop {
            let sent = drain_tx(&fixture);
            let Some(outbound) = sent.last() else { break };
            fixture.dispatcher.handle_packet(ack(outbound.packet.message_counter, ACK_OK));
        }
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::PutParamset);
        assert!(result.ok);
    }

    #[test]
    fn operations_on_unknown_peers_are_refused() {
        let mut fixture = fixture();
        fixture.dispatcher.handle_command(EngineCommand::Unpair { address: 0x999999 });
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::Unpair);
        assert!(!result.ok);
    }

    #[test]
    fn unpair_deletes_the_peer_when_the_queue_drains() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        fixture.dispatcher.handle_command(EngineCommand::Unpair { address: DEVICE });
        loop {
            let sent = drain_tx(&fixture);
            let Some(outbound) = sent.last() else { break };
            fixture.dispatcher.handle_packet(ack(outbound.packet.message_counter, ACK_OK));
        }

        assert!(!fixture.dispatcher.has_peer(DEVICE));
        assert!(matches!(
            fixture.events.receiver().try_receive(),
            Ok(LinkEvent::DeviceRemoved { address: DEVICE })
        ));
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::Unpair);
        assert!(result.ok);
    }

    #[test]
    fn get_value_mismatch_retransmits_the_request() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        fixture.dispatcher.handle_command(EngineCommand::GetValue { address: DEVICE, channel: 1, list: 1, index: 0x05 });
        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 1);
        let request = sent[0].packet.clone();

        // Something other than the awaited PARAM_RESPONSE arrives.
        let unrelated = BidcosPacket::new(8, 0, 0x41, DEVICE, CENTRAL, &[0x00]);
        fixture.dispatcher.handle_packet(unrelated);
        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 1, "the value request goes out again");
        assert_eq!(sent[0].packet.message_counter, request.message_counter);

        // Now the real answer lands and the value surfaces.
        let response = BidcosPacket::new(
            request.message_counter,
            0,
            message_type::PARAM_RESPONSE,
            DEVICE,
            CENTRAL,
            &[0x02, 0x05, 0x77, 0x00, 0x00],
        );
        fixture.dispatcher.handle_packet(response);
        assert!(matches!(
            fixture.events.receiver().try_receive(),
            Ok(LinkEvent::ValueChanged { address: DEVICE, channel: 1, index: 0x05, value: 0x77 })
        ));
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::GetValue);
        assert_eq!(result.value, Some(0x77));
    }

    #[test]
    fn time_request_is_answered_with_the_configured_time() {
        let mut fixture = fixture();
        pair_device(&mut fixture);

        let request = BidcosPacket::new(9, control::BIDIRECTIONAL, message_type::TIME_REQUEST, DEVICE, CENTRAL, &[]);
        fixture.dispatcher.handle_packet(request);

        let sent = drain_tx(&fixture);
        assert_eq!(sent.len(), 1);
        let reply = &sent[0].packet;
        assert_eq!(reply.message_type, message_type::TIME_REQUEST);
        assert_eq!(reply.message_counter, 9);
        assert_eq!(&reply.payload()[2..6], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn commands_issued_during_pairing_are_parked_and_promoted() {
        let mut fixture = fixture();
        fixture.dispatcher.handle_command(EngineCommand::SetPairingMode(true));
        fixture.dispatcher.handle_packet(pairing_request());
        let sent = drain_tx(&fixture);
        let config_start = sent.last().unwrap().packet.clone();
        fixture.dispatcher.handle_packet(ack(config_start.message_counter, ACK_OK));
        assert!(fixture.dispatcher.has_peer(DEVICE));

        // The pairing queue is still live; a write issued now must wait.
        let mut set = ParamChangeSet::new(1);
        set.push(0, 1, 0xAA);
        fixture.dispatcher.handle_command(EngineCommand::PutParamset { address: DEVICE, set });

        let mut saw_parked_write = false;
        loop {
            let sent = drain_tx(&fixture);
            let Some(outbound) = sent.last() else { break };
            let payload = outbound.packet.payload();
            if payload.len() > 3 && payload[1] == config_subtype::CONFIG_WRITE_INDEX && payload[2] == 0x01 && payload[3] == 0xAA {
                saw_parked_write = true;
            }
            match outbound.packet.message_type {
                message_type::CONFIG if payload[1] == config_subtype::PARAM_REQUEST => {
                    let response = BidcosPacket::new(
                        outbound.packet.message_counter,
                        0,
                        message_type::PARAM_RESPONSE,
                        DEVICE,
                        CENTRAL,
                        &[0x02, 0x00, 0x00],
                    );
                    fixture.dispatcher.handle_packet(response);
                }
                _ => fixture.dispatcher.handle_packet(ack(outbound.packet.message_counter, ACK_OK)),
            }
        }
        assert!(saw_parked_write, "the parked write ran after the pairing queue drained");
        let result = fixture.op_results.receiver().try_receive().unwrap();
        assert_eq!(result.kind, OpKind::PutParamset);
        assert!(result.ok);
    }
}
