#![cfg_attr(not(feature = "std"), no_std)]

//! # BidCoS Link Engine
//!
//! Link- and session-layer engine for the BidCoS sub-GHz RF protocol:
//! reliable configuration writes to remote devices, the pairing handshake
//! that turns an unknown sender into a known peer, and access-controlled
//! dispatch of inbound packets to protocol handlers.
//!
//! The engine is a single long-lived dispatch task owning all protocol
//! state, fed by `embassy_sync` channels: decoded packets in, frames out,
//! commands from the [`BidcosCentral`] front object, events and operation
//! results back. Transports are external: [`BidcosCentral::initialize`]
//! returns the [`TransportChannels`] pair and the caller wires it to a
//! device task (the [`transport`] module ships an echo loopback and a
//! scripted device simulator for host testing).

pub mod config;
pub mod dispatcher;
pub mod message_table;
pub mod packet;
pub mod pairing;
pub mod peer;
pub mod pending_queue;
pub mod queue;
pub mod queue_manager;
pub mod transport;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration};
use log::log;
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

pub use config::ParamChangeSet;
pub use packet::BidcosPacket;

/// A frame handed to the transport for transmission.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct OutboundPacket {
    pub packet: BidcosPacket,
    /// Send without raising send events; used for protocol-internal ACKs.
    pub stealthy: bool,
}

const TX_PACKET_QUEUE_SIZE: usize = 16;
pub type TxPacketQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, OutboundPacket, TX_PACKET_QUEUE_SIZE>;
pub type TxPacketQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, OutboundPacket, TX_PACKET_QUEUE_SIZE>;
pub type TxPacketQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, OutboundPacket, TX_PACKET_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static TX_PACKET_QUEUE: TxPacketQueue = Channel::new();

const RX_PACKET_QUEUE_SIZE: usize = 16;
pub type RxPacketQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, BidcosPacket, RX_PACKET_QUEUE_SIZE>;
pub type RxPacketQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, BidcosPacket, RX_PACKET_QUEUE_SIZE>;
pub type RxPacketQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, BidcosPacket, RX_PACKET_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static RX_PACKET_QUEUE: RxPacketQueue = Channel::new();

const COMMAND_QUEUE_SIZE: usize = 4;
pub type CommandQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, EngineCommand, COMMAND_QUEUE_SIZE>;
pub type CommandQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, EngineCommand, COMMAND_QUEUE_SIZE>;
pub type CommandQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, EngineCommand, COMMAND_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static COMMAND_QUEUE: CommandQueue = Channel::new();

const EVENT_QUEUE_SIZE: usize = 8;
pub type EventQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, LinkEvent, EVENT_QUEUE_SIZE>;
pub type EventQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, LinkEvent, EVENT_QUEUE_SIZE>;
pub type EventQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, LinkEvent, EVENT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static EVENT_QUEUE: EventQueue = Channel::new();

const OP_RESULT_QUEUE_SIZE: usize = 4;
pub type OpResultQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, OpResult, OP_RESULT_QUEUE_SIZE>;
pub type OpResultQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, OpResult, OP_RESULT_QUEUE_SIZE>;
pub type OpResultQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, OpResult, OP_RESULT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static OP_RESULT_QUEUE: OpResultQueue = Channel::new();

/// Synchronous operations the engine runs on behalf of a caller.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum OpKind {
    PutParamset,
    RequestParamset,
    GetValue,
    Unpair,
    RotateAesKey,
}

/// Completion notice for one synchronous operation.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct OpResult {
    pub kind: OpKind,
    pub address: u32,
    pub ok: bool,
    /// Register value for a completed getValue call.
    pub value: Option<u8>,
}

/// Commands the front object hands to the dispatch task.
pub enum EngineCommand {
    SetPairingMode(bool),
    PutParamset { address: u32, set: ParamChangeSet },
    RequestParamset { address: u32, channel: u8, list: u8 },
    GetValue { address: u32, channel: u8, list: u8, index: u8 },
    Unpair { address: u32 },
    RotateAesKey { address: u32, channel: u8 },
}

/// State changes surfaced to the application.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum LinkEvent {
    DeviceAdded { address: u32, device_type: u16 },
    DeviceRemoved { address: u32 },
    PairingFailed { address: u32 },
    ValueChanged { address: u32, channel: u8, index: u8, value: u8 },
    ConfigReadComplete { address: u32, channel: u8, list: u8 },
}

#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum LinkError {
    NotInited,
    ChannelFull,
    /// The device did not answer within the response timeout.
    NoAnswerFromDevice,
    /// The engine rejected the operation (unknown peer, device NACK).
    OperationRefused,
}

/// Engine configuration handed to [`BidcosCentral::initialize`].
#[derive(Clone, Copy)]
pub struct LinkConfiguration {
    /// The central's own 24-bit radio address.
    pub central_address: u32,
    /// Wait budget for synchronous operations and response expectations.
    pub response_timeout: Duration,
    /// Epoch seconds supplied to devices asking for the time.
    pub time_source: fn() -> u32,
}

/// Rolling outbound message counter, randomly seeded so a restarted
/// central does not collide with counters devices remember.
pub struct MessageCounters {
    current: u8,
}

impl MessageCounters {
    pub fn new(rng_seed: u64) -> Self {
        let mut rng = WyRand::seed_from_u64(rng_seed);
        MessageCounters {
            current: rng.next_u32() as u8,
        }
    }

    pub fn next(&mut self) -> u8 {
        self.current = self.current.wrapping_add(1);
        self.current
    }
}

/// Channels per device model.
pub const MAX_CHANNELS: usize = 8;

/// Static description of one device channel, resolved from an external
/// device-description source.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ChannelModel {
    /// Master parameter lists the channel carries, read during pairing.
    pub master_lists: [Option<u8>; 4],
    /// Channel can hold link peers, so its peer list is read too.
    pub has_link_role: bool,
    /// Channel defaults to encrypted traffic.
    pub aes_default: bool,
}

/// Static description of a device type, indexed by channel number.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct DeviceModel {
    channels: [Option<ChannelModel>; MAX_CHANNELS],
}

impl DeviceModel {
    pub const fn new() -> Self {
        DeviceModel {
            channels: [None; MAX_CHANNELS],
        }
    }

    pub fn set_channel(&mut self, channel: u8, model: ChannelModel) {
        if (channel as usize) < MAX_CHANNELS {
            self.channels[channel as usize] = Some(model);
        }
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.iter().filter(|slot| slot.is_some()).count() as u8
    }

    pub fn channels(&self) -> impl Iterator<Item = (u8, &ChannelModel)> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(channel, slot)| slot.as_ref().map(|model| (channel as u8, model)))
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a device type to its static model. Unknown types abort pairing.
pub trait DeviceDescriptionResolver {
    fn resolve(&self, device_type: u16, firmware_version: u8) -> Option<DeviceModel>;
}

/// Sink for register values streamed back by parameter reads. The engine
/// never interprets parameter semantics itself.
pub trait ParameterStore {
    fn store_config(&self, address: u32, channel: u8, list: u8, index: u8, value: u8);
}

/// Channel pair the caller wires to a transport device task.
pub struct TransportChannels {
    /// Frames the engine wants transmitted.
    pub packets_out: TxPacketQueueReceiver,
    /// Decoded inbound packets for the engine.
    pub packets_in: RxPacketQueueSender,
}

enum BidcosCentralState {
    Uninitialized,
    Initialized {
        command_queue_sender: CommandQueueSender,
        event_queue_receiver: EventQueueReceiver,
        op_result_queue_receiver: OpResultQueueReceiver,
        /// Serializes synchronous operations so every caller consumes its
        /// own completion.
        operation_lock: Mutex<CriticalSectionRawMutex, ()>,
        response_timeout: Duration,
    },
}

/// Front object of the engine: spawns the dispatch task and exposes the
/// synchronous operation API. Operations are serialized internally, so
/// the front object can be shared by several caller tasks.
pub struct BidcosCentral {
    state: BidcosCentralState,
}

impl BidcosCentral {
    pub const fn new() -> Self {
        BidcosCentral {
            state: BidcosCentralState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        configuration: LinkConfiguration,
        spawner: Spawner,
        resolver: &'static dyn DeviceDescriptionResolver,
        store: &'static dyn ParameterStore,
        rng_seed: u64,
    ) -> Result<TransportChannels, ()> {
        self.initialize_common(
            configuration,
            spawner,
            resolver,
            store,
            &TX_PACKET_QUEUE,
            &RX_PACKET_QUEUE,
            &COMMAND_QUEUE,
            &EVENT_QUEUE,
            &OP_RESULT_QUEUE,
            rng_seed,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        configuration: LinkConfiguration,
        spawner: Spawner,
        resolver: &'static dyn DeviceDescriptionResolver,
        store: &'static dyn ParameterStore,
        rng_seed: u64,
    ) -> Result<TransportChannels, ()> {
        let tx_packet_queue: &'static TxPacketQueue = Box::leak(Box::new(Channel::new()));
        let rx_packet_queue: &'static RxPacketQueue = Box::leak(Box::new(Channel::new()));
        let command_queue: &'static CommandQueue = Box::leak(Box::new(Channel::new()));
        let event_queue: &'static EventQueue = Box::leak(Box::new(Channel::new()));
        let op_result_queue: &'static OpResultQueue = Box::leak(Box::new(Channel::new()));
        self.initialize_common(
            configuration,
            spawner,
            resolver,
            store,
            tx_packet_queue,
            rx_packet_queue,
            command_queue,
            event_queue,
            op_result_queue,
            rng_seed,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        configuration: LinkConfiguration,
        spawner: Spawner,
        resolver: &'static dyn DeviceDescriptionResolver,
        store: &'static dyn ParameterStore,
        tx_packet_queue: &'static TxPacketQueue,
        rx_packet_queue: &'static RxPacketQueue,
        command_queue: &'static CommandQueue,
        event_queue: &'static EventQueue,
        op_result_queue: &'static OpResultQueue,
        rng_seed: u64,
    ) -> Result<TransportChannels, ()> {
        let mut rng = WyRand::seed_from_u64(rng_seed);

        let dispatch_task_result = spawner.spawn(dispatcher::dispatch_task(
            rx_packet_queue.receiver(),
            command_queue.receiver(),
            tx_packet_queue.sender(),
            event_queue.sender(),
            op_result_queue.sender(),
            configuration,
            resolver,
            store,
            rng.next_u64(),
        ));
        if dispatch_task_result.is_err() {
            return Err(());
        }
        log!(log::Level::Info, "BidCoS link engine initialized for 0x{:06X}", configuration.central_address);

        self.state = BidcosCentralState::Initialized {
            command_queue_sender: command_queue.sender(),
            event_queue_receiver: event_queue.receiver(),
            op_result_queue_receiver: op_result_queue.receiver(),
            operation_lock: Mutex::new(()),
            response_timeout: configuration.response_timeout,
        };
        Ok(TransportChannels {
            packets_out: tx_packet_queue.receiver(),
            packets_in: rx_packet_queue.sender(),
        })
    }

    fn channels(
        &self,
    ) -> Result<(&CommandQueueSender, &OpResultQueueReceiver, &Mutex<CriticalSectionRawMutex, ()>, Duration), LinkError> {
        match &self.state {
            BidcosCentralState::Uninitialized => Err(LinkError::NotInited),
            BidcosCentralState::Initialized {
                command_queue_sender,
                op_result_queue_receiver,
                operation_lock,
                response_timeout,
                ..
            } => Ok((command_queue_sender, op_result_queue_receiver, operation_lock, *response_timeout)),
        }
    }

    /// Enqueues a command and waits for its matching operation result
    /// under the configured wait budget. Operations are serialized: a
    /// second caller waits for the first to finish, so a completion can
    /// never be consumed by the wrong waiter. Results left over from a
    /// timed-out call are skipped.
    async fn run_operation(&self, command: EngineCommand, kind: OpKind, address: u32) -> Result<OpResult, LinkError> {
        let (commands, op_results, lock, response_timeout) = self.channels()?;
        let _guard = lock.lock().await;
        commands.try_send(command).map_err(|_| LinkError::ChannelFull)?;
        let result = with_timeout(response_timeout, async {
            loop {
                let result = op_results.receive().await;
                if result.kind == kind && result.address == address {
                    return result;
                }
            }
        })
        .await
        .map_err(|_| LinkError::NoAnswerFromDevice)?;
        if result.ok {
            Ok(result)
        } else {
            Err(LinkError::OperationRefused)
        }
    }

    /// Turns pairing mode on or off. Fire and forget.
    pub fn set_pairing_mode(&self, enabled: bool) -> Result<(), LinkError> {
        let (commands, _, _, _) = self.channels()?;
        commands
            .try_send(EngineCommand::SetPairingMode(enabled))
            .map_err(|_| LinkError::ChannelFull)
    }

    /// Writes a set of register changes to a paired device and waits for
    /// the full config cycle to be acknowledged.
    pub async fn put_paramset(&self, address: u32, set: ParamChangeSet) -> Result<(), LinkError> {
        self.run_operation(EngineCommand::PutParamset { address, set }, OpKind::PutParamset, address)
            .await
            .map(|_| ())
    }

    /// Reads a parameter list from a device into the parameter store.
    pub async fn request_paramset(&self, address: u32, channel: u8, list: u8) -> Result<(), LinkError> {
        self.run_operation(
            EngineCommand::RequestParamset { address, channel, list },
            OpKind::RequestParamset,
            address,
        )
        .await
        .map(|_| ())
    }

    /// Reads a single register value from a device.
    pub async fn get_value(&self, address: u32, channel: u8, list: u8, index: u8) -> Result<u8, LinkError> {
        let result = self
            .run_operation(EngineCommand::GetValue { address, channel, list, index }, OpKind::GetValue, address)
            .await?;
        result.value.ok_or(LinkError::NoAnswerFromDevice)
    }

    /// Resets a device's pairing registers and removes the peer.
    pub async fn unpair(&self, address: u32) -> Result<(), LinkError> {
        self.run_operation(EngineCommand::Unpair { address }, OpKind::Unpair, address)
            .await
            .map(|_| ())
    }

    /// Advances the AES key index a device expects.
    pub async fn rotate_aes_key(&self, address: u32, channel: u8) -> Result<(), LinkError> {
        self.run_operation(EngineCommand::RotateAesKey { address, channel }, OpKind::RotateAesKey, address)
            .await
            .map(|_| ())
    }

    /// Next engine event: device added/removed, value changed, read done.
    pub async fn receive_event(&self) -> Result<LinkEvent, LinkError> {
        let event_queue_receiver = match &self.state {
            BidcosCentralState::Uninitialized => return Err(LinkError::NotInited),
            BidcosCentralState::Initialized { event_queue_receiver, .. } => event_queue_receiver,
        };
        Ok(event_queue_receiver.receive().await)
    }
}

impl Default for BidcosCentral {
    fn default() -> Self {
        Self::new()
    }
}
