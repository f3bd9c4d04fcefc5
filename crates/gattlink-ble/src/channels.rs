//! Channel types connecting session handles, native transports and the
//! session tasks

use gattlink_core::ChannelConfig;
use tokio::sync::{broadcast, mpsc};

use crate::central::Command;
use crate::events::{PeripheralEvent, SessionEvent};
use crate::peripheral::PeripheralCommand;
use crate::transport::{EventSink, PeripheralTransportEvent, TransportEvent};

pub(crate) type CommandSender = mpsc::Sender<Command>;
pub(crate) type CommandReceiver = mpsc::Receiver<Command>;
pub(crate) type PeripheralCommandSender = mpsc::Sender<PeripheralCommand>;
pub(crate) type PeripheralCommandReceiver = mpsc::Receiver<PeripheralCommand>;

pub type SessionEventSender = broadcast::Sender<SessionEvent>;
pub type SessionEventReceiver = broadcast::Receiver<SessionEvent>;
pub type PeripheralEventSender = broadcast::Sender<PeripheralEvent>;
pub type PeripheralEventReceiver = broadcast::Receiver<PeripheralEvent>;

/// Per-characteristic value listener
pub type ValueReceiver = mpsc::UnboundedReceiver<Vec<u8>>;
pub(crate) type ValueSender = mpsc::UnboundedSender<Vec<u8>>;

pub(crate) fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    mpsc::channel(config.command_buffer_size.max(1))
}

pub(crate) fn create_peripheral_command_channel(
    config: &ChannelConfig,
) -> (PeripheralCommandSender, PeripheralCommandReceiver) {
    mpsc::channel(config.command_buffer_size.max(1))
}

pub(crate) fn create_session_event_channel(config: &ChannelConfig) -> SessionEventSender {
    broadcast::channel(config.event_buffer_size.max(1)).0
}

pub(crate) fn create_peripheral_event_channel(config: &ChannelConfig) -> PeripheralEventSender {
    broadcast::channel(config.event_buffer_size.max(1)).0
}

pub(crate) fn create_transport_channel() -> (
    EventSink<TransportEvent>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}

pub(crate) fn create_peripheral_transport_channel() -> (
    EventSink<PeripheralTransportEvent>,
    mpsc::UnboundedReceiver<PeripheralTransportEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}
