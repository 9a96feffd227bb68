use std::sync::Arc;

use hantas::logging::Logger;
use hantas::DeviceId;

use crate::comm::frame::Wire;
use crate::comm::serial::SerialLink;
use crate::comm::shared::LinkEvents;
use crate::comm::tcp::{LegacyLink, TcpLink};

/// Transport capability shared by the serial and TCP workers. A link owns
/// its connection, reader thread and ingest pipeline; classified frames and
/// raw echoes flow out through the registered event sinks.
pub trait Link: Send {
    /// Opens the connection. `target` is a port name or dotted-quad IP,
    /// `option` a baud rate or TCP port. Returns false on invalid
    /// parameters or failure; true means ingestion has begun.
    fn connect(&mut self, target: &str, option: u32, device: DeviceId) -> bool;

    /// Stops ingestion and releases the connection.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Blocking send of an encoded packet; false when not connected or the
    /// write fails. The connection is left open either way.
    fn write(&mut self, packet: &[u8]) -> bool;

    fn set_events(&mut self, events: Arc<dyn LinkEvents>);

    /// Dialect of the frames this link produces and classifies.
    fn wire(&self) -> Wire;

    fn encode_read_holding(&self, address: u16, count: u16) -> Vec<u8>;
    fn encode_read_input(&self, address: u16, count: u16) -> Vec<u8>;
    fn encode_write_single(&self, address: u16, value: u16) -> Vec<u8>;
    fn encode_write_multi(&self, address: u16, values: &[u16]) -> Vec<u8>;
    fn encode_write_string(&self, address: u16, text: &str, length: u8) -> Vec<u8>;
    fn encode_read_info(&self) -> Vec<u8>;
}

/// Concrete transports selectable by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// MODBUS-RTU over a serial port; also the legacy serial dialect.
    Serial,
    /// MODBUS-TCP over a single client socket.
    Tcp,
    /// Legacy dual-socket Ethernet: commands at `port`, monitor at
    /// `port + 1`.
    LegacyTcp,
}

/// Picks the transport for `kind`.
pub fn create<'a, L: Into<Option<&'a Logger>>>(kind: LinkKind, log: L) -> Box<dyn Link> {
    let log = log.into();

    match kind {
        LinkKind::Serial => Box::new(SerialLink::new(log)),
        LinkKind::Tcp => Box::new(TcpLink::new(log)),
        LinkKind::LegacyTcp => Box::new(LegacyLink::new(log)),
    }
}
