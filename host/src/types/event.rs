//! HCI event packets and their parameter layouts.

use heapless::Vec;

use crate::codec::{Decode, Error, Reader};
use crate::types::opcode::Opcode;
use crate::types::status::Status;
use crate::types::{BdAddr, ConnHandle};

/// Largest possible HCI event: 2-byte header plus 255 parameter bytes.
pub const MAX_EVENT_SIZE: usize = 257;

/// An HCI event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventCode(u8);

impl EventCode {
    pub const CONNECTION_COMPLETE: EventCode = EventCode(0x03);
    pub const CONNECTION_REQUEST: EventCode = EventCode(0x04);
    pub const DISCONNECTION_COMPLETE: EventCode = EventCode(0x05);
    pub const ENCRYPTION_CHANGE: EventCode = EventCode(0x08);
    pub const COMMAND_COMPLETE: EventCode = EventCode(0x0E);
    pub const COMMAND_STATUS: EventCode = EventCode(0x0F);
    pub const HARDWARE_ERROR: EventCode = EventCode(0x10);
    pub const NUMBER_OF_COMPLETED_PACKETS: EventCode = EventCode(0x13);
    pub const LE_META: EventCode = EventCode(0x3E);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }
}

/// An LE meta event subevent code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeSubevent(u8);

impl LeSubevent {
    pub const CONNECTION_COMPLETE: LeSubevent = LeSubevent(0x01);
    pub const ADVERTISING_REPORT: LeSubevent = LeSubevent(0x02);
    pub const CONNECTION_UPDATE_COMPLETE: LeSubevent = LeSubevent(0x03);
    pub const LONG_TERM_KEY_REQUEST: LeSubevent = LeSubevent(0x05);
    pub const ENHANCED_CONNECTION_COMPLETE: LeSubevent = LeSubevent(0x0A);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }
}

/// An owned HCI event, as delivered to event subscribers.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventPacket {
    code: EventCode,
    params: Vec<u8, 255>,
}

impl EventPacket {
    /// Parse an event from its wire form (event code, parameter length,
    /// parameters).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(data);
        let code = EventCode::from_raw(r.field()?);
        let len: u8 = r.field()?;
        let params = r.bytes(len as usize)?;
        Ok(Self {
            code,
            params: unwrap!(Vec::from_slice(params).ok(), "event parameters exceed 255 bytes"),
        })
    }

    pub fn code(&self) -> EventCode {
        self.code
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

/// Command Complete parameters.
pub struct CommandComplete<'d> {
    pub num_hci_command_packets: u8,
    pub opcode: Opcode,
    pub return_params: &'d [u8],
}

impl<'d> CommandComplete<'d> {
    pub fn parse(params: &'d [u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        let num_hci_command_packets = r.field()?;
        let opcode = r.field()?;
        Ok(Self {
            num_hci_command_packets,
            opcode,
            return_params: r.rest(),
        })
    }
}

/// Command Status parameters.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatus {
    pub status: Status,
    pub num_hci_command_packets: u8,
    pub opcode: Opcode,
}

impl CommandStatus {
    pub fn parse(params: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        Ok(Self {
            status: r.field()?,
            num_hci_command_packets: r.field()?,
            opcode: r.field()?,
        })
    }
}

/// Connection Complete parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub bd_addr: BdAddr,
    pub link_type: u8,
    pub encryption_enabled: bool,
}

impl ConnectionComplete {
    pub fn parse(params: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        let status = r.field()?;
        // A failed attempt may carry an out-of-range handle; don't reject it.
        let raw_handle: u16 = r.field()?;
        Ok(Self {
            status,
            handle: ConnHandle::new(raw_handle & 0x0FFF),
            bd_addr: r.field()?,
            link_type: r.field()?,
            encryption_enabled: r.field::<u8>()? != 0,
        })
    }
}

/// Connection Request parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRequest {
    pub bd_addr: BdAddr,
    pub class_of_device: [u8; 3],
    pub link_type: u8,
}

impl ConnectionRequest {
    pub fn parse(params: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        Ok(Self {
            bd_addr: r.field()?,
            class_of_device: r.field()?,
            link_type: r.field()?,
        })
    }
}

/// Disconnection Complete parameters.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub reason: Status,
}

impl DisconnectionComplete {
    pub fn parse(params: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        Ok(Self {
            status: r.field()?,
            handle: r.field()?,
            reason: r.field()?,
        })
    }
}

/// Number Of Completed Packets parameters: a handle array followed by a
/// matching completed-count array.
pub struct NumberOfCompletedPackets<'d> {
    num_handles: usize,
    data: &'d [u8],
}

impl<'d> NumberOfCompletedPackets<'d> {
    pub fn parse(params: &'d [u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        let num_handles = r.field::<u8>()? as usize;
        let data = r.bytes(num_handles * 4)?;
        Ok(Self { num_handles, data })
    }

    /// Iterate the (handle, completed packet count) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ConnHandle, u16)> + 'd {
        let num = self.num_handles;
        let data = self.data;
        (0..num).map(move |i| {
            let handle = u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]) & 0x0FFF;
            let count = u16::from_le_bytes([data[num * 2 + i * 2], data[num * 2 + i * 2 + 1]]);
            (ConnHandle::new(handle), count)
        })
    }
}

/// An LE meta event, before subevent demultiplexing.
pub struct LeMeta<'d> {
    pub subevent: LeSubevent,
    pub params: &'d [u8],
}

impl<'d> LeMeta<'d> {
    pub fn parse(params: &'d [u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        Ok(Self {
            subevent: LeSubevent::from_raw(r.field()?),
            params: r.rest(),
        })
    }
}

/// LE Connection Complete subevent parameters.
#[derive(Debug, Clone, Copy)]
pub struct LeConnectionComplete {
    pub status: Status,
    pub handle: ConnHandle,
    pub role: u8,
    pub peer_addr_kind: u8,
    pub peer_addr: BdAddr,
    pub conn_interval: u16,
    pub peripheral_latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionComplete {
    /// Parse from LE meta parameters, exclusive of the subevent code.
    pub fn parse(params: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(params);
        let status = r.field()?;
        let raw_handle: u16 = r.field()?;
        Ok(Self {
            status,
            handle: ConnHandle::new(raw_handle & 0x0FFF),
            role: r.field()?,
            peer_addr_kind: r.field()?,
            peer_addr: r.field()?,
            conn_interval: r.field()?,
            peripheral_latency: r.field()?,
            supervision_timeout: r.field()?,
        })
    }
}

impl<'d> Decode<'d> for EventCode {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        Ok(Self(u8::decode(src)?))
    }
}

impl crate::codec::FixedSize for EventCode {
    const SIZE: usize = 1;
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn parse_command_complete() {
        // Reset complete, 1 command credit, status success
        let event = EventPacket::parse(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]).unwrap();
        assert_eq!(event.code(), EventCode::COMMAND_COMPLETE);
        let complete = CommandComplete::parse(event.params()).unwrap();
        assert_eq!(complete.num_hci_command_packets, 1);
        assert_eq!(complete.opcode, crate::types::opcode::RESET);
        assert_eq!(complete.return_params, &[0x00]);
    }

    #[test]
    fn parse_command_status() {
        let event = EventPacket::parse(&[0x0F, 0x04, 0x00, 0x01, 0x05, 0x04]).unwrap();
        let status = CommandStatus::parse(event.params()).unwrap();
        assert_eq!(status.status, Status::SUCCESS);
        assert_eq!(status.num_hci_command_packets, 1);
        assert_eq!(status.opcode, crate::types::opcode::CREATE_CONNECTION);
    }

    #[test]
    fn parse_truncated_event_fails() {
        assert!(EventPacket::parse(&[0x0E, 0x04, 0x01]).is_err());
    }

    #[test]
    fn parse_number_of_completed_packets() {
        // Two handles: 0x0040 with 2 credits, 0x0041 with 1 credit.
        let params = [0x02, 0x40, 0x00, 0x41, 0x00, 0x02, 0x00, 0x01, 0x00];
        let view = NumberOfCompletedPackets::parse(&params).unwrap();
        let pairs: std::vec::Vec<_> = view.iter().collect();
        assert_eq!(pairs, &[(ConnHandle::new(0x0040), 2), (ConnHandle::new(0x0041), 1)]);
    }

    #[test]
    fn parse_disconnection_complete() {
        let params = [0x00, 0x40, 0x00, 0x13];
        let event = DisconnectionComplete::parse(&params).unwrap();
        assert_eq!(event.status, Status::SUCCESS);
        assert_eq!(event.handle, ConnHandle::new(0x0040));
        assert_eq!(event.reason, Status::REMOTE_USER_TERMINATED_CONN);
    }
}
