//! ACL data packet framing.

use heapless::Vec;

use crate::codec::Error;
use crate::config;
use crate::types::{ConnHandle, LinkKind};

/// Packet boundary flag, bits 12..14 of the ACL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BoundaryFlag {
    /// First fragment of a non-automatically-flushable payload.
    FirstNonFlushable,
    /// Continuation of a previously started payload.
    ContinuingFragment,
    /// First fragment of an automatically flushable payload.
    FirstFlushable,
    /// A complete, unfragmented payload (deprecated on the wire).
    CompletePdu,
}

impl BoundaryFlag {
    const fn bits(self) -> u16 {
        match self {
            BoundaryFlag::FirstNonFlushable => 0b00,
            BoundaryFlag::ContinuingFragment => 0b01,
            BoundaryFlag::FirstFlushable => 0b10,
            BoundaryFlag::CompletePdu => 0b11,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => BoundaryFlag::FirstNonFlushable,
            0b01 => BoundaryFlag::ContinuingFragment,
            0b10 => BoundaryFlag::FirstFlushable,
            _ => BoundaryFlag::CompletePdu,
        }
    }
}

/// Broadcast flag, bits 14..16 of the ACL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BroadcastFlag {
    PointToPoint,
    ActiveBroadcast,
    PiconetBroadcast,
    Reserved,
}

impl BroadcastFlag {
    const fn bits(self) -> u16 {
        match self {
            BroadcastFlag::PointToPoint => 0b00,
            BroadcastFlag::ActiveBroadcast => 0b01,
            BroadcastFlag::PiconetBroadcast => 0b10,
            BroadcastFlag::Reserved => 0b11,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => BroadcastFlag::PointToPoint,
            0b01 => BroadcastFlag::ActiveBroadcast,
            0b10 => BroadcastFlag::PiconetBroadcast,
            _ => BroadcastFlag::Reserved,
        }
    }
}

/// An ACL data packet: a single fragment on the wire.
///
/// Owns its data so it can cross queues; the 4-byte header is
/// reconstructed on encode.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AclPacket {
    pub handle: ConnHandle,
    pub boundary: BoundaryFlag,
    pub broadcast: BroadcastFlag,
    pub data: Vec<u8, { config::ACL_BUFFER_SIZE }>,
}

impl AclPacket {
    pub fn new(handle: ConnHandle, boundary: BoundaryFlag, data: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            handle,
            boundary,
            broadcast: BroadcastFlag::PointToPoint,
            data: Vec::from_slice(data).map_err(|_| Error::InsufficientSpace)?,
        })
    }

    /// Parse a packet from its wire form.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::InsufficientSpace);
        }
        let raw_handle = u16::from_le_bytes([data[0], data[1]]);
        let len = u16::from_le_bytes([data[2], data[3]]) as usize;
        let payload = data[4..].get(..len).ok_or(Error::InsufficientSpace)?;
        Ok(Self {
            handle: ConnHandle::new(raw_handle & 0x0FFF),
            boundary: BoundaryFlag::from_bits((raw_handle >> 12) & 0b11),
            broadcast: BroadcastFlag::from_bits((raw_handle >> 14) & 0b11),
            data: Vec::from_slice(payload).map_err(|_| Error::InsufficientSpace)?,
        })
    }

    /// Serialize into `dest` and return the encoded size.
    pub fn encode(&self, dest: &mut [u8]) -> Result<usize, Error> {
        let size = 4 + self.data.len();
        if dest.len() < size {
            return Err(Error::InsufficientSpace);
        }
        let raw_handle = self.handle.raw() | (self.boundary.bits() << 12) | (self.broadcast.bits() << 14);
        dest[0..2].copy_from_slice(&raw_handle.to_le_bytes());
        dest[2..4].copy_from_slice(&(self.data.len() as u16).to_le_bytes());
        dest[4..size].copy_from_slice(&self.data);
        Ok(size)
    }
}

/// An outbound fragment queued for the controller, tagged with the
/// connection kind whose credit pool it will be charged against.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaggedFragment {
    pub kind: LinkKind,
    pub packet: AclPacket,
}
