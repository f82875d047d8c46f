//! Upper-layer payload buffers.

use crate::packet_pool::Packet;

/// An upper-layer payload: a pool packet and the number of valid bytes in it.
pub struct Pdu<P> {
    pub packet: P,
    pub len: usize,
}

impl<P> Pdu<P> {
    /// Wrap `len` valid bytes of `packet` as a payload.
    pub fn new(packet: P, len: usize) -> Self {
        Self { packet, len }
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<P: Packet> AsRef<[u8]> for Pdu<P> {
    fn as_ref(&self) -> &[u8] {
        &self.packet.as_ref()[..self.len]
    }
}

impl<P: Packet> AsMut<[u8]> for Pdu<P> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.packet.as_mut()[..self.len]
    }
}
