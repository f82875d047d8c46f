//! Interface to the HCI transport driver (HAL).

pub use embedded_io_async::ErrorKind;

/// This trait allows generic code to do limited inspecting of errors,
/// to react differently to different kinds.
pub trait Error: core::fmt::Debug {
    /// Get the kind of this error.
    fn kind(&self) -> ErrorKind;
}

impl Error for core::convert::Infallible {
    fn kind(&self) -> ErrorKind {
        match *self {}
    }
}

impl Error for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

/// Kind of an HCI packet, as carried by the transport's packet indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum HciPacketKind {
    Command = 0x01,
    AclData = 0x02,
    SyncData = 0x03,
    Event = 0x04,
    IsoData = 0x05,
}

/// Interface to a driver for an HCI transport.
///
/// A driver moves whole HCI packets between the host and the controller.
/// Both methods take `&self`; implementations serialize concurrent reads
/// and writes internally.
pub trait HciDriver {
    /// The driver's error type.
    type Error: Error;

    /// Read an entire HCI packet into the provided buffer.
    ///
    /// If successful, returns the kind of the received packet and the
    /// number of bytes read, exclusive of the packet indicator.
    async fn read(&self, buf: &mut [u8]) -> Result<(HciPacketKind, usize), Self::Error>;

    /// Write the provided data as a single HCI packet.
    async fn write(&self, kind: HciPacketKind, data: &[u8]) -> Result<(), Self::Error>;
}
