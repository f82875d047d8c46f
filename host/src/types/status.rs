//! HCI status and error codes.

use crate::codec::{Decode, Encode, Error, FixedSize};

/// An HCI status code byte, returned by the controller in command replies
/// and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(u8);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const UNKNOWN_HCI_COMMAND: Status = Status(0x01);
    pub const UNKNOWN_CONN_IDENTIFIER: Status = Status(0x02);
    pub const HARDWARE_FAILURE: Status = Status(0x03);
    pub const PAGE_TIMEOUT: Status = Status(0x04);
    pub const AUTHENTICATION_FAILURE: Status = Status(0x05);
    pub const MEMORY_CAPACITY_EXCEEDED: Status = Status(0x07);
    pub const CONNECTION_TIMEOUT: Status = Status(0x08);
    pub const CONNECTION_LIMIT_EXCEEDED: Status = Status(0x09);
    pub const CONNECTION_ALREADY_EXISTS: Status = Status(0x0B);
    pub const COMMAND_DISALLOWED: Status = Status(0x0C);
    pub const LIMITED_RESOURCES: Status = Status(0x0D);
    pub const REMOTE_USER_TERMINATED_CONN: Status = Status(0x13);
    pub const REMOTE_DEVICE_TERMINATED_CONN_LOW_RESOURCES: Status = Status(0x14);
    pub const REMOTE_DEVICE_TERMINATED_CONN_POWER_OFF: Status = Status(0x15);
    pub const CONN_TERMINATED_BY_LOCAL_HOST: Status = Status(0x16);
    pub const UNSUPPORTED_REMOTE_FEATURE: Status = Status(0x1A);
    pub const UNSPECIFIED: Status = Status(0x1F);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// Ok for a success status, the status itself otherwise.
    pub fn to_result(self) -> Result<(), Status> {
        if self == Status::SUCCESS {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl FixedSize for Status {
    const SIZE: usize = 1;
}

impl Encode for Status {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        self.0.encode(dest)
    }
}

impl<'d> Decode<'d> for Status {
    fn decode(src: &'d [u8]) -> Result<Self, Error> {
        Ok(Self(u8::decode(src)?))
    }
}

/// Reasons a host is allowed to give when terminating a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DisconnectReason {
    AuthenticationFailure = 0x05,
    RemoteUserTerminatedConn = 0x13,
    RemoteDeviceTerminatedConnLowResources = 0x14,
    RemoteDeviceTerminatedConnPowerOff = 0x15,
    UnsupportedRemoteFeature = 0x1A,
    PairingWithUnitKeyNotSupported = 0x29,
    UnacceptableConnParameters = 0x3B,
}

impl FixedSize for DisconnectReason {
    const SIZE: usize = 1;
}

impl Encode for DisconnectReason {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        (*self as u8).encode(dest)
    }
}
