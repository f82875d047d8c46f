//! HCI command definitions.

use crate::codec::{self, Decode, Reader, Writer};
use crate::types::opcode::{self, Opcode};
use crate::types::status::{DisconnectReason, Status};
use crate::types::{BdAddr, ConnHandle};

/// Largest possible HCI command: 3-byte header plus 255 parameter bytes.
pub const MAX_COMMAND_SIZE: usize = 258;

/// An HCI command.
pub trait Command {
    const OPCODE: Opcode;

    fn params_size(&self) -> usize;

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error>;

    /// Serialize the full command packet (opcode, parameter length,
    /// parameters) and return its size.
    fn encode(&self, dest: &mut [u8]) -> Result<usize, codec::Error> {
        let mut w = Writer::new(dest);
        w.field(&Self::OPCODE)?;
        w.field(&(self.params_size() as u8))?;
        self.encode_params(&mut w)?;
        Ok(w.written())
    }
}

/// A command the controller answers with a Command Complete event.
pub trait SyncCommand: Command {
    type Return;

    fn decode_return(params: &[u8]) -> Result<Self::Return, codec::Error>;
}

/// A command the controller answers with a Command Status event; the real
/// outcome arrives later as a separate event.
pub trait AsyncCommand: Command {}

macro_rules! no_params {
    () => {
        fn params_size(&self) -> usize {
            0
        }

        fn encode_params(&self, _w: &mut Writer<'_>) -> Result<(), codec::Error> {
            Ok(())
        }
    };
}

/// Reset the controller to its power-on state.
pub struct Reset;

impl Command for Reset {
    const OPCODE: Opcode = opcode::RESET;
    no_params!();
}

impl SyncCommand for Reset {
    type Return = Status;

    fn decode_return(params: &[u8]) -> Result<Status, codec::Error> {
        Status::decode(params)
    }
}

/// Select which events the controller may generate.
pub struct SetEventMask {
    pub mask: u64,
}

impl SetEventMask {
    /// The events this stack consumes.
    pub const DEFAULT: u64 = (1 << 2)   // Connection Complete
        | (1 << 3)                      // Connection Request
        | (1 << 4)                      // Disconnection Complete
        | (1 << 7)                      // Encryption Change
        | (1 << 15)                     // Hardware Error
        | (1 << 61); // LE Meta

    pub fn new(mask: u64) -> Self {
        Self { mask }
    }
}

impl Command for SetEventMask {
    const OPCODE: Opcode = opcode::SET_EVENT_MASK;

    fn params_size(&self) -> usize {
        8
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.mask)
    }
}

impl SyncCommand for SetEventMask {
    type Return = Status;

    fn decode_return(params: &[u8]) -> Result<Status, codec::Error> {
        Status::decode(params)
    }
}

/// Select which LE subevents the controller may generate.
pub struct LeSetEventMask {
    pub mask: u64,
}

impl LeSetEventMask {
    /// The LE subevents this stack consumes.
    pub const DEFAULT: u64 = 1; // LE Connection Complete

    pub fn new(mask: u64) -> Self {
        Self { mask }
    }
}

impl Command for LeSetEventMask {
    const OPCODE: Opcode = opcode::LE_SET_EVENT_MASK;

    fn params_size(&self) -> usize {
        8
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.mask)
    }
}

impl SyncCommand for LeSetEventMask {
    type Return = Status;

    fn decode_return(params: &[u8]) -> Result<Status, codec::Error> {
        Status::decode(params)
    }
}

/// Read the controller's ACL and synchronous buffer geometry.
pub struct ReadBufferSize;

#[derive(Debug, Clone, Copy)]
pub struct BufferSize {
    pub status: Status,
    pub acl_data_packet_length: u16,
    pub sync_data_packet_length: u8,
    pub total_num_acl_data_packets: u16,
    pub total_num_sync_data_packets: u16,
}

impl Command for ReadBufferSize {
    const OPCODE: Opcode = opcode::READ_BUFFER_SIZE;
    no_params!();
}

impl SyncCommand for ReadBufferSize {
    type Return = BufferSize;

    fn decode_return(params: &[u8]) -> Result<BufferSize, codec::Error> {
        let mut r = Reader::new(params);
        Ok(BufferSize {
            status: r.field()?,
            acl_data_packet_length: r.field()?,
            sync_data_packet_length: r.field()?,
            total_num_acl_data_packets: r.field()?,
            total_num_sync_data_packets: r.field()?,
        })
    }
}

/// Read the controller's LE ACL buffer geometry.
pub struct LeReadBufferSize;

#[derive(Debug, Clone, Copy)]
pub struct LeBufferSize {
    pub status: Status,
    pub le_acl_data_packet_length: u16,
    pub total_num_le_acl_data_packets: u8,
}

impl Command for LeReadBufferSize {
    const OPCODE: Opcode = opcode::LE_READ_BUFFER_SIZE;
    no_params!();
}

impl SyncCommand for LeReadBufferSize {
    type Return = LeBufferSize;

    fn decode_return(params: &[u8]) -> Result<LeBufferSize, codec::Error> {
        let mut r = Reader::new(params);
        Ok(LeBufferSize {
            status: r.field()?,
            le_acl_data_packet_length: r.field()?,
            total_num_le_acl_data_packets: r.field()?,
        })
    }
}

/// Read the controller's public device address.
pub struct ReadBdAddr;

impl Command for ReadBdAddr {
    const OPCODE: Opcode = opcode::READ_BD_ADDR;
    no_params!();
}

impl SyncCommand for ReadBdAddr {
    type Return = (Status, BdAddr);

    fn decode_return(params: &[u8]) -> Result<(Status, BdAddr), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Read the Supported Commands bitmap.
pub struct ReadLocalSupportedCommands;

impl Command for ReadLocalSupportedCommands {
    const OPCODE: Opcode = opcode::READ_LOCAL_SUPPORTED_COMMANDS;
    no_params!();
}

impl SyncCommand for ReadLocalSupportedCommands {
    type Return = (Status, [u8; 64]);

    fn decode_return(params: &[u8]) -> Result<(Status, [u8; 64]), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Read LMP feature page 0.
pub struct ReadLocalSupportedFeatures;

impl Command for ReadLocalSupportedFeatures {
    const OPCODE: Opcode = opcode::READ_LOCAL_SUPPORTED_FEATURES;
    no_params!();
}

impl SyncCommand for ReadLocalSupportedFeatures {
    type Return = (Status, u64);

    fn decode_return(params: &[u8]) -> Result<(Status, u64), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Read an extended LMP feature page.
pub struct ReadLocalExtendedFeatures {
    pub page: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtendedFeatures {
    pub status: Status,
    pub page_number: u8,
    pub maximum_page_number: u8,
    pub extended_lmp_features: u64,
}

impl ReadLocalExtendedFeatures {
    pub fn new(page: u8) -> Self {
        Self { page }
    }
}

impl Command for ReadLocalExtendedFeatures {
    const OPCODE: Opcode = opcode::READ_LOCAL_EXTENDED_FEATURES;

    fn params_size(&self) -> usize {
        1
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.page)
    }
}

impl SyncCommand for ReadLocalExtendedFeatures {
    type Return = ExtendedFeatures;

    fn decode_return(params: &[u8]) -> Result<ExtendedFeatures, codec::Error> {
        let mut r = Reader::new(params);
        Ok(ExtendedFeatures {
            status: r.field()?,
            page_number: r.field()?,
            maximum_page_number: r.field()?,
            extended_lmp_features: r.field()?,
        })
    }
}

/// Read the LE feature mask.
pub struct LeReadLocalSupportedFeatures;

impl Command for LeReadLocalSupportedFeatures {
    const OPCODE: Opcode = opcode::LE_READ_LOCAL_SUPPORTED_FEATURES;
    no_params!();
}

impl SyncCommand for LeReadLocalSupportedFeatures {
    type Return = (Status, u64);

    fn decode_return(params: &[u8]) -> Result<(Status, u64), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Read the maximum advertising data length the controller accepts.
pub struct LeReadMaximumAdvertisingDataLength;

impl Command for LeReadMaximumAdvertisingDataLength {
    const OPCODE: Opcode = opcode::LE_READ_MAXIMUM_ADVERTISING_DATA_LENGTH;
    no_params!();
}

impl SyncCommand for LeReadMaximumAdvertisingDataLength {
    type Return = (Status, u16);

    fn decode_return(params: &[u8]) -> Result<(Status, u16), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Initiate a classic connection to a peer.
pub struct CreateConnection {
    pub bd_addr: BdAddr,
    pub packet_type: u16,
    pub page_scan_repetition_mode: u8,
    pub clock_offset: u16,
    pub allow_role_switch: bool,
}

impl CreateConnection {
    /// DM1/3/5 and DH1/3/5 packets, R1 page scan, no clock offset, role
    /// switch allowed.
    pub fn new(bd_addr: BdAddr) -> Self {
        Self {
            bd_addr,
            packet_type: 0x4408 | 0x8810,
            page_scan_repetition_mode: 0x01,
            clock_offset: 0,
            allow_role_switch: true,
        }
    }
}

impl Command for CreateConnection {
    const OPCODE: Opcode = opcode::CREATE_CONNECTION;

    fn params_size(&self) -> usize {
        13
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.bd_addr)?;
        w.field(&self.packet_type)?;
        w.field(&self.page_scan_repetition_mode)?;
        w.field(&0u8)?; // reserved
        w.field(&self.clock_offset)?;
        w.field(&(self.allow_role_switch as u8))
    }
}

impl AsyncCommand for CreateConnection {}

/// Cancel an in-flight [`CreateConnection`].
pub struct CreateConnectionCancel {
    pub bd_addr: BdAddr,
}

impl CreateConnectionCancel {
    pub fn new(bd_addr: BdAddr) -> Self {
        Self { bd_addr }
    }
}

impl Command for CreateConnectionCancel {
    const OPCODE: Opcode = opcode::CREATE_CONNECTION_CANCEL;

    fn params_size(&self) -> usize {
        6
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.bd_addr)
    }
}

impl SyncCommand for CreateConnectionCancel {
    type Return = (Status, BdAddr);

    fn decode_return(params: &[u8]) -> Result<(Status, BdAddr), codec::Error> {
        let mut r = Reader::new(params);
        Ok((r.field()?, r.field()?))
    }
}

/// Accept an incoming connection request.
pub struct AcceptConnectionRequest {
    pub bd_addr: BdAddr,
    pub become_central: bool,
}

impl AcceptConnectionRequest {
    pub fn new(bd_addr: BdAddr, become_central: bool) -> Self {
        Self { bd_addr, become_central }
    }
}

impl Command for AcceptConnectionRequest {
    const OPCODE: Opcode = opcode::ACCEPT_CONNECTION_REQUEST;

    fn params_size(&self) -> usize {
        7
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.bd_addr)?;
        w.field(&if self.become_central { 0u8 } else { 1u8 })
    }
}

impl AsyncCommand for AcceptConnectionRequest {}

/// Reject an incoming connection request.
pub struct RejectConnectionRequest {
    pub bd_addr: BdAddr,
    pub reason: Status,
}

impl RejectConnectionRequest {
    pub fn new(bd_addr: BdAddr, reason: Status) -> Self {
        Self { bd_addr, reason }
    }
}

impl Command for RejectConnectionRequest {
    const OPCODE: Opcode = opcode::REJECT_CONNECTION_REQUEST;

    fn params_size(&self) -> usize {
        7
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.bd_addr)?;
        w.field(&self.reason)
    }
}

impl AsyncCommand for RejectConnectionRequest {}

/// Terminate a connection.
pub struct Disconnect {
    pub handle: ConnHandle,
    pub reason: DisconnectReason,
}

impl Disconnect {
    pub fn new(handle: ConnHandle, reason: DisconnectReason) -> Self {
        Self { handle, reason }
    }
}

impl Command for Disconnect {
    const OPCODE: Opcode = opcode::DISCONNECT;

    fn params_size(&self) -> usize {
        3
    }

    fn encode_params(&self, w: &mut Writer<'_>) -> Result<(), codec::Error> {
        w.field(&self.handle)?;
        w.field(&self.reason)
    }
}

impl AsyncCommand for Disconnect {}
