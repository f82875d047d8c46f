//! The controller module.
//!
//! Interrogates the local controller once at startup, caches the result as
//! an immutable [`Capabilities`] record, and forwards
//! `Number Of Completed Packets` credits to whoever registered for them.

use core::cell::RefCell;

use embassy_sync::once_lock::OnceLock;
use heapless::Vec;

use crate::config;
use crate::driver::HciDriver;
use crate::hci::{EventQueue, HciLayer, HCI_LAYER};
use crate::runtime::{Module, ModuleDescriptor, TaskQueue};
use crate::types::cmd::{
    LeReadBufferSize, LeReadLocalSupportedFeatures, LeReadMaximumAdvertisingDataLength, LeSetEventMask,
    ReadBdAddr, ReadBufferSize, ReadLocalExtendedFeatures, ReadLocalSupportedCommands, ReadLocalSupportedFeatures,
    Reset, SetEventMask,
};
use crate::types::event::{EventCode, NumberOfCompletedPackets};
use crate::types::opcode::{self, Opcode};
use crate::types::{BdAddr, ConnHandle};
use crate::Error;

/// Descriptor of the controller module.
pub static CONTROLLER: ModuleDescriptor = ModuleDescriptor::new("controller");

static CONTROLLER_DEPS: [&ModuleDescriptor; 1] = [&HCI_LAYER];

/// Task queue carrying returned ACL buffer credits, as (handle, count)
/// pairs.
pub type CreditQueue = TaskQueue<(ConnHandle, u16), { config::MAX_CONNECTIONS * 2 }>;

/// Maximum number of LMP feature pages retained, page 0 included.
pub const MAX_FEATURE_PAGES: usize = 4;

/// The advertising data limit every controller supports.
const LEGACY_ADV_DATA_LEN: u16 = 31;

/// What the local controller can do. Captured once at startup, then only
/// read.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// The controller's public device address.
    pub addr: BdAddr,
    /// The Supported Commands bitmap.
    pub supported_commands: [u8; 64],
    /// LMP feature pages; index 0 is the base page.
    pub features: Vec<u64, MAX_FEATURE_PAGES>,
    /// Largest classic ACL fragment the controller accepts.
    pub acl_mtu: u16,
    /// Number of classic ACL buffers in the controller.
    pub acl_buffers: u16,
    /// Largest LE ACL fragment the controller accepts.
    pub le_acl_mtu: u16,
    /// Number of LE ACL buffers in the controller.
    pub le_acl_buffers: u16,
    /// The LE feature mask.
    pub le_features: u64,
    /// Largest advertising payload the controller accepts.
    pub max_advertising_data_length: u16,
}

impl Capabilities {
    /// Whether the controller claims support for an opcode.
    pub fn supports(&self, opcode: Opcode) -> bool {
        bitmap_has(&self.supported_commands, opcode)
    }
}

fn bitmap_has(bitmap: &[u8; 64], opcode: Opcode) -> bool {
    match opcode.bitmap_position() {
        Some((octet, bit)) => bitmap[octet] & (1 << bit) != 0,
        None => false,
    }
}

/// The controller module.
pub struct Controller<'d, D: HciDriver> {
    hci: &'d HciLayer<'d, D>,
    events: &'d EventQueue,
    caps: OnceLock<Capabilities>,
    credits_sink: RefCell<Option<&'d CreditQueue>>,
}

impl<'d, D: HciDriver> Controller<'d, D> {
    /// A controller module over `hci`, with `events` as its task queue.
    pub fn new(hci: &'d HciLayer<'d, D>, events: &'d EventQueue) -> Self {
        Self {
            hci,
            events,
            caps: OnceLock::new(),
            credits_sink: RefCell::new(None),
        }
    }

    /// Route returned ACL credits into `queue`. At most one registration;
    /// a second one is a contract violation.
    pub fn register_completed_packets(&self, queue: &'d CreditQueue) {
        let mut sink = self.credits_sink.borrow_mut();
        assert!(sink.is_none(), "completed-packets callback registered twice");
        *sink = Some(queue);
    }

    /// Wait for the startup interrogation to finish and return the record.
    pub async fn capabilities(&self) -> &Capabilities {
        self.caps.get().await
    }

    /// The record, if the startup interrogation has finished.
    pub fn try_capabilities(&self) -> Option<&Capabilities> {
        self.caps.try_get()
    }

    async fn interrogate(&self) -> Result<Capabilities, Error> {
        let hci = self.hci;

        hci.command(Reset).await?.to_result().map_err(Error::Controller)?;
        hci.command(SetEventMask::new(SetEventMask::DEFAULT))
            .await?
            .to_result()
            .map_err(Error::Controller)?;
        hci.command(LeSetEventMask::new(LeSetEventMask::DEFAULT))
            .await?
            .to_result()
            .map_err(Error::Controller)?;

        let (status, supported_commands) = hci.command(ReadLocalSupportedCommands).await?;
        status.to_result().map_err(Error::Controller)?;

        let (status, base_features) = hci.command(ReadLocalSupportedFeatures).await?;
        status.to_result().map_err(Error::Controller)?;
        let mut features: Vec<u64, MAX_FEATURE_PAGES> = Vec::new();
        unwrap!(features.push(base_features).ok());
        if bitmap_has(&supported_commands, opcode::READ_LOCAL_EXTENDED_FEATURES) {
            let mut page = 1;
            loop {
                let ret = hci.command(ReadLocalExtendedFeatures::new(page)).await?;
                ret.status.to_result().map_err(Error::Controller)?;
                if features.push(ret.extended_lmp_features).is_err() {
                    warn!("[controller] ignoring feature pages beyond {}", features.len() - 1);
                    break;
                }
                if page >= ret.maximum_page_number || page as usize >= MAX_FEATURE_PAGES - 1 {
                    break;
                }
                page += 1;
            }
        }

        let buffers = hci.command(ReadBufferSize).await?;
        buffers.status.to_result().map_err(Error::Controller)?;

        let le_buffers = hci.command(LeReadBufferSize).await?;
        le_buffers.status.to_result().map_err(Error::Controller)?;
        // Zero means the LE transport shares the classic buffer pool.
        let (le_acl_mtu, le_acl_buffers) =
            if le_buffers.le_acl_data_packet_length == 0 || le_buffers.total_num_le_acl_data_packets == 0 {
                (buffers.acl_data_packet_length, buffers.total_num_acl_data_packets)
            } else {
                (
                    le_buffers.le_acl_data_packet_length,
                    le_buffers.total_num_le_acl_data_packets as u16,
                )
            };

        let (status, le_features) = hci.command(LeReadLocalSupportedFeatures).await?;
        status.to_result().map_err(Error::Controller)?;

        let max_advertising_data_length =
            if bitmap_has(&supported_commands, opcode::LE_READ_MAXIMUM_ADVERTISING_DATA_LENGTH) {
                let (status, len) = hci.command(LeReadMaximumAdvertisingDataLength).await?;
                status.to_result().map_err(Error::Controller)?;
                len
            } else {
                LEGACY_ADV_DATA_LEN
            };

        // Last so the record is complete the moment this returns.
        let (status, addr) = hci.command(ReadBdAddr).await?;
        status.to_result().map_err(Error::Controller)?;

        Ok(Capabilities {
            addr,
            supported_commands,
            features,
            acl_mtu: buffers.acl_data_packet_length,
            acl_buffers: buffers.total_num_acl_data_packets,
            le_acl_mtu,
            le_acl_buffers,
            le_features,
            max_advertising_data_length,
        })
    }

    /// Run the startup interrogation, then forward completed-packet
    /// credits for the rest of the stack's lifetime.
    pub async fn run(&self) -> Result<(), Error> {
        let caps = self.interrogate().await?;
        info!(
            "[controller] {} acl {}x{} le {}x{}",
            caps.addr, caps.acl_buffers, caps.acl_mtu, caps.le_acl_buffers, caps.le_acl_mtu
        );
        let _ = self.caps.init(caps);

        loop {
            let event = self.events.receive().await;
            if event.code() != EventCode::NUMBER_OF_COMPLETED_PACKETS {
                warn!("[controller] unexpected event {:?}", event.code());
                continue;
            }
            let view = match NumberOfCompletedPackets::parse(event.params()) {
                Ok(view) => view,
                Err(e) => {
                    warn!("[controller] malformed completed-packets event: {:?}", e);
                    continue;
                }
            };
            let sink = *unwrap!(
                self.credits_sink.borrow().as_ref(),
                "completed-packets event with no registered callback"
            );
            for (handle, credits) in view.iter() {
                sink.post((handle, credits)).await;
            }
        }
    }
}

impl<'d, D: HciDriver> Module for Controller<'d, D> {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &CONTROLLER
    }

    fn dependencies(&self) -> &[&'static ModuleDescriptor] {
        &CONTROLLER_DEPS
    }

    fn start(&self) {
        self.hci
            .register_event_handler(EventCode::NUMBER_OF_COMPLETED_PACKETS, self.events);
    }

    fn stop(&self) {
        self.hci.unregister_event_handler(EventCode::NUMBER_OF_COMPLETED_PACKETS);
    }
}
