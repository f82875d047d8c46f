#![no_std]
#![allow(clippy::needless_lifetimes)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod fmt;

#[allow(missing_docs)]
pub mod codec;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod controller;
pub mod driver;
pub mod hci;
pub mod packet_pool;
pub mod pdu;
pub mod runtime;
pub mod scheduler;
#[allow(missing_docs)]
pub mod types;

#[cfg(test)]
pub(crate) mod mock_driver;

use embassy_futures::select::{select4, Either4};

use crate::connection_manager::{AclManager, LinkStorage};
use crate::controller::{Controller, CreditQueue};
use crate::driver::HciDriver;
use crate::hci::{EventQueue, HciLayer};
use crate::packet_pool::PacketPool;
use crate::runtime::{Module, ModuleRegistry};
use crate::types::cmd::{AsyncCommand, SyncCommand};
use crate::types::status::Status;

/// Errors returned by the host core.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Error encoding or decoding an HCI packet.
    Codec(codec::Error),
    /// The controller violated the HCI protocol (for example a command
    /// reply of the wrong kind, or for the wrong opcode).
    Protocol,
    /// The controller reported a non-success status.
    Controller(Status),
    /// The transport to the controller is gone.
    Transport,
    /// Resource not found.
    NotFound,
    /// Connection is disconnected.
    Disconnected,
    /// Invalid state.
    InvalidState,
    /// Out of memory.
    OutOfMemory,
    /// The operation would block.
    Busy,
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}

/// Errors surfaced by the host runners: either from the transport driver
/// or from the host itself.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostError<E> {
    /// Error from the HCI transport driver.
    Driver(E),
    /// Error from the host.
    Host(Error),
}

impl<E> From<Error> for HostError<E> {
    fn from(value: Error) -> Self {
        Self::Host(value)
    }
}

/// HostResources holds the caller-owned storage used by the host: one
/// slot per simultaneous connection plus the stack's internal task
/// queues.
pub struct HostResources<P: PacketPool, const CONNS: usize> {
    links: [LinkStorage<P>; CONNS],
    controller_events: EventQueue,
    manager_events: EventQueue,
    credits: CreditQueue,
}

impl<P: PacketPool, const CONNS: usize> Default for HostResources<P, CONNS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PacketPool, const CONNS: usize> HostResources<P, CONNS> {
    /// Create a new instance of host resources.
    pub const fn new() -> Self {
        Self {
            links: [const { LinkStorage::new() }; CONNS],
            controller_events: EventQueue::new(),
            manager_events: EventQueue::new(),
            credits: CreditQueue::new(),
        }
    }
}

/// Create a new instance of the host using the provided driver
/// implementation and resource configuration.
pub fn new<'d, D: HciDriver, P: PacketPool, const CONNS: usize>(
    driver: D,
    resources: &'d HostResources<P, CONNS>,
) -> Stack<'d, D, P> {
    Stack {
        hci: HciLayer::new(driver),
        links: &resources.links,
        controller_events: &resources.controller_events,
        manager_events: &resources.manager_events,
        credits: &resources.credits,
    }
}

/// Contains the host stack.
pub struct Stack<'d, D: HciDriver, P: PacketPool> {
    hci: HciLayer<'d, D>,
    links: &'d [LinkStorage<P>],
    controller_events: &'d EventQueue,
    manager_events: &'d EventQueue,
    credits: &'d CreditQueue,
}

impl<'d, D: HciDriver, P: PacketPool> Stack<'d, D, P> {
    /// Build the host. Call once.
    pub fn build(&'d self) -> Host<'d, D, P> {
        let controller = Controller::new(&self.hci, self.controller_events);
        controller.register_completed_packets(self.credits);
        let acl = AclManager::new(&self.hci, self.credits, self.links, self.manager_events);
        Host {
            stack: self,
            controller,
            acl,
        }
    }
}

/// Host components.
#[non_exhaustive]
pub struct Host<'d, D: HciDriver, P: PacketPool> {
    stack: &'d Stack<'d, D, P>,
    /// The controller module; capability reads after startup.
    pub controller: Controller<'d, D>,
    /// The connection management surface.
    pub acl: AclManager<'d, D, P>,
}

impl<'d, D: HciDriver, P: PacketPool> Host<'d, D, P> {
    /// The HCI layer: raw command submission, event subscription and the
    /// ACL queue endpoint.
    pub fn hci(&self) -> &HciLayer<'d, D> {
        &self.stack.hci
    }

    /// Run an HCI command and return its completion. Waits for the stack
    /// to finish initializing.
    pub async fn command<C: SyncCommand>(&self, cmd: C) -> Result<C::Return, Error> {
        let _ = self.controller.capabilities().await;
        self.stack.hci.command(cmd).await
    }

    /// Run an HCI command that is answered with Command Status.
    pub async fn async_command<C: AsyncCommand>(&self, cmd: C) -> Result<(), Error> {
        let _ = self.controller.capabilities().await;
        self.stack.hci.async_command(cmd).await
    }

    /// Bring the modules up in dependency order and drive them until one
    /// fails, then stop them in reverse order.
    pub async fn run(&self) -> Result<(), HostError<D::Error>> {
        let registry = ModuleRegistry::new();
        {
            let modules: [&dyn Module; 3] = [&self.stack.hci, &self.controller, &self.acl];
            registry.start(&modules);
        }

        let hci = &self.stack.hci;
        let controller_run = async { self.controller.run().await.map_err(HostError::Host) };
        let acl_run = async {
            let caps = self.controller.capabilities().await;
            self.acl.run(caps).await.map_err(HostError::Host)
        };
        let result = match select4(hci.run_rx(), hci.run_tx(), controller_run, acl_run).await {
            Either4::First(result) => result,
            Either4::Second(result) => result,
            Either4::Third(result) => result,
            Either4::Fourth(result) => result,
        };

        registry.stop_all();
        result
    }
}

pub mod prelude {
    //! Convenience include of most commonly used types.
    pub use crate::connection::AclConnection;
    pub use crate::connection_manager::{AclQueueUpEnd, ConnectionEvent, LinkEvent, LinkStorage};
    pub use crate::controller::{Capabilities, Controller};
    pub use crate::driver::{HciDriver, HciPacketKind};
    pub use crate::hci::{AclQueueEnd, CommandInterface, EventQueue, HciLayer, ReplyKind};
    pub use crate::packet_pool::{DefaultPacketPool, Packet, PacketPool};
    pub use crate::pdu::Pdu;
    pub use crate::runtime::{Module, ModuleDescriptor, ModuleRegistry, TaskQueue};
    pub use crate::scheduler::RoundRobinScheduler;
    pub use crate::types::acl::{AclPacket, BoundaryFlag};
    pub use crate::types::event::{EventCode, EventPacket, LeSubevent};
    pub use crate::types::status::{DisconnectReason, Status};
    pub use crate::types::{BdAddr, ConnHandle, LinkKind};
    pub use crate::{Error, Host, HostError, HostResources, Stack};
}
