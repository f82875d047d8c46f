//! A handle to an established ACL connection.

use crate::connection_manager::{AclManager, AclQueueUpEnd};
use crate::driver::HciDriver;
use crate::packet_pool::PacketPool;
use crate::types::status::{DisconnectReason, Status};
use crate::types::{BdAddr, ConnHandle, LinkKind};

/// An established ACL connection.
///
/// Dropping the handle requests disconnection; the underlying slot is
/// recycled once the controller confirms the link is down.
pub struct AclConnection<'d, D: HciDriver, P: PacketPool> {
    index: u8,
    manager: &'d AclManager<'d, D, P>,
}

impl<'d, D: HciDriver, P: PacketPool> AclConnection<'d, D, P> {
    pub(crate) fn new(index: u8, manager: &'d AclManager<'d, D, P>) -> Self {
        Self { index, manager }
    }

    /// The peer's device address.
    pub fn address(&self) -> BdAddr {
        self.manager.peer_address(self.index)
    }

    /// Which transport the connection runs on.
    pub fn kind(&self) -> LinkKind {
        self.manager.link_kind(self.index)
    }

    /// The controller-assigned connection handle.
    pub fn handle(&self) -> ConnHandle {
        self.manager.handle(self.index)
    }

    /// Whether the link is still up.
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected(self.index)
    }

    /// The bidirectional queue endpoint for this connection's ACL payloads.
    pub fn queue_end(&self) -> AclQueueUpEnd<'d, P> {
        self.manager.up_end(self.index)
    }

    /// Ask the controller to terminate the connection. The outcome arrives
    /// through [`Self::disconnected`].
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.manager.request_disconnect(self.index, reason);
    }

    /// Wait until the connection is down and return the controller's
    /// reason.
    pub async fn disconnected(&self) -> Status {
        self.manager.wait_disconnected(self.index).await
    }

    /// Release the connection after disconnection. Releasing a live
    /// connection is a programming error; use [`Self::disconnect`] (or
    /// drop the handle) first.
    pub fn finish(self) {
        self.manager.finish(self.index);
        core::mem::forget(self);
    }
}

impl<'d, D: HciDriver, P: PacketPool> Drop for AclConnection<'d, D, P> {
    fn drop(&mut self) {
        self.manager.release(self.index);
    }
}
