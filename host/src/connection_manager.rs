//! ACL connection lifecycle management.
//!
//! Translates connection-related HCI events into link slots, keeps the
//! scheduler's registration map in sync with controller handles, and hands
//! upper layers a bidirectional per-connection queue endpoint.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::waitqueue::WakerRegistration;
use heapless::{Deque, Vec};

use crate::config;
use crate::connection::AclConnection;
use crate::controller::{Capabilities, CreditQueue, CONTROLLER};
use crate::driver::HciDriver;
use crate::hci::{CommandInterface, EventQueue, HciLayer, HCI_LAYER};
use crate::packet_pool::PacketPool;
use crate::pdu::Pdu;
use crate::runtime::{Module, ModuleDescriptor};
use crate::scheduler::RoundRobinScheduler;
use crate::types::acl::AclPacket;
use crate::types::cmd::{
    AcceptConnectionRequest, CreateConnection, CreateConnectionCancel, Disconnect, RejectConnectionRequest,
};
use crate::types::event::{
    ConnectionComplete, ConnectionRequest, DisconnectionComplete, EventCode, EventPacket, LeConnectionComplete,
    LeMeta, LeSubevent,
};
use crate::types::status::{DisconnectReason, Status};
use crate::types::{BdAddr, ConnHandle, LinkKind};
use crate::Error;

/// Descriptor of the ACL manager module.
pub static ACL_MANAGER: ModuleDescriptor = ModuleDescriptor::new("acl_manager");

static ACL_MANAGER_DEPS: [&ModuleDescriptor; 2] = [&HCI_LAYER, &CONTROLLER];

/// Lifecycle notifications delivered on a link's event queue.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionEvent {
    /// The link went down.
    Disconnected {
        /// The controller's reason for the disconnection.
        reason: Status,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Free,
    Connected,
    DisconnectRequest(DisconnectReason),
    Disconnecting,
    Disconnected,
}

struct LinkMeta {
    state: LinkState,
    handle: Option<ConnHandle>,
    peer: BdAddr,
    kind: LinkKind,
    claimed: bool,
    released: bool,
}

impl LinkMeta {
    const fn new() -> Self {
        Self {
            state: LinkState::Free,
            handle: None,
            peer: BdAddr::new([0; 6]),
            kind: LinkKind::Classic,
            claimed: false,
            released: false,
        }
    }
}

/// Storage for one ACL link: the bidirectional payload queue, the
/// lifecycle event queue, and the slot metadata.
pub struct LinkStorage<P: PacketPool> {
    outbound: Channel<NoopRawMutex, Pdu<P::Packet>, { config::LINK_TX_QUEUE_SIZE }>,
    inbound: Channel<NoopRawMutex, AclPacket, { config::LINK_RX_QUEUE_SIZE }>,
    events: Channel<NoopRawMutex, ConnectionEvent, { config::CONNECTION_EVENT_QUEUE_SIZE }>,
    meta: RefCell<LinkMeta>,
}

impl<P: PacketPool> Default for LinkStorage<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PacketPool> LinkStorage<P> {
    /// An unoccupied link slot.
    pub const fn new() -> Self {
        Self {
            outbound: Channel::new(),
            inbound: Channel::new(),
            events: Channel::new(),
            meta: RefCell::new(LinkMeta::new()),
        }
    }

    /// The end the scheduler dequeues outbound payloads from.
    pub(crate) fn down_end(&self) -> AclQueueDownEnd<'_, P> {
        AclQueueDownEnd { storage: self }
    }

    pub(crate) fn try_send_outbound(&self, pdu: Pdu<P::Packet>) -> Result<(), Pdu<P::Packet>> {
        self.outbound.try_send(pdu).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(pdu) => pdu,
        })
    }
}

/// The scheduler-facing end of a link's outbound queue.
pub struct AclQueueDownEnd<'d, P: PacketPool> {
    storage: &'d LinkStorage<P>,
}

impl<'d, P: PacketPool> AclQueueDownEnd<'d, P> {
    pub(crate) fn poll_dequeue(&self, cx: Option<&mut Context<'_>>) -> Poll<Pdu<P::Packet>> {
        match cx {
            Some(cx) => self.storage.outbound.poll_receive(cx),
            None => match self.storage.outbound.try_receive() {
                Ok(pdu) => Poll::Ready(pdu),
                Err(_) => Poll::Pending,
            },
        }
    }
}

/// The upper-layer end of a link's queues: enqueue outbound payloads,
/// dequeue inbound fragments.
#[derive(Clone, Copy)]
pub struct AclQueueUpEnd<'d, P: PacketPool> {
    storage: &'d LinkStorage<P>,
}

impl<'d, P: PacketPool> AclQueueUpEnd<'d, P> {
    /// Enqueue an upper-layer payload for transmission.
    pub async fn send(&self, pdu: Pdu<P::Packet>) {
        self.storage.outbound.send(pdu).await
    }

    /// Enqueue a payload without waiting; hands it back if the queue is
    /// full.
    pub fn try_send(&self, pdu: Pdu<P::Packet>) -> Result<(), Pdu<P::Packet>> {
        self.storage.try_send_outbound(pdu)
    }

    /// Dequeue the next inbound fragment.
    pub async fn receive(&self) -> AclPacket {
        self.storage.inbound.receive().await
    }

    /// Poll for the next inbound fragment.
    pub fn poll_receive(&self, cx: &mut Context<'_>) -> Poll<AclPacket> {
        self.storage.inbound.poll_receive(cx)
    }
}

/// What the connection surface yields next.
pub enum LinkEvent<'d, D: HciDriver, P: PacketPool> {
    /// A connection reached the controller and is live.
    Up(AclConnection<'d, D, P>),
    /// A connection attempt failed.
    ConnectFailed { peer: BdAddr, reason: Status },
}

struct ManagerState {
    connecting: Vec<BdAddr, { config::MAX_CONNECTIONS }>,
    failed: Deque<(BdAddr, Status), { config::MAX_CONNECTIONS }>,
    accept_waker: WakerRegistration,
    disconnect_waker: WakerRegistration,
}

/// The ACL connection manager module. Owns the round-robin scheduler its
/// links dispatch through.
pub struct AclManager<'d, D: HciDriver, P: PacketPool> {
    hci: &'d HciLayer<'d, D>,
    scheduler: RoundRobinScheduler<'d, P>,
    links: &'d [LinkStorage<P>],
    events: &'d EventQueue,
    state: RefCell<ManagerState>,
}

impl<'d, D: HciDriver, P: PacketPool> AclManager<'d, D, P> {
    /// `credits` must be the queue registered with the controller's
    /// completed-packets forwarding.
    pub fn new(
        hci: &'d HciLayer<'d, D>,
        credits: &'d CreditQueue,
        links: &'d [LinkStorage<P>],
        events: &'d EventQueue,
    ) -> Self {
        Self {
            hci,
            scheduler: RoundRobinScheduler::new(credits, hci.acl_queue_end()),
            links,
            events,
            state: RefCell::new(ManagerState {
                connecting: Vec::new(),
                failed: Deque::new(),
                accept_waker: WakerRegistration::new(),
                disconnect_waker: WakerRegistration::new(),
            }),
        }
    }

    /// The scheduler dispatching this manager's links.
    pub fn scheduler(&self) -> &RoundRobinScheduler<'d, P> {
        &self.scheduler
    }

    /// Initiate a classic connection to `peer`.
    pub async fn create_connection(&self, peer: BdAddr) -> Result<(), Error> {
        {
            let mut state = self.state.borrow_mut();
            if !state.connecting.contains(&peer) && state.connecting.push(peer).is_err() {
                return Err(Error::OutOfMemory);
            }
        }
        let result = self
            .hci
            .acl_connection_interface()
            .async_command(CreateConnection::new(peer))
            .await;
        if result.is_err() {
            self.state.borrow_mut().connecting.retain(|p| *p != peer);
        }
        result
    }

    /// Cancel an in-flight connection attempt.
    pub async fn cancel_connect(&self, peer: BdAddr) -> Result<(), Error> {
        {
            let mut state = self.state.borrow_mut();
            if !state.connecting.contains(&peer) {
                info!("[acl] no connection attempt to {} to cancel", peer);
                return Ok(());
            }
            state.connecting.retain(|p| *p != peer);
        }
        let (status, _addr) = self
            .hci
            .acl_connection_interface()
            .command(CreateConnectionCancel::new(peer))
            .await?;
        status.to_result().map_err(Error::Controller)
    }

    /// Wait for the next connection outcome: a live connection (locally or
    /// remotely initiated) or a failed attempt.
    pub async fn next(&'d self) -> LinkEvent<'d, D, P> {
        poll_fn(|cx| {
            let mut state = self.state.borrow_mut();
            if let Some((peer, reason)) = state.failed.pop_front() {
                return Poll::Ready(LinkEvent::ConnectFailed { peer, reason });
            }
            for (index, storage) in self.links.iter().enumerate() {
                let mut meta = storage.meta.borrow_mut();
                if meta.state == LinkState::Connected && !meta.claimed {
                    meta.claimed = true;
                    return Poll::Ready(LinkEvent::Up(AclConnection::new(index as u8, self)));
                }
            }
            state.accept_waker.register(cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Drive the manager and its scheduler, with credit pools sized from
    /// the controller record.
    pub async fn run(&self, caps: &Capabilities) -> Result<(), Error> {
        match select(self.scheduler.run(caps), self.manage()).await {
            Either::First(result) => result,
            Either::Second(result) => result,
        }
    }

    /// Process lifecycle events, route inbound fragments, and issue
    /// requested disconnects.
    async fn manage(&self) -> Result<(), Error> {
        let interface = self.hci.acl_connection_interface();
        let acl_end = self.hci.acl_queue_end();
        loop {
            match select3(
                self.events.receive(),
                acl_end.dequeue(),
                poll_fn(|cx| self.poll_disconnect_request(cx)),
            )
            .await
            {
                Either3::First(event) => self.handle_event(&interface, event).await?,
                Either3::Second(packet) => self.route_inbound(packet),
                Either3::Third((handle, reason)) => {
                    match interface.async_command(Disconnect::new(handle, reason)).await {
                        Ok(()) => {}
                        // Already gone; the disconnection event will clean up.
                        Err(Error::Controller(status)) if status == Status::UNKNOWN_CONN_IDENTIFIER => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn poll_disconnect_request(&self, cx: &mut Context<'_>) -> Poll<(ConnHandle, DisconnectReason)> {
        let mut state = self.state.borrow_mut();
        for storage in self.links.iter() {
            let mut meta = storage.meta.borrow_mut();
            if let LinkState::DisconnectRequest(reason) = meta.state {
                meta.state = LinkState::Disconnecting;
                return Poll::Ready((unwrap!(meta.handle), reason));
            }
        }
        state.disconnect_waker.register(cx.waker());
        Poll::Pending
    }

    async fn handle_event(&self, interface: &CommandInterface<'_, 'd, D>, event: EventPacket) -> Result<(), Error> {
        match event.code() {
            EventCode::CONNECTION_COMPLETE => match ConnectionComplete::parse(event.params()) {
                Ok(complete) => {
                    self.on_connection(
                        interface,
                        LinkKind::Classic,
                        complete.status,
                        complete.handle,
                        complete.bd_addr,
                    )
                    .await?;
                }
                Err(e) => warn!("[acl] malformed connection complete: {:?}", e),
            },
            EventCode::DISCONNECTION_COMPLETE => match DisconnectionComplete::parse(event.params()) {
                Ok(complete) => self.on_disconnection(complete),
                Err(e) => warn!("[acl] malformed disconnection complete: {:?}", e),
            },
            EventCode::CONNECTION_REQUEST => match ConnectionRequest::parse(event.params()) {
                Ok(request) => self.on_incoming_connection(interface, request).await?,
                Err(e) => warn!("[acl] malformed connection request: {:?}", e),
            },
            EventCode::LE_META => match LeMeta::parse(event.params()).and_then(|meta| {
                assert!(meta.subevent == LeSubevent::CONNECTION_COMPLETE);
                LeConnectionComplete::parse(meta.params)
            }) {
                Ok(complete) => {
                    self.on_connection(interface, LinkKind::Le, complete.status, complete.handle, complete.peer_addr)
                        .await?;
                }
                Err(e) => warn!("[acl] malformed le connection complete: {:?}", e),
            },
            code => warn!("[acl] unexpected event {:?}", code),
        }
        Ok(())
    }

    async fn on_connection(
        &self,
        interface: &CommandInterface<'_, 'd, D>,
        kind: LinkKind,
        status: Status,
        handle: ConnHandle,
        peer: BdAddr,
    ) -> Result<(), Error> {
        if kind == LinkKind::Classic {
            let mut state = self.state.borrow_mut();
            let known = state.connecting.contains(&peer);
            if !known {
                warn!("[acl] connection complete for {} without a prior request", peer);
            }
            state.connecting.retain(|p| *p != peer);
        }

        if let Err(reason) = status.to_result() {
            debug!("[acl] connection to {} failed: {:?}", peer, reason);
            let mut state = self.state.borrow_mut();
            if state.failed.push_back((peer, reason)).is_err() {
                warn!("[acl] dropping connect failure report for {}", peer);
            }
            state.accept_waker.wake();
            return Ok(());
        }

        for storage in self.links.iter() {
            let meta = storage.meta.borrow();
            assert!(
                meta.state == LinkState::Free || meta.handle != Some(handle),
                "controller reused live handle {:?}",
                handle
            );
        }

        let Some((index, storage)) = self
            .links
            .iter()
            .enumerate()
            .find(|(_, s)| s.meta.borrow().state == LinkState::Free && !s.meta.borrow().claimed)
        else {
            warn!("[acl] no free link slot for {}, disconnecting", peer);
            return interface
                .async_command(Disconnect::new(handle, DisconnectReason::RemoteDeviceTerminatedConnLowResources))
                .await;
        };

        storage.outbound.clear();
        storage.inbound.clear();
        storage.events.clear();
        {
            let mut meta = storage.meta.borrow_mut();
            *meta = LinkMeta {
                state: LinkState::Connected,
                handle: Some(handle),
                peer,
                kind,
                claimed: false,
                released: false,
            };
        }
        self.scheduler.register(kind, handle, storage.down_end());
        debug!("[acl] link {:?} to {} up (slot {})", handle, peer, index);
        self.state.borrow_mut().accept_waker.wake();
        Ok(())
    }

    fn on_disconnection(&self, complete: DisconnectionComplete) {
        if let Err(e) = complete.status.to_result() {
            error!(
                "[acl] disconnection complete for {:?} with status {:?}",
                complete.handle, e
            );
            return;
        }
        let Some((index, storage)) = self.find_by_handle(complete.handle) else {
            warn!("[acl] disconnection complete for unknown handle {:?}", complete.handle);
            return;
        };
        let released = {
            let mut meta = storage.meta.borrow_mut();
            meta.state = LinkState::Disconnected;
            meta.released
        };
        self.scheduler.set_disconnect(complete.handle);
        if storage
            .events
            .try_send(ConnectionEvent::Disconnected {
                reason: complete.reason,
            })
            .is_err()
        {
            warn!("[acl] dropping disconnect notification for {:?}", complete.handle);
        }
        if released {
            self.cleanup(index as u8);
        }
    }

    async fn on_incoming_connection(
        &self,
        interface: &CommandInterface<'_, 'd, D>,
        request: ConnectionRequest,
    ) -> Result<(), Error> {
        let has_slot = self
            .links
            .iter()
            .any(|s| s.meta.borrow().state == LinkState::Free && !s.meta.borrow().claimed);
        if !has_slot {
            debug!("[acl] rejecting connection from {}", request.bd_addr);
            return interface
                .async_command(RejectConnectionRequest::new(request.bd_addr, Status::LIMITED_RESOURCES))
                .await;
        }
        {
            let mut state = self.state.borrow_mut();
            if !state.connecting.contains(&request.bd_addr) {
                let _ = state.connecting.push(request.bd_addr);
            }
        }
        interface
            .async_command(AcceptConnectionRequest::new(request.bd_addr, true))
            .await
    }

    fn route_inbound(&self, packet: AclPacket) {
        let Some((_, storage)) = self.find_by_handle(packet.handle) else {
            info!(
                "[acl] dropping {} byte fragment for unknown handle {:?}",
                packet.data.len(),
                packet.handle
            );
            return;
        };
        if storage.meta.borrow().state != LinkState::Connected {
            info!("[acl] dropping fragment for closing handle {:?}", packet.handle);
            return;
        }
        if storage.inbound.try_send(packet).is_err() {
            warn!("[acl] inbound queue full, dropping fragment");
        }
    }

    fn find_by_handle(&self, handle: ConnHandle) -> Option<(usize, &'d LinkStorage<P>)> {
        self.links.iter().enumerate().find(|(_, s)| {
            let meta = s.meta.borrow();
            meta.state != LinkState::Free && meta.handle == Some(handle)
        })
    }

    fn cleanup(&self, index: u8) {
        let storage = &self.links[index as usize];
        let handle = {
            let meta = storage.meta.borrow();
            assert!(meta.state == LinkState::Disconnected, "cleanup of a live link");
            unwrap!(meta.handle)
        };
        self.scheduler.unregister(handle);
        *storage.meta.borrow_mut() = LinkMeta::new();
    }

    pub(crate) fn peer_address(&self, index: u8) -> BdAddr {
        self.links[index as usize].meta.borrow().peer
    }

    pub(crate) fn link_kind(&self, index: u8) -> LinkKind {
        self.links[index as usize].meta.borrow().kind
    }

    pub(crate) fn handle(&self, index: u8) -> ConnHandle {
        unwrap!(self.links[index as usize].meta.borrow().handle)
    }

    pub(crate) fn is_connected(&self, index: u8) -> bool {
        self.links[index as usize].meta.borrow().state == LinkState::Connected
    }

    pub(crate) fn up_end(&self, index: u8) -> AclQueueUpEnd<'d, P> {
        AclQueueUpEnd {
            storage: &self.links[index as usize],
        }
    }

    pub(crate) fn request_disconnect(&self, index: u8, reason: DisconnectReason) {
        let storage = &self.links[index as usize];
        let mut meta = storage.meta.borrow_mut();
        if meta.state == LinkState::Connected {
            meta.state = LinkState::DisconnectRequest(reason);
            self.state.borrow_mut().disconnect_waker.wake();
        } else {
            info!("[acl] disconnect request for a link that is already closing");
        }
    }

    pub(crate) async fn wait_disconnected(&self, index: u8) -> Status {
        let storage = &self.links[index as usize];
        let ConnectionEvent::Disconnected { reason } = storage.events.receive().await;
        reason
    }

    /// Release an upper-layer reference. Must only follow disconnection.
    pub(crate) fn finish(&self, index: u8) {
        let state = self.links[index as usize].meta.borrow().state;
        assert!(
            state == LinkState::Disconnected,
            "finish of a link that has not disconnected"
        );
        self.release(index);
    }

    /// Drop an upper-layer reference, requesting disconnection if the link
    /// is still up. The slot is recycled once the link is both released
    /// and disconnected.
    pub(crate) fn release(&self, index: u8) {
        let storage = &self.links[index as usize];
        let state = {
            let mut meta = storage.meta.borrow_mut();
            meta.released = true;
            meta.state
        };
        match state {
            LinkState::Connected => self.request_disconnect(index, DisconnectReason::RemoteUserTerminatedConn),
            LinkState::Disconnected => self.cleanup(index),
            _ => {}
        }
    }
}

impl<'d, D: HciDriver, P: PacketPool> Module for AclManager<'d, D, P> {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &ACL_MANAGER
    }

    fn dependencies(&self) -> &[&'static ModuleDescriptor] {
        &ACL_MANAGER_DEPS
    }

    fn start(&self) {
        self.hci.register_event_handler(EventCode::CONNECTION_COMPLETE, self.events);
        self.hci.register_event_handler(EventCode::CONNECTION_REQUEST, self.events);
        self.hci
            .register_event_handler(EventCode::DISCONNECTION_COMPLETE, self.events);
        self.hci
            .register_le_event_handler(LeSubevent::CONNECTION_COMPLETE, self.events);
    }

    fn stop(&self) {
        self.hci.unregister_event_handler(EventCode::CONNECTION_COMPLETE);
        self.hci.unregister_event_handler(EventCode::CONNECTION_REQUEST);
        self.hci.unregister_event_handler(EventCode::DISCONNECTION_COMPLETE);
        self.hci.unregister_le_event_handler(LeSubevent::CONNECTION_COMPLETE);
    }
}
