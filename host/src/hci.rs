//! The HCI layer.
//!
//! Turns the byte-level [`HciDriver`] into a typed interface with four
//! surfaces: command submission with credit-based pacing and reply pairing,
//! event subscription by event code, a bidirectional ACL fragment queue,
//! and opcode-filtered command interfaces for specific callers.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::waitqueue::WakerRegistration;
use heapless::{FnvIndexMap, Vec};

use crate::config;
use crate::driver::{HciDriver, HciPacketKind};
use crate::runtime::{Module, ModuleDescriptor, TaskQueue};
use crate::types::acl::AclPacket;
use crate::types::cmd::{AsyncCommand, Command, SyncCommand, MAX_COMMAND_SIZE};
use crate::types::event::{CommandComplete, CommandStatus, EventCode, EventPacket, LeMeta, LeSubevent, MAX_EVENT_SIZE};
use crate::types::opcode::{self, Opcode};
use crate::{Error, HostError};

/// Descriptor of the HCI layer module.
pub static HCI_LAYER: ModuleDescriptor = ModuleDescriptor::new("hci_layer");

/// Task queue carrying events to a subscriber.
pub type EventQueue = TaskQueue<EventPacket, { config::EVENT_QUEUE_SIZE }>;

/// The kind of reply a submitted command has declared it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplyKind {
    /// The controller answers with Command Complete.
    Complete,
    /// The controller answers with Command Status.
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Queued,
    Issued,
    Done,
    /// The submitter went away while the command was at the controller.
    AbandonedIssued,
}

struct CommandSlot {
    seq: u64,
    state: SlotState,
    opcode: Opcode,
    expects: ReplyKind,
    bytes: Vec<u8, MAX_COMMAND_SIZE>,
    reply: Option<Result<EventPacket, Error>>,
    waker: WakerRegistration,
}

impl CommandSlot {
    const fn new() -> Self {
        Self {
            seq: 0,
            state: SlotState::Free,
            opcode: Opcode::NONE,
            expects: ReplyKind::Complete,
            bytes: Vec::new(),
            reply: None,
            waker: WakerRegistration::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommandToken {
    index: usize,
    seq: u64,
}

struct PipelineState {
    slots: [CommandSlot; config::COMMAND_QUEUE_SIZE],
    next_seq: u64,
    credits: u8,
    closed: bool,
    alloc_waker: WakerRegistration,
    tx_waker: WakerRegistration,
}

impl PipelineState {
    fn lowest_seq(&self, filter: fn(SlotState) -> bool) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| filter(s.state))
            .min_by_key(|(_, s)| s.seq)
            .map(|(index, _)| index)
    }
}

/// The HCI command pipeline.
///
/// At most `credits` commands are outstanding at the controller at a time;
/// the rest queue in submission order.
struct CommandPipeline {
    state: RefCell<PipelineState>,
}

impl CommandPipeline {
    fn new() -> Self {
        Self {
            state: RefCell::new(PipelineState {
                slots: [const { CommandSlot::new() }; config::COMMAND_QUEUE_SIZE],
                next_seq: 0,
                // The controller accepts one command until it reports
                // otherwise.
                credits: 1,
                closed: false,
                alloc_waker: WakerRegistration::new(),
                tx_waker: WakerRegistration::new(),
            }),
        }
    }

    fn poll_alloc(
        &self,
        opcode: Opcode,
        expects: ReplyKind,
        bytes: &[u8],
        cx: Option<&mut Context<'_>>,
    ) -> Poll<Result<CommandToken, Error>> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Poll::Ready(Err(Error::Transport));
        }
        let Some(index) = state.slots.iter().position(|s| s.state == SlotState::Free) else {
            if let Some(cx) = cx {
                state.alloc_waker.register(cx.waker());
            }
            return Poll::Pending;
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        let slot = &mut state.slots[index];
        slot.seq = seq;
        slot.state = SlotState::Queued;
        slot.opcode = opcode;
        slot.expects = expects;
        slot.bytes.clear();
        unwrap!(slot.bytes.extend_from_slice(bytes).ok(), "command exceeds maximum size");
        slot.reply = None;
        state.tx_waker.wake();
        Poll::Ready(Ok(CommandToken { index, seq }))
    }

    /// Poll for the next command to put on the wire. Consumes one command
    /// credit.
    fn poll_issue(&self, cx: Option<&mut Context<'_>>) -> Poll<Vec<u8, MAX_COMMAND_SIZE>> {
        let mut state = self.state.borrow_mut();
        if state.credits > 0 {
            if let Some(index) = state.lowest_seq(|s| s == SlotState::Queued) {
                state.credits -= 1;
                let slot = &mut state.slots[index];
                slot.state = SlotState::Issued;
                trace!("[hci] issuing command {:?}", slot.opcode);
                return Poll::Ready(slot.bytes.clone());
            }
        }
        if let Some(cx) = cx {
            state.tx_waker.register(cx.waker());
        }
        Poll::Pending
    }

    fn poll_reply(&self, token: CommandToken, cx: Option<&mut Context<'_>>) -> Poll<Result<EventPacket, Error>> {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.slots[token.index];
        assert!(slot.seq == token.seq, "command slot recycled under its owner");
        if slot.state == SlotState::Done {
            let reply = unwrap!(slot.reply.take());
            slot.state = SlotState::Free;
            state.alloc_waker.wake();
            Poll::Ready(reply)
        } else {
            if let Some(cx) = cx {
                slot.waker.register(cx.waker());
            }
            Poll::Pending
        }
    }

    /// Release a slot whose submitter is going away.
    fn abandon(&self, token: CommandToken) {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.slots[token.index];
        if slot.seq != token.seq {
            return;
        }
        match slot.state {
            SlotState::Queued | SlotState::Done => {
                slot.state = SlotState::Free;
                slot.reply = None;
                state.alloc_waker.wake();
            }
            SlotState::Issued => slot.state = SlotState::AbandonedIssued,
            _ => {}
        }
    }

    /// Pair a Command Complete or Command Status with the front outstanding
    /// command and restore the credits it carries.
    fn on_reply(&self, kind: ReplyKind, opcode: Opcode, num_hci_command_packets: u8, event: &EventPacket) {
        let mut state = self.state.borrow_mut();
        state.credits = state.credits.saturating_add(num_hci_command_packets);
        if opcode == Opcode::NONE {
            // A credit-only update; it answers no command, so any
            // outstanding slot stays untouched.
            state.tx_waker.wake();
            return;
        }
        let mut freed = false;
        loop {
            let Some(index) = state.lowest_seq(|s| matches!(s, SlotState::Issued | SlotState::AbandonedIssued)) else {
                warn!("[hci] reply for {:?} with no outstanding command", opcode);
                break;
            };
            let slot = &mut state.slots[index];
            let abandoned = slot.state == SlotState::AbandonedIssued;
            if slot.opcode != opcode {
                // The controller replied to something else; the front
                // command will never complete.
                warn!("[hci] expected reply for {:?}, got {:?}", slot.opcode, opcode);
                if abandoned {
                    slot.state = SlotState::Free;
                    freed = true;
                } else {
                    slot.state = SlotState::Done;
                    slot.reply = Some(Err(Error::Protocol));
                    slot.waker.wake();
                }
                continue;
            }
            if abandoned {
                slot.state = SlotState::Free;
                freed = true;
            } else if slot.expects != kind {
                warn!("[hci] command {:?} completed with the wrong reply kind", opcode);
                slot.state = SlotState::Done;
                slot.reply = Some(Err(Error::Protocol));
                slot.waker.wake();
            } else {
                slot.state = SlotState::Done;
                slot.reply = Some(Ok(event.clone()));
                slot.waker.wake();
            }
            break;
        }
        state.tx_waker.wake();
        if freed {
            state.alloc_waker.wake();
        }
    }

    /// Fail every pending command and refuse new ones.
    fn close(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        for slot in state.slots.iter_mut() {
            match slot.state {
                SlotState::Queued | SlotState::Issued => {
                    slot.state = SlotState::Done;
                    slot.reply = Some(Err(Error::Transport));
                    slot.waker.wake();
                }
                SlotState::AbandonedIssued => slot.state = SlotState::Free,
                _ => {}
            }
        }
        state.alloc_waker.wake();
        state.tx_waker.wake();
    }
}

struct EventTables<'d> {
    handlers: FnvIndexMap<u8, &'d EventQueue, { config::MAX_EVENT_HANDLERS }>,
    le_handlers: FnvIndexMap<u8, &'d EventQueue, { config::MAX_EVENT_HANDLERS }>,
}

/// The HCI layer module.
pub struct HciLayer<'d, D: HciDriver> {
    pub(crate) driver: D,
    cmd: CommandPipeline,
    events: RefCell<EventTables<'d>>,
    acl_out: Channel<NoopRawMutex, AclPacket, { config::ACL_TX_QUEUE_SIZE }>,
    acl_in: Channel<NoopRawMutex, AclPacket, { config::ACL_RX_QUEUE_SIZE }>,
}

impl<'d, D: HciDriver> HciLayer<'d, D> {
    /// A fresh HCI layer over `driver`.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            cmd: CommandPipeline::new(),
            events: RefCell::new(EventTables {
                handlers: FnvIndexMap::new(),
                le_handlers: FnvIndexMap::new(),
            }),
            acl_out: Channel::new(),
            acl_in: Channel::new(),
        }
    }

    /// Submit a serialized command, declaring the reply kind it expects,
    /// and wait for that reply.
    pub async fn enqueue_command(
        &self,
        opcode: Opcode,
        expects: ReplyKind,
        bytes: &[u8],
    ) -> Result<EventPacket, Error> {
        let token = poll_fn(|cx| self.cmd.poll_alloc(opcode, expects, bytes, Some(cx))).await?;
        let guard = OnAbandon {
            pipeline: &self.cmd,
            token,
        };
        let reply = poll_fn(|cx| self.cmd.poll_reply(token, Some(cx))).await;
        guard.defuse();
        reply
    }

    /// Run a command that completes with Command Complete and decode its
    /// return parameters.
    pub async fn command<C: SyncCommand>(&self, cmd: C) -> Result<C::Return, Error> {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let len = cmd.encode(&mut buf)?;
        let reply = self.enqueue_command(C::OPCODE, ReplyKind::Complete, &buf[..len]).await?;
        let complete = CommandComplete::parse(reply.params())?;
        Ok(C::decode_return(complete.return_params)?)
    }

    /// Run a command that completes with Command Status. A non-success
    /// status surfaces as [`Error::Controller`].
    pub async fn async_command<C: AsyncCommand>(&self, cmd: C) -> Result<(), Error> {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let len = cmd.encode(&mut buf)?;
        let reply = self.enqueue_command(C::OPCODE, ReplyKind::Status, &buf[..len]).await?;
        let status = CommandStatus::parse(reply.params())?;
        status.status.to_result().map_err(Error::Controller)
    }

    /// Subscribe `queue` to an event code. At most one subscriber per code;
    /// a second subscription is a contract violation.
    pub fn register_event_handler(&self, code: EventCode, queue: &'d EventQueue) {
        assert!(
            code != EventCode::COMMAND_COMPLETE && code != EventCode::COMMAND_STATUS,
            "command replies are handled by the command pipeline"
        );
        let mut events = self.events.borrow_mut();
        match events.handlers.insert(code.raw(), queue) {
            Ok(None) => {}
            Ok(Some(_)) => panic!("second handler registered for event {:?}", code),
            Err(_) => panic!("event handler table full"),
        }
    }

    /// Drop the subscription for an event code, if any.
    pub fn unregister_event_handler(&self, code: EventCode) {
        self.events.borrow_mut().handlers.remove(&code.raw());
    }

    /// Subscribe `queue` to an LE meta subevent code.
    pub fn register_le_event_handler(&self, subevent: LeSubevent, queue: &'d EventQueue) {
        let mut events = self.events.borrow_mut();
        match events.le_handlers.insert(subevent.raw(), queue) {
            Ok(None) => {}
            Ok(Some(_)) => panic!("second handler registered for LE subevent {:?}", subevent),
            Err(_) => panic!("LE event handler table full"),
        }
    }

    /// Drop the subscription for an LE meta subevent code, if any.
    pub fn unregister_le_event_handler(&self, subevent: LeSubevent) {
        self.events.borrow_mut().le_handlers.remove(&subevent.raw());
    }

    /// The ACL side of the HCI layer: fragments in, fragments out.
    pub fn acl_queue_end(&self) -> AclQueueEnd<'_> {
        AclQueueEnd {
            egress: &self.acl_out,
            ingress: &self.acl_in,
        }
    }

    /// Commands for managing ACL connections.
    pub fn acl_connection_interface(&self) -> CommandInterface<'_, 'd, D> {
        CommandInterface {
            hci: self,
            name: "acl-connection",
            allowed: &[
                opcode::CREATE_CONNECTION,
                opcode::CREATE_CONNECTION_CANCEL,
                opcode::ACCEPT_CONNECTION_REQUEST,
                opcode::REJECT_CONNECTION_REQUEST,
                opcode::DISCONNECT,
            ],
        }
    }

    /// Commands for classic link security.
    pub fn security_interface(&self) -> CommandInterface<'_, 'd, D> {
        CommandInterface {
            hci: self,
            name: "security",
            allowed: &[opcode::AUTHENTICATION_REQUESTED, opcode::SET_CONNECTION_ENCRYPTION],
        }
    }

    /// Commands for LE link security.
    pub fn le_security_interface(&self) -> CommandInterface<'_, 'd, D> {
        CommandInterface {
            hci: self,
            name: "le-security",
            allowed: &[opcode::LE_ENABLE_ENCRYPTION, opcode::LE_LONG_TERM_KEY_REQUEST_REPLY],
        }
    }

    /// Commands for LE advertising.
    pub fn le_advertising_interface(&self) -> CommandInterface<'_, 'd, D> {
        CommandInterface {
            hci: self,
            name: "le-advertising",
            allowed: &[
                opcode::LE_SET_ADVERTISING_PARAMETERS,
                opcode::LE_SET_ADVERTISING_DATA,
                opcode::LE_SET_ADVERTISING_ENABLE,
            ],
        }
    }

    /// Commands for LE scanning.
    pub fn le_scanning_interface(&self) -> CommandInterface<'_, 'd, D> {
        CommandInterface {
            hci: self,
            name: "le-scanning",
            allowed: &[opcode::LE_SET_SCAN_PARAMETERS, opcode::LE_SET_SCAN_ENABLE],
        }
    }

    fn on_event(&self, data: &[u8]) -> Result<(), Error> {
        let event = EventPacket::parse(data)?;
        match event.code() {
            EventCode::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(event.params())?;
                self.cmd.on_reply(
                    ReplyKind::Complete,
                    complete.opcode,
                    complete.num_hci_command_packets,
                    &event,
                );
            }
            EventCode::COMMAND_STATUS => {
                let status = CommandStatus::parse(event.params())?;
                self.cmd
                    .on_reply(ReplyKind::Status, status.opcode, status.num_hci_command_packets, &event);
            }
            EventCode::LE_META => {
                let meta = LeMeta::parse(event.params())?;
                let events = self.events.borrow();
                match events.le_handlers.get(&meta.subevent.raw()) {
                    Some(queue) => {
                        if queue.try_post(event.clone()).is_err() {
                            warn!("[hci] subscriber queue full, dropping LE subevent {:?}", meta.subevent);
                        }
                    }
                    None => warn!("[hci] no handler for LE subevent {:?}, dropping", meta.subevent),
                }
            }
            code => {
                let events = self.events.borrow();
                match events.handlers.get(&code.raw()) {
                    Some(queue) => {
                        if queue.try_post(event.clone()).is_err() {
                            warn!("[hci] subscriber queue full, dropping event {:?}", code);
                        }
                    }
                    None => warn!("[hci] no handler for event {:?}, dropping", code),
                }
            }
        }
        Ok(())
    }

    /// Run the receive half: demultiplex controller packets into command
    /// replies, events and inbound ACL fragments.
    pub async fn run_rx(&self) -> Result<(), HostError<D::Error>> {
        const RX_BUF: usize = if config::ACL_BUFFER_SIZE + 4 > MAX_EVENT_SIZE {
            config::ACL_BUFFER_SIZE + 4
        } else {
            MAX_EVENT_SIZE
        };
        let mut buf = [0u8; RX_BUF];
        loop {
            match self.driver.read(&mut buf).await {
                Ok((HciPacketKind::Event, len)) => {
                    if let Err(e) = self.on_event(&buf[..len]) {
                        warn!("[hci] malformed event: {:?}", e);
                    }
                }
                Ok((HciPacketKind::AclData, len)) => match AclPacket::parse(&buf[..len]) {
                    Ok(packet) => self.acl_in.send(packet).await,
                    Err(e) => warn!("[hci] malformed acl packet: {:?}", e),
                },
                Ok((kind, len)) => {
                    trace!("[hci] ignoring {:?} packet of {} bytes", kind, len);
                }
                Err(e) => {
                    self.cmd.close();
                    return Err(HostError::Driver(e));
                }
            }
        }
    }

    /// Run the transmit half: serialize queued commands and outbound ACL
    /// fragments to the driver. Commands take priority.
    pub async fn run_tx(&self) -> Result<(), HostError<D::Error>> {
        let mut buf = [0u8; config::ACL_BUFFER_SIZE + 4];
        loop {
            let result = match select(poll_fn(|cx| self.cmd.poll_issue(Some(cx))), self.acl_out.receive()).await {
                Either::First(bytes) => self.driver.write(HciPacketKind::Command, &bytes).await,
                Either::Second(packet) => {
                    let len = unwrap!(packet.encode(&mut buf).ok());
                    self.driver.write(HciPacketKind::AclData, &buf[..len]).await
                }
            };
            if let Err(e) = result {
                self.cmd.close();
                return Err(HostError::Driver(e));
            }
        }
    }
}

impl<'d, D: HciDriver> Module for HciLayer<'d, D> {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &HCI_LAYER
    }

    fn stop(&self) {
        self.cmd.close();
    }
}

/// Drop guard releasing a command slot whose submitter was cancelled.
struct OnAbandon<'a> {
    pipeline: &'a CommandPipeline,
    token: CommandToken,
}

impl OnAbandon<'_> {
    fn defuse(self) {
        core::mem::forget(self);
    }
}

impl Drop for OnAbandon<'_> {
    fn drop(&mut self) {
        self.pipeline.abandon(self.token);
    }
}

/// The bidirectional ACL queue endpoint of the HCI layer.
///
/// The egress side accepts outbound fragments; the ingress side yields
/// parsed inbound fragments. Fragment boundaries and handles pass through
/// untouched.
#[derive(Clone, Copy)]
pub struct AclQueueEnd<'d> {
    egress: &'d Channel<NoopRawMutex, AclPacket, { config::ACL_TX_QUEUE_SIZE }>,
    ingress: &'d Channel<NoopRawMutex, AclPacket, { config::ACL_RX_QUEUE_SIZE }>,
}

impl<'d> AclQueueEnd<'d> {
    /// Poll for space on the egress side.
    pub fn poll_enqueue_ready(&self, cx: Option<&mut Context<'_>>) -> Poll<()> {
        match cx {
            Some(cx) => self.egress.poll_ready_to_send(cx),
            None => {
                if self.egress.is_full() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }
        }
    }

    /// Enqueue an outbound fragment. There must be space; interleave with
    /// [`Self::poll_enqueue_ready`].
    pub fn enqueue(&self, packet: AclPacket) {
        unwrap!(self.egress.try_send(packet).ok(), "acl egress overrun");
    }

    /// Dequeue the next inbound fragment.
    pub async fn dequeue(&self) -> AclPacket {
        self.ingress.receive().await
    }

    /// Poll for the next inbound fragment.
    pub fn poll_dequeue(&self, cx: &mut Context<'_>) -> Poll<AclPacket> {
        self.ingress.poll_receive(cx)
    }
}

/// A thin command surface that only admits a fixed set of opcodes.
///
/// Submitting anything else is a programming error.
pub struct CommandInterface<'a, 'd, D: HciDriver> {
    hci: &'a HciLayer<'d, D>,
    name: &'static str,
    allowed: &'static [Opcode],
}

impl<'a, 'd, D: HciDriver> CommandInterface<'a, 'd, D> {
    fn check<C: Command>(&self) {
        assert!(
            self.allowed.contains(&C::OPCODE),
            "opcode {:?} is outside the {} interface",
            C::OPCODE,
            self.name
        );
    }

    /// Run a Command Complete command from this interface's opcode set.
    pub async fn command<C: SyncCommand>(&self, cmd: C) -> Result<C::Return, Error> {
        self.check::<C>();
        self.hci.command(cmd).await
    }

    /// Run a Command Status command from this interface's opcode set.
    pub async fn async_command<C: AsyncCommand>(&self, cmd: C) -> Result<(), Error> {
        self.check::<C>();
        self.hci.async_command(cmd).await
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::{select, Either};

    use super::*;
    use crate::mock_driver::MockDriver;
    use crate::types::cmd::{Disconnect, ReadBdAddr, Reset};
    use crate::types::status::{DisconnectReason, Status};
    use crate::types::{BdAddr, ConnHandle};

    fn setup() -> &'static HciLayer<'static, MockDriver> {
        std::boxed::Box::leak(std::boxed::Box::new(HciLayer::new(MockDriver::new())))
    }

    /// Run `scenario` against the HCI runners until it completes.
    fn run<F: core::future::Future>(hci: &'static HciLayer<'static, MockDriver>, scenario: F) -> F::Output {
        block_on(async {
            match select(scenario, join(hci.run_rx(), hci.run_tx())).await {
                Either::First(output) => output,
                Either::Second(_) => panic!("runners exited before the scenario finished"),
            }
        })
    }

    #[test]
    fn sync_command_round_trip() {
        let hci = setup();
        hci.driver.expect_command(&[0x09, 0x10, 0x00], || {
            // Command Complete for ReadBdAddr with a success status.
            hci.driver
                .feed_event(&[0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        });
        let (status, addr) = run(hci, hci.command(ReadBdAddr)).unwrap();
        assert_eq!(status, Status::SUCCESS);
        assert_eq!(addr, BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
    }

    #[test]
    fn commands_wait_for_credits() {
        let hci = setup();
        // Only the first command may reach the wire before its reply.
        hci.driver.expect_command(&[0x03, 0x0C, 0x00], || {
            assert_eq!(hci.driver.written_commands(), 1);
            hci.driver.feed_event(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        });
        hci.driver.expect_command(&[0x09, 0x10, 0x00], || {
            hci.driver
                .feed_event(&[0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        });
        run(hci, async {
            let (first, second) = join(hci.command(Reset), hci.command(ReadBdAddr)).await;
            first.unwrap();
            second.unwrap();
        });
        assert_eq!(hci.driver.written_commands(), 2);
    }

    #[test]
    fn wrong_reply_kind_is_a_protocol_error() {
        let hci = setup();
        hci.driver.expect_command(&[0x03, 0x0C, 0x00], || {
            // Command Status for an opcode that declared Complete.
            hci.driver.feed_event(&[0x0F, 0x04, 0x00, 0x01, 0x03, 0x0C]);
        });
        hci.driver.expect_command(&[0x09, 0x10, 0x00], || {
            hci.driver
                .feed_event(&[0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        });
        run(hci, async {
            assert_eq!(hci.command(Reset).await.unwrap_err(), Error::Protocol);
            // The slot was freed; later commands proceed.
            hci.command(ReadBdAddr).await.unwrap();
        });
    }

    #[test]
    fn mismatched_opcode_fails_front_command() {
        let hci = setup();
        hci.driver.expect_command(&[0x03, 0x0C, 0x00], || {
            // Complete for a different opcode than the outstanding one.
            hci.driver.feed_event(&[0x0E, 0x04, 0x01, 0x01, 0x0C, 0x00]);
        });
        run(hci, async {
            assert_eq!(hci.command(Reset).await.unwrap_err(), Error::Protocol);
        });
    }

    #[test]
    fn credit_only_reply_leaves_outstanding_command_alone() {
        let hci = setup();
        hci.driver.expect_command(&[0x03, 0x0C, 0x00], || {
            // A Num_HCI_Command_Packets-only update (opcode 0x0000) lands
            // while the command is still in flight, then the real reply.
            hci.driver.feed_event(&[0x0E, 0x03, 0x01, 0x00, 0x00]);
            hci.driver.feed_event(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        });
        hci.driver.expect_command(&[0x09, 0x10, 0x00], || {
            hci.driver
                .feed_event(&[0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        });
        run(hci, async {
            hci.command(Reset).await.unwrap();
            hci.command(ReadBdAddr).await.unwrap();
        });
        assert_eq!(hci.driver.written_commands(), 2);
    }

    #[test]
    fn async_command_returns_on_status() {
        let hci = setup();
        hci.driver.expect_command(&[0x06, 0x04, 0x03, 0x40, 0x00, 0x13], || {
            hci.driver.feed_event(&[0x0F, 0x04, 0x00, 0x01, 0x06, 0x04]);
        });
        run(hci, async {
            hci.async_command(Disconnect::new(
                ConnHandle::new(0x0040),
                DisconnectReason::RemoteUserTerminatedConn,
            ))
            .await
            .unwrap();
        });
    }

    #[test]
    fn events_reach_their_subscriber() {
        let hci = setup();
        let queue: &'static EventQueue = std::boxed::Box::leak(std::boxed::Box::new(EventQueue::new()));
        hci.register_event_handler(EventCode::HARDWARE_ERROR, queue);
        // An unsubscribed event is dropped without disturbing anything.
        hci.driver.feed_event(&[0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00]);
        hci.driver.feed_event(&[0x10, 0x01, 0x42]);
        let event = run(hci, queue.receive());
        assert_eq!(event.code(), EventCode::HARDWARE_ERROR);
        assert_eq!(event.params(), &[0x42]);
    }

    #[test]
    fn le_meta_demultiplexes_by_subevent() {
        let hci = setup();
        let queue: &'static EventQueue = std::boxed::Box::leak(std::boxed::Box::new(EventQueue::new()));
        hci.register_le_event_handler(LeSubevent::CONNECTION_COMPLETE, queue);
        // An LE advertising report has no subscriber and is dropped.
        hci.driver.feed_event(&[0x3E, 0x03, 0x02, 0x00, 0x00]);
        hci.driver.feed_event(&[
            0x3E, 0x13, 0x01, 0x00, 0x40, 0x00, 0x01, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x18, 0x00, 0x00,
            0x00, 0x48, 0x00, 0x00,
        ]);
        let event = run(hci, queue.receive());
        let meta = LeMeta::parse(event.params()).unwrap();
        assert_eq!(meta.subevent, LeSubevent::CONNECTION_COMPLETE);
    }

    #[test]
    #[should_panic]
    fn second_event_subscription_panics() {
        let hci = setup();
        let queue: &'static EventQueue = std::boxed::Box::leak(std::boxed::Box::new(EventQueue::new()));
        hci.register_event_handler(EventCode::HARDWARE_ERROR, queue);
        hci.register_event_handler(EventCode::HARDWARE_ERROR, queue);
    }

    #[test]
    #[should_panic]
    fn command_complete_subscription_panics() {
        let hci = setup();
        let queue: &'static EventQueue = std::boxed::Box::leak(std::boxed::Box::new(EventQueue::new()));
        hci.register_event_handler(EventCode::COMMAND_COMPLETE, queue);
    }

    #[test]
    fn acl_traffic_passes_through() {
        let hci = setup();
        let end = hci.acl_queue_end();
        hci.driver.feed_acl(&[0x40, 0x20, 0x02, 0x00, 0xAB, 0xCD]);
        let inbound = run(hci, async {
            let packet = AclPacket::new(
                ConnHandle::new(0x0041),
                crate::types::acl::BoundaryFlag::FirstFlushable,
                &[1, 2, 3],
            )
            .unwrap();
            assert!(end.poll_enqueue_ready(None).is_ready());
            end.enqueue(packet);
            end.dequeue().await
        });
        assert_eq!(inbound.handle, ConnHandle::new(0x0040));
        assert_eq!(&inbound.data[..], &[0xAB, 0xCD]);
        run(hci, hci.driver.wait_for_acl_written(1));
        assert_eq!(hci.driver.written_acl(), &[&[0x41, 0x20, 0x03, 0x00, 1, 2, 3][..]]);
    }

    #[test]
    fn transport_loss_fails_pending_commands() {
        let hci = setup();
        hci.driver.expect_command(&[0x03, 0x0C, 0x00], || hci.driver.close());
        let result = block_on(async {
            match select(hci.command(Reset), join(hci.run_rx(), hci.run_tx())).await {
                Either::First(result) => result,
                Either::Second(_) => hci.command(Reset).await,
            }
        });
        assert_eq!(result.unwrap_err(), Error::Transport);
        // Submissions after the loss fail immediately.
        assert!(matches!(
            hci.cmd.poll_alloc(Opcode::NONE, ReplyKind::Complete, &[], None),
            Poll::Ready(Err(Error::Transport))
        ));
    }

    #[test]
    fn out_of_scope_opcode_panics() {
        let hci = setup();
        let interface = hci.le_scanning_interface();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = run(hci, interface.async_command(Disconnect::new(
                ConnHandle::new(0x0040),
                DisconnectReason::RemoteUserTerminatedConn,
            )));
        }));
        assert!(result.is_err());
    }
}
