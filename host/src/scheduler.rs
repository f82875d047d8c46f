//! Fair, credit-aware dispatch of ACL payloads to the HCI egress.
//!
//! Every registered connection exposes the down end of its outbound queue.
//! The scheduler grants connections payload slots in rotating order,
//! fragments each accepted payload to the controller MTU of its transport,
//! and only puts a fragment on the HCI egress while the matching credit
//! pool is positive. Credits come back through the controller's
//! `Number Of Completed Packets` forwarding.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_sync::waitqueue::WakerRegistration;
use heapless::{Deque, FnvIndexMap, Vec};

use crate::config;
use crate::connection_manager::AclQueueDownEnd;
use crate::controller::{Capabilities, CreditQueue};
use crate::hci::AclQueueEnd;
use crate::packet_pool::PacketPool;
use crate::pdu::Pdu;
use crate::types::acl::{AclPacket, BoundaryFlag, TaggedFragment};
use crate::types::{ConnHandle, LinkKind};
use crate::Error;

struct CreditPool {
    available: u16,
    max: u16,
}

impl CreditPool {
    const fn new() -> Self {
        Self { available: 0, max: 0 }
    }

    fn configure(&mut self, max: u16) {
        self.max = max;
        self.available = max;
    }

    fn grant(&mut self) {
        assert!(self.available > 0, "acl credit underflow");
        self.available -= 1;
    }

    fn restore(&mut self, n: u16) {
        self.available += n;
        assert!(self.available <= self.max, "acl credit overflow");
    }
}

struct LinkEntry<'d, P: PacketPool> {
    kind: LinkKind,
    queue: AclQueueDownEnd<'d, P>,
    dequeue_registered: bool,
    outstanding: u16,
    disconnected: bool,
}

struct State<'d, P: PacketPool> {
    links: FnvIndexMap<u16, LinkEntry<'d, P>, { config::MAX_CONNECTIONS }>,
    classic: CreditPool,
    le: CreditPool,
    classic_mtu: usize,
    le_mtu: usize,
    fragments: Deque<TaggedFragment, { config::FRAGMENT_QUEUE_SIZE }>,
    cursor: usize,
    enqueue_registered: bool,
    waker: WakerRegistration,
}

impl<'d, P: PacketPool> State<'d, P> {
    fn pool(&mut self, kind: LinkKind) -> &mut CreditPool {
        match kind {
            LinkKind::Classic => &mut self.classic,
            LinkKind::Le => &mut self.le,
        }
    }

    fn mtu(&self, kind: LinkKind) -> usize {
        let mtu = match kind {
            LinkKind::Classic => self.classic_mtu,
            LinkKind::Le => self.le_mtu,
        };
        mtu.min(config::ACL_BUFFER_SIZE)
    }

    fn apply_credits(&mut self, handle: ConnHandle, credits: u16) {
        let Some(entry) = self.links.get_mut(&handle.raw()) else {
            info!("[scheduler] dropping {} credits for unknown handle {:?}", credits, handle);
            return;
        };
        if entry.disconnected {
            info!(
                "[scheduler] dropping {} credits for disconnected handle {:?}",
                credits, handle
            );
            return;
        }
        let credits = if credits > entry.outstanding {
            warn!(
                "[scheduler] controller returned {} credits for handle {:?} with {} outstanding",
                credits, handle, entry.outstanding
            );
            entry.outstanding
        } else {
            credits
        };
        entry.outstanding -= credits;
        let kind = entry.kind;
        self.pool(kind).restore(credits);
    }

    /// Fragment an accepted payload into the FIFO and charge the link.
    fn buffer_packet(&mut self, handle: ConnHandle, pdu: Pdu<P::Packet>) {
        let entry = unwrap!(self.links.get_mut(&handle.raw()));
        let kind = entry.kind;
        let mtu = self.mtu(kind);
        let data = pdu.as_ref();

        let mut count: u16 = 0;
        if data.is_empty() {
            // An empty payload still marks a boundary for the upper layer.
            let packet = unwrap!(AclPacket::new(handle, BoundaryFlag::FirstFlushable, &[]).ok());
            unwrap!(
                self.fragments.push_back(TaggedFragment { kind, packet }).ok(),
                "fragment queue exhausted"
            );
            count = 1;
        } else {
            for (i, chunk) in data.chunks(mtu).enumerate() {
                let boundary = if i == 0 {
                    BoundaryFlag::FirstFlushable
                } else {
                    BoundaryFlag::ContinuingFragment
                };
                let packet = unwrap!(AclPacket::new(handle, boundary, chunk).ok());
                unwrap!(
                    self.fragments.push_back(TaggedFragment { kind, packet }).ok(),
                    "fragment queue exhausted"
                );
                count += 1;
            }
        }

        let entry = unwrap!(self.links.get_mut(&handle.raw()));
        entry.outstanding += count;

        // No other connection may steal the egress mid-burst.
        for (_, entry) in self.links.iter_mut() {
            entry.dequeue_registered = false;
        }
    }
}

/// The round-robin ACL scheduler module.
pub struct RoundRobinScheduler<'d, P: PacketPool> {
    state: RefCell<State<'d, P>>,
    credits: &'d CreditQueue,
    hci_end: AclQueueEnd<'d>,
}

impl<'d, P: PacketPool> RoundRobinScheduler<'d, P> {
    /// `credits` must be the queue registered with the controller's
    /// completed-packets forwarding; `hci_end` is the HCI ACL endpoint the
    /// fragments leave through.
    pub fn new(credits: &'d CreditQueue, hci_end: AclQueueEnd<'d>) -> Self {
        Self {
            state: RefCell::new(State {
                links: FnvIndexMap::new(),
                classic: CreditPool::new(),
                le: CreditPool::new(),
                classic_mtu: 0,
                le_mtu: 0,
                fragments: Deque::new(),
                cursor: 0,
                enqueue_registered: false,
                waker: WakerRegistration::new(),
            }),
            credits,
            hci_end,
        }
    }

    /// Size the credit pools and MTUs from the controller record.
    pub fn configure(&self, caps: &Capabilities) {
        let mut state = self.state.borrow_mut();
        state.classic.configure(caps.acl_buffers);
        state.le.configure(caps.le_acl_buffers);
        state.classic_mtu = caps.acl_mtu as usize;
        state.le_mtu = caps.le_acl_mtu as usize;
        let min_mtu = state.mtu(LinkKind::Classic).min(state.mtu(LinkKind::Le)).max(1);
        assert!(
            P::MTU.div_ceil(min_mtu) <= config::FRAGMENT_QUEUE_SIZE,
            "fragment queue cannot hold a maximum-size payload"
        );
    }

    /// Add a connection, kicking the scheduling loop if it was idle.
    pub fn register(&self, kind: LinkKind, handle: ConnHandle, queue: AclQueueDownEnd<'d, P>) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.links.contains_key(&handle.raw()),
            "handle {:?} registered twice",
            handle
        );
        unwrap!(
            state
                .links
                .insert(
                    handle.raw(),
                    LinkEntry {
                        kind,
                        queue,
                        dequeue_registered: false,
                        outstanding: 0,
                        disconnected: false,
                    },
                )
                .ok(),
            "link table full"
        );
        if state.fragments.is_empty() {
            state.waker.wake();
        }
    }

    /// Remove a connection. Unknown handles are a contract violation.
    pub fn unregister(&self, handle: ConnHandle) {
        let mut state = self.state.borrow_mut();
        unwrap!(
            state.links.remove(&handle.raw()),
            "unregister of unknown handle {:?}",
            handle
        );
        state.cursor = 0;
    }

    /// Mark a connection disconnected and reclaim its in-flight credits.
    ///
    /// The controller stops reporting completions for a handle once its
    /// disconnection is complete, so the credits its outstanding fragments
    /// hold are returned here; any late completion reports for the handle
    /// are discarded.
    pub fn set_disconnect(&self, handle: ConnHandle) {
        let mut state = self.state.borrow_mut();
        let entry = unwrap!(
            state.links.get_mut(&handle.raw()),
            "disconnect of unknown handle {:?}",
            handle
        );
        entry.disconnected = true;
        let reclaimed = entry.outstanding;
        entry.outstanding = 0;
        let kind = entry.kind;
        state.pool(kind).restore(reclaimed);
        state.waker.wake();
    }

    /// Return credits for a handle, resuming dispatch if a pool was dry.
    pub fn incoming_acl_credits(&self, handle: ConnHandle, credits: u16) {
        let mut state = self.state.borrow_mut();
        state.apply_credits(handle, credits);
        state.waker.wake();
    }

    /// Drive the scheduler forever.
    pub async fn run(&self, caps: &Capabilities) -> Result<(), Error> {
        self.configure(caps);
        loop {
            poll_fn(|cx| self.poll_work(Some(cx))).await;
        }
    }

    /// Perform one unit of scheduling work: apply returned credits, then
    /// either emit the front fragment or accept one payload from the
    /// connection whose turn it is.
    pub fn poll_work(&self, mut cx: Option<&mut Context<'_>>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        if let Some(cx) = cx.as_deref_mut() {
            state.waker.register(cx.waker());
        }

        loop {
            let next = match cx.as_deref_mut() {
                Some(cx) => match self.credits.poll_receive(cx) {
                    Poll::Ready(pair) => Some(pair),
                    Poll::Pending => None,
                },
                None => self.credits.try_receive(),
            };
            let Some((handle, credits)) = next else { break };
            state.apply_credits(handle, credits);
        }

        if !state.fragments.is_empty() {
            return self.poll_emit(&mut state, cx);
        }
        self.poll_collect(&mut state, cx)
    }

    /// Emit phase: move the front fragment onto the HCI egress, charging
    /// its credit pool.
    fn poll_emit(&self, state: &mut State<'d, P>, cx: Option<&mut Context<'_>>) -> Poll<()> {
        let kind = unwrap!(state.fragments.front()).kind;
        if state.pool(kind).available == 0 {
            // Wait for credit return.
            state.enqueue_registered = false;
            return Poll::Pending;
        }
        if self.hci_end.poll_enqueue_ready(cx).is_pending() {
            state.enqueue_registered = true;
            return Poll::Pending;
        }
        state.enqueue_registered = true;
        let fragment = unwrap!(state.fragments.pop_front());
        state.pool(fragment.kind).grant();
        self.hci_end.enqueue(fragment.packet);

        if state.fragments.is_empty() {
            state.enqueue_registered = false;
        } else {
            let next_kind = unwrap!(state.fragments.front()).kind;
            if state.pool(next_kind).available == 0 {
                state.enqueue_registered = false;
            }
        }
        Poll::Ready(())
    }

    /// Registration phase: offer a dequeue slot to every connection and
    /// accept one payload from the first ready connection at or after the
    /// rotation cursor.
    fn poll_collect(&self, state: &mut State<'d, P>, mut cx: Option<&mut Context<'_>>) -> Poll<()> {
        if state.classic.available == 0 && state.le.available == 0 {
            return Poll::Pending;
        }
        if state.links.is_empty() {
            return Poll::Pending;
        }

        for (_, entry) in state.links.iter_mut() {
            entry.dequeue_registered = true;
        }

        let handles: Vec<u16, { config::MAX_CONNECTIONS }> = state.links.keys().copied().collect();
        let count = handles.len();
        let start = state.cursor % count;
        for i in 0..count {
            let raw = handles[(start + i) % count];
            let entry = unwrap!(state.links.get_mut(&raw));
            if let Poll::Ready(pdu) = entry.queue.poll_dequeue(cx.as_deref_mut()) {
                state.cursor = start + 1;
                state.buffer_packet(ConnHandle::new(raw), pdu);
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }

    #[cfg(test)]
    pub(crate) fn credits_available(&self, kind: LinkKind) -> u16 {
        let mut state = self.state.borrow_mut();
        state.pool(kind).available
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self, handle: ConnHandle) -> u16 {
        let state = self.state.borrow();
        unwrap!(state.links.get(&handle.raw())).outstanding
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, handle: ConnHandle) -> bool {
        let state = self.state.borrow();
        state.links.contains_key(&handle.raw())
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.state.borrow().cursor
    }

    #[cfg(test)]
    pub(crate) fn check_conservation(&self, kind: LinkKind) {
        let mut state = self.state.borrow_mut();
        let in_fifo: u16 = state
            .fragments
            .iter()
            .filter(|f| f.kind == kind)
            .count() as u16;
        let outstanding: u16 = state
            .links
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(_, e)| e.outstanding)
            .sum();
        let pool = state.pool(kind);
        // Fragments still in the FIFO hold outstanding counts but no
        // credits yet.
        assert_eq!(pool.available + outstanding - in_fifo, pool.max);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::{select, Either};
    use std::boxed::Box;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::connection_manager::LinkStorage;
    use crate::hci::HciLayer;
    use crate::mock_driver::MockDriver;
    use crate::packet_pool::tests::TestPool;

    struct Harness {
        hci: &'static HciLayer<'static, MockDriver>,
        scheduler: &'static RoundRobinScheduler<'static, TestPool>,
        credits: &'static CreditQueue,
        links: &'static [LinkStorage<TestPool>; 2],
    }

    fn caps(acl_buffers: u16, acl_mtu: u16) -> Capabilities {
        Capabilities {
            addr: crate::types::BdAddr::default(),
            supported_commands: [0; 64],
            features: heapless::Vec::new(),
            acl_mtu,
            acl_buffers,
            le_acl_mtu: 27,
            le_acl_buffers: 2,
            le_features: 0,
            max_advertising_data_length: 31,
        }
    }

    fn setup(capabilities: &Capabilities) -> Harness {
        let hci = Box::leak(Box::new(HciLayer::new(MockDriver::new())));
        let credits = Box::leak(Box::new(CreditQueue::new()));
        let scheduler = Box::leak(Box::new(RoundRobinScheduler::new(credits, hci.acl_queue_end())));
        scheduler.configure(capabilities);
        let links = Box::leak(Box::new([LinkStorage::<TestPool>::new(), LinkStorage::<TestPool>::new()]));
        Harness {
            hci,
            scheduler,
            credits,
            links,
        }
    }

    fn payload(data: &[u8]) -> Pdu<<TestPool as PacketPool>::Packet> {
        let mut packet = unwrap!(TestPool::allocate());
        packet.as_mut()[..data.len()].copy_from_slice(data);
        Pdu::new(packet, data.len())
    }

    /// Drive the scheduler and the HCI transmitter until `scenario` completes.
    fn run<F: core::future::Future>(h: &Harness, capabilities: &Capabilities, scenario: F) -> F::Output {
        let hci = h.hci;
        let scheduler = h.scheduler;
        block_on(async {
            match select(scenario, join(scheduler.run(capabilities), hci.run_tx())).await {
                Either::First(output) => output,
                Either::Second(_) => panic!("runners exited before the scenario finished"),
            }
        })
    }

    fn written_handles(h: &Harness) -> StdVec<u16> {
        h.hci
            .driver
            .written_acl()
            .iter()
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) & 0x0FFF)
            .collect()
    }

    const H1: ConnHandle = ConnHandle::new(0x0040);
    const H2: ConnHandle = ConnHandle::new(0x0041);

    #[test]
    fn two_connections_interleave_fairly() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        h.scheduler.register(LinkKind::Classic, H2, h.links[1].down_end());
        for _ in 0..4 {
            unwrap!(h.links[0].try_send_outbound(payload(&[0xAA; 10])).ok());
            unwrap!(h.links[1].try_send_outbound(payload(&[0xBB; 10])).ok());
        }
        run(&h, &caps, async {
            h.hci.driver.wait_for_acl_written(4).await;
            assert_eq!(written_handles(&h), &[0x0040, 0x0041, 0x0040, 0x0041]);
            // Out of credits: nothing more leaves until completions return.
            assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 0);
            h.scheduler.check_conservation(LinkKind::Classic);

            unwrap!(h.credits.try_post((H1, 2)).ok());
            unwrap!(h.credits.try_post((H2, 2)).ok());
            h.hci.driver.wait_for_acl_written(8).await;
        });
        assert_eq!(
            written_handles(&h),
            &[0x0040, 0x0041, 0x0040, 0x0041, 0x0040, 0x0041, 0x0040, 0x0041]
        );
        h.scheduler.check_conservation(LinkKind::Classic);
    }

    #[test]
    fn payloads_fragment_to_the_mtu() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        let data: StdVec<u8> = (0..60).collect();
        unwrap!(h.links[0].try_send_outbound(payload(&data)).ok());
        run(&h, &caps, h.hci.driver.wait_for_acl_written(3));

        let written = h.hci.driver.written_acl();
        let sizes: StdVec<usize> = written.iter().map(|w| w.len() - 4).collect();
        assert_eq!(sizes, &[27, 27, 6]);
        let boundaries: StdVec<BoundaryFlag> = written
            .iter()
            .map(|w| unwrap!(AclPacket::parse(w).ok()).boundary)
            .collect();
        assert_eq!(
            boundaries,
            &[
                BoundaryFlag::FirstFlushable,
                BoundaryFlag::ContinuingFragment,
                BoundaryFlag::ContinuingFragment
            ]
        );
        // Fragments of one payload are contiguous and reassemble to it.
        let mut reassembled = StdVec::new();
        for w in written.iter() {
            reassembled.extend_from_slice(&w[4..]);
        }
        assert_eq!(reassembled, data);
        assert_eq!(h.scheduler.outstanding(H1), 3);
    }

    #[test]
    fn boundary_payload_sizes() {
        let caps = caps(8, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        // Empty payload: one empty fragment, not dropped.
        unwrap!(h.links[0].try_send_outbound(payload(&[])).ok());
        // Exactly MTU: one fragment.
        unwrap!(h.links[0].try_send_outbound(payload(&[0x11; 27])).ok());
        // MTU + 1: two fragments.
        unwrap!(h.links[0].try_send_outbound(payload(&[0x22; 28])).ok());
        run(&h, &caps, h.hci.driver.wait_for_acl_written(4));

        let written = h.hci.driver.written_acl();
        let parsed: StdVec<AclPacket> = written.iter().map(|w| unwrap!(AclPacket::parse(w).ok())).collect();
        assert_eq!(parsed[0].data.len(), 0);
        assert_eq!(parsed[0].boundary, BoundaryFlag::FirstFlushable);
        assert_eq!(parsed[1].data.len(), 27);
        assert_eq!(parsed[1].boundary, BoundaryFlag::FirstFlushable);
        assert_eq!(parsed[2].data.len(), 27);
        assert_eq!(parsed[2].boundary, BoundaryFlag::FirstFlushable);
        assert_eq!(parsed[3].data.len(), 1);
        assert_eq!(parsed[3].boundary, BoundaryFlag::ContinuingFragment);
    }

    #[test]
    fn starved_connection_resumes_on_credit_return() {
        let caps = caps(1, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        unwrap!(h.links[0].try_send_outbound(payload(&[0x01; 10])).ok());
        unwrap!(h.links[0].try_send_outbound(payload(&[0x02; 10])).ok());
        run(&h, &caps, async {
            h.hci.driver.wait_for_acl_written(1).await;
            assert_eq!(h.hci.driver.written_acl().len(), 1);
            assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 0);

            unwrap!(h.credits.try_post((H1, 1)).ok());
            h.hci.driver.wait_for_acl_written(2).await;
        });
        assert_eq!(h.hci.driver.written_acl().len(), 2);
    }

    #[test]
    fn disconnect_reclaims_outstanding_credits() {
        let caps = caps(2, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        h.scheduler.register(LinkKind::Classic, H2, h.links[1].down_end());
        unwrap!(h.links[0].try_send_outbound(payload(&[0x01; 5])).ok());
        unwrap!(h.links[1].try_send_outbound(payload(&[0x02; 5])).ok());
        run(&h, &caps, async {
            h.hci.driver.wait_for_acl_written(2).await;
            assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 0);

            h.scheduler.set_disconnect(H1);
            assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 1);
            assert_eq!(h.scheduler.outstanding(H1), 0);

            // A payload enqueued after the disconnect may proceed.
            unwrap!(h.links[1].try_send_outbound(payload(&[0x03; 5])).ok());
            h.hci.driver.wait_for_acl_written(3).await;
        });
        assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 0);

        // Late completions for the disconnected handle are discarded.
        h.scheduler.incoming_acl_credits(H1, 1);
        assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 0);
        // The other link's completion still counts.
        h.scheduler.incoming_acl_credits(H2, 1);
        assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 1);
    }

    #[test]
    fn unknown_handle_credits_are_discarded() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        h.scheduler.incoming_acl_credits(ConnHandle::new(0x0DEA), 3);
        assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 4);
        h.scheduler.check_conservation(LinkKind::Classic);
    }

    #[test]
    fn reregistration_restores_the_initial_state() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        h.scheduler.unregister(H1);
        assert!(!h.scheduler.is_registered(H1));
        assert_eq!(h.scheduler.cursor(), 0);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        assert!(h.scheduler.is_registered(H1));
        assert_eq!(h.scheduler.outstanding(H1), 0);
        assert_eq!(h.scheduler.credits_available(LinkKind::Classic), 4);
    }

    #[test]
    fn cursor_advances_one_step_per_accepted_payload() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.register(LinkKind::Classic, H1, h.links[0].down_end());
        h.scheduler.register(LinkKind::Classic, H2, h.links[1].down_end());
        unwrap!(h.links[0].try_send_outbound(payload(&[0x01; 4])).ok());
        let before = h.scheduler.cursor();
        assert!(h.scheduler.poll_work(None).is_ready());
        assert_eq!(h.scheduler.cursor(), before + 1);
    }

    #[test]
    #[should_panic]
    fn disconnect_of_unknown_handle_panics() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.set_disconnect(H1);
    }

    #[test]
    #[should_panic]
    fn unregister_of_unknown_handle_panics() {
        let caps = caps(4, 27);
        let h = setup(&caps);
        h.scheduler.unregister(H1);
    }
}
