//! Packet buffers for upper-layer ACL payloads.

use core::cell::UnsafeCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::config;

/// A Packet is a byte buffer for packet data.
/// Similar to a `Vec<u8>` it has a length and a capacity.
pub trait Packet: Sized + AsRef<[u8]> + AsMut<[u8]> {}

/// A Packet Pool that can allocate packets of the desired size.
///
/// The MTU is usually related to the MTU of the upper-layer payloads.
pub trait PacketPool: 'static {
    /// Packet type provided by this pool.
    type Packet: Packet;

    /// The maximum size a packet can have.
    const MTU: usize;

    /// Allocate a new buffer with space for `MTU` bytes.
    /// Return `None` when the allocation can't be fulfilled.
    fn allocate() -> Option<Self::Packet>;

    /// Capacity of this pool in the number of packets.
    fn capacity() -> usize;
}

const MTU: usize = config::DEFAULT_PACKET_POOL_MTU;
const N: usize = config::DEFAULT_PACKET_POOL_SIZE;

struct PacketBuf {
    buf: [u8; MTU],
    free: bool,
}

struct State {
    packets: UnsafeCell<[PacketBuf; N]>,
}

// The UnsafeCell content is only touched while holding the pool lock, and
// each allocated buffer is referenced by exactly one PoolPacket.
unsafe impl Send for State {}

static POOL: Mutex<CriticalSectionRawMutex, State> = Mutex::new(State {
    packets: UnsafeCell::new(
        [const {
            PacketBuf {
                buf: [0; MTU],
                free: true,
            }
        }; N],
    ),
});

/// A fixed-size global pool sized by [`config::DEFAULT_PACKET_POOL_SIZE`]
/// and [`config::DEFAULT_PACKET_POOL_MTU`].
pub struct DefaultPacketPool;

impl PacketPool for DefaultPacketPool {
    type Packet = PoolPacket;

    const MTU: usize = MTU;

    fn allocate() -> Option<PoolPacket> {
        POOL.lock(|state| {
            let packets = unsafe { &mut *state.packets.get() };
            for (index, packet) in packets.iter_mut().enumerate() {
                if packet.free {
                    packet.free = false;
                    packet.buf.fill(0);
                    return Some(PoolPacket {
                        index,
                        buf: &mut packet.buf[..],
                    });
                }
            }
            None
        })
    }

    fn capacity() -> usize {
        N
    }
}

/// A packet allocated from [`DefaultPacketPool`]. Returns its buffer to
/// the pool on drop.
pub struct PoolPacket {
    index: usize,
    buf: *mut [u8],
}

unsafe impl Send for PoolPacket {}

impl Packet for PoolPacket {}

impl AsRef<[u8]> for PoolPacket {
    fn as_ref(&self) -> &[u8] {
        unsafe { &*self.buf }
    }
}

impl AsMut<[u8]> for PoolPacket {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { &mut *self.buf }
    }
}

impl Drop for PoolPacket {
    fn drop(&mut self) {
        POOL.lock(|state| {
            let packets = unsafe { &mut *state.packets.get() };
            packets[self.index].free = true;
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use std::boxed::Box;

    use super::*;

    /// A heap-backed pool for tests, so they never contend on the global
    /// pool.
    pub(crate) struct TestPool;

    impl Packet for Box<[u8]> {}

    impl PacketPool for TestPool {
        type Packet = Box<[u8]>;

        const MTU: usize = 64;

        fn allocate() -> Option<Box<[u8]>> {
            Some(std::vec![0u8; Self::MTU].into_boxed_slice())
        }

        fn capacity() -> usize {
            usize::MAX
        }
    }

    #[test]
    fn allocations_are_returned_on_drop() {
        let mut taken = std::vec::Vec::new();
        for _ in 0..DefaultPacketPool::capacity() {
            taken.push(DefaultPacketPool::allocate().unwrap());
        }
        assert!(DefaultPacketPool::allocate().is_none());
        taken.pop();
        let packet = DefaultPacketPool::allocate().unwrap();
        assert_eq!(packet.as_ref().len(), DefaultPacketPool::MTU);
        drop(taken);
    }
}
