//! Compile-time configuration.
//!
//! Queue depths and buffer sizes are fixed at compile time so the whole
//! stack stays allocation-free. The defaults suit a host with a handful of
//! connections; shrink them for constrained targets.

/// Maximum number of simultaneously registered ACL connections.
///
/// Bounds the scheduler's link table and the connection manager's slot
/// count. Default: 4.
pub const MAX_CONNECTIONS: usize = 4;

/// Maximum number of modules a registry can hold.
pub const MAX_MODULES: usize = 8;

/// Depth of the HCI command ring.
///
/// Commands beyond the controller's command-credit allowance queue here in
/// submission order. Default: 4.
pub const COMMAND_QUEUE_SIZE: usize = 4;

/// Depth of each event subscription task queue.
///
/// Events for a subscriber that cannot keep up are dropped with a warning.
/// Default: 4.
pub const EVENT_QUEUE_SIZE: usize = 4;

/// Maximum number of distinct event-code subscriptions (and, separately,
/// LE meta subevent subscriptions).
pub const MAX_EVENT_HANDLERS: usize = 8;

/// Depth of the HCI egress queue for outbound ACL fragments.
///
/// The controller's out-of-credit state, not this queue, is the real
/// backpressure mechanism; a small depth just decouples the scheduler from
/// the transport writer. Default: 3.
pub const ACL_TX_QUEUE_SIZE: usize = 3;

/// Depth of the HCI ingress queue for inbound ACL fragments.
pub const ACL_RX_QUEUE_SIZE: usize = 3;

/// Depth of each connection's outbound payload queue.
pub const LINK_TX_QUEUE_SIZE: usize = 4;

/// Depth of each connection's inbound fragment queue.
///
/// Inbound fragments for a connection whose queue is full are dropped with
/// a warning, so this should cover at least one full upper-layer PDU's
/// worth of fragments.
pub const LINK_RX_QUEUE_SIZE: usize = 8;

/// Capacity of the scheduler's prepared-fragment FIFO.
///
/// Must hold every fragment of a single upper-layer payload: at least
/// `ceil(pool MTU / controller MTU)` for the smallest controller MTU in
/// use (27 for a minimal LE controller).
pub const FRAGMENT_QUEUE_SIZE: usize = 10;

/// Size of a single outbound or inbound ACL data buffer.
///
/// Outbound fragments are capped to `min(controller MTU, ACL_BUFFER_SIZE)`;
/// fragmenting below the controller MTU is always legal framing. Inbound
/// fragments larger than this are a transport error.
pub const ACL_BUFFER_SIZE: usize = 255;

/// Depth of each connection's lifecycle event queue.
pub const CONNECTION_EVENT_QUEUE_SIZE: usize = 2;

/// Number of packets in [`DefaultPacketPool`](crate::packet_pool::DefaultPacketPool).
pub const DEFAULT_PACKET_POOL_SIZE: usize = 16;

/// Payload capacity of each packet in the default pool.
pub const DEFAULT_PACKET_POOL_MTU: usize = 251;
