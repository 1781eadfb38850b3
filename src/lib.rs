//! Peer-to-peer middleware for distributing versioned, mutable objects across a cluster.
//!
//! The crate has two halves that build on each other:
//!
//! * [`transport`] implements RSP, a reliable stream protocol on top of UDP multicast. It turns
//!   the unreliable one-to-many datagram channel into a set of loss-tolerant, rate-controlled,
//!   in-order byte streams - one per writer on the group. Reliability is NACK-driven: readers
//!   request retransmission of the sequence ranges they are missing, and writers pace their
//!   output through a token bucket that slows down on reported loss.
//! * [`object`] implements the object change managers. A *master* object produces versions by
//!   serializing its state (full snapshots, or deltas plus snapshots), retains a bounded ring
//!   of past versions for late subscribers, and streams framed commands to its *slaves*. A
//!   slave reassembles incoming command fragments into version streams and applies them in
//!   strictly increasing version order.
//!
//! ## Design notes
//!
//! * One protocol task per RSP listener owns the sockets, timers and all window state; the
//!   application only touches the two buffer queues and a wakeup handle. This keeps the hot
//!   path free of locks.
//! * Buffers are allocated once at listen time and cycle between the free pool, the protocol
//!   task and the application. Running out of free buffers drops packets, it never blocks the
//!   protocol task.
//! * All wire encodings are little-endian. Membership datagrams carry a two-byte protocol
//!   version whose value fits into one byte, so a peer with mismatched byte order reads a
//!   value it does not recognize and drops the datagram.
//!
//! The protocol assumes a single multicast-capable LAN; there is no routing across subnets,
//! no authentication and no persistence.

pub mod config;
pub mod error;
pub mod object;
pub mod transport;
pub mod util;
