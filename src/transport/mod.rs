//! RSP - a reliable stream protocol over UDP multicast.
//!
//! A peer joins a multicast group as a *listener* and claims a random 16-bit id through the
//! HELLO/DENY handshake. Every writer seen on the group (including the peer itself) becomes a
//! *child* of the listener: an in-order byte stream that the application reads independently.
//! Reliability is NACK-driven, sending is paced by a token bucket, and all per-connection
//! memory is allocated up front as a fixed set of MTU-sized buffers.

pub mod buffer_pool;
pub mod datagram;
pub mod pacing;
pub mod peer;
mod reader;
#[cfg(test)]
pub(crate) mod test_hub;
mod writer;

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::error;

use crate::config::Config;
use crate::error::{TransportError, TransportResult};

/// Bit marking multicast-capable connection types. Future multicast transports must keep
/// this bit set so that `is_multicast` stays a bit test.
pub const MULTICAST_BIT: u16 = 0x100;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum ConnectionType {
    None = 0,
    Rsp = MULTICAST_BIT | 1,
}

impl ConnectionType {
    pub fn is_multicast(self) -> bool {
        (self as u16) & MULTICAST_BIT != 0
    }
}

/// The uniform capability surface of a connection, as seen by the object layer.
///
/// Not every connection supports every operation: an RSP listener is written to, the readers
/// it accepts are read from. Unsupported operations report
/// [`TransportError::Unsupported`].
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    fn is_closed(&self) -> bool;

    /// Reads exactly `buf.len()` bytes unless the connection closes or the configured
    /// timeout expires first.
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let _ = buf;
        Err(TransportError::Unsupported)
    }

    /// Writes all of `data`.
    async fn write(&self, data: &[u8]) -> TransportResult<usize> {
        let _ = data;
        Err(TransportError::Unsupported)
    }

    /// Closes the connection. Idempotent.
    async fn close(&mut self);
}

/// Abstraction over the multicast group socket pair, introduced so tests can run the
/// protocol over an in-process hub with scriptable loss and reordering.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sends one datagram to the group. Send errors are logged and swallowed; the protocol
    /// recovers through its regular retransmission path.
    async fn send(&self, datagram: &[u8]);

    /// Receives the next datagram into `buf`, returning its length.
    async fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The production socket pair: one socket bound to the group port for receiving, one
/// connected to the group address for sending. Multicast loopback is disabled - a writer
/// sees its own data through the in-process self-child instead.
pub struct UdpGroupSocket {
    read: UdpSocket,
    write: UdpSocket,
}

impl UdpGroupSocket {
    pub async fn join(config: &Config) -> io::Result<UdpGroupSocket> {
        let read = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).await?;
        read.join_multicast_v4(config.group_addr, config.interface)?;

        let write = UdpSocket::bind(SocketAddrV4::new(config.interface, 0)).await?;
        write.set_multicast_loop_v4(false)?;
        write
            .connect(SocketAddrV4::new(config.group_addr, config.port))
            .await?;

        Ok(UdpGroupSocket { read, write })
    }
}

#[async_trait]
impl DatagramSocket for UdpGroupSocket {
    async fn send(&self, datagram: &[u8]) {
        if let Err(e) = self.write.send(datagram).await {
            error!("error sending datagram to the group: {}", e);
        }
    }

    async fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.recv(buf).await
    }
}

/// Protocol counters, updated by the protocol task and readable from the listener handle.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_sent: AtomicU64,
    pub datagrams_merged: AtomicU64,
    pub datagrams_repeated: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub acks_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub nacks_sent: AtomicU64,
    pub nacks_received: AtomicU64,
    pub send_rate_kbps: AtomicI64,
}

impl TransportStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) type SharedStats = Arc<TransportStats>;
