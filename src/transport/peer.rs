//! RSP peers: the listener bound to the multicast group, the per-writer readers it accepts,
//! and the protocol task that owns all window state.
//!
//! The protocol task is the only place that touches the socket, the timers, membership and
//! the send/receive windows. Application handles interact with it exclusively through the
//! buffer queues and the wakeup handle, so the hot path needs no locking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::{TransportError, TransportResult};
use crate::transport::buffer_pool::{allocate_buffers, BufferQueue, FixedBuf, PopError};
use crate::transport::datagram::{
    Ack, DataHeader, Datagram, DatagramType, NodeDatagram, PeerId, SeqNo, SeqRange,
    DATA_HEADER_LEN,
};
use crate::transport::pacing::RateController;
use crate::transport::{
    Connection, ConnectionType, DatagramSocket, SharedStats, TransportStats, UdpGroupSocket,
};

/// Interval of the membership handshake timer.
const JOIN_TICK: Duration = Duration::from_millis(10);
/// Number of unchallenged announcements before an id is considered claimed, and of
/// COUNTNODE exchange rounds before the peer starts listening.
const JOIN_ROUNDS: u32 = 20;
/// Number of denied ids after which listen gives up.
const MAX_ID_REBUILDS: u32 = 20;

/// Queues and signals shared between one connection's application handle and the protocol
/// task. For the listener, `app_buffers` holds free write buffers and `thread_buffers` the
/// filled ones; for a reader child the roles are mirrored: `app_buffers` holds ready data,
/// `thread_buffers` returned free buffers.
pub(super) struct PeerShared {
    pub(super) app_buffers: BufferQueue,
    pub(super) thread_buffers: BufferQueue,
    pub(super) wakeup: Notify,
}

impl PeerShared {
    pub(super) fn new() -> PeerShared {
        PeerShared {
            app_buffers: BufferQueue::new(),
            thread_buffers: BufferQueue::new(),
            wakeup: Notify::new(),
        }
    }
}

/// Per-writer state kept by the protocol task. A child is both the reader-side view of a
/// remote writer (`sequence`, `recv_buffers`) and the writer-side record of that peer as a
/// reader of our own data (`acked`).
pub(super) struct Child {
    pub(super) id: PeerId,
    /// Next expected sequence from this writer.
    pub(super) sequence: SeqNo,
    /// Latest cumulative ack received from this peer for our own writes.
    pub(super) acked: SeqNo,
    /// Out-of-order buffers; index `i` corresponds to sequence `sequence + 1 + i`.
    pub(super) recv_buffers: VecDeque<Option<FixedBuf>>,
    pub(super) shared: Arc<PeerShared>,
}

pub(super) enum Phase {
    /// Broadcasting HELLO, watching for DENY.
    Announcing { attempts: u32 },
    /// Id claimed and CONFIRM sent; exchanging COUNTNODE before going live.
    Discovering { ticks: u32 },
    Listening,
    Closed,
}

/// All state owned by the protocol task.
pub(super) struct ProtocolState {
    pub(super) config: Arc<Config>,
    pub(super) socket: Arc<dyn DatagramSocket>,
    pub(super) id: PeerId,
    pub(super) phase: Phase,
    pub(super) id_rebuilds: u32,
    /// Unanswered ACK request counter; exceeding the budget triggers laggard handling.
    pub(super) timeouts: u32,
    /// Next sequence number to stamp on an outgoing datagram.
    pub(super) sequence: SeqNo,
    /// Sent but not group-wide acknowledged datagrams, oldest first.
    pub(super) write_buffers: VecDeque<FixedBuf>,
    /// NACK-requested ranges awaiting retransmission.
    pub(super) repeat_queue: VecDeque<SeqRange>,
    pub(super) rate: RateController,
    pub(super) children: Vec<Child>,
    pub(super) writer_shared: Arc<PeerShared>,
    pub(super) accept_tx: mpsc::UnboundedSender<RspReader>,
    pub(super) shutdown: Arc<Notify>,
    pub(super) stats: SharedStats,
    /// Time of the last outgoing data write, for the ACK request cadence.
    pub(super) last_activity: Instant,
    /// When the timer arm of the event loop fires next.
    pub(super) deadline: Instant,
    pub(super) ready_tx: Option<oneshot::Sender<TransportResult<PeerId>>>,
    pub(super) default_timeout: Option<Duration>,
}

impl ProtocolState {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: Arc<Config>,
        socket: Arc<dyn DatagramSocket>,
        writer_shared: Arc<PeerShared>,
        accept_tx: mpsc::UnboundedSender<RspReader>,
        shutdown: Arc<Notify>,
        stats: SharedStats,
        ready_tx: oneshot::Sender<TransportResult<PeerId>>,
    ) -> ProtocolState {
        let rate = RateController::new(&config);
        let default_timeout = config.default_timeout;
        ProtocolState {
            config,
            socket,
            id: rand::thread_rng().gen(),
            phase: Phase::Announcing { attempts: 0 },
            id_rebuilds: 0,
            timeouts: 0,
            sequence: SeqNo::ZERO,
            write_buffers: VecDeque::new(),
            repeat_queue: VecDeque::new(),
            rate,
            children: Vec::new(),
            writer_shared,
            accept_tx,
            shutdown,
            stats,
            last_activity: Instant::now(),
            deadline: Instant::now() + JOIN_TICK,
            ready_tx: Some(ready_tx),
            default_timeout,
        }
    }

    pub(super) async fn run(mut self) {
        debug!("peer {} announcing on the group", self.id);
        self.send_node(DatagramType::Hello, self.id).await;
        self.deadline = Instant::now() + JOIN_TICK;

        let mut recv_buf = FixedBuf::new(self.config.mtu);
        loop {
            recv_buf.maximize_len();
            let socket = self.socket.clone();
            let shared = self.writer_shared.clone();
            let shutdown = self.shutdown.clone();
            let deadline = self.deadline;

            tokio::select! {
                received = socket.recv_into(recv_buf.as_mut()) => {
                    match received {
                        Ok(n) => {
                            recv_buf.truncate(n);
                            self.handle_datagram(&mut recv_buf).await;
                            if matches!(self.phase, Phase::Listening) {
                                self.process_outgoing().await;
                            }
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_timeout().await;
                }
                _ = shared.wakeup.notified() => {
                    if matches!(self.phase, Phase::Listening) {
                        self.process_outgoing().await;
                    }
                }
                _ = shutdown.notified() => {
                    self.on_close().await;
                }
            }

            if matches!(self.phase, Phase::Closed) {
                debug!("peer {} protocol task terminating", self.id);
                return;
            }
        }
    }

    async fn handle_datagram(&mut self, buf: &mut FixedBuf) {
        let datagram = match Datagram::deser(buf.as_ref()) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping unparsable datagram: {:#}", e);
                return;
            }
        };

        match self.phase {
            Phase::Announcing { .. } | Phase::Discovering { .. } => {
                // data traffic is ignored until membership is established
                if let Datagram::Node(node) = datagram {
                    self.handle_node(node).await;
                }
            }
            Phase::Listening => match datagram {
                Datagram::Data(header) => self.handle_data(header, buf).await,
                Datagram::Ack(ack) => self.handle_ack(ack).await,
                Datagram::Nack(nack) => self.handle_nack(nack).await,
                Datagram::AckRequest(request) => self.handle_ack_request(request).await,
                Datagram::Node(node) => self.handle_node(node).await,
            },
            Phase::Closed => {}
        }
    }

    async fn on_timeout(&mut self) {
        match self.phase {
            Phase::Announcing { attempts } => {
                if attempts + 1 < JOIN_ROUNDS {
                    self.phase = Phase::Announcing {
                        attempts: attempts + 1,
                    };
                    trace!("announce {} ({})", self.id, attempts + 1);
                    self.send_node(DatagramType::Hello, self.id).await;
                } else {
                    debug!("confirming id {}", self.id);
                    self.send_node(DatagramType::Confirm, self.id).await;
                    let own_id = self.id;
                    let own_sequence = self.sequence;
                    self.add_child(own_id, own_sequence).await;
                    self.phase = Phase::Discovering { ticks: 0 };
                    self.send_count_node().await;
                }
                self.deadline = Instant::now() + JOIN_TICK;
            }
            Phase::Discovering { ticks } => {
                if ticks + 1 < JOIN_ROUNDS {
                    self.phase = Phase::Discovering { ticks: ticks + 1 };
                    self.send_count_node().await;
                    self.deadline = Instant::now() + JOIN_TICK;
                } else {
                    debug!("peer {} listening", self.id);
                    self.phase = Phase::Listening;
                    self.timeouts = 0;
                    self.deadline = far_future();
                    if let Some(ready) = self.ready_tx.take() {
                        let _ = ready.send(Ok(self.id));
                    }
                }
            }
            Phase::Listening => {
                self.handle_connected_timeout().await;
            }
            Phase::Closed => {}
        }
    }

    async fn handle_node(&mut self, node: NodeDatagram) {
        match node.kind {
            DatagramType::Hello => {
                if let Phase::Discovering { .. } = self.phase {
                    // a newcomer is announcing: extend discovery so it sees our COUNTNODE
                    self.phase = Phase::Discovering { ticks: 0 };
                }
                self.check_new_id(node.connection_id).await;
            }
            DatagramType::HelloReply | DatagramType::Confirm => {
                if let Phase::Discovering { .. } = self.phase {
                    self.phase = Phase::Discovering { ticks: 0 };
                }
                self.add_child(node.connection_id, SeqNo(node.data)).await;
            }
            DatagramType::Deny => {
                if let Phase::Announcing { .. } = self.phase {
                    if node.connection_id == self.id {
                        self.id_rebuilds += 1;
                        if self.id_rebuilds >= MAX_ID_REBUILDS {
                            warn!("giving up after {} denied ids", self.id_rebuilds);
                            if let Some(ready) = self.ready_tx.take() {
                                let _ = ready.send(Err(TransportError::NoId {
                                    attempts: self.id_rebuilds,
                                }));
                            }
                            self.phase = Phase::Closed;
                            return;
                        }
                        self.id = rand::thread_rng().gen();
                        self.phase = Phase::Announcing { attempts: 0 };
                        debug!("id denied, announcing {} instead", self.id);
                        self.send_node(DatagramType::Hello, self.id).await;
                    }
                }
            }
            DatagramType::Exit => self.remove_child(node.connection_id).await,
            DatagramType::CountNode => {
                trace!("peer {} reports {} nodes", node.connection_id, node.data);
            }
            _ => {}
        }
    }

    /// A peer announced `id`; deny it if it collides with us or a known child, otherwise
    /// introduce ourselves with our current write sequence.
    ///
    /// A peer that is itself still announcing stays quiet: two concurrent joiners that
    /// introduced themselves to each other would later mistake the other's repeated
    /// announcements for an id collision. They discover each other through CONFIRM instead.
    async fn check_new_id(&mut self, id: PeerId) {
        if id == self.id || self.child_index(id).is_some() {
            debug!("denying id {}", id);
            self.send_node(DatagramType::Deny, id).await;
        } else if !matches!(self.phase, Phase::Announcing { .. }) {
            self.send_node(DatagramType::HelloReply, self.id).await;
        }
    }

    pub(super) fn child_index(&self, id: PeerId) -> Option<usize> {
        self.children.iter().position(|child| child.id == id)
    }

    pub(super) async fn add_child(&mut self, id: PeerId, sequence: SeqNo) -> bool {
        if self.child_index(id).is_some() {
            return false;
        }
        debug!("adding peer {} with starting sequence {}", id, sequence);

        let shared = Arc::new(PeerShared::new());
        for buffer in allocate_buffers(self.config.num_buffers, self.config.mtu) {
            shared.thread_buffers.push(buffer);
        }

        self.children.push(Child {
            id,
            sequence,
            // a new peer only expects data from our current sequence onward
            acked: self.sequence.minus(1),
            recv_buffers: VecDeque::new(),
            shared: shared.clone(),
        });

        let reader = RspReader {
            id,
            shared,
            read_buffer: None,
            read_pos: 0,
            timeout: self.default_timeout,
            parent_shutdown: self.shutdown.clone(),
            closed: false,
        };
        let _ = self.accept_tx.send(reader);

        self.send_count_node().await;
        true
    }

    pub(super) async fn remove_child(&mut self, id: PeerId) {
        if id == self.id {
            return;
        }
        if let Some(index) = self.child_index(id) {
            debug!("removing peer {}", id);
            let child = self.children.remove(index);
            child.shared.app_buffers.close();
        }
        self.send_count_node().await;
    }

    pub(super) async fn send_node(&mut self, kind: DatagramType, id: PeerId) {
        let data = match kind {
            // DENY carries the clashing id in `connection_id` and no payload data
            DatagramType::Deny => 0,
            _ => self.sequence.0,
        };
        let mut buf = Vec::with_capacity(crate::transport::datagram::NODE_LEN);
        NodeDatagram {
            kind,
            connection_id: id,
            data,
        }
        .ser(&mut buf);
        self.socket.send(&buf).await;
    }

    pub(super) async fn send_count_node(&mut self) {
        // announce the node count only once we count ourselves
        if self.child_index(self.id).is_none() {
            return;
        }
        let mut buf = Vec::with_capacity(crate::transport::datagram::NODE_LEN);
        NodeDatagram {
            kind: DatagramType::CountNode,
            connection_id: self.id,
            data: self.children.len() as u16,
        }
        .ser(&mut buf);
        self.socket.send(&buf).await;
    }

    pub(super) async fn send_ack(&mut self, ack: Ack) {
        trace!("sending ack {} for writer {}", ack.sequence, ack.writer_id);
        let mut buf = Vec::with_capacity(crate::transport::datagram::ACK_LEN);
        ack.ser(&mut buf);
        self.socket.send(&buf).await;
        TransportStats::bump(&self.stats.acks_sent);
    }

    pub(super) async fn send_nack(&mut self, writer_id: PeerId, ranges: Vec<SeqRange>) {
        if writer_id == self.id {
            // shortcut: we are the writer, queue the repeats directly
            self.add_repeat(&split_wrapping(ranges));
            return;
        }

        let ranges = split_wrapping(ranges);
        debug!("sending nack to writer {}: {:?}", writer_id, ranges);
        let nack = crate::transport::datagram::Nack {
            reader_id: self.id,
            writer_id,
            ranges,
        };
        let mut buf = Vec::with_capacity(crate::transport::datagram::nack_len(nack.ranges.len()));
        nack.ser(&mut buf);
        self.socket.send(&buf).await;
        TransportStats::bump(&self.stats.nacks_sent);
    }

    pub(super) async fn send_ack_request(&mut self) {
        let request = crate::transport::datagram::AckRequest {
            writer_id: self.id,
            sequence: self.sequence.minus(1),
        };
        trace!("sending ack request for {}", request.sequence);
        let mut buf = Vec::with_capacity(crate::transport::datagram::ACK_REQUEST_LEN);
        request.ser(&mut buf);
        self.socket.send(&buf).await;
    }

    pub(super) async fn on_close(&mut self) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        debug!("closing peer {}", self.id);
        self.send_node(DatagramType::Exit, self.id).await;
        for child in &self.children {
            child.shared.app_buffers.close();
        }
        self.writer_shared.app_buffers.abort();
        self.writer_shared.thread_buffers.abort();
        self.phase = Phase::Closed;
    }
}

pub(super) fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

/// Splits ranges that wrap past the end of the sequence space, so each wire range satisfies
/// `start <= end` in plain integer terms.
fn split_wrapping(ranges: Vec<SeqRange>) -> Vec<SeqRange> {
    let mut result = Vec::with_capacity(ranges.len());
    for range in ranges {
        if range.start.0 > range.end.0 {
            result.push(SeqRange {
                start: range.start,
                end: SeqNo(u16::MAX),
            });
            result.push(SeqRange {
                start: SeqNo::ZERO,
                end: range.end,
            });
        } else {
            result.push(range);
        }
    }
    result
}

/// A listener on an RSP multicast group: the writing end of the connection and the acceptor
/// for the per-writer readers.
pub struct RspListener {
    id: PeerId,
    config: Arc<Config>,
    shared: Arc<PeerShared>,
    accept_rx: mpsc::UnboundedReceiver<RspReader>,
    task: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    stats: SharedStats,
    closed: AtomicBool,
}

impl RspListener {
    /// Joins the configured multicast group and establishes membership. Returns once the
    /// peer has claimed an id and is live on the group.
    pub async fn listen(config: Config) -> anyhow::Result<RspListener> {
        config.validate()?;
        let socket = Arc::new(UdpGroupSocket::join(&config).await?);
        Self::listen_with_socket(config, socket).await
    }

    /// Like [`listen`](RspListener::listen), with a caller-provided socket. This is the seam
    /// used to run the protocol over an in-process hub in tests.
    pub async fn listen_with_socket(
        config: Config,
        socket: Arc<dyn DatagramSocket>,
    ) -> anyhow::Result<RspListener> {
        config.validate()?;
        let config = Arc::new(config);

        let shared = Arc::new(PeerShared::new());
        for buffer in allocate_buffers(config.num_buffers, config.mtu) {
            shared.app_buffers.push(buffer);
        }

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = Arc::new(Notify::new());
        let stats: SharedStats = Arc::new(TransportStats::default());

        let state = ProtocolState::new(
            config.clone(),
            socket,
            shared.clone(),
            accept_tx,
            shutdown.clone(),
            stats.clone(),
            ready_tx,
        );
        let task = tokio::spawn(state.run());

        // the id may still change while announcing (DENY), so the final one arrives with
        // the ready signal
        let id = match ready_rx.await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::Closed.into()),
        };

        Ok(RspListener {
            id,
            config,
            shared,
            accept_rx,
            task: Some(task),
            shutdown,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// The peer's id on the multicast group.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current send rate in KB/s.
    pub fn send_rate(&self) -> i64 {
        self.stats.send_rate_kbps.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Awaits the next reader child. The first accepted reader is usually the peer's own
    /// self-child, through which it receives its own writes.
    pub async fn accept(&mut self) -> TransportResult<RspReader> {
        self.accept_rx.recv().await.ok_or(TransportError::Closed)
    }

    /// Writes `data` as a sequence of datagrams. Blocks while the pool has no free buffers;
    /// with a configured timeout, expiry surfaces as [`TransportError::TimeoutWrite`] and
    /// the connection stays open.
    pub async fn write(&self, data: &[u8]) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let payload_size = self.config.payload_size();
        for chunk in data.chunks(payload_size) {
            if self.shared.app_buffers.is_empty() {
                // kick the protocol task so acknowledged buffers come back to the pool
                self.shared.wakeup.notify_one();
            }
            let mut buffer = match self.shared.app_buffers.pop(self.config.default_timeout).await
            {
                Ok(buffer) => buffer,
                Err(PopError::Timeout) => return Err(TransportError::TimeoutWrite),
                Err(PopError::Closed) => return Err(TransportError::Closed),
            };

            buffer.clear();
            DataHeader {
                size: chunk.len() as u16,
                writer_id: self.id,
                // stamped by the protocol task at send time
                sequence: SeqNo::ZERO,
            }
            .ser(&mut buffer);
            bytes::BufMut::put_slice(&mut buffer, chunk);

            self.shared.thread_buffers.push(buffer);
        }
        self.shared.wakeup.notify_one();
        Ok(data.len())
    }

    /// Waits until every pooled write buffer is back in the free pool, i.e. all pending
    /// writes have been sent and acknowledged group-wide.
    pub async fn finish(&self) {
        let _ = self
            .shared
            .app_buffers
            .wait_len(self.config.num_buffers as usize)
            .await;
    }

    /// Closes the listener: multicasts EXIT, stops the protocol task and wakes all blocked
    /// readers and writers. Idempotent.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RspListener {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Connection for RspListener {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Rsp
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn write(&self, data: &[u8]) -> TransportResult<usize> {
        RspListener::write(self, data).await
    }

    async fn close(&mut self) {
        RspListener::close(self).await;
    }
}

/// The in-order byte stream of one writer on the group, accepted from a listener.
pub struct RspReader {
    id: PeerId,
    shared: Arc<PeerShared>,
    read_buffer: Option<FixedBuf>,
    read_pos: usize,
    timeout: Option<Duration>,
    parent_shutdown: Arc<Notify>,
    closed: bool,
}

impl RspReader {
    /// Id of the writer this reader follows.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Reads exactly `out.len()` bytes, in the order they were written by the remote peer.
    ///
    /// Returns the number of bytes read, which is short only if the connection closed
    /// mid-read. With a configured timeout, expiry surfaces as
    /// [`TransportError::TimeoutRead`] if nothing was read yet; the connection stays open.
    pub async fn read(&mut self, out: &mut [u8]) -> TransportResult<usize> {
        let mut done = 0;
        while done < out.len() {
            let buffer = match self.read_buffer.take() {
                Some(buffer) => buffer,
                None => {
                    self.read_pos = 0;
                    match self.shared.app_buffers.pop(self.timeout).await {
                        Ok(buffer) => buffer,
                        Err(PopError::Closed) => {
                            self.closed = true;
                            return if done > 0 {
                                Ok(done)
                            } else {
                                Err(TransportError::Closed)
                            };
                        }
                        Err(PopError::Timeout) => {
                            return if done > 0 {
                                Ok(done)
                            } else {
                                Err(TransportError::TimeoutRead)
                            };
                        }
                    }
                }
            };

            let payload = &buffer.as_ref()[DATA_HEADER_LEN..];
            let available = payload.len() - self.read_pos;
            let take = available.min(out.len() - done);
            out[done..done + take].copy_from_slice(&payload[self.read_pos..self.read_pos + take]);
            done += take;
            self.read_pos += take;

            if self.read_pos >= payload.len() {
                // buffer fully consumed: recycle it to the protocol task
                let mut buffer = buffer;
                buffer.clear();
                self.shared.thread_buffers.push(buffer);
                self.read_pos = 0;
            } else {
                self.read_buffer = Some(buffer);
            }
        }
        Ok(done)
    }

    /// Closes this reader. Per the ownership rules the close escalates to the owning
    /// listener, which shuts down the whole peer.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.app_buffers.abort();
        self.parent_shutdown.notify_one();
    }
}

#[async_trait]
impl Connection for RspReader {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Rsp
    }

    fn is_closed(&self) -> bool {
        self.closed || self.shared.app_buffers.is_closed()
    }

    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        RspReader::read(self, buf).await
    }

    async fn close(&mut self) {
        RspReader::close(self);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{data_datagram, listening_state};
    use super::*;
    use crate::transport::datagram::Nack;
    use crate::transport::test_hub::Hub;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config(num_buffers: u16, mtu: usize) -> Config {
        Config {
            mtu,
            num_buffers,
            bandwidth_kbps: 102_400,
            ..Config::default()
        }
    }

    async fn accept_reader_for(listener: &mut RspListener, writer_id: PeerId) -> RspReader {
        loop {
            let reader = tokio::time::timeout(Duration::from_secs(10), listener.accept())
                .await
                .expect("timed out waiting for a reader")
                .expect("listener closed while accepting");
            if reader.id() == writer_id {
                return reader;
            }
        }
    }

    async fn drain_accepted_ids(listener: &mut RspListener) -> Vec<PeerId> {
        let mut ids = Vec::new();
        while let Ok(Ok(reader)) =
            tokio::time::timeout(Duration::from_millis(50), listener.accept()).await
        {
            ids.push(reader.id());
        }
        ids
    }

    fn count_data_datagrams(log: &[Vec<u8>]) -> usize {
        log.iter()
            .filter(|d| matches!(Datagram::deser(d), Ok(Datagram::Data(_))))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_s1_byte_stream_fidelity() {
        let hub = Hub::new();
        let config = small_config(4, 64);
        assert_eq!(config.payload_size(), 56);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        let mut reader = accept_reader_for(&mut b, a.id()).await;

        let payload: Vec<u8> = (0..=255u8).map(|b| b as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                a.write(&payload).await.unwrap();
                a.finish().await;
                a
            })
        };

        let mut received = Vec::new();
        for chunk_len in [100usize, 100, 56] {
            let mut chunk = vec![0u8; chunk_len];
            let n = reader.read(&mut chunk).await.unwrap();
            assert_eq!(n, chunk_len);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);

        let _a = writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_s2_retransmit_after_loss() {
        let hub = Hub::new();
        let config = small_config(4, 64);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();
        let a_id = a.id();

        let mut reader = accept_reader_for(&mut b, a_id).await;

        // drop the datagram with sequence 2 exactly twice on the wire
        let mut dropped = 0;
        hub.set_filter(move |_, datagram| {
            if let Ok(Datagram::Data(header)) = Datagram::deser(datagram) {
                if header.sequence == SeqNo(2) && dropped < 2 {
                    dropped += 1;
                    return true;
                }
            }
            false
        });

        let payload: Vec<u8> = (0..=255u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                a.write(&payload).await.unwrap();
                a.finish().await;
                a
            })
        };

        let mut received = vec![0u8; 256];
        reader.read(&mut received).await.unwrap();
        assert_eq!(received, payload);
        let _a = writer.await.unwrap();

        // allow the final ack request round to settle
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = hub.log();
        let nacked_two = log.iter().any(|d| {
            matches!(Datagram::deser(d), Ok(Datagram::Nack(Nack { ranges, .. }))
                if ranges == vec![SeqRange { start: SeqNo(2), end: SeqNo(2) }])
        });
        assert!(nacked_two, "expected a NACK for {{2,2}}");

        let acked_final = log.iter().any(|d| {
            matches!(Datagram::deser(d), Ok(Datagram::Ack(ack))
                if ack.writer_id == a_id && ack.sequence == SeqNo(4))
        });
        assert!(acked_final, "expected the writer to be acked up to 4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_s3_three_peer_membership() {
        let hub = Hub::new();
        let config = small_config(8, 1400);

        let (a, b, c) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let mut peers = [a.unwrap(), b.unwrap(), c.unwrap()];

        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut ids: Vec<PeerId> = peers.iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "peer ids must be distinct");

        for peer in peers.iter_mut() {
            let accepted = drain_accepted_ids(peer).await;
            assert_eq!(accepted.len(), 3, "each peer sees three children");
        }

        let deny_sent = hub.log().iter().any(|d| {
            matches!(
                Datagram::deser(d),
                Ok(Datagram::Node(NodeDatagram {
                    kind: DatagramType::Deny,
                    ..
                }))
            )
        });
        assert!(!deny_sent, "no DENY expected with distinct random ids");
    }

    #[tokio::test(start_paused = true)]
    async fn test_s6_merged_writes() {
        let hub = Hub::new();
        let config = small_config(16, 64);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        let mut reader = accept_reader_for(&mut b, a.id()).await;

        const N: usize = 10_000;
        let writer = tokio::spawn(async move {
            for i in 0..N {
                a.write(&[(i % 256) as u8]).await.unwrap();
            }
            a.finish().await;
            a
        });

        let mut received = vec![0u8; N];
        reader.read(&mut received).await.unwrap();
        for (i, &byte) in received.iter().enumerate() {
            assert_eq!(byte, (i % 256) as u8, "byte {} out of order", i);
        }
        let _a = writer.await.unwrap();

        let data_count = count_data_datagrams(&hub.log());
        assert!(
            data_count < N,
            "merging should reduce {} single-byte writes to fewer datagrams, got {}",
            N,
            data_count
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_tolerance_under_random_drop() {
        let hub = Hub::new();
        let config = small_config(8, 64);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        let mut reader = accept_reader_for(&mut b, a.id()).await;

        // 30% uniform drop of data and control traffic, deterministic seed
        let mut rng = StdRng::seed_from_u64(0x5eed);
        hub.set_filter(move |_, datagram| {
            matches!(
                Datagram::deser(datagram),
                Ok(Datagram::Data(_))
                    | Ok(Datagram::Ack(_))
                    | Ok(Datagram::Nack(_))
                    | Ok(Datagram::AckRequest(_))
            ) && rng.gen_bool(0.3)
        });

        let payload: Vec<u8> = (0..4096usize).map(|i| (i * 31 % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                a.write(&payload).await.unwrap();
                a.finish().await;
                a
            })
        };

        let mut received = vec![0u8; payload.len()];
        reader.read(&mut received).await.unwrap();
        assert_eq!(received, payload);
        let _a = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_window_restores_send_order() {
        let mut peer = listening_state(small_config(8, 64));
        peer.state.add_child(7, SeqNo::ZERO).await;
        let mut reader = peer.accept_rx.recv().await.unwrap();

        for seq in [1u16, 0, 3, 2, 6, 5, 4, 7] {
            let mut datagram = data_datagram(7, seq, &[seq as u8; 3]);
            let header = match Datagram::deser(datagram.as_ref()).unwrap() {
                Datagram::Data(header) => header,
                _ => unreachable!(),
            };
            peer.state.handle_data(header, &mut datagram).await;
        }

        let mut received = vec![0u8; 24];
        reader.read(&mut received).await.unwrap();
        let expected: Vec<u8> = (0u8..8).flat_map(|b| [b, b, b]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_early_nack_bounds_the_hole() {
        let mut peer = listening_state(small_config(8, 64));
        peer.state.add_child(7, SeqNo::ZERO).await;
        peer.socket.take_sent();

        // expecting 0, receiving 2: hole is {0, 1}
        let mut datagram = data_datagram(7, 2, &[1, 2, 3]);
        let header = match Datagram::deser(datagram.as_ref()).unwrap() {
            Datagram::Data(h) => h,
            _ => unreachable!(),
        };
        peer.state.handle_data(header, &mut datagram).await;

        let sent = peer.socket.take_sent();
        assert_eq!(sent.len(), 1);
        match Datagram::deser(&sent[0]).unwrap() {
            Datagram::Nack(nack) => {
                assert_eq!(nack.writer_id, 7);
                assert_eq!(
                    nack.ranges,
                    vec![SeqRange {
                        start: SeqNo(0),
                        end: SeqNo(1)
                    }]
                );
            }
            other => panic!("expected a NACK, got {:?}", other),
        }

        // receiving 4 next: only the new hole {3} is requested
        let mut datagram = data_datagram(7, 4, &[4]);
        let header = match Datagram::deser(datagram.as_ref()).unwrap() {
            Datagram::Data(h) => h,
            _ => unreachable!(),
        };
        peer.state.handle_data(header, &mut datagram).await;

        let sent = peer.socket.take_sent();
        assert_eq!(sent.len(), 1);
        match Datagram::deser(&sent[0]).unwrap() {
            Datagram::Nack(nack) => assert_eq!(
                nack.ranges,
                vec![SeqRange {
                    start: SeqNo(3),
                    end: SeqNo(3)
                }]
            ),
            other => panic!("expected a NACK, got {:?}", other),
        }

        // receiving 3: the hole before it is already requested, no new NACK
        let mut datagram = data_datagram(7, 3, &[3]);
        let header = match Datagram::deser(datagram.as_ref()).unwrap() {
            Datagram::Data(h) => h,
            _ => unreachable!(),
        };
        peer.state.handle_data(header, &mut datagram).await;
        assert!(peer.socket.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_ack_request_when_caught_up_yields_ack() {
        let mut peer = listening_state(small_config(8, 64));
        peer.state.add_child(7, SeqNo::ZERO).await;
        peer.socket.take_sent();

        // deliver 0..3 in order
        for seq in 0u16..3 {
            let mut datagram = data_datagram(7, seq, &[0]);
            let header = match Datagram::deser(datagram.as_ref()).unwrap() {
                Datagram::Data(h) => h,
                _ => unreachable!(),
            };
            peer.state.handle_data(header, &mut datagram).await;
        }
        peer.socket.take_sent();

        peer.state
            .handle_ack_request(crate::transport::datagram::AckRequest {
                writer_id: 7,
                sequence: SeqNo(2),
            })
            .await;

        let sent = peer.socket.take_sent();
        assert_eq!(sent.len(), 1);
        match Datagram::deser(&sent[0]).unwrap() {
            Datagram::Ack(ack) => {
                assert_eq!(ack.writer_id, 7);
                assert_eq!(ack.reader_id, 1);
                assert_eq!(ack.sequence, SeqNo(2));
            }
            other => panic!("expected an ACK, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_close() {
        let hub = Hub::new();
        let mut a = RspListener::listen_with_socket(small_config(4, 64), hub.socket())
            .await
            .unwrap();

        a.close().await;
        a.close().await;
        assert!(matches!(a.write(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_exit_wakes_blocked_reader() {
        let hub = Hub::new();
        let config = small_config(4, 64);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        let mut reader = accept_reader_for(&mut b, a.id()).await;
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close().await;

        let result = read_task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_trait_surface() {
        let hub = Hub::new();
        let config = small_config(4, 64);

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        let reader = accept_reader_for(&mut b, a.id()).await;
        let writer: Box<dyn Connection> = Box::new(a);
        let mut reader: Box<dyn Connection> = Box::new(reader);

        assert_eq!(writer.connection_type(), ConnectionType::Rsp);
        assert!(writer.connection_type().is_multicast());

        writer.write(b"via trait").await.unwrap();
        // a reader does not support writing
        assert!(matches!(
            reader.write(b"nope").await,
            Err(TransportError::Unsupported)
        ));

        let mut buf = [0u8; 9];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"via trait");

        reader.close().await;
        assert!(reader.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_leaves_connection_open() {
        let hub = Hub::new();
        let config = Config {
            default_timeout: Some(Duration::from_millis(50)),
            ..small_config(4, 64)
        };

        let (a, b) = tokio::join!(
            RspListener::listen_with_socket(config.clone(), hub.socket()),
            RspListener::listen_with_socket(config.clone(), hub.socket()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        let mut reader = accept_reader_for(&mut b, a.id()).await;

        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(TransportError::TimeoutRead)
        ));

        a.write(b"late").await.unwrap();
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"late");
    }
}
