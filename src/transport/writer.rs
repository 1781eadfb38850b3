//! Send path of the protocol task: sequencing and coalescing outbound datagrams, serving
//! NACK-driven repeats, aggregating ACKs and enforcing the retry budget.

use std::sync::atomic::Ordering;

use tracing::{trace, warn};

use crate::transport::buffer_pool::FixedBuf;
use crate::transport::datagram::{Ack, DataHeader, Nack, PeerId, SeqRange, DATA_HEADER_LEN};
use crate::transport::peer::{far_future, ProtocolState};
use crate::transport::TransportStats;
use tokio::time::Instant;

fn data_size(buffer: &FixedBuf) -> u16 {
    u16::from_le_bytes([buffer.as_ref()[2], buffer.as_ref()[3]])
}

impl ProtocolState {
    /// One round of outgoing work: serve pending repeats first, otherwise send fresh data;
    /// then re-arm the timer for either an immediate follow-up round or the ACK request
    /// cadence.
    pub(super) async fn process_outgoing(&mut self) {
        if !self.repeat_queue.is_empty() {
            self.repeat_data().await;
        } else {
            self.write_data().await;
        }

        if !self.writer_shared.thread_buffers.is_empty() || !self.repeat_queue.is_empty() {
            // more to send - run again right after the next poll of the socket
            self.deadline = Instant::now();
            return;
        }

        if self.write_buffers.is_empty() {
            // everything acknowledged
            self.timeouts = 0;
            self.deadline = far_future();
            return;
        }

        let elapsed = self.last_activity.elapsed();
        if elapsed >= self.config.ack_timeout {
            self.last_activity = Instant::now();
            self.timeouts += 1;
            if self.timeouts < self.config.max_timeouts {
                self.send_ack_request().await;
            }
            self.deadline = Instant::now() + self.config.ack_timeout;
        } else {
            self.deadline = Instant::now() + (self.config.ack_timeout - elapsed);
        }
    }

    /// Takes the next application buffer, stamps its sequence, optionally coalesces
    /// following small writes into it, paces it through the token bucket and sends it.
    async fn write_data(&mut self) {
        let Some(mut buffer) = self.writer_shared.thread_buffers.try_pop() else {
            return;
        };
        self.timeouts = 0;

        let sequence = self.sequence.fetch_next();
        DataHeader::patch_sequence(buffer.as_mut(), sequence);

        if self.config.merge_writes {
            let payload_size = self.config.payload_size();
            let mut size = data_size(&buffer);
            let mut grown = false;
            while (size as usize) < payload_size {
                let Some(mut extra) = self.writer_shared.thread_buffers.try_pop_if(|next| {
                    size as usize + data_size(next) as usize <= payload_size
                }) else {
                    break;
                };
                bytes::BufMut::put_slice(&mut buffer, &extra.as_ref()[DATA_HEADER_LEN..]);
                size += data_size(&extra);
                grown = true;
                TransportStats::bump(&self.stats.datagrams_merged);

                extra.clear();
                self.writer_shared.app_buffers.push(extra);
            }
            if grown {
                DataHeader::patch_size(buffer.as_mut(), size);
            }
        }

        let len = buffer.len();
        self.rate.acquire(len).await;
        self.socket.send(buffer.as_ref()).await;
        TransportStats::bump(&self.stats.datagrams_sent);
        self.stats
            .send_rate_kbps
            .store(self.rate.rate(), Ordering::Relaxed);
        self.last_activity = Instant::now();

        // retained for repeats and for local delivery once acknowledged
        self.write_buffers.push_back(buffer);

        if self.children.len() == 1 {
            // all alone - the only reader is ourselves
            self.finish_write_queue(sequence).await;
        }
    }

    /// Serves the front of the repeat queue, at most one datagram per call so inbound
    /// processing interleaves with retransmission bursts.
    async fn repeat_data(&mut self) {
        self.timeouts = 0;

        while let Some(request) = self.repeat_queue.front().copied() {
            let distance = self.sequence.distance_from(request.start);
            if distance == 0 {
                warn!("ignoring invalid nack ({}..{})", request.start, request.end);
                self.repeat_queue.pop_front();
                continue;
            }

            let in_window = (distance as usize) <= self.write_buffers.len();
            if in_window {
                // not acknowledged yet, the datagram is still in the write deque
                let index = self.write_buffers.len() - distance as usize;
                debug_assert_eq!(
                    DataHeader::deser(&mut self.write_buffers[index].as_ref())
                        .map(|h| h.sequence)
                        .ok(),
                    Some(request.start)
                );
                let len = self.write_buffers[index].len();
                self.rate.acquire(len).await;
                self.socket.send(self.write_buffers[index].as_ref()).await;
                TransportStats::bump(&self.stats.datagrams_repeated);
            }

            if request.start == request.end {
                self.repeat_queue.pop_front();
            } else if let Some(front) = self.repeat_queue.front_mut() {
                front.start = request.start.next();
            }

            if in_window {
                return;
            }
        }
    }

    /// Releases all write buffers up to `acked`, delivering a copy of each to the self
    /// child. The protocol task never blocks on the application: if the self reader has no
    /// free buffers, the local copy is dropped.
    pub(super) async fn finish_write_queue(&mut self, acked: crate::transport::datagram::SeqNo) {
        let outstanding = self.sequence.distance_from(acked);
        if outstanding == 0 {
            return;
        }
        let keep = (outstanding - 1) as usize;
        let Some(self_index) = self.child_index(self.id) else {
            return;
        };

        trace!(
            "got all acks up to {}, advancing {} buffers",
            acked,
            self.write_buffers.len().saturating_sub(keep)
        );

        while self.write_buffers.len() > keep {
            let mut buffer = self
                .write_buffers
                .pop_front()
                .expect("write deque cannot be empty here");

            let child = &mut self.children[self_index];
            if !child.shared.app_buffers.is_closed() {
                match child.shared.thread_buffers.try_pop() {
                    Some(mut copy) => {
                        copy.clear();
                        bytes::BufMut::put_slice(&mut copy, buffer.as_ref());
                        child.shared.app_buffers.push(copy);
                    }
                    None => {
                        trace!("self reader out of buffers, dropping local copy");
                        TransportStats::bump(&self.stats.datagrams_dropped);
                    }
                }
            }
            // the local stream position advances regardless, tracking what the group
            // already considers delivered
            child.sequence = child.sequence.next();

            buffer.clear();
            self.writer_shared.app_buffers.push(buffer);
        }

        let child = &mut self.children[self_index];
        child.acked = child.sequence.minus(1);
        self.timeouts = 0;
    }

    /// Writer-side ACK handling: record the reader's progress and release everything that
    /// all readers have acknowledged.
    pub(super) async fn handle_ack(&mut self, ack: Ack) {
        TransportStats::bump(&self.stats.acks_received);
        if ack.writer_id != self.id {
            return;
        }

        let num_buffers = self.config.num_buffers;
        let Some(index) = self.child_index(ack.reader_id) else {
            warn!("ACK from unknown reader {} - dropping", ack.reader_id);
            return;
        };

        {
            let child = &mut self.children[index];
            if child.acked.distance_from(ack.sequence) <= num_buffers {
                trace!("late ack from {}", ack.reader_id);
                return;
            }
            child.acked = ack.sequence;
        }
        self.timeouts = 0;

        // group-wide acknowledged sequence: the minimum over all readers, where "behind" is
        // detected through the wrapping distance. A reader whose ack lags the minimum by
        // more than the window is wrap-ahead and does not pin it.
        let mut acked_all = ack.sequence;
        for child in &self.children {
            if child.id == self.id {
                continue;
            }
            if child.acked.distance_from(acked_all) > num_buffers {
                acked_all = child.acked;
            }
        }

        let self_acked = self.children[self_index_must(self, self.id)].acked;
        if acked_all.distance_from(self_acked) <= num_buffers {
            self.finish_write_queue(acked_all).await;
        }
    }

    /// Writer-side NACK handling: queue the requested ranges for retransmission and slow
    /// down proportionally to the reported loss.
    pub(super) async fn handle_nack(&mut self, nack: Nack) {
        TransportStats::bump(&self.stats.nacks_received);
        if nack.writer_id != self.id {
            trace!(
                "ignoring {} nacks from {} for writer {}",
                nack.ranges.len(),
                nack.reader_id,
                nack.writer_id
            );
            return;
        }
        if self.child_index(nack.reader_id).is_none() {
            warn!("NACK from unknown reader {} - dropping", nack.reader_id);
            return;
        }

        self.timeouts = 0;
        self.add_repeat(&nack.ranges);
    }

    /// Merges ranges into the repeat queue, coalescing overlaps, and applies the rate
    /// slow-down for the newly reported loss.
    pub(super) fn add_repeat(&mut self, ranges: &[SeqRange]) {
        let mut lost: u32 = 0;

        for &nack in ranges {
            // wrapped ranges are split before they go on the wire
            debug_assert!(nack.start.0 <= nack.end.0);

            let mut merged = false;
            for old in self.repeat_queue.iter_mut() {
                if old.start.0 <= nack.end.0 && old.end.0 >= nack.start.0 {
                    if old.start.0 > nack.start.0 {
                        lost += (old.start.0 - nack.start.0) as u32;
                        old.start = nack.start;
                    }
                    if old.end.0 < nack.end.0 {
                        lost += (nack.end.0 - old.end.0) as u32;
                        old.end = nack.end;
                    }
                    merged = true;
                    break;
                }
            }
            if !merged {
                lost += nack.len() as u32;
                self.repeat_queue.push_back(nack);
            }
        }

        if lost > 0 {
            // total outstanding loss is bounded by the window size
            let lost = lost.min(self.config.num_buffers as u32) as u16;
            self.rate.on_loss(lost);
        }
    }

    /// Timer handling while listening: do outgoing work, and once the ACK retry budget is
    /// exhausted either drop the laggards we can identify or give up entirely.
    pub(super) async fn handle_connected_timeout(&mut self) {
        self.process_outgoing().await;

        if self.timeouts < self.config.max_timeouts {
            return;
        }
        warn!("too many timeouts during send: {}", self.timeouts);

        let num_buffers = self.config.num_buffers;
        let newest = self.sequence.minus(1);

        let any_caught_up = self.children.iter().any(|child| {
            child.id != self.id && newest.distance_from(child.acked) < num_buffers
        });

        if !any_caught_up {
            // no reader is anywhere near - we are probably disconnected
            self.on_close().await;
            return;
        }

        let laggards: Vec<PeerId> = self
            .children
            .iter()
            .filter(|child| child.id != self.id && newest.distance_from(child.acked) != 0)
            .map(|child| child.id)
            .collect();
        for id in laggards {
            warn!("dropping laggard reader {}", id);
            self.send_node(crate::transport::datagram::DatagramType::Exit, id)
                .await;
            self.remove_child(id).await;
        }

        let forced = self.sequence.minus(self.write_buffers.len() as u16);
        for child in &mut self.children {
            child.acked = forced;
        }
        self.timeouts = 0;
    }
}

fn self_index_must(state: &ProtocolState, id: PeerId) -> usize {
    state
        .child_index(id)
        .expect("the self child exists while listening")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::datagram::{Datagram, SeqNo};
    use crate::transport::peer::test_support::{data_datagram, listening_state};
    use rstest::rstest;

    fn config() -> Config {
        Config {
            num_buffers: 8,
            mtu: 64,
            ..Config::default()
        }
    }

    fn range(start: u16, end: u16) -> SeqRange {
        SeqRange {
            start: SeqNo(start),
            end: SeqNo(end),
        }
    }

    #[rstest]
    #[case::disjoint(vec![range(2, 4), range(8, 9)], vec![range(2, 4), range(8, 9)])]
    #[case::extend_end(vec![range(2, 4), range(3, 6)], vec![range(2, 6)])]
    #[case::extend_start(vec![range(4, 6), range(2, 5)], vec![range(2, 6)])]
    #[case::contained(vec![range(2, 6), range(3, 4)], vec![range(2, 6)])]
    #[case::touching(vec![range(2, 4), range(4, 7)], vec![range(2, 7)])]
    fn test_add_repeat_coalesces(#[case] input: Vec<SeqRange>, #[case] expected: Vec<SeqRange>) {
        let mut peer = listening_state(config());
        for nack in input {
            peer.state.add_repeat(&[nack]);
        }
        let queued: Vec<SeqRange> = peer.state.repeat_queue.iter().copied().collect();
        assert_eq!(queued, expected);
    }

    #[test]
    fn test_add_repeat_slows_down_send_rate() {
        let mut peer = listening_state(config());
        let before = peer.state.rate.rate();
        peer.state.add_repeat(&[range(0, 5)]);
        assert!(peer.state.rate.rate() < before);

        // a duplicate of an already queued range reports no new loss
        let after_first = peer.state.rate.rate();
        peer.state.add_repeat(&[range(0, 5)]);
        assert_eq!(peer.state.rate.rate(), after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_serves_from_write_buffers() {
        let mut peer = listening_state(config());
        peer.state.add_child(1, SeqNo::ZERO).await; // self child
        peer.socket.take_sent();

        // three sent, unacknowledged datagrams
        for seq in 0u16..3 {
            peer.state
                .write_buffers
                .push_back(data_datagram(1, seq, &[seq as u8]));
        }
        peer.state.sequence = SeqNo(3);

        peer.state.add_repeat(&[range(1, 1)]);
        peer.state.repeat_data().await;

        let sent = peer.socket.take_sent();
        assert_eq!(sent.len(), 1);
        match Datagram::deser(&sent[0]).unwrap() {
            Datagram::Data(header) => assert_eq!(header.sequence, SeqNo(1)),
            other => panic!("expected a DATA repeat, got {:?}", other),
        }
        assert!(peer.state.repeat_queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_repeat_request_is_discarded() {
        let mut peer = listening_state(config());
        peer.state.sequence = SeqNo(10);
        // the requested range is no longer in the write deque (already acknowledged)
        peer.state.add_repeat(&[range(2, 3)]);
        peer.state.repeat_data().await;

        assert!(peer.state.repeat_queue.is_empty());
        assert!(peer.socket.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_aggregation_releases_up_to_slowest_reader() {
        let mut peer = listening_state(config());
        peer.state.add_child(1, SeqNo::ZERO).await; // self child
        peer.state.add_child(7, SeqNo::ZERO).await;
        peer.state.add_child(9, SeqNo::ZERO).await;
        peer.socket.take_sent();

        for seq in 0u16..4 {
            peer.state
                .write_buffers
                .push_back(data_datagram(1, seq, &[seq as u8]));
        }
        peer.state.sequence = SeqNo(4);

        // reader 7 acks everything, reader 9 only the first datagram
        peer.state
            .handle_ack(Ack {
                reader_id: 9,
                writer_id: 1,
                sequence: SeqNo(0),
            })
            .await;
        peer.state
            .handle_ack(Ack {
                reader_id: 7,
                writer_id: 1,
                sequence: SeqNo(3),
            })
            .await;

        // only the group-wide acknowledged prefix is released
        assert_eq!(peer.state.write_buffers.len(), 3);

        peer.state
            .handle_ack(Ack {
                reader_id: 9,
                writer_id: 1,
                sequence: SeqNo(3),
            })
            .await;
        assert!(peer.state.write_buffers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_writer_is_ignored() {
        let mut peer = listening_state(config());
        peer.state.add_child(1, SeqNo::ZERO).await;
        peer.state.add_child(7, SeqNo::ZERO).await;

        peer.state
            .write_buffers
            .push_back(data_datagram(1, 0, &[0]));
        peer.state.sequence = SeqNo(1);

        peer.state
            .handle_ack(Ack {
                reader_id: 7,
                writer_id: 42,
                sequence: SeqNo(0),
            })
            .await;
        assert_eq!(peer.state.write_buffers.len(), 1);
    }
}
