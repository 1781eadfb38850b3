//! Receive path of the protocol task: in-order delivery, out-of-order parking with early
//! NACKs, and answering a writer's ACK requests.

use std::mem;

use tracing::{debug, trace, warn};

use crate::transport::buffer_pool::FixedBuf;
use crate::transport::datagram::{Ack, AckRequest, DataHeader, SeqNo, SeqRange};
use crate::transport::peer::ProtocolState;
use crate::transport::TransportStats;

impl ProtocolState {
    /// Handles an inbound DATA datagram. `buf` holds the full datagram; on consumption its
    /// contents are swapped against a free buffer of the child's pool, so `buf` stays usable
    /// as the receive staging buffer.
    pub(super) async fn handle_data(&mut self, header: DataHeader, buf: &mut FixedBuf) {
        if header.writer_id == self.id {
            // multicast loopback is off, but some stacks occasionally deliver our own
            // datagrams anyway - drop them, the self-child path covers local delivery
            return;
        }

        let num_buffers = self.config.num_buffers;
        let Some(index) = self.child_index(header.writer_id) else {
            warn!("DATA from unknown writer {} - dropping", header.writer_id);
            return;
        };

        let sequence = header.sequence;
        let expected = self.children[index].sequence;
        let distance = sequence.distance_from(expected);

        if distance == 0 {
            // the expected packet: deliver, then drain the contiguous parked prefix
            let Some(mut fresh) = self.children[index].shared.thread_buffers.try_pop() else {
                trace!("reader too slow, dropping packet {}", sequence);
                TransportStats::bump(&self.stats.datagrams_dropped);
                return;
            };
            mem::swap(&mut fresh, buf);
            self.push_data_buffer(index, fresh).await;

            loop {
                let parked = {
                    let child = &mut self.children[index];
                    match child.recv_buffers.front() {
                        Some(Some(_)) => child.recv_buffers.pop_front().flatten(),
                        _ => None,
                    }
                };
                match parked {
                    Some(buffer) => self.push_data_buffer(index, buffer).await,
                    None => break,
                }
            }
            // the deque is indexed relative to `sequence + 1`; consuming the in-order
            // packet shifted the base, so a leading hole marker is now redundant
            let child = &mut self.children[index];
            if matches!(child.recv_buffers.front(), Some(None)) {
                child.recv_buffers.pop_front();
            }
            return;
        }

        if distance > num_buffers {
            // a retransmit for another reader, or we are hopelessly behind
            return;
        }

        // out of order: park the datagram in the reorder deque
        let slot = (distance - 1) as usize;
        {
            let child = &self.children[index];
            if child.recv_buffers.len() > slot && child.recv_buffers[slot].is_some() {
                return;
            }
        }
        let Some(mut fresh) = self.children[index].shared.thread_buffers.try_pop() else {
            trace!("reader too slow, dropping out-of-order packet {}", sequence);
            TransportStats::bump(&self.stats.datagrams_dropped);
            return;
        };
        mem::swap(&mut fresh, buf);

        let child = &mut self.children[index];
        if child.recv_buffers.len() <= slot {
            child.recv_buffers.resize_with(slot + 1, || None);
        }
        child.recv_buffers[slot] = Some(fresh);

        // early NACK: request the hole this datagram newly bounds. If the previous slot is
        // filled the hole was already requested when that datagram was parked.
        if slot > 0 && child.recv_buffers[slot - 1].is_some() {
            return;
        }
        let mut start = child.sequence;
        for j in (0..slot).rev() {
            if child.recv_buffers[j].is_some() {
                // slot j holds sequence + 1 + j, so the hole starts just after it
                start = child.sequence.plus(j as u16 + 2);
                break;
            }
        }
        let nack = SeqRange {
            start,
            end: sequence.minus(1),
        };
        debug!(
            "early nack {}..{} for writer {} (expecting {})",
            nack.start, nack.end, header.writer_id, expected
        );
        self.send_nack(header.writer_id, vec![nack]).await;
    }

    /// Delivers the next in-order buffer of a child to its application queue, emitting a
    /// cumulative ACK on the configured cadence.
    pub(super) async fn push_data_buffer(&mut self, index: usize, buffer: FixedBuf) {
        let ack_freq = self.config.ack_freq as u32;
        let child = &mut self.children[index];

        let sequence = child.sequence;
        debug_assert_eq!(
            DataHeader::deser(&mut buffer.as_ref()).map(|h| h.sequence).ok(),
            Some(sequence)
        );

        child.sequence = sequence.next();
        child.shared.app_buffers.push(buffer);

        // stagger acks across readers by mixing in the own id
        let need_ack = (sequence.0 as u32 + self.id as u32) % ack_freq == 0;
        let writer_id = child.id;
        if need_ack {
            self.send_ack(Ack {
                reader_id: self.id,
                writer_id,
                sequence,
            })
            .await;
        }
    }

    /// A writer asks for a cumulative ACK up to `request.sequence`: confirm if we have
    /// everything, otherwise answer with NACK ranges covering all holes.
    pub(super) async fn handle_ack_request(&mut self, request: AckRequest) {
        if request.writer_id == self.id {
            return;
        }
        let num_buffers = self.config.num_buffers;
        let Some(index) = self.child_index(request.writer_id) else {
            warn!("ACKREQ from unknown writer {} - dropping", request.writer_id);
            return;
        };

        let child = &self.children[index];
        let got = child.sequence.minus(1);
        let missing = request.sequence.distance_from(got);
        trace!(
            "ack request {} from {}, got {}, missing {}",
            request.sequence,
            request.writer_id,
            got,
            missing
        );

        if missing == 0 || missing > num_buffers {
            // we have everything requested (or the request is out of window): plain ack
            let ack = Ack {
                reader_id: self.id,
                writer_id: request.writer_id,
                sequence: got,
            };
            self.send_ack(ack).await;
            return;
        }

        let max_ranges = self.config.max_nack_ranges();
        let ranges = Self::missing_ranges(child, request.sequence, max_ranges);
        debug_assert!(!ranges.is_empty());
        self.send_nack(request.writer_id, ranges).await;
    }

    /// Collects up to `max_ranges` ranges covering every sequence in
    /// `(child.sequence - 1, up_to]` that has not been received.
    fn missing_ranges(
        child: &crate::transport::peer::Child,
        up_to: SeqNo,
        max_ranges: usize,
    ) -> Vec<SeqRange> {
        let mut ranges: Vec<SeqRange> = Vec::new();
        let mut run_start: Option<SeqNo> = None;

        let total = up_to.distance_from(child.sequence);
        for offset in 0..=total {
            let sequence = child.sequence.plus(offset);
            let received = if offset == 0 {
                // the expected packet is by definition missing
                false
            } else {
                let slot = (offset - 1) as usize;
                child.recv_buffers.len() > slot && child.recv_buffers[slot].is_some()
            };

            if received {
                if let Some(start) = run_start.take() {
                    ranges.push(SeqRange {
                        start,
                        end: sequence.minus(1),
                    });
                }
            } else if run_start.is_none() {
                run_start = Some(sequence);

                // leave room for the final range and a potential wrap split
                if ranges.len() + 2 >= max_ranges {
                    ranges.push(SeqRange {
                        start: sequence,
                        end: up_to,
                    });
                    return ranges;
                }
            }
        }

        if let Some(start) = run_start {
            ranges.push(SeqRange { start, end: up_to });
        }
        ranges
    }
}
