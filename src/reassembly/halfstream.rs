//! Per-direction TCP state (spec §3, §4.4).

use std::collections::VecDeque;

/// State of one direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    SynSent,
    SynReceived,
    Established,
    FinSent,
    FinConfirmed,
    Closing,
    Closed,
}

/// A raw TCP payload segment retained pending in-order delivery.
#[derive(Debug, Clone)]
pub struct Page {
    pub seq: u32,
    pub ack: u32,
    pub urg: bool,
    pub fin: bool,
    pub urgent_pointer: u16,
    pub payload: Vec<u8>,
}

impl Page {
    pub fn end_seq(&self) -> u32 {
        self.seq
            .wrapping_add(self.payload.len() as u32)
            .wrapping_add(if self.fin { 1 } else { 0 })
    }
}

/// One direction (client-to-server or server-to-client) of a TCP connection.
#[derive(Debug, Clone)]
pub struct HalfStream {
    pub state: HalfState,
    pub seq: u32,
    pub ack: u32,
    pub expected_receive_seq: u32,
    pub pages: VecDeque<Page>,
    pub recv_buffer: Vec<u8>,
    pub delivered_bytes: u64,
}

impl HalfStream {
    pub fn new(state: HalfState) -> Self {
        HalfStream {
            state,
            seq: 0,
            ack: 0,
            expected_receive_seq: 0,
            pages: VecDeque::new(),
            recv_buffer: Vec::new(),
            delivered_bytes: 0,
        }
    }

    /// Inserts `page` into the reorder buffer keeping it ordered by `seq`,
    /// appending when `seq` is greater than or equal to every existing page.
    pub fn insert_out_of_order(&mut self, page: Page) {
        match self.pages.iter().position(|p| super::seq::seq_diff(p.seq, page.seq) > 0) {
            Some(idx) => self.pages.insert(idx, page),
            None => self.pages.push_back(page),
        }
    }

    /// Feeds one incoming segment into the reorder buffer (spec §4.4.6's
    /// `tcpQueue`): delivers it (and any now-contiguous buffered pages)
    /// into `recv_buffer` when it arrives in order, or parks it in `pages`
    /// when it doesn't.
    pub fn enqueue(&mut self, seq: u32, payload: &[u8], fin: bool, urg: bool, urgent_pointer: u16) -> QueueOutcome {
        let mut outcome = QueueOutcome::default();

        if super::seq::seq_diff(seq, self.expected_receive_seq) <= 0 {
            let end = seq.wrapping_add(payload.len() as u32).wrapping_add(if fin { 1 } else { 0 });
            if super::seq::seq_diff(end, self.expected_receive_seq) <= 0 {
                outcome.retransmitted = true;
                return outcome;
            }

            let page = Page { seq, ack: 0, urg, fin, urgent_pointer, payload: payload.to_vec() };
            if self.deliver_from_page(&page) {
                outcome.fin_delivered = true;
            }

            while let Some(front) = self.pages.front() {
                if super::seq::seq_diff(front.seq, self.expected_receive_seq) > 0 {
                    break;
                }
                let front = self.pages.pop_front().expect("checked by front()");
                if super::seq::seq_diff(front.end_seq(), self.expected_receive_seq) <= 0 {
                    outcome.retransmitted = true;
                    continue;
                }
                if self.deliver_from_page(&front) {
                    outcome.fin_delivered = true;
                }
            }
        } else {
            outcome.out_of_order = true;
            let page = Page { seq, ack: 0, urg, fin, urgent_pointer, payload: payload.to_vec() };
            self.insert_out_of_order(page);
            if fin {
                outcome.fin_lazy = true;
            }
        }

        outcome
    }

    /// Copies the still-needed bytes of `page` into `recv_buffer`, eliding
    /// the urgent byte when `URG` points inside the newly delivered range,
    /// and advances `expected_receive_seq`. Returns whether `page` carried
    /// an in-order FIN.
    fn deliver_from_page(&mut self, page: &Page) -> bool {
        let skip = super::seq::seq_diff(self.expected_receive_seq, page.seq).max(0) as usize;
        if skip < page.payload.len() {
            let urgent_index = if page.urg && page.urgent_pointer > 0 {
                let idx = page.urgent_pointer as usize - 1;
                (idx >= skip && idx < page.payload.len()).then_some(idx)
            } else {
                None
            };
            match urgent_index {
                Some(idx) => {
                    self.recv_buffer.extend_from_slice(&page.payload[skip..idx]);
                    self.recv_buffer.extend_from_slice(&page.payload[idx + 1..]);
                }
                None => self.recv_buffer.extend_from_slice(&page.payload[skip..]),
            }
        }
        self.expected_receive_seq = page.seq.wrapping_add(page.payload.len() as u32).wrapping_add(if page.fin { 1 } else { 0 });
        page.fin
    }
}

/// Result of feeding one segment through [`HalfStream::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOutcome {
    pub retransmitted: bool,
    pub out_of_order: bool,
    pub fin_lazy: bool,
    pub fin_delivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_segments_deliver_immediately() {
        let mut h = HalfStream::new(HalfState::Established);
        h.expected_receive_seq = 10;
        let outcome = h.enqueue(10, b"hello", false, false, 0);
        assert!(!outcome.retransmitted && !outcome.out_of_order);
        assert_eq!(h.recv_buffer, b"hello");
        assert_eq!(h.expected_receive_seq, 15);
    }

    #[test]
    fn out_of_order_segment_is_parked_and_flushed_later() {
        let mut h = HalfStream::new(HalfState::Established);
        h.expected_receive_seq = 10;
        let outcome = h.enqueue(15, b"world", false, false, 0);
        assert!(outcome.out_of_order);
        assert!(h.recv_buffer.is_empty());

        let outcome = h.enqueue(10, b"hello", false, false, 0);
        assert!(!outcome.out_of_order && !outcome.retransmitted);
        assert_eq!(h.recv_buffer, b"helloworld");
        assert_eq!(h.expected_receive_seq, 20);
    }

    #[test]
    fn fully_covered_retransmission_is_dropped() {
        let mut h = HalfStream::new(HalfState::Established);
        h.expected_receive_seq = 10;
        h.enqueue(10, b"hello", false, false, 0);
        let outcome = h.enqueue(10, b"hello", false, false, 0);
        assert!(outcome.retransmitted);
        assert_eq!(h.recv_buffer, b"hello");
    }

    #[test]
    fn urgent_byte_is_elided_from_the_delivered_stream() {
        let mut h = HalfStream::new(HalfState::Established);
        h.expected_receive_seq = 0;
        // "worl#d", urgent_pointer=5 means the byte at index 4 ('#') is elided.
        let outcome = h.enqueue(0, b"worl#d", false, true, 5);
        assert!(!outcome.out_of_order);
        assert_eq!(h.recv_buffer, b"world");
    }

    #[test]
    fn out_of_order_fin_is_reported_lazily() {
        let mut h = HalfStream::new(HalfState::Established);
        h.expected_receive_seq = 10;
        let outcome = h.enqueue(15, b"bye", true, false, 0);
        assert!(outcome.fin_lazy);
        assert!(!outcome.fin_delivered);
    }
}
