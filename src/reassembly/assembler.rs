//! Per-lane TCP reassembly state machine (spec §4.4).
//!
//! Each lane owns one `Lane`: a [`slab::Slab`] of [`Stream`]s plus two
//! intrusive doubly-linked lists threaded through `Stream`'s own
//! `lru_*`/`closing_*` index fields -- an LRU list for admission control
//! (spec §4.4.2/§4.4.8) and a closing-timeout list (spec §4.4.8). Using
//! slab indices instead of `Box`/`Rc` pointers (as the Go original's
//! `container/list` would translate to) keeps the whole lane
//! allocation-free after warm-up and sidesteps the borrow-checker fight a
//! pointer-based intrusive list would pick in safe Rust.

use crate::analyzer::{self, detector, registry};
use crate::breakdown::SessionBreakdown;
use crate::codec::tcp::TcpHeader;
use crate::config::PipelineConfig;
use crate::reassembly::halfstream::HalfState;
use crate::reassembly::seq;
use crate::reassembly::stream::{Stream, StreamState, Tuple4};
use slab::Slab;
use std::collections::HashMap;
use std::time::Duration;

const CLOSING_TIMEOUT: Duration = Duration::from_secs(30);
const DETECTION_BYTE_THRESHOLD: u64 = 200;

/// One reassembly lane: an independent, single-threaded slice of the
/// overall stream table (spec §5, "Per-lane state ... no locking").
pub struct Lane {
    tiny_payload_bytes: usize,
    max_streams: usize,
    streams: Slab<Stream>,
    index: HashMap<Tuple4, usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    closing_head: Option<usize>,
    closing_tail: Option<usize>,
    breakdowns: Vec<SessionBreakdown>,
    /// The lane's own notion of "now": the latest segment timestamp seen,
    /// advanced synthetically by `advance_clock` between segments so it
    /// stays in the same timeline `closing_expiry` (set from segment
    /// timestamps) was computed in. Using wall-clock elapsed time here
    /// instead would never catch up to a capture-time expiry.
    clock: Duration,
}

impl Lane {
    pub fn new(config: &PipelineConfig) -> Self {
        Lane {
            tiny_payload_bytes: config.tiny_tcp_payload_bytes,
            max_streams: config.max_tcp_streams_count,
            streams: Slab::new(),
            index: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            closing_head: None,
            closing_tail: None,
            breakdowns: Vec::new(),
            clock: Duration::ZERO,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_state(&self, tuple: &Tuple4) -> Option<StreamState> {
        self.lookup(tuple).and_then(|(key, _)| self.streams.get(key)).map(|s| s.state)
    }

    /// Drains and returns every breakdown produced since the last drain.
    pub fn take_breakdowns(&mut self) -> Vec<SessionBreakdown> {
        std::mem::take(&mut self.breakdowns)
    }

    /// Feeds one TCP segment, `tuple` already oriented `(src, sport, dst, dport)`.
    pub fn process(&mut self, tuple: Tuple4, tcp: &TcpHeader<'_>, now: Duration) {
        self.clock = self.clock.max(now);
        match self.lookup(&tuple) {
            Some((key, from_client)) => self.process_existing(key, from_client, tcp, now),
            None => {
                if tcp.flags.syn && !tcp.flags.ack && !tcp.flags.rst {
                    self.create_stream(tuple, tcp, now);
                }
            }
        }
    }

    /// Advances the lane's clock by `dt` for an idle wake-up with no
    /// incoming segment to carry a timestamp (spec §5 `WAKE_INTERVAL`).
    pub fn advance_clock(&mut self, dt: Duration) {
        self.clock += dt;
    }

    /// Walks the closing-timeout list from the head, evicting every entry
    /// whose expiry has passed the lane's clock (spec §4.4.8 `check_closing`).
    pub fn check_closing(&mut self) {
        let now = self.clock;
        while let Some(key) = self.closing_head {
            let expiry = match self.streams.get(key) {
                Some(s) => s.closing_expiry.unwrap_or(now),
                None => {
                    self.closing_unlink(key);
                    continue;
                }
            };
            if expiry > now {
                break;
            }
            if let Some(s) = self.streams.get_mut(key) {
                s.state = StreamState::ClosingTimeout;
            }
            self.remove_stream(key);
        }
    }

    fn lookup(&self, tuple: &Tuple4) -> Option<(usize, bool)> {
        if let Some(&key) = self.index.get(tuple) {
            return Some((key, true));
        }
        let swapped = tuple.swapped();
        self.index.get(&swapped).map(|&key| (key, false))
    }

    fn create_stream(&mut self, tuple: Tuple4, tcp: &TcpHeader<'_>, now: Duration) {
        let mut proto_name = None;
        let mut boxed_analyzer = None;
        if let Some(name) = registry::get_proto(tuple.dst_ip, tuple.dst_port) {
            if let Some(boxed) = analyzer::new_analyzer(&name) {
                boxed_analyzer = Some(boxed);
                proto_name = Some(name);
            }
        }

        if boxed_analyzer.is_none() && self.streams.len() >= self.max_streams {
            self.evict_lru_head();
        }

        let mut stream = Stream::new(tuple, tcp.seq, now);
        stream.handshake.mss = tcp.mss();
        stream.analyzer = boxed_analyzer;
        stream.proto_name = proto_name;

        let key = self.streams.insert(stream);
        self.index.insert(tuple, key);
        self.lru_push_back(key);
    }

    fn process_existing(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>, now: Duration) {
        self.lru_touch(key);

        if tcp.flags.rst {
            self.handle_reset(key, from_client, now);
            return;
        }
        if tcp.flags.syn {
            self.handle_syn(key, from_client, tcp, now);
            return;
        }
        self.handle_ack(key, from_client, tcp, now);
    }

    fn handle_reset(&mut self, key: usize, from_client: bool, now: Duration) {
        let Some(stream) = self.streams.get_mut(key) else { return };
        let established =
            matches!(stream.state, StreamState::Connected | StreamState::DataExchanging | StreamState::Closing);
        if established {
            if let Some(analyzer) = stream.analyzer.as_mut() {
                if let Some(app) = analyzer.handle_reset(from_client, now) {
                    let sb = SessionBreakdown::snapshot(stream, app);
                    self.breakdowns.push(sb);
                }
            }
            let stream = self.streams.get_mut(key).expect("present");
            stream.state =
                if from_client { StreamState::ResetByClientAfterConn } else { StreamState::ResetByServerAfterConn };
        } else {
            stream.state = if from_client { StreamState::ResetByClientBeforeConn } else { StreamState::ResetByServerBeforeConn };
        }
        self.remove_stream(key);
    }

    fn handle_syn(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>, now: Duration) {
        let Some(stream) = self.streams.get_mut(key) else { return };

        if !from_client && tcp.flags.ack && stream.client.state == HalfState::SynSent && stream.server.state == HalfState::Closed {
            stream.server.state = HalfState::SynReceived;
            stream.server.seq = tcp.seq;
            stream.server.ack = tcp.ack;
            stream.client.expected_receive_seq = tcp.seq.wrapping_add(1);
            stream.handshake.sync_ack_time = Some(now);
            if let Some(mss) = tcp.mss() {
                stream.handshake.mss = Some(stream.handshake.mss.map_or(mss, |cur| cur.min(mss)));
            }
            return;
        }

        if from_client && stream.client.state == HalfState::SynSent {
            stream.handshake.sync_retry_time = Some(now);
            stream.handshake.sync_retries += 1;
            return;
        }

        if !from_client && stream.server.state == HalfState::SynReceived {
            stream.handshake.sync_ack_retry_time = Some(now);
            stream.handshake.sync_ack_retries += 1;
            return;
        }

        self.close_abnormally(key);
    }

    fn handle_ack(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>, now: Duration) {
        if !self.complete_third_handshake_ack(key, from_client, tcp, now) {
            return;
        }

        self.advance_send_sequence(key, from_client, tcp);
        self.update_ack_progress(key, from_client, tcp);
        self.confirm_fin_if_acked(key);

        if !self.streams.contains(key) {
            return;
        }

        if !tcp.payload().is_empty() || tcp.flags.fin {
            self.handle_payload_or_fin(key, from_client, tcp, now);
        }
    }

    /// Returns `false` if the stream was closed abnormally and the caller
    /// must stop processing this segment.
    fn complete_third_handshake_ack(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>, now: Duration) -> bool {
        let Some(stream) = self.streams.get_mut(key) else { return false };
        let is_third_ack = from_client && stream.client.state == HalfState::SynSent && stream.server.state == HalfState::SynReceived;
        if !is_third_ack {
            return true;
        }

        let expected = stream.server.expected_receive_seq;
        if tcp.seq != expected {
            self.close_abnormally(key);
            return false;
        }

        let stream = self.streams.get_mut(key).expect("present");
        stream.client.state = HalfState::Established;
        stream.server.state = HalfState::Established;
        stream.state = StreamState::Connected;
        stream.handshake.estab_time = Some(now);
        if let Some(analyzer) = stream.analyzer.as_mut() {
            analyzer.handle_estb(now);
        }
        true
    }

    fn advance_send_sequence(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>) {
        if let Some(stream) = self.streams.get_mut(key) {
            let snd = if from_client { &mut stream.client } else { &mut stream.server };
            snd.seq = tcp.seq;
        }
    }

    fn update_ack_progress(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>) {
        let Some(stream) = self.streams.get_mut(key) else { return };
        let has_payload = !tcp.payload().is_empty();
        let is_duplicate = {
            let snd = if from_client { &mut stream.client } else { &mut stream.server };
            if seq::seq_diff(snd.ack, tcp.ack) < 0 {
                snd.ack = tcp.ack;
                false
            } else {
                !has_payload
            }
        };
        if is_duplicate {
            if from_client {
                stream.counters.c2s_duplicate_acks += 1;
            } else {
                stream.counters.s2c_duplicate_acks += 1;
            }
        }
    }

    fn confirm_fin_if_acked(&mut self, key: usize) {
        let Some(stream) = self.streams.get_mut(key) else { return };
        if stream.client.state == HalfState::FinSent {
            stream.client.state = HalfState::FinConfirmed;
        }
        if stream.server.state == HalfState::FinSent {
            stream.server.state = HalfState::FinConfirmed;
        }
        let both_confirmed = stream.client.state == HalfState::FinConfirmed && stream.server.state == HalfState::FinConfirmed;
        if both_confirmed {
            stream.state = StreamState::Closed;
        }
        if both_confirmed {
            self.remove_stream(key);
        }
    }

    fn handle_payload_or_fin(&mut self, key: usize, from_client: bool, tcp: &TcpHeader<'_>, now: Duration) {
        let payload = tcp.payload();
        let tiny_limit = self.tiny_payload_bytes;

        let outcome = {
            let Some(stream) = self.streams.get_mut(key) else { return };
            if matches!(stream.state, StreamState::Connected | StreamState::Connecting) {
                stream.state = StreamState::DataExchanging;
            }

            {
                let counters = &mut stream.counters;
                if from_client {
                    counters.c2s_packets += 1;
                    counters.c2s_bytes += payload.len() as u64;
                    if payload.len() <= tiny_limit {
                        counters.c2s_tiny_packets += 1;
                    }
                    if tcp.window == 0 {
                        counters.client_zero_windows += 1;
                    }
                } else {
                    counters.s2c_packets += 1;
                    counters.s2c_bytes += payload.len() as u64;
                    if payload.len() <= tiny_limit {
                        counters.s2c_tiny_packets += 1;
                    }
                    if tcp.window == 0 {
                        counters.server_zero_windows += 1;
                    }
                }
            }

            let rcv = if from_client { &mut stream.server } else { &mut stream.client };
            let outcome = rcv.enqueue(tcp.seq, payload, tcp.flags.fin, tcp.flags.urg, tcp.urgent_pointer);

            if outcome.retransmitted {
                if from_client {
                    stream.counters.c2s_retransmitted_packets += 1;
                } else {
                    stream.counters.s2c_retransmitted_packets += 1;
                }
            }
            if outcome.out_of_order {
                if from_client {
                    stream.counters.c2s_out_of_order_packets += 1;
                } else {
                    stream.counters.s2c_out_of_order_packets += 1;
                }
            }

            outcome
        };

        if outcome.fin_lazy {
            self.handle_fin_event(key, from_client, true, now);
        }

        if outcome.fin_delivered {
            self.handle_fin_event(key, from_client, false, now);
        }

        let has_buffered = self
            .streams
            .get(key)
            .map(|s| {
                let rcv = if from_client { &s.server } else { &s.client };
                !rcv.recv_buffer.is_empty()
            })
            .unwrap_or(false);
        if has_buffered {
            self.run_handle_data(key, from_client, now);
        }
    }

    fn run_handle_data(&mut self, key: usize, from_client: bool, now: Duration) {
        let Some(stream) = self.streams.get_mut(key) else { return };

        if stream.analyzer.is_some() {
            let buffer = {
                let rcv = if from_client { &mut stream.server } else { &mut stream.client };
                std::mem::take(&mut rcv.recv_buffer)
            };
            if buffer.is_empty() {
                return;
            }
            let (consumed, breakdown) = {
                let analyzer = stream.analyzer.as_mut().expect("checked above");
                analyzer.handle_data(&buffer, from_client, now)
            };
            let consumed = consumed.min(buffer.len());
            {
                let rcv = if from_client { &mut stream.server } else { &mut stream.client };
                rcv.recv_buffer = buffer[consumed..].to_vec();
            }
            stream.total_received_bytes += consumed as u64;

            if let Some(app) = breakdown {
                let sb = SessionBreakdown::snapshot(stream, app);
                self.breakdowns.push(sb);
            }
            return;
        }

        let rcv = if from_client { &stream.server } else { &stream.client };
        if rcv.recv_buffer.is_empty() {
            return;
        }
        let buffer = rcv.recv_buffer.clone();

        if let Some(proto_name) = detector::detect_proto(&buffer, from_client) {
            registry::add_proto(proto_name, stream.tuple.dst_ip, stream.tuple.dst_port);
            self.remove_stream(key);
            return;
        }

        if stream.client.recv_buffer.len() as u64 > DETECTION_BYTE_THRESHOLD
            && stream.server.recv_buffer.len() as u64 > DETECTION_BYTE_THRESHOLD
        {
            registry::add_proto("TCP", stream.tuple.dst_ip, stream.tuple.dst_port);
            self.remove_stream(key);
        }
    }

    fn handle_fin_event(&mut self, key: usize, from_client: bool, lazy: bool, now: Duration) {
        {
            let Some(stream) = self.streams.get_mut(key) else { return };
            if !lazy {
                let snd = if from_client { &mut stream.client } else { &mut stream.server };
                snd.state = HalfState::FinSent;
            }
            stream.state = StreamState::Closing;
        }
        let expiry = now + CLOSING_TIMEOUT;
        self.closing_push_back(key, expiry);

        if lazy {
            return;
        }

        let Some(stream) = self.streams.get_mut(key) else { return };
        if let Some(analyzer) = stream.analyzer.as_mut() {
            if let Some(app) = analyzer.handle_fin(from_client, now) {
                let sb = SessionBreakdown::snapshot(stream, app);
                self.breakdowns.push(sb);
            }
        }
    }

    fn close_abnormally(&mut self, key: usize) {
        if let Some(stream) = self.streams.get_mut(key) {
            stream.state = StreamState::ClosedAbnormally;
        }
        self.remove_stream(key);
    }

    fn evict_lru_head(&mut self) {
        let Some(key) = self.lru_head else { return };
        if let Some(stream) = self.streams.get_mut(key) {
            stream.state = StreamState::ClosedExceedMaxCount;
        }
        self.remove_stream(key);
    }

    fn remove_stream(&mut self, key: usize) {
        self.lru_unlink(key);
        self.closing_unlink(key);
        if self.streams.contains(key) {
            let tuple = self.streams[key].tuple;
            self.index.remove(&tuple);
            self.streams.remove(key);
        }
    }

    fn lru_unlink(&mut self, key: usize) {
        let Some((prev, next)) = self.streams.get(key).map(|s| (s.lru_prev, s.lru_next)) else { return };
        match prev {
            Some(p) => self.streams[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.streams[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        if let Some(s) = self.streams.get_mut(key) {
            s.lru_prev = None;
            s.lru_next = None;
        }
    }

    fn lru_push_back(&mut self, key: usize) {
        let old_tail = self.lru_tail;
        if let Some(s) = self.streams.get_mut(key) {
            s.lru_prev = old_tail;
            s.lru_next = None;
        }
        match old_tail {
            Some(t) => self.streams[t].lru_next = Some(key),
            None => self.lru_head = Some(key),
        }
        self.lru_tail = Some(key);
    }

    fn lru_touch(&mut self, key: usize) {
        if self.lru_tail == Some(key) {
            return;
        }
        self.lru_unlink(key);
        self.lru_push_back(key);
    }

    fn closing_unlink(&mut self, key: usize) {
        let in_list = self.streams.get(key).map(|s| s.in_closing_list).unwrap_or(false);
        if !in_list {
            return;
        }
        let (prev, next) = self.streams.get(key).map(|s| (s.closing_prev, s.closing_next)).unwrap_or((None, None));
        match prev {
            Some(p) => self.streams[p].closing_next = next,
            None => self.closing_head = next,
        }
        match next {
            Some(n) => self.streams[n].closing_prev = prev,
            None => self.closing_tail = prev,
        }
        if let Some(s) = self.streams.get_mut(key) {
            s.closing_prev = None;
            s.closing_next = None;
            s.in_closing_list = false;
        }
    }

    fn closing_push_back(&mut self, key: usize, expiry: Duration) {
        self.closing_unlink(key);
        let old_tail = self.closing_tail;
        if let Some(s) = self.streams.get_mut(key) {
            s.closing_prev = old_tail;
            s.closing_next = None;
            s.closing_expiry = Some(expiry);
            s.in_closing_list = true;
        }
        match old_tail {
            Some(t) => self.streams[t].closing_next = Some(key),
            None => self.closing_head = Some(key),
        }
        self.closing_tail = Some(key);
    }
}
