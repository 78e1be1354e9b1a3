//! A single TCP connection's reassembly state (spec §3).

use crate::breakdown::ConnInfo;
use crate::reassembly::halfstream::{HalfState, HalfStream};
use std::net::Ipv4Addr;
use std::time::Duration;

/// `(src_ip, src_port, dst_ip, dst_port)` in the direction of the first SYN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple4 {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl Tuple4 {
    pub fn swapped(&self) -> Tuple4 {
        Tuple4 {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    /// `"srcIP:srcPort-dstIP:dstPort"`, the wire format for breakdown addresses.
    pub fn address(&self) -> String {
        format!("{}:{}-{}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

/// Overall lifecycle state of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Connected,
    DataExchanging,
    Closing,
    ClosingTimeout,
    Closed,
    ClosedAbnormally,
    ClosedExceedMaxCount,
    ResetByClientBeforeConn,
    ResetByServerBeforeConn,
    ResetByClientAfterConn,
    ResetByServerAfterConn,
}

/// Per-direction quality counters, reset to zero after every emitted breakdown
/// (spec §4.4.9: breakdowns carry the delta since the previous one).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnCounters {
    pub c2s_bytes: u64,
    pub s2c_bytes: u64,
    pub c2s_packets: u64,
    pub s2c_packets: u64,
    pub c2s_tiny_packets: u64,
    pub s2c_tiny_packets: u64,
    pub c2s_retransmitted_packets: u64,
    pub s2c_retransmitted_packets: u64,
    pub c2s_out_of_order_packets: u64,
    pub s2c_out_of_order_packets: u64,
    pub c2s_duplicate_acks: u64,
    pub s2c_duplicate_acks: u64,
    pub client_zero_windows: u64,
    pub server_zero_windows: u64,
}

impl ConnCounters {
    pub fn reset(&mut self) {
        *self = ConnCounters::default();
    }
}

/// Handshake bookkeeping, emitted once as `ConnInfo` on the first breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake {
    pub sync_time: Option<Duration>,
    pub sync_retry_time: Option<Duration>,
    pub sync_retries: u32,
    pub sync_ack_time: Option<Duration>,
    pub sync_ack_retry_time: Option<Duration>,
    pub sync_ack_retries: u32,
    pub estab_time: Option<Duration>,
    pub mss: Option<u16>,
}

impl Handshake {
    /// Builds the one-time connection-info sub-record, in milliseconds,
    /// floored at zero when timestamps are inverted or missing.
    pub fn to_conn_info(&self) -> ConnInfo {
        let ms = |a: Option<Duration>, b: Option<Duration>| -> u64 {
            match (a, b) {
                (Some(a), Some(b)) if a > b => (a - b).as_millis() as u64,
                _ => 0,
            }
        };
        ConnInfo {
            sync_retries_latency: ms(self.sync_retry_time, self.sync_time),
            establishment_latency: ms(self.estab_time, self.sync_time),
            sync_retries: self.sync_retries,
            sync_ack_retries: self.sync_ack_retries,
            mss: self.mss.unwrap_or(0),
        }
    }
}

/// A TCP connection owned exclusively by one reassembly lane.
pub struct Stream {
    pub tuple: Tuple4,
    pub state: StreamState,
    pub client: HalfStream,
    pub server: HalfStream,
    pub handshake: Handshake,
    pub counters: ConnCounters,
    pub proto_name: Option<String>,
    pub analyzer: Option<Box<dyn crate::analyzer::Analyzer>>,
    pub emitted_conn_info: bool,
    pub total_received_bytes: u64,
    pub created_at: Duration,
    pub lru_prev: Option<usize>,
    pub lru_next: Option<usize>,
    pub closing_expiry: Option<Duration>,
    pub closing_prev: Option<usize>,
    pub closing_next: Option<usize>,
    pub in_closing_list: bool,
}

impl Stream {
    pub fn new(tuple: Tuple4, client_seq: u32, now: Duration) -> Self {
        let mut client = HalfStream::new(HalfState::SynSent);
        client.seq = client_seq;
        let mut server = HalfStream::new(HalfState::Closed);
        server.expected_receive_seq = client_seq.wrapping_add(1);

        Stream {
            tuple,
            state: StreamState::Connecting,
            client,
            server,
            handshake: Handshake { sync_time: Some(now), ..Default::default() },
            counters: ConnCounters::default(),
            proto_name: None,
            analyzer: None,
            emitted_conn_info: false,
            total_received_bytes: 0,
            created_at: now,
            lru_prev: None,
            lru_next: None,
            closing_expiry: None,
            closing_prev: None,
            closing_next: None,
            in_closing_list: false,
        }
    }

    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.created_at)
    }
}
