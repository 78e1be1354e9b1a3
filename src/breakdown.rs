//! `SessionBreakdown` and its nested records (spec §3, §6).
//!
//! Field names are `serde`-renamed to the exact wire keys spec.md §6
//! requires, the same way the teacher tags every NetFlow field with
//! doc comments and, where the wire name differs from the Rust name,
//! `#[nom(...)]`/`Serialize` attributes (see `static_versions/v5.rs`).

use crate::reassembly::stream::{ConnCounters, Stream};
use serde::Serialize;
use std::collections::HashMap;

/// One-time handshake sub-record, present only on a connection's first
/// breakdown (spec §4.4.9, invariant 4).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnInfo {
    #[serde(rename = "tcp_conn_sync_retries_latency")]
    pub sync_retries_latency: u64,
    #[serde(rename = "tcp_conn_establishment_latency")]
    pub establishment_latency: u64,
    #[serde(rename = "tcp_conn_sync_retries")]
    pub sync_retries: u32,
    #[serde(rename = "tcp_conn_sync_ack_retries")]
    pub sync_ack_retries: u32,
    #[serde(rename = "tcp_mss")]
    pub mss: u16,
}

/// Delta counters since the previous breakdown, flattened into the parent
/// record with the exact key names from spec.md §6.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CountersView {
    pub tcp_c2s_bytes: u64,
    pub tcp_s2c_bytes: u64,
    pub tcp_c2s_packets: u64,
    pub tcp_s2c_packets: u64,
    pub tcp_c2s_tiny_packets: u64,
    pub tcp_s2c_tiny_packets: u64,
    pub tcp_c2s_retransmitted_packets: u64,
    pub tcp_s2c_retransmitted_packets: u64,
    pub tcp_c2s_out_of_order_packets: u64,
    pub tcp_s2c_out_of_order_packets: u64,
    pub tcp_c2s_duplicate_acks: u64,
    pub tcp_s2c_duplicate_acks: u64,
    pub tcp_client_zero_windows: u64,
    pub tcp_server_zero_windows: u64,
}

impl From<&ConnCounters> for CountersView {
    fn from(c: &ConnCounters) -> Self {
        CountersView {
            tcp_c2s_bytes: c.c2s_bytes,
            tcp_s2c_bytes: c.s2c_bytes,
            tcp_c2s_packets: c.c2s_packets,
            tcp_s2c_packets: c.s2c_packets,
            tcp_c2s_tiny_packets: c.c2s_tiny_packets,
            tcp_s2c_tiny_packets: c.s2c_tiny_packets,
            tcp_c2s_retransmitted_packets: c.c2s_retransmitted_packets,
            tcp_s2c_retransmitted_packets: c.s2c_retransmitted_packets,
            tcp_c2s_out_of_order_packets: c.c2s_out_of_order_packets,
            tcp_s2c_out_of_order_packets: c.s2c_out_of_order_packets,
            tcp_c2s_duplicate_acks: c.c2s_duplicate_acks,
            tcp_s2c_duplicate_acks: c.s2c_duplicate_acks,
            tcp_client_zero_windows: c.client_zero_windows,
            tcp_server_zero_windows: c.server_zero_windows,
        }
    }
}

/// HTTP analyzer sub-record (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct HttpBreakdown {
    pub http_session_state: String,
    pub http_request_version: String,
    pub http_request_method: String,
    pub http_request_uri: String,
    pub http_request_headers: HashMap<String, String>,
    pub http_request_header_bytes: u64,
    pub http_request_body_bytes: u64,
    pub http_response_version: String,
    pub http_response_headers: HashMap<String, String>,
    pub http_response_status_code: u16,
    pub http_response_header_bytes: u64,
    pub http_response_body_bytes: u64,
    pub http_server_latency: u64,
    pub http_download_latency: u64,
}

/// Generic TCP analyzer sub-record (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct TcpBreakdown {
    pub tcp_session_state: String,
    pub tcp_data_exchange_bytes: u64,
    pub tcp_session_latency: u64,
}

/// Protocol-specific nested record carried by every breakdown.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AppBreakdown {
    Http(HttpBreakdown),
    Tcp(TcpBreakdown),
}

/// One structured session-breakdown record (spec §3, §6).
#[derive(Debug, Clone, Serialize)]
pub struct SessionBreakdown {
    pub proto: String,
    pub address: String,
    #[serde(flatten)]
    pub counters: CountersView,
    #[serde(rename = "tcp_conn_info", skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<ConnInfo>,
    #[serde(rename = "application_session_breakdown")]
    pub application: AppBreakdown,
}

impl SessionBreakdown {
    /// Builds a breakdown from a stream's identity/counters, consuming the
    /// delta counters and the one-time conn-info flag per spec §4.4.9.
    pub fn snapshot(stream: &mut Stream, application: AppBreakdown) -> SessionBreakdown {
        let conn_info = if stream.emitted_conn_info {
            None
        } else {
            stream.emitted_conn_info = true;
            Some(stream.handshake.to_conn_info())
        };
        let counters = CountersView::from(&stream.counters);
        stream.counters.reset();

        SessionBreakdown {
            proto: stream.proto_name.clone().unwrap_or_default(),
            address: stream.tuple.address(),
            counters,
            conn_info,
            application,
        }
    }

    /// Serializes to a single line-delimited JSON record, `\n`-terminated,
    /// matching the core's documented output format (spec §6). Line framing
    /// is the only I/O concern the core takes on; writing the line to a
    /// sink is an external collaborator's job.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}
