//! Pluggable application-layer analyzers (spec §5).
//!
//! An `Analyzer` is handed a connection's bytes in order, one direction at a
//! time, and decides for itself when it has enough to emit a breakdown.
//! Grounded in the Go original's analyzer interface
//! (`proto/analyzer/{tcp,http}/analyzer.go`): four callbacks, each allowed
//! to return a breakdown or nothing.

pub mod detector;
pub mod http;
pub mod registry;
pub mod tcp_generic;

use crate::breakdown::AppBreakdown;
use std::time::Duration;

/// Per-connection application-layer analyzer.
///
/// Implementations own no knowledge of sequence numbers or retransmission;
/// the reassembler hands them only in-order, deduplicated bytes.
pub trait Analyzer: Send {
    fn name(&self) -> &'static str;

    /// Called once, when the three-way handshake completes.
    fn handle_estb(&mut self, timestamp: Duration);

    /// Called with an in-order chunk of payload from one direction. Returns
    /// the number of bytes actually consumed and, if a session completed,
    /// its breakdown.
    fn handle_data(&mut self, payload: &[u8], from_client: bool, timestamp: Duration) -> (usize, Option<AppBreakdown>);

    /// Called when a RST arrives from `from_client`'s side.
    fn handle_reset(&mut self, from_client: bool, timestamp: Duration) -> Option<AppBreakdown>;

    /// Called when a FIN arrives from `from_client`'s side.
    fn handle_fin(&mut self, from_client: bool, timestamp: Duration) -> Option<AppBreakdown>;
}

/// Builds the analyzer registered for `proto_name`, or `None` if unknown.
pub fn new_analyzer(proto_name: &str) -> Option<Box<dyn Analyzer>> {
    match proto_name {
        detector::HTTP_PROTO_NAME => Some(Box::<http::HttpAnalyzer>::default()),
        "TCP" => Some(Box::<tcp_generic::GenericTcpAnalyzer>::default()),
        _ => None,
    }
}
