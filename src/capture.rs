//! External packet-capture interface (spec §6).
//!
//! Packet acquisition is out of scope for this crate (spec.md §1): a
//! libpcap-style driver lives outside the core and is consumed only through
//! this contract. `CaptureDriver` is the trait a host binary implements (or
//! wraps a real capture library behind); `nettrace::pipeline` drives it.

use crate::codec::DatalinkType;
use std::fmt;
use std::time::Duration;

/// One captured frame as handed to the core.
///
/// `original_len` is the frame's length on the wire before any capture-side
/// snap-length truncation; `bytes` is what was actually captured. Per
/// spec.md §3, a frame where these disagree is truncated and must be
/// dropped rather than repaired.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Duration,
    pub original_len: usize,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn is_truncated(&self) -> bool {
        self.bytes.len() != self.original_len
    }
}

/// Capture-driver counters (spec §6's `stats()`), mirroring libpcap's
/// `pcap_stats`: packets seen, and packets dropped by the driver or the
/// kernel/NIC before they ever reached this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub dropped_by_driver: u64,
    pub dropped_by_interface: u64,
}

/// A capture-driver failure. Per spec §7, this is the one error class that
/// sets the pipeline's global stop-flag rather than being absorbed per-packet.
#[derive(Debug)]
pub struct CaptureFatal(pub String);

impl fmt::Display for CaptureFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture driver failed: {}", self.0)
    }
}

impl std::error::Error for CaptureFatal {}

/// The capture source the pipeline drives (spec §6: `open`/`set_filter`/
/// `next_packet`/`datalink_type`/`stats`/`close`). `open(dev)` itself is a
/// driver-specific constructor and so isn't part of the trait; everything a
/// caller needs once a driver exists is.
pub trait CaptureDriver: Send {
    /// The link-layer framing every [`Frame`] this driver yields uses.
    fn datalink_type(&self) -> DatalinkType;

    /// Installs a BPF-style filter expression. The pipeline installs
    /// `"tcp or icmp"` on startup (spec §6).
    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureFatal>;

    /// Returns the next frame, or `Ok(None)` on a timeout/would-block with
    /// no frame ready.
    fn next_packet(&mut self) -> Result<Option<Frame>, CaptureFatal>;

    fn stats(&mut self) -> CaptureStats;

    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_truncated_frame() {
        let frame = Frame { timestamp: Duration::ZERO, original_len: 100, bytes: vec![0u8; 60] };
        assert!(frame.is_truncated());
    }

    #[test]
    fn untruncated_frame_reports_false() {
        let frame = Frame { timestamp: Duration::ZERO, original_len: 4, bytes: vec![0u8; 4] };
        assert!(!frame.is_truncated());
    }
}
