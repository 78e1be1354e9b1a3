//! Error types shared by the codec, defragmenter and reassembler.
//!
//! Per-packet errors never propagate across stage boundaries (spec §7): every
//! stage absorbs its own `DecodeError`/`TraceError` and logs it, the pipeline
//! as a whole keeps running.

use std::fmt;

/// Failure decoding a single protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the layer's minimum header size.
    TooShort { layer: &'static str, need: usize, have: usize },
    /// Header bytes present but internally inconsistent (bad length field,
    /// option table that runs past the header, etc).
    Malformed { layer: &'static str, reason: &'static str },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { layer, need, have } => {
                write!(f, "{layer}: too short (need {need}, have {have})")
            }
            DecodeError::Malformed { layer, reason } => {
                write!(f, "{layer}: malformed ({reason})")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failures raised above the codec layer: defragmentation and reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// Fragment offset/length would overflow the 65,535-byte IPv4 maximum.
    DefragOversize,
    /// Gluing fragments left a gap: some byte range was never covered.
    DefragHole,
    /// A fragment group hit the retry cap without completing.
    DefragExhausted,
    /// A lane's stream table is at capacity and no room could be made.
    StreamExceededMax,
    /// A protocol-violating SYN or bad handshake sequence closed the stream.
    AbnormalClose,
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TraceError::DefragOversize => "fragment exceeds IPv4 maximum datagram size",
            TraceError::DefragHole => "hole found while gluing IPv4 fragments",
            TraceError::DefragExhausted => "fragment group exceeded retry count without completing",
            TraceError::StreamExceededMax => "lane stream table exceeded maximum count",
            TraceError::AbnormalClose => "stream closed abnormally",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TraceError {}
