//! First-payload protocol detection (spec §5.1).
//!
//! Grounded in `examples/original_source/proto/detector/detector.go` and
//! `proto/detector/http/detector.go`. The HTTP request-line table corrects
//! the original's `PATCH `/`PURGE ` cases: the Go source matches a 6-byte
//! prefix (`"PATCH "`) but records `preLen = 7`, which then scans for the
//! trailing `HTTP/1.x` marker one byte short of the real method boundary.
//! Here `pre_len` always equals the matched prefix's own length.

/// Name recorded in [`crate::analyzer::registry`] once a flow is detected as HTTP.
pub const HTTP_PROTO_NAME: &str = "HTTP";

const CLIENT_PREFIXES: &[&str] = &[
    "DELETE ", "GET ", "HEAD ", "POST ", "PUT ", "CONNECT ", "OPTIONS ", "TRACE ", "COPY ", "LOCK ", "MKCOL ", "MOVE ",
    "PROPFIND ", "PROPPATCH ", "SEARCH ", "UNLOCK ", "REPORT ", "MKACTIVITY ", "CHECKOUT ", "MERGE ", "MSEARCH ",
    "NOTIFY ", "SUBSCRIBE ", "UNSUBSCRIBE ", "PATCH ", "PURGE ",
];

/// Detects an HTTP request (client side) or response (server side) from the
/// first bytes of a direction's payload.
pub fn detect_http(payload: &[u8], from_client: bool) -> bool {
    if !from_client {
        return payload.len() >= 8 && matches!(&payload[..8], b"HTTP/1.0" | b"HTTP/1.1");
    }

    let Some(pre_len) = CLIENT_PREFIXES
        .iter()
        .find(|prefix| payload.len() >= prefix.len() && &payload[..prefix.len()] == prefix.as_bytes())
        .map(|prefix| prefix.len())
    else {
        return false;
    };

    let start = pre_len.max(8);
    if payload.len() <= start {
        return false;
    }
    for i in start..payload.len() - 1 {
        if &payload[i..i + 2] == b"\r\n" && matches!(&payload[i - 8..i], b"HTTP/1.0" | b"HTTP/1.1") {
            return true;
        }
    }
    false
}

/// One registered protocol detector: a name plus its match function.
pub struct Detector {
    pub proto_name: &'static str,
    pub detect: fn(&[u8], bool) -> bool,
}

/// All detectors tried, in order, for an as-yet-unidentified flow.
pub const DETECTORS: &[Detector] = &[Detector { proto_name: HTTP_PROTO_NAME, detect: detect_http }];

/// Runs every registered detector against `payload`, returning the first match.
pub fn detect_proto(payload: &[u8], from_client: bool) -> Option<&'static str> {
    DETECTORS.iter().find(|d| (d.detect)(payload, from_client)).map(|d| d.proto_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_get_request() {
        let req = b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(detect_http(req, true));
        assert_eq!(detect_proto(req, true), Some(HTTP_PROTO_NAME));
    }

    #[test]
    fn detects_post_request() {
        let req = b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n";
        assert!(detect_http(req, true));
        assert_eq!(detect_proto(req, true), Some(HTTP_PROTO_NAME));
    }

    #[test]
    fn detects_patch_request_without_the_original_off_by_one() {
        let req = b"PATCH /x HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(detect_http(req, true));
    }

    #[test]
    fn detects_response_status_line() {
        assert!(detect_http(b"HTTP/1.1 200 OK\r\n", false));
    }

    #[test]
    fn rejects_unrelated_payload() {
        assert!(!detect_http(b"\x16\x03\x01\x00\xa5", true));
        assert!(!detect_http(b"not-http-at-all", false));
    }

    #[test]
    fn rejects_truncated_request_line() {
        assert!(!detect_http(b"GET /", true));
    }
}
