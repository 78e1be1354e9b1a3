//! HTTP/1.x pipelining analyzer (spec §5.3).
//!
//! Grounded in `examples/original_source/proto/analyzer/http/analyzer.go`:
//! the Go original drives a C `http_parser` through per-direction callback
//! tables and keeps in-flight requests in a FIFO (`container/list.List`),
//! pushing a new one on every request line and popping the front once its
//! response body completes -- this is what makes it correct for pipelined
//! HTTP (several in-flight requests before any response arrives). This
//! replaces the cgo state machine with a hand-rolled incremental line
//! parser but keeps the FIFO pipelining model and session-state names.
//!
//! Chunked bodies are recognized only by their terminating `0\r\n\r\n`
//! sequence rather than decoded chunk-by-chunk; byte and latency accounting
//! stay correct, only the exact chunk boundaries are not reconstructed.

use crate::analyzer::{Analyzer, AppBreakdown};
use crate::breakdown::HttpBreakdown;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    RequestHeaderBegin,
    RequestHeaderComplete,
    RequestBodyBegin,
    RequestBodyComplete,
    ResponseHeaderBegin,
    ResponseHeaderComplete,
    ResponseBodyBegin,
    ResponseBodyComplete,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        use SessionState::*;
        match self {
            RequestHeaderBegin => "HTTPRequestHeaderBegin",
            RequestHeaderComplete => "HTTPRequestHeaderComplete",
            RequestBodyBegin => "HTTPRequestBodyBegin",
            RequestBodyComplete => "HTTPRequestBodyComplete",
            ResponseHeaderBegin => "HTTPResponseHeaderBegin",
            ResponseHeaderComplete => "HTTPResponseHeaderComplete",
            ResponseBodyBegin => "HTTPResponseBodyBegin",
            ResponseBodyComplete => "HTTPResponseBodyComplete",
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    reset: bool,
    state: SessionState,
    req_ver: String,
    req_method: String,
    req_uri: String,
    req_headers: Vec<(String, String)>,
    req_header_bytes: u64,
    req_body_bytes: u64,
    resp_ver: String,
    resp_headers: Vec<(String, String)>,
    status_code: u16,
    resp_header_bytes: u64,
    resp_body_bytes: u64,
    req_time: Duration,
    resp_begin_time: Option<Duration>,
    resp_complete_time: Option<Duration>,
}

impl Session {
    fn new(req_time: Duration) -> Self {
        Session {
            reset: false,
            state: SessionState::RequestHeaderBegin,
            req_ver: String::new(),
            req_method: String::new(),
            req_uri: String::new(),
            req_headers: Vec::new(),
            req_header_bytes: 0,
            req_body_bytes: 0,
            resp_ver: String::new(),
            resp_headers: Vec::new(),
            status_code: 0,
            resp_header_bytes: 0,
            resp_body_bytes: 0,
            req_time,
            resp_begin_time: None,
            resp_complete_time: None,
        }
    }

    fn to_breakdown(&self) -> HttpBreakdown {
        let http_session_state =
            if self.reset { format!("Reset:{}", self.state.as_str()) } else { self.state.as_str().to_string() };
        let http_server_latency = match self.resp_begin_time {
            Some(t) if t > self.req_time => (t - self.req_time).as_millis() as u64,
            _ => 0,
        };
        let http_download_latency = match (self.resp_complete_time, self.resp_begin_time) {
            (Some(c), Some(b)) if c > b => (c - b).as_millis() as u64,
            _ => 0,
        };
        HttpBreakdown {
            http_session_state,
            http_request_version: self.req_ver.clone(),
            http_request_method: self.req_method.clone(),
            http_request_uri: self.req_uri.clone(),
            http_request_headers: self.req_headers.iter().cloned().collect(),
            http_request_header_bytes: self.req_header_bytes,
            http_request_body_bytes: self.req_body_bytes,
            http_response_version: self.resp_ver.clone(),
            http_response_headers: self.resp_headers.iter().cloned().collect(),
            http_response_status_code: self.status_code,
            http_response_header_bytes: self.resp_header_bytes,
            http_response_body_bytes: self.resp_body_bytes,
            http_server_latency,
            http_download_latency,
        }
    }
}

/// How a message body's end is delimited (RFC 7230 §3.3.3 priority order:
/// `Transfer-Encoding: chunked` wins over `Content-Length`).
enum BodyLength {
    Fixed(u64),
    Chunked,
    Unknown,
}

fn body_length_from(headers: &[(String, String)]) -> BodyLength {
    if headers.iter().any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"))
    {
        return BodyLength::Chunked;
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(n) = value.trim().parse::<u64>() {
                return BodyLength::Fixed(n);
            }
        }
    }
    BodyLength::Unknown
}

enum Phase {
    StartLine,
    Headers,
    Body(u64),
    Chunked,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_subslice(buf: &[u8], needle: &[u8]) -> Option<usize> {
    if buf.len() < needle.len() {
        return None;
    }
    buf.windows(needle.len()).position(|w| w == needle)
}

fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let line = std::str::from_utf8(line).ok()?;
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn parse_request_line(line: &[u8]) -> Option<(String, String, String)> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let uri = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    Some((method.to_string(), uri.to_string(), version.to_string()))
}

fn parse_status_line(line: &[u8]) -> Option<(String, u16)> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    Some((version.to_string(), code))
}

/// Parses the client-to-server side of a pipeline, pushing a new session to
/// the back of the queue on every request line (matches `onReqMessageBegin`).
struct RequestParser {
    buf: Vec<u8>,
    phase: Phase,
}

impl RequestParser {
    fn new() -> Self {
        RequestParser { buf: Vec::new(), phase: Phase::StartLine }
    }

    fn feed(&mut self, data: &[u8], now: Duration, sessions: &mut VecDeque<Session>) {
        self.buf.extend_from_slice(data);
        loop {
            match self.phase {
                Phase::StartLine => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    if let Some((method, uri, version)) = parse_request_line(&line[..pos]) {
                        let mut session = Session::new(now);
                        session.req_method = method;
                        session.req_uri = uri;
                        session.req_ver = version;
                        session.req_header_bytes = line.len() as u64;
                        sessions.push_back(session);
                        self.phase = Phase::Headers;
                    }
                }
                Phase::Headers => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    let Some(session) = sessions.back_mut() else {
                        self.phase = Phase::StartLine;
                        continue;
                    };
                    session.req_header_bytes += line.len() as u64;
                    if pos == 0 {
                        session.state = SessionState::RequestHeaderComplete;
                        self.phase = match body_length_from(&session.req_headers) {
                            BodyLength::Fixed(0) | BodyLength::Unknown => {
                                session.state = SessionState::RequestBodyComplete;
                                Phase::StartLine
                            }
                            BodyLength::Fixed(n) => Phase::Body(n),
                            BodyLength::Chunked => Phase::Chunked,
                        };
                    } else if let Some((name, value)) = parse_header_line(&line[..pos]) {
                        session.req_headers.push((name, value));
                    }
                }
                Phase::Body(remaining) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    let left = remaining - chunk.len() as u64;
                    if let Some(session) = sessions.back_mut() {
                        session.state = SessionState::RequestBodyBegin;
                        session.req_body_bytes += chunk.len() as u64;
                        if left == 0 {
                            session.state = SessionState::RequestBodyComplete;
                        }
                    }
                    self.phase = if left == 0 { Phase::StartLine } else { Phase::Body(left) };
                }
                Phase::Chunked => {
                    if self.buf.is_empty() {
                        break;
                    }
                    if let Some(pos) = find_subslice(&self.buf, b"0\r\n\r\n") {
                        let consumed: Vec<u8> = self.buf.drain(..pos + 5).collect();
                        if let Some(session) = sessions.back_mut() {
                            session.req_body_bytes += consumed.len() as u64;
                            session.state = SessionState::RequestBodyComplete;
                        }
                        self.phase = Phase::StartLine;
                    } else {
                        let keep = self.buf.len().saturating_sub(4);
                        if keep == 0 {
                            break;
                        }
                        if let Some(session) = sessions.back_mut() {
                            session.state = SessionState::RequestBodyBegin;
                            session.req_body_bytes += keep as u64;
                        }
                        self.buf.drain(..keep);
                        break;
                    }
                }
            }
        }
    }
}

/// Parses the server-to-client side, always updating the front of the
/// queue (matches `onRespMessageBegin` reading `sessions.Front()`).
struct ResponseParser {
    buf: Vec<u8>,
    phase: Phase,
}

impl ResponseParser {
    fn new() -> Self {
        ResponseParser { buf: Vec::new(), phase: Phase::StartLine }
    }

    fn feed(&mut self, data: &[u8], now: Duration, sessions: &mut VecDeque<Session>) {
        self.buf.extend_from_slice(data);
        loop {
            match self.phase {
                Phase::StartLine => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    if let Some((version, code)) = parse_status_line(&line[..pos]) {
                        if let Some(session) = sessions.front_mut() {
                            session.resp_begin_time = Some(now);
                            session.resp_ver = version;
                            session.status_code = code;
                            session.resp_header_bytes = line.len() as u64;
                            session.state = SessionState::ResponseHeaderBegin;
                        }
                        self.phase = Phase::Headers;
                    }
                }
                Phase::Headers => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                    let Some(session) = sessions.front_mut() else {
                        self.phase = Phase::StartLine;
                        continue;
                    };
                    session.resp_header_bytes += line.len() as u64;
                    if pos == 0 {
                        session.state = SessionState::ResponseHeaderComplete;
                        self.phase = match body_length_from(&session.resp_headers) {
                            BodyLength::Fixed(0) | BodyLength::Unknown => {
                                session.state = SessionState::ResponseBodyComplete;
                                session.resp_complete_time = Some(now);
                                Phase::StartLine
                            }
                            BodyLength::Fixed(n) => Phase::Body(n),
                            BodyLength::Chunked => Phase::Chunked,
                        };
                    } else if let Some((name, value)) = parse_header_line(&line[..pos]) {
                        session.resp_headers.push((name, value));
                    }
                }
                Phase::Body(remaining) => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    let left = remaining - chunk.len() as u64;
                    if let Some(session) = sessions.front_mut() {
                        session.state = SessionState::ResponseBodyBegin;
                        session.resp_body_bytes += chunk.len() as u64;
                        if left == 0 {
                            session.state = SessionState::ResponseBodyComplete;
                            session.resp_complete_time = Some(now);
                        }
                    }
                    self.phase = if left == 0 { Phase::StartLine } else { Phase::Body(left) };
                }
                Phase::Chunked => {
                    if self.buf.is_empty() {
                        break;
                    }
                    if let Some(pos) = find_subslice(&self.buf, b"0\r\n\r\n") {
                        let consumed: Vec<u8> = self.buf.drain(..pos + 5).collect();
                        if let Some(session) = sessions.front_mut() {
                            session.resp_body_bytes += consumed.len() as u64;
                            session.state = SessionState::ResponseBodyComplete;
                            session.resp_complete_time = Some(now);
                        }
                        self.phase = Phase::StartLine;
                    } else {
                        let keep = self.buf.len().saturating_sub(4);
                        if keep == 0 {
                            break;
                        }
                        if let Some(session) = sessions.front_mut() {
                            session.state = SessionState::ResponseBodyBegin;
                            session.resp_body_bytes += keep as u64;
                        }
                        self.buf.drain(..keep);
                        break;
                    }
                }
            }
        }
    }
}

/// Pipelined HTTP/1.x request/response analyzer.
pub struct HttpAnalyzer {
    sessions: VecDeque<Session>,
    req: RequestParser,
    resp: ResponseParser,
}

impl Default for HttpAnalyzer {
    fn default() -> Self {
        HttpAnalyzer { sessions: VecDeque::new(), req: RequestParser::new(), resp: ResponseParser::new() }
    }
}

impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn handle_estb(&mut self, _timestamp: Duration) {}

    fn handle_data(&mut self, payload: &[u8], from_client: bool, timestamp: Duration) -> (usize, Option<AppBreakdown>) {
        if payload.is_empty() {
            return (0, None);
        }
        if from_client {
            self.req.feed(payload, timestamp, &mut self.sessions);
        } else {
            self.resp.feed(payload, timestamp, &mut self.sessions);
        }

        let complete = matches!(self.sessions.front(), Some(s) if s.state == SessionState::ResponseBodyComplete);
        let breakdown = complete.then(|| self.sessions.pop_front().map(|s| AppBreakdown::Http(s.to_breakdown()))).flatten();
        (payload.len(), breakdown)
    }

    fn handle_reset(&mut self, from_client: bool, timestamp: Duration) -> Option<AppBreakdown> {
        let mut session = self.sessions.pop_front()?;
        if !from_client && session.state == SessionState::ResponseBodyBegin {
            session.state = SessionState::ResponseBodyComplete;
            session.resp_complete_time = Some(timestamp);
        } else {
            session.reset = true;
        }
        Some(AppBreakdown::Http(session.to_breakdown()))
    }

    fn handle_fin(&mut self, from_client: bool, timestamp: Duration) -> Option<AppBreakdown> {
        if from_client {
            return None;
        }
        let ready = matches!(self.sessions.front(), Some(s) if s.state == SessionState::ResponseBodyBegin);
        if !ready {
            return None;
        }
        let mut session = self.sessions.pop_front()?;
        session.state = SessionState::ResponseBodyComplete;
        session.resp_complete_time = Some(timestamp);
        Some(AppBreakdown::Http(session.to_breakdown()))
    }
}
