//! End-to-end integration test: a scripted capture driver feeding full
//! Ethernet/IPv4/TCP frames through `nettrace::spawn` produces one HTTP
//! session breakdown (scenario S3).

use nettrace::breakdown::AppBreakdown;
use nettrace::capture::{CaptureDriver, CaptureFatal, CaptureStats, Frame};
use nettrace::codec::DatalinkType;
use nettrace::{analyzer, PipelineConfig, SessionBreakdown};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct ScriptedDriver {
    frames: std::vec::IntoIter<Frame>,
}

impl CaptureDriver for ScriptedDriver {
    fn datalink_type(&self) -> DatalinkType {
        DatalinkType::Ethernet
    }

    fn set_filter(&mut self, _expression: &str) -> Result<(), CaptureFatal> {
        Ok(())
    }

    fn next_packet(&mut self) -> Result<Option<Frame>, CaptureFatal> {
        match self.frames.next() {
            Some(frame) => Ok(Some(frame)),
            None => {
                thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
        }
    }

    fn stats(&mut self) -> CaptureStats {
        CaptureStats::default()
    }

    fn close(&mut self) {}
}

const CLIENT_IP: [u8; 4] = [192, 168, 1, 10];
const SERVER_IP: [u8; 4] = [10, 0, 0, 1];
const CLIENT_PORT: u16 = 44321;
const SERVER_PORT: u16 = 80;

fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    tcp.extend_from_slice(payload);
    tcp
}

fn frame_from(src: [u8; 4], dst: [u8; 4], tcp: Vec<u8>) -> Frame {
    let total_length = 20 + tcp.len() as u16;
    let mut ip = vec![0u8; 20];
    ip[0] = (4 << 4) | 5;
    ip[2..4].copy_from_slice(&total_length.to_be_bytes());
    ip[8] = 64;
    ip[9] = 6; // TCP
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    ip.extend_from_slice(&tcp);

    let mut eth = vec![0xffu8; 6];
    eth.extend_from_slice(&[0x02; 6]);
    eth.extend_from_slice(&0x0800u16.to_be_bytes());
    eth.extend_from_slice(&ip);

    let len = eth.len();
    Frame { timestamp: Duration::ZERO, original_len: len, bytes: eth }
}

/// A client SYN, the server's SYN-ACK, the client's ACK, a full HTTP
/// request, the server's response, then both sides' FINs.
fn http_exchange() -> Vec<Frame> {
    let mut frames = Vec::new();

    frames.push(frame_from(
        CLIENT_IP,
        SERVER_IP,
        tcp_segment(CLIENT_PORT, SERVER_PORT, 1, 0, 0x02, b""),
    ));
    frames.push(frame_from(
        SERVER_IP,
        CLIENT_IP,
        tcp_segment(SERVER_PORT, CLIENT_PORT, 1, 2, 0x12, b""),
    ));
    frames.push(frame_from(
        CLIENT_IP,
        SERVER_IP,
        tcp_segment(CLIENT_PORT, SERVER_PORT, 2, 2, 0x10, b""),
    ));

    let request = b"GET /status HTTP/1.1\r\nHost: example\r\n\r\n";
    frames.push(frame_from(
        CLIENT_IP,
        SERVER_IP,
        tcp_segment(CLIENT_PORT, SERVER_PORT, 2, 2, 0x18, request),
    ));

    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    frames.push(frame_from(
        SERVER_IP,
        CLIENT_IP,
        tcp_segment(SERVER_PORT, CLIENT_PORT, 2, 2 + request.len() as u32, 0x18, response),
    ));

    let client_ack_of_response =
        tcp_segment(CLIENT_PORT, SERVER_PORT, 2 + request.len() as u32, 2 + response.len() as u32, 0x10, b"");
    frames.push(frame_from(CLIENT_IP, SERVER_IP, client_ack_of_response));

    let client_fin = tcp_segment(
        CLIENT_PORT,
        SERVER_PORT,
        2 + request.len() as u32,
        2 + response.len() as u32,
        0x11,
        b"",
    );
    frames.push(frame_from(CLIENT_IP, SERVER_IP, client_fin));

    let server_fin_ack = tcp_segment(
        SERVER_PORT,
        CLIENT_PORT,
        2 + response.len() as u32,
        3 + request.len() as u32,
        0x11,
        b"",
    );
    frames.push(frame_from(SERVER_IP, CLIENT_IP, server_fin_ack));

    let client_last_ack = tcp_segment(
        CLIENT_PORT,
        SERVER_PORT,
        3 + request.len() as u32,
        3 + response.len() as u32,
        0x10,
        b"",
    );
    frames.push(frame_from(CLIENT_IP, SERVER_IP, client_last_ack));

    frames
}

#[test]
fn http_exchange_produces_one_breakdown_with_latency() {
    analyzer::registry::add_proto("HTTP", std::net::Ipv4Addr::from(SERVER_IP), SERVER_PORT);

    let driver = ScriptedDriver { frames: http_exchange().into_iter() };
    let received: Arc<Mutex<Vec<SessionBreakdown>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    let icmp_seen = Arc::new(AtomicBool::new(false));
    let icmp_seen_clone = Arc::clone(&icmp_seen);

    let handle = nettrace::spawn(
        Box::new(driver),
        PipelineConfig::default(),
        1,
        move |_event| icmp_seen_clone.store(true, Ordering::Relaxed),
        move |breakdown| received_clone.lock().unwrap().push(breakdown),
    );

    thread::sleep(Duration::from_millis(200));
    handle.stop();
    handle.join();

    let breakdowns = received.lock().unwrap();
    assert_eq!(breakdowns.len(), 1, "expected exactly one session breakdown, got {breakdowns:?}");
    let breakdown = &breakdowns[0];
    assert_eq!(breakdown.proto, "HTTP");
    match &breakdown.application {
        AppBreakdown::Http(http) => {
            assert_eq!(http.http_request_method, "GET");
            assert_eq!(http.http_request_uri, "/status");
            assert_eq!(http.http_response_status_code, 200);
        }
        AppBreakdown::Tcp(_) => panic!("expected an HTTP breakdown"),
    }
    assert!(!icmp_seen.load(Ordering::Relaxed));
}
