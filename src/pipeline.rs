//! Bounded-channel worker-pool orchestration (spec §5).
//!
//! Grounded in the teacher's `examples/netflow_udp_listener_multi_threaded.rs`:
//! one `std::sync::mpsc` channel per worker, `thread::spawn` wrapping a loop
//! that blocks on `recv`. Spec §5 calls for *bounded* FIFOs with
//! configurable capacity and back-pressure, so every inter-stage channel
//! here is a `mpsc::sync_channel` rather than the teacher's unbounded
//! `channel()`, and every worker wakes at least once a second to observe the
//! stop-flag and (lanes only) run `check_closing`.

use crate::breakdown::SessionBreakdown;
use crate::capture::{CaptureDriver, Frame};
use crate::codec::ethernet::EthernetHeader;
use crate::codec::icmpv4::Icmpv4Header;
use crate::codec::ipv4::Ipv4Header;
use crate::codec::loopback::LoopbackHeader;
use crate::codec::tcp::TcpHeader;
use crate::codec::vlan::VlanHeader;
use crate::codec::{DatalinkType, NextLayer};
use crate::config::PipelineConfig;
use crate::defrag::{DefragOutcome, Defragmenter};
use crate::flowhash;
use crate::reassembly::{Lane, Tuple4};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often an idle worker wakes to observe the stop-flag (spec §5).
const WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// One decoded-and-owned TCP segment, handed from IP/TCP dispatch to its
/// destination lane. Carries the raw segment bytes rather than a borrowed
/// `TcpHeader`, which can't cross a thread boundary; the lane re-decodes it,
/// a cheap, stateless operation (spec §4.1).
struct TcpSegment {
    tuple: Tuple4,
    timestamp: Duration,
    bytes: Vec<u8>,
}

/// One ICMPv4 datagram's identity, handed to the ICMP-handling stage (spec
/// §1's supplemented pass-through logging; see `SPEC_FULL.md`).
#[derive(Debug, Clone, Copy)]
pub struct IcmpEvent {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub kind: u8,
    pub code: u8,
    pub timestamp: Duration,
}

/// A running pipeline's stop-flag and worker handles.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Sets the process-wide stop-flag (spec §5): every worker checks it
    /// between iterations and exits once set.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Blocks until every worker thread has exited.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Starts the full capture-to-breakdown pipeline as a background thread
/// pool and returns immediately with a handle to stop and join it.
///
/// `lane_count` should be the CPU count (spec §5: "N TCP-reassembly lanes,
/// N = CPU count"). `on_icmpv4` observes every ICMPv4 datagram reaching the
/// IP dispatcher; `sink` receives every emitted [`SessionBreakdown`] in
/// arrival order. Both run on dedicated worker threads.
pub fn spawn(
    mut capture: Box<dyn CaptureDriver>,
    config: PipelineConfig,
    lane_count: usize,
    on_icmpv4: impl Fn(IcmpEvent) + Send + 'static,
    mut sink: impl FnMut(SessionBreakdown) + Send + 'static,
) -> PipelineHandle {
    let lane_count = lane_count.max(1);
    let stop = Arc::new(AtomicBool::new(false));
    let datalink_type = capture.datalink_type();

    let (frame_tx, frame_rx) = mpsc::sync_channel::<Frame>(config.channel_buffer_size);
    let (icmp_tx, icmp_rx) = mpsc::sync_channel::<IcmpEvent>(config.channel_buffer_size);
    let (breakdown_tx, breakdown_rx) = mpsc::sync_channel::<SessionBreakdown>(config.channel_buffer_size);

    let mut lane_txs = Vec::with_capacity(lane_count);
    let mut lane_rxs = Vec::with_capacity(lane_count);
    for _ in 0..lane_count {
        let (tx, rx) = mpsc::sync_channel::<TcpSegment>(config.channel_buffer_size);
        lane_txs.push(tx);
        lane_rxs.push(rx);
    }

    let mut handles = Vec::new();

    // Capture thread: the sole ingester (spec §5).
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = capture.set_filter("tcp or icmp") {
            log::error!("failed to install capture filter: {e}");
        }
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match capture.next_packet() {
                    Ok(Some(frame)) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("capture driver failed fatally: {e}");
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
            capture.close();
        }));
    }

    // IP dispatcher: link decode, IPv4 decode + defrag, ICMP/TCP split,
    // flow-hash shard to a lane (spec §5, co-located defragmenter).
    {
        let stop = Arc::clone(&stop);
        let lane_txs = lane_txs.clone();
        handles.push(thread::spawn(move || {
            let mut defrag = Defragmenter::new();
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let frame = match frame_rx.recv_timeout(WAKE_INTERVAL) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if frame.is_truncated() {
                    log::debug!("dropping truncated frame ({} of {} bytes)", frame.bytes.len(), frame.original_len);
                    continue;
                }
                dispatch_frame(&frame, datalink_type, &mut defrag, &icmp_tx, &lane_txs, lane_count);
            }
        }));
    }

    // ICMP handler: decoded upstream, just observed here (spec's
    // supplemented pass-through logging hook).
    handles.push(thread::spawn(move || {
        while let Ok(event) = icmp_rx.recv() {
            on_icmpv4(event);
        }
    }));

    // Reassembly lanes: independent, single-threaded stream tables, no
    // locking (spec §5).
    for (lane_index, rx) in lane_rxs.into_iter().enumerate() {
        let stop = Arc::clone(&stop);
        let breakdown_tx = breakdown_tx.clone();
        handles.push(thread::spawn(move || {
            let mut lane = Lane::new(&config);
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match rx.recv_timeout(WAKE_INTERVAL) {
                    Ok(segment) => {
                        if let Ok(tcp) = TcpHeader::decode(&segment.bytes) {
                            lane.process(segment.tuple, &tcp, segment.timestamp);
                        } else {
                            log::debug!("lane {lane_index}: re-decode of dispatched segment failed");
                        }
                        for breakdown in lane.take_breakdowns() {
                            if breakdown_tx.send(breakdown).is_err() {
                                return;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        lane.advance_clock(WAKE_INTERVAL);
                        lane.check_closing();
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }));
    }
    drop(breakdown_tx);

    // Breakdown-dump thread: the one place records leave the pipeline.
    handles.push(thread::spawn(move || {
        while let Ok(breakdown) = breakdown_rx.recv() {
            sink(breakdown);
        }
    }));

    PipelineHandle { stop, handles }
}

fn dispatch_frame(
    frame: &Frame,
    datalink_type: DatalinkType,
    defrag: &mut Defragmenter,
    icmp_tx: &SyncSender<IcmpEvent>,
    lane_txs: &[SyncSender<TcpSegment>],
    lane_count: usize,
) {
    let payload = match link_payload(datalink_type, &frame.bytes) {
        Some(p) => p,
        None => return,
    };

    let ip = match Ipv4Header::decode(payload) {
        Ok(ip) => ip,
        Err(e) => {
            log::debug!("ipv4 decode failed: {e}");
            return;
        }
    };

    match defrag.defragment(&ip, frame.timestamp) {
        DefragOutcome::Passthrough => dispatch_ipv4(&ip, frame.timestamp, icmp_tx, lane_txs, lane_count),
        DefragOutcome::Complete(bytes) => match Ipv4Header::decode(&bytes) {
            Ok(whole) => dispatch_ipv4(&whole, frame.timestamp, icmp_tx, lane_txs, lane_count),
            Err(e) => log::debug!("reassembled ipv4 datagram malformed: {e}"),
        },
        DefragOutcome::Pending => {}
        DefragOutcome::Failed(e) => log::debug!("ipv4 defrag failed: {e}"),
    }
}

/// Walks the link layer (and any 802.1Q tag) down to the IPv4 payload.
fn link_payload(datalink_type: DatalinkType, bytes: &[u8]) -> Option<&[u8]> {
    match datalink_type {
        DatalinkType::Ethernet => {
            let eth = EthernetHeader::decode(bytes)
                .map_err(|e| log::debug!("ethernet decode failed: {e}"))
                .ok()?;
            match eth.next_layer() {
                NextLayer::Ipv4 => Some(eth.payload()),
                NextLayer::Vlan => {
                    let vlan = VlanHeader::decode(eth.payload())
                        .map_err(|e| log::debug!("vlan decode failed: {e}"))
                        .ok()?;
                    (vlan.next_layer() == NextLayer::Ipv4).then(|| vlan.payload())
                }
                _ => None,
            }
        }
        DatalinkType::Loopback => {
            let lo = LoopbackHeader::decode(bytes).map_err(|e| log::debug!("loopback decode failed: {e}")).ok()?;
            (lo.next_layer() == NextLayer::Ipv4).then(|| lo.payload())
        }
    }
}

fn dispatch_ipv4(
    ip: &Ipv4Header<'_>,
    timestamp: Duration,
    icmp_tx: &SyncSender<IcmpEvent>,
    lane_txs: &[SyncSender<TcpSegment>],
    lane_count: usize,
) {
    match ip.next_layer() {
        NextLayer::Icmpv4 => match Icmpv4Header::decode(ip.payload()) {
            Ok(icmp) => {
                let event = IcmpEvent { src: ip.src, dst: ip.dst, kind: icmp.kind, code: icmp.code, timestamp };
                let _ = icmp_tx.send(event);
            }
            Err(e) => log::debug!("icmpv4 decode failed: {e}"),
        },
        NextLayer::Tcp => match TcpHeader::decode(ip.payload()) {
            Ok(tcp) => {
                let tuple = Tuple4 { src_ip: ip.src, src_port: tcp.src_port, dst_ip: ip.dst, dst_port: tcp.dst_port };
                let lane = flowhash::lane_for(ip.src, tcp.src_port, ip.dst, tcp.dst_port, lane_count);
                let segment = TcpSegment { tuple, timestamp, bytes: ip.payload().to_vec() };
                let _ = lane_txs[lane].send(segment);
            }
            Err(e) => log::debug!("tcp decode failed: {e}"),
        },
        NextLayer::Unsupported(proto) => log::trace!("unsupported ip protocol {proto}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureFatal, CaptureStats};
    use std::sync::Mutex;

    /// Replays a fixed list of frames once, then blocks forever (simulating
    /// an idle live capture) until `close` is called.
    struct ScriptedDriver {
        frames: std::vec::IntoIter<Frame>,
        datalink: DatalinkType,
        closed: Arc<AtomicBool>,
    }

    impl CaptureDriver for ScriptedDriver {
        fn datalink_type(&self) -> DatalinkType {
            self.datalink
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
        fn close(&mut self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    fn eth_ip_tcp(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        tcp[14..16].copy_from_slice(&1024u16.to_be_bytes());
        tcp.extend_from_slice(payload);

        let total_length = 20 + tcp.len() as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = (4 << 4) | 5;
        ip[2..4].copy_from_slice(&total_length.to_be_bytes());
        ip[8] = 64;
        ip[9] = 6;
        ip[12..16].copy_from_slice(&[192, 168, 1, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&tcp);

        let mut frame = vec![0xffu8; 6];
        frame.extend_from_slice(&[0x02; 6]);
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame
    }

    #[test]
    fn a_syn_reaches_a_lane_and_emits_no_breakdown_yet() {
        let bytes = eth_ip_tcp(0x02, b"");
        let len = bytes.len();
        let frame = Frame { timestamp: Duration::ZERO, original_len: len, bytes };
        let driver =
            ScriptedDriver { frames: vec![frame].into_iter(), datalink: DatalinkType::Ethernet, closed: Arc::new(AtomicBool::new(false)) };

        let received: Arc<Mutex<Vec<SessionBreakdown>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let handle = spawn(Box::new(driver), PipelineConfig::default(), 1, |_event| {}, move |b| {
            received_clone.lock().unwrap().push(b);
        });

        thread::sleep(Duration::from_millis(50));
        handle.stop();
        handle.join();

        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn capture_close_runs_when_the_pipeline_stops() {
        let driver =
            ScriptedDriver { frames: Vec::new().into_iter(), datalink: DatalinkType::Ethernet, closed: Arc::new(AtomicBool::new(false)) };
        let closed = Arc::clone(&driver.closed);

        let handle = spawn(Box::new(driver), PipelineConfig::default(), 1, |_event| {}, |_b| {});
        thread::sleep(Duration::from_millis(20));
        handle.stop();
        handle.join();

        assert!(closed.load(Ordering::Relaxed));
    }

    #[test]
    fn truncated_frame_is_dropped_before_reaching_a_lane() {
        let frame = Frame { timestamp: Duration::ZERO, original_len: 9999, bytes: vec![0u8; 10] };
        assert!(frame.is_truncated());
    }
}
