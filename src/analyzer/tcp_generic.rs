//! Generic TCP byte-counting analyzer (spec §5.4), the fallback used when no
//! detector claims a flow.
//!
//! Grounded verbatim in
//! `examples/original_source/proto/analyzer/tcp/analyzer.go`: three states
//! (`Init` -> `DataExchanging` -> `Complete`), a breakdown emitted on reset,
//! and a breakdown on FIN only when a *previous* FIN already set a complete
//! time that is itself after the handshake's begin time -- i.e. only the
//! second FIN of a connection ever reports completion.

use crate::analyzer::{Analyzer, AppBreakdown};
use crate::breakdown::TcpBreakdown;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    DataExchanging,
    Complete,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "TCPSessionInit",
            SessionState::DataExchanging => "TCPSessionDataExchanging",
            SessionState::Complete => "TCPSessionComplete",
        }
    }
}

#[derive(Debug)]
struct Session {
    reset: bool,
    state: SessionState,
    data_exchange_bytes: u64,
    begin_time: Option<Duration>,
    complete_time: Option<Duration>,
}

impl Default for Session {
    fn default() -> Self {
        Session { reset: false, state: SessionState::Init, data_exchange_bytes: 0, begin_time: None, complete_time: None }
    }
}

impl Session {
    fn to_breakdown(&self) -> TcpBreakdown {
        let tcp_session_state =
            if self.reset { format!("Reset:{}", self.state.as_str()) } else { self.state.as_str().to_string() };
        let tcp_session_latency = match (self.complete_time, self.begin_time) {
            (Some(c), Some(b)) if c > b => (c - b).as_millis() as u64,
            _ => 0,
        };
        TcpBreakdown { tcp_session_state, tcp_data_exchange_bytes: self.data_exchange_bytes, tcp_session_latency }
    }
}

/// Counts bytes and wall-clock session duration for any TCP flow no
/// detector recognized.
#[derive(Debug, Default)]
pub struct GenericTcpAnalyzer {
    session: Session,
}

impl Analyzer for GenericTcpAnalyzer {
    fn name(&self) -> &'static str {
        "TCP"
    }

    fn handle_estb(&mut self, timestamp: Duration) {
        self.session.begin_time = Some(timestamp);
    }

    fn handle_data(&mut self, payload: &[u8], _from_client: bool, _timestamp: Duration) -> (usize, Option<AppBreakdown>) {
        self.session.state = SessionState::DataExchanging;
        self.session.data_exchange_bytes += payload.len() as u64;
        (payload.len(), None)
    }

    fn handle_reset(&mut self, _from_client: bool, timestamp: Duration) -> Option<AppBreakdown> {
        self.session.reset = true;
        self.session.state = SessionState::Complete;
        self.session.complete_time = Some(timestamp);
        Some(AppBreakdown::Tcp(self.session.to_breakdown()))
    }

    fn handle_fin(&mut self, _from_client: bool, timestamp: Duration) -> Option<AppBreakdown> {
        let previous_complete = self.session.complete_time;
        self.session.complete_time = Some(timestamp);

        match (previous_complete, self.session.begin_time) {
            (Some(prev), Some(begin)) if prev > begin => {
                self.session.state = SessionState::Complete;
                Some(AppBreakdown::Tcp(self.session.to_breakdown()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakdown::AppBreakdown;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_fin_never_reports_completion() {
        let mut a = GenericTcpAnalyzer::default();
        a.handle_estb(ms(0));
        a.handle_data(b"hello", true, ms(1));
        assert!(a.handle_fin(true, ms(2)).is_none());
    }

    #[test]
    fn second_fin_reports_completion_with_latency() {
        let mut a = GenericTcpAnalyzer::default();
        a.handle_estb(ms(0));
        a.handle_data(b"hello", true, ms(1));
        assert!(a.handle_fin(true, ms(5)).is_none());
        let breakdown = a.handle_fin(false, ms(20)).expect("second FIN completes the session");
        match breakdown {
            AppBreakdown::Tcp(tcp) => {
                assert_eq!(tcp.tcp_session_state, "TCPSessionComplete");
                assert_eq!(tcp.tcp_data_exchange_bytes, 5);
                assert_eq!(tcp.tcp_session_latency, 20);
            }
            _ => panic!("expected a TCP breakdown"),
        }
    }

    #[test]
    fn reset_reports_completion_immediately_with_reset_prefix() {
        let mut a = GenericTcpAnalyzer::default();
        a.handle_estb(ms(0));
        a.handle_data(b"hi", true, ms(1));
        let breakdown = a.handle_reset(false, ms(9)).expect("reset always completes");
        match breakdown {
            AppBreakdown::Tcp(tcp) => assert_eq!(tcp.tcp_session_state, "Reset:TCPSessionDataExchanging"),
            _ => panic!("expected a TCP breakdown"),
        }
    }
}
