//! Process-wide "app service" registry (spec §5.2).
//!
//! Once a `(dst_ip, dst_port)` pair is observed speaking a protocol, later
//! connections to the same destination skip detection entirely and go
//! straight to that protocol's analyzer. Grounded in
//! `examples/original_source/proto/detector/detector.go`'s package-level
//! `detectedProtos` map guarded by a `sync.RWMutex`: reads vastly outnumber
//! writes, so a `RwLock` over a plain `HashMap` is the idiomatic match.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{OnceLock, RwLock};

type Key = (Ipv4Addr, u16);

fn registry() -> &'static RwLock<HashMap<Key, String>> {
    static REGISTRY: OnceLock<RwLock<HashMap<Key, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Records that `ip:port` has been observed speaking `proto_name`.
///
/// The registry only grows: entries are never evicted, matching the
/// original's unbounded lifetime-of-the-process map (spec §5.2, intentional).
pub fn add_proto(proto_name: &str, ip: Ipv4Addr, port: u16) {
    registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert((ip, port), proto_name.to_string());
}

/// Looks up a previously learned protocol for `ip:port`, if any.
pub fn get_proto(ip: Ipv4Addr, port: u16) -> Option<String> {
    registry().read().unwrap_or_else(|e| e.into_inner()).get(&(ip, port)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_destination_returns_none() {
        let ip = Ipv4Addr::new(198, 51, 100, 1);
        assert_eq!(get_proto(ip, 11111), None);
    }

    #[test]
    fn records_and_recalls_a_learned_protocol() {
        let ip = Ipv4Addr::new(198, 51, 100, 2);
        add_proto("HTTP", ip, 22222);
        assert_eq!(get_proto(ip, 22222), Some("HTTP".to_string()));
    }

    #[test]
    fn distinct_ports_on_the_same_host_are_independent() {
        let ip = Ipv4Addr::new(198, 51, 100, 3);
        add_proto("HTTP", ip, 33333);
        assert_eq!(get_proto(ip, 33334), None);
    }
}
