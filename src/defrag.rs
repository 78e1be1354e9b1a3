//! IPv4 defragmenter (spec §4.2).
//!
//! Grounded in `examples/original_source/ip4defrag/defrag.go`: an ordered
//! fragment list per `(src, dst, id)` key, gluing on completion, eviction by
//! age and by fragment-count exhaustion. The Go source's `container/list`
//! doubly-linked list of groups ordered by last-seen time is exactly what
//! `lru::LruCache` gives for free: `get_mut`/`put` promote a touched group to
//! most-recently-used, and `peek_lru`/`pop_lru` scan from the stale end --
//! no hand-rolled ordering structure needed alongside the group map.

use crate::codec::ipv4::Ipv4Header;
use crate::error::TraceError;
use lru::LruCache;
use std::net::Ipv4Addr;
use std::time::Duration;

const MAX_DATAGRAM_SIZE: u16 = 65_535;
const MAX_FRAGMENT_OFFSET: u16 = 8_191;
const MAX_FRAGMENTS_PER_GROUP: usize = 8;
const GROUP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type GroupKey = (Ipv4Addr, Ipv4Addr, u16);

#[derive(Debug, Clone)]
struct OwnedFragment {
    frag_offset: u16,
    payload: Vec<u8>,
    mf: bool,
}

/// A reassembled IPv4 datagram's header fields, used to build the glued
/// output. Everything but length/id/flags is inherited from the last
/// fragment to arrive.
#[derive(Debug, Clone, Copy)]
struct InheritedHeader {
    version: u8,
    ihl: u8,
    tos: u8,
    ttl: u8,
    protocol: u8,
    checksum: u16,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

struct FragmentGroup {
    fragments: Vec<OwnedFragment>,
    highest: u16,
    current: u16,
    last_received: bool,
    last_seen: Duration,
    header: InheritedHeader,
}

impl FragmentGroup {
    fn new(header: InheritedHeader, now: Duration) -> Self {
        FragmentGroup {
            fragments: Vec::new(),
            highest: 0,
            current: 0,
            last_received: false,
            last_seen: now,
            header,
        }
    }

    fn insert(&mut self, frag_offset: u16, payload: &[u8], mf: bool, header: InheritedHeader, now: Duration) {
        let frag = OwnedFragment { frag_offset, payload: payload.to_vec(), mf };
        let byte_offset = frag_offset * 8;
        match self.fragments.iter().position(|f| f.frag_offset >= frag_offset) {
            Some(idx) => self.fragments.insert(idx, frag),
            None => self.fragments.push(frag),
        }
        self.last_seen = now;
        self.header = header;
        self.current += payload.len() as u16;
        self.highest = self.highest.max(byte_offset + payload.len() as u16);
        if !mf {
            self.last_received = true;
        }
    }

    fn ready(&self) -> bool {
        self.last_received && self.highest == self.current
    }

    fn glue(&self) -> Result<Vec<u8>, TraceError> {
        let mut body = Vec::with_capacity(self.highest as usize);
        let mut current_offset: u16 = 0;
        for frag in &self.fragments {
            let start = frag.frag_offset * 8;
            if start == current_offset {
                body.extend_from_slice(&frag.payload);
                current_offset += frag.payload.len() as u16;
            } else if start < current_offset {
                let overlap = current_offset - start;
                if (overlap as usize) < frag.payload.len() {
                    body.extend_from_slice(&frag.payload[overlap as usize..]);
                    current_offset = start + frag.payload.len() as u16;
                }
            } else {
                return Err(TraceError::DefragHole);
            }
        }

        let total_length = 20u16 + self.highest;
        let mut out = Vec::with_capacity(total_length as usize);
        out.push((self.header.version << 4) | 5);
        out.push(self.header.tos);
        out.extend_from_slice(&total_length.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // id = 0
        let flags_offset: u16 = 0b010 << 13; // DF=1, MF=0, offset=0
        out.extend_from_slice(&flags_offset.to_be_bytes());
        out.push(self.header.ttl);
        out.push(self.header.protocol);
        out.extend_from_slice(&self.header.checksum.to_be_bytes());
        out.extend_from_slice(&self.header.src.octets());
        out.extend_from_slice(&self.header.dst.octets());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// The result of feeding one IPv4 datagram through the defragmenter.
pub enum DefragOutcome {
    /// Not fragmented (DF, or MF=0 && offset=0): pass the original bytes through.
    Passthrough,
    /// Fragment accepted, group still incomplete.
    Pending,
    /// Fragment group complete; glued bytes form a full IPv4 datagram ready
    /// to be re-decoded.
    Complete(Vec<u8>),
    /// The fragment or group is invalid; the group (if any) was discarded.
    Failed(TraceError),
}

/// Owns the defragmenter's fragment-group table. Single-threaded, co-located
/// with the stage that runs IPv4 dispatch (spec §5).
pub struct Defragmenter {
    groups: LruCache<GroupKey, FragmentGroup>,
}

impl Default for Defragmenter {
    fn default() -> Self {
        Defragmenter { groups: LruCache::unbounded() }
    }
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded IPv4 header through the defragmenter at time `now`.
    pub fn defragment(&mut self, ip: &Ipv4Header<'_>, now: Duration) -> DefragOutcome {
        if ip.df || (!ip.mf && ip.frag_offset == 0) {
            return DefragOutcome::Passthrough;
        }

        if ip.frag_offset > MAX_FRAGMENT_OFFSET
            || ip.frag_offset as u32 * 8 + ip.total_length as u32 > MAX_DATAGRAM_SIZE as u32
        {
            return DefragOutcome::Failed(TraceError::DefragOversize);
        }

        let key: GroupKey = (ip.src, ip.dst, ip.id);
        self.evict_expired(&key, now);

        let header = InheritedHeader {
            version: ip.version,
            ihl: ip.ihl,
            tos: ip.tos,
            ttl: ip.ttl,
            protocol: ip.protocol,
            checksum: ip.checksum,
            src: ip.src,
            dst: ip.dst,
        };

        if self.groups.get_mut(&key).is_none() {
            self.groups.put(key, FragmentGroup::new(header, now));
        }
        let group = self.groups.get_mut(&key).expect("just inserted");
        group.insert(ip.frag_offset, ip.payload(), ip.mf, header, now);

        if group.ready() {
            let result = group.glue();
            self.groups.pop(&key);
            return match result {
                Ok(bytes) => DefragOutcome::Complete(bytes),
                Err(e) => DefragOutcome::Failed(e),
            };
        }

        if group.fragments.len() >= MAX_FRAGMENTS_PER_GROUP {
            self.groups.pop(&key);
            return DefragOutcome::Failed(TraceError::DefragExhausted);
        }

        DefragOutcome::Pending
    }

    /// Pops groups from the stale end while they're both expired and not the
    /// group the caller is about to touch.
    fn evict_expired(&mut self, current: &GroupKey, now: Duration) {
        loop {
            let expired = match self.groups.peek_lru() {
                Some((key, _)) if key == current => false,
                Some((_, group)) => now.saturating_sub(group.last_seen) >= GROUP_IDLE_TIMEOUT,
                None => false,
            };
            if !expired {
                break;
            }
            self.groups.pop_lru();
        }
    }

    /// Number of fragment groups currently pending (test/diagnostic hook).
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ipv4::Ipv4Header;

    fn fragment(id: u16, mf: bool, frag_offset: u16, payload: &[u8]) -> Vec<u8> {
        let total_length = 20 + payload.len() as u16;
        let mut v = vec![0u8; 20];
        v[0] = (4 << 4) | 5;
        v[2..4].copy_from_slice(&total_length.to_be_bytes());
        v[4..6].copy_from_slice(&id.to_be_bytes());
        let flags: u16 = if mf { 1 << 13 } else { 0 };
        let flags_offset = flags | frag_offset;
        v[6..8].copy_from_slice(&flags_offset.to_be_bytes());
        v[8] = 64;
        v[9] = 17; // UDP, arbitrary
        v[12..16].copy_from_slice(&[1, 1, 1, 1]);
        v[16..20].copy_from_slice(&[2, 2, 2, 2]);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn passthrough_unfragmented() {
        let mut d = Defragmenter::new();
        let raw = fragment(1, false, 0, b"hello");
        let ip = Ipv4Header::decode(&raw).unwrap();
        assert!(matches!(d.defragment(&ip, Duration::ZERO), DefragOutcome::Passthrough));
    }

    #[test]
    fn reassembles_three_out_of_order_fragments() {
        // 1480 + 1480 + remainder bytes, matching scenario S4's shape but smaller.
        let p0 = vec![b'a'; 16];
        let p1 = vec![b'b'; 16];
        let p2 = vec![b'c'; 8];

        let mut d = Defragmenter::new();
        let now = Duration::ZERO;

        let f1 = fragment(42, true, 2 /* *8=16 */, &p1);
        let ip1 = Ipv4Header::decode(&f1).unwrap();
        assert!(matches!(d.defragment(&ip1, now), DefragOutcome::Pending));

        let f0 = fragment(42, true, 0, &p0);
        let ip0 = Ipv4Header::decode(&f0).unwrap();
        assert!(matches!(d.defragment(&ip0, now), DefragOutcome::Pending));

        let f2 = fragment(42, false, 4 /* *8=32 */, &p2);
        let ip2 = Ipv4Header::decode(&f2).unwrap();
        match d.defragment(&ip2, now) {
            DefragOutcome::Complete(bytes) => {
                let whole = Ipv4Header::decode(&bytes).unwrap();
                let mut expected = p0.clone();
                expected.extend_from_slice(&p1);
                expected.extend_from_slice(&p2);
                assert_eq!(whole.payload(), expected.as_slice());
            }
            DefragOutcome::Failed(e) => panic!("expected Complete, got Failed({e})"),
            _ => panic!("expected Complete"),
        }
        assert_eq!(d.pending_groups(), 0);
    }

    #[test]
    fn rejects_oversized_fragment() {
        let mut d = Defragmenter::new();
        let raw = fragment(3, true, 8_191, &[0u8; 10]);
        let ip = Ipv4Header::decode(&raw).unwrap();
        assert!(matches!(d.defragment(&ip, Duration::ZERO), DefragOutcome::Failed(TraceError::DefragOversize)));
    }

    #[test]
    fn exhausts_after_max_fragment_count() {
        let mut d = Defragmenter::new();
        let now = Duration::ZERO;
        for i in 0..8u16 {
            let raw = fragment(7, true, i * 2, &[b'x'; 16]);
            let ip = Ipv4Header::decode(&raw).unwrap();
            let outcome = d.defragment(&ip, now);
            if i < 7 {
                assert!(matches!(outcome, DefragOutcome::Pending));
            } else {
                assert!(matches!(outcome, DefragOutcome::Failed(TraceError::DefragExhausted)));
            }
        }
    }

    #[test]
    fn evicts_idle_group_after_30s() {
        let mut d = Defragmenter::new();
        let raw = fragment(9, true, 0, &[0u8; 8]);
        let ip = Ipv4Header::decode(&raw).unwrap();
        d.defragment(&ip, Duration::from_secs(0));
        assert_eq!(d.pending_groups(), 1);

        // A different flow's arrival 31s later should trigger eviction scan.
        let raw2 = fragment(10, true, 0, &[0u8; 8]);
        let ip2 = Ipv4Header::decode(&raw2).unwrap();
        d.defragment(&ip2, Duration::from_secs(31));
        assert_eq!(d.pending_groups(), 1);
    }
}
