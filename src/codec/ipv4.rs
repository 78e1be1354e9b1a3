//! IPv4 header decode (spec §4.1).
//!
//! The flags/fragment-offset half-word is decoded per spec §9's corrected
//! bit layout (`flags = word >> 13`, `RF = flags & 4`, `DF = flags & 2`,
//! `MF = flags & 1`), not the original source's inverted shift.

use crate::codec::NextLayer;
use crate::error::DecodeError;
use std::net::Ipv4Addr;

/// One parsed IPv4 header option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Option<'a> {
    pub kind: u8,
    pub bytes: &'a [u8],
}

/// A decoded IPv4 datagram. `payload` is trimmed to `total_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub id: u16,
    pub reserved_flag: bool,
    pub df: bool,
    pub mf: bool,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    options: Vec<Ipv4OptionOwned>,
    bytes: &'a [u8],
    payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ipv4OptionOwned {
    kind: u8,
    start: usize,
    end: usize,
}

impl<'a> Ipv4Header<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, DecodeError> {
        if frame.len() < 20 {
            return Err(DecodeError::TooShort { layer: "ipv4", need: 20, have: frame.len() });
        }

        let version_ihl = frame[0];
        let version = version_ihl >> 4;
        let ihl = version_ihl & 0x0F;
        let header_len = ihl as usize * 4;
        if header_len < 20 {
            return Err(DecodeError::Malformed { layer: "ipv4", reason: "ihl<5" });
        }
        if frame.len() < header_len {
            return Err(DecodeError::TooShort { layer: "ipv4", need: header_len, have: frame.len() });
        }

        let tos = frame[1];
        let total_length = u16::from_be_bytes([frame[2], frame[3]]);
        if (total_length as usize) < header_len {
            return Err(DecodeError::Malformed { layer: "ipv4", reason: "total_length<ihl*4" });
        }
        if frame.len() < total_length as usize {
            return Err(DecodeError::TooShort {
                layer: "ipv4",
                need: total_length as usize,
                have: frame.len(),
            });
        }

        let id = u16::from_be_bytes([frame[4], frame[5]]);
        let flags_offset = u16::from_be_bytes([frame[6], frame[7]]);
        let flags = flags_offset >> 13;
        let reserved_flag = flags & 0x4 != 0;
        let df = flags & 0x2 != 0;
        let mf = flags & 0x1 != 0;
        let frag_offset = flags_offset & 0x1FFF;

        let ttl = frame[8];
        let protocol = frame[9];
        let checksum = u16::from_be_bytes([frame[10], frame[11]]);
        let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
        let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

        let options = parse_options(&frame[20..header_len])?;

        Ok(Ipv4Header {
            version,
            ihl,
            tos,
            total_length,
            id,
            reserved_flag,
            df,
            mf,
            frag_offset,
            ttl,
            protocol,
            checksum,
            src,
            dst,
            options,
            bytes: &frame[..header_len],
            payload: &frame[header_len..total_length as usize],
        })
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn options(&self) -> impl Iterator<Item = Ipv4Option<'a>> + '_ {
        let base = self.bytes;
        self.options
            .iter()
            .map(move |o| Ipv4Option { kind: o.kind, bytes: &base[o.start..o.end] })
    }

    pub fn next_layer(&self) -> NextLayer {
        match self.protocol {
            1 => NextLayer::Icmpv4,
            6 => NextLayer::Tcp,
            other => NextLayer::Unsupported(other as u16),
        }
    }
}

fn parse_options(mut buf: &[u8]) -> Result<Vec<Ipv4OptionOwned>, DecodeError> {
    let full_len = buf.len();
    let mut opts = Vec::new();
    loop {
        if buf.is_empty() {
            break;
        }
        let kind = buf[0];
        if kind == 0 {
            break;
        }
        if kind == 1 {
            let start = full_len - buf.len();
            opts.push(Ipv4OptionOwned { kind, start, end: start + 1 });
            buf = &buf[1..];
            continue;
        }
        if buf.len() < 2 {
            return Err(DecodeError::Malformed { layer: "ipv4", reason: "option truncated" });
        }
        let len = buf[1] as usize;
        if len < 2 || len > buf.len() {
            return Err(DecodeError::Malformed { layer: "ipv4", reason: "option length out of range" });
        }
        let start = full_len - buf.len();
        opts.push(Ipv4OptionOwned { kind, start, end: start + len });
        buf = &buf[len..];
    }
    Ok(opts)
}
