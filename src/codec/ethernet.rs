//! Ethernet II frame header (spec §4.1).

use crate::codec::{MacAddr, NextLayer};
use crate::error::DecodeError;
use nom::number::complete::be_u16;

const HEADER_LEN: usize = 14;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_VLAN: u16 = 0x8100;

/// A decoded Ethernet header. Borrows from the original frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
    bytes: &'a [u8],
    payload: &'a [u8],
}

impl<'a> EthernetHeader<'a> {
    /// Decodes an Ethernet II header from `frame`. Requires at least 14 bytes.
    pub fn decode(frame: &'a [u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                layer: "ethernet",
                need: HEADER_LEN,
                have: frame.len(),
            });
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        let (_, ether_type) = be_u16::<_, nom::error::Error<&[u8]>>(&frame[12..14])
            .map_err(|_| DecodeError::Malformed { layer: "ethernet", reason: "ether_type" })?;

        Ok(EthernetHeader {
            dst,
            src,
            ether_type,
            bytes: &frame[..HEADER_LEN],
            payload: &frame[HEADER_LEN..],
        })
    }

    pub fn header_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn next_layer(&self) -> NextLayer {
        match self.ether_type {
            ETHER_TYPE_IPV4 => NextLayer::Ipv4,
            ETHER_TYPE_VLAN => NextLayer::Vlan,
            other => NextLayer::Unsupported(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0xff; 6];
        v.extend_from_slice(&[0x02; 6]);
        v.extend_from_slice(&ether_type.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn decodes_ipv4_ether_type() {
        let data = frame(ETHER_TYPE_IPV4, b"hello");
        let eth = EthernetHeader::decode(&data).unwrap();
        assert_eq!(eth.next_layer(), NextLayer::Ipv4);
        assert_eq!(eth.payload(), b"hello");
        assert_eq!(eth.dst, [0xff; 6]);
    }

    #[test]
    fn decodes_vlan_ether_type() {
        let data = frame(ETHER_TYPE_VLAN, b"tagged");
        let eth = EthernetHeader::decode(&data).unwrap();
        assert_eq!(eth.next_layer(), NextLayer::Vlan);
    }

    #[test]
    fn rejects_short_frame() {
        let data = vec![0u8; 13];
        assert!(matches!(
            EthernetHeader::decode(&data),
            Err(DecodeError::TooShort { layer: "ethernet", .. })
        ));
    }
}
