//! 802.1Q VLAN tag (spec §4.1).

use crate::codec::NextLayer;
use crate::error::DecodeError;
use nom::number::complete::be_u16;

const HEADER_LEN: usize = 4;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_VLAN: u16 = 0x8100;

/// A decoded 802.1Q tag: 3-bit PCP, 1-bit DEI, 12-bit VID, plus the inner
/// EtherType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanHeader<'a> {
    pub pcp: u8,
    pub dei: bool,
    pub vid: u16,
    pub inner_ether_type: u16,
    bytes: &'a [u8],
    payload: &'a [u8],
}

impl<'a> VlanHeader<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort { layer: "vlan", need: HEADER_LEN, have: frame.len() });
        }

        let (_, tci) = be_u16::<_, nom::error::Error<&[u8]>>(&frame[0..2])
            .map_err(|_| DecodeError::Malformed { layer: "vlan", reason: "tci" })?;
        let (_, inner_ether_type) = be_u16::<_, nom::error::Error<&[u8]>>(&frame[2..4])
            .map_err(|_| DecodeError::Malformed { layer: "vlan", reason: "inner_ether_type" })?;

        Ok(VlanHeader {
            pcp: ((tci >> 13) & 0x7) as u8,
            dei: (tci >> 12) & 0x1 == 1,
            vid: tci & 0x0FFF,
            inner_ether_type,
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
        match self.inner_ether_type {
            ETHER_TYPE_IPV4 => NextLayer::Ipv4,
            ETHER_TYPE_VLAN => NextLayer::Vlan,
            other => NextLayer::Unsupported(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pcp_dei_vid() {
        // PCP=5 (101), DEI=1, VID=0x0AB (101 1 000010101011)
        let tci: u16 = (0b101 << 13) | (1 << 12) | 0x0AB;
        let mut data = tci.to_be_bytes().to_vec();
        data.extend_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
        let vlan = VlanHeader::decode(&data).unwrap();
        assert_eq!(vlan.pcp, 5);
        assert!(vlan.dei);
        assert_eq!(vlan.vid, 0x0AB);
        assert_eq!(vlan.next_layer(), NextLayer::Ipv4);
    }

    #[test]
    fn rejects_short() {
        assert!(VlanHeader::decode(&[0u8; 3]).is_err());
    }
}
