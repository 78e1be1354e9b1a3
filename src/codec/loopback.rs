//! BSD loopback / null datalink header (spec §4.1).

use crate::codec::NextLayer;
use crate::error::DecodeError;

const HEADER_LEN: usize = 4;
const PF_INET: u32 = 0x02;

/// Decoded BSD loopback header: a 32-bit protocol family whose own byte
/// order is self-describing (all-zero high bytes on either end implies
/// big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackHeader<'a> {
    pub family: u32,
    bytes: &'a [u8],
    payload: &'a [u8],
}

impl<'a> LoopbackHeader<'a> {
    pub fn decode(frame: &'a [u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::TooShort { layer: "loopback", need: HEADER_LEN, have: frame.len() });
        }

        let raw: [u8; 4] = frame[0..4].try_into().unwrap();
        // Both the low 16 bits of a little-endian read and the high 16 bits
        // of a big-endian read being zero is the degenerate case the spec
        // pins to big-endian.
        let big = u32::from_be_bytes(raw);
        let little = u32::from_le_bytes(raw);
        let family = if raw[0] == 0 && raw[1] == 0 { big } else { little };

        Ok(LoopbackHeader {
            family,
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
        if self.family == PF_INET {
            NextLayer::Ipv4
        } else {
            NextLayer::Unsupported(self.family as u16)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_family() {
        let data = [0x00, 0x00, 0x00, 0x02];
        let lo = LoopbackHeader::decode(&data).unwrap();
        assert_eq!(lo.family, 2);
        assert_eq!(lo.next_layer(), NextLayer::Ipv4);
    }

    #[test]
    fn little_endian_family() {
        let data = [0x02, 0x00, 0x00, 0x00];
        let lo = LoopbackHeader::decode(&data).unwrap();
        assert_eq!(lo.family, 2);
        assert_eq!(lo.next_layer(), NextLayer::Ipv4);
    }
}
