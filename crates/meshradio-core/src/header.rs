use crate::seq::Seq;
use crate::NodeId;

/// Size of the PHY header on the air, in bytes
pub const HDR_SIZE: usize = 5;

/// Size of the extended header at the start of the payload, in bytes
pub const EHDR_SIZE: usize = 6;

/// Packet flags carried in the PHY header.
///
/// On the air this is a single byte:
/// bit 0 = syn, bit 1 = ack, bit 2 = has_seq, bit 3 = has_control,
/// bit 4 = compressed, bits 5-7 = team.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    /// Set if the packet is the first in a new connection
    pub syn: bool,
    /// Set if the packet is ACKing
    pub ack: bool,
    /// Set if the packet is sequenced
    pub has_seq: bool,
    /// Set if the packet has control data
    pub has_control: bool,
    /// Set if the packet is compressed
    pub compressed: bool,
    /// Team identifier (3 bits)
    pub team: u8,
}

impl HeaderFlags {
    pub fn to_byte(self) -> u8 {
        (self.syn as u8)
            | (self.ack as u8) << 1
            | (self.has_seq as u8) << 2
            | (self.has_control as u8) << 3
            | (self.compressed as u8) << 4
            | (self.team & 0x7) << 5
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            syn: b & 0x01 != 0,
            ack: b & 0x02 != 0,
            has_seq: b & 0x04 != 0,
            has_control: b & 0x08 != 0,
            compressed: b & 0x10 != 0,
            team: (b >> 5) & 0x7,
        }
    }
}

/// PHY packet header.
///
/// Wire layout: `curhop:u8 || nexthop:u8 || seq:u16 LE || flags:u8`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Current hop
    pub curhop: NodeId,
    /// Next hop
    pub nexthop: NodeId,
    /// Packet sequence number
    pub seq: Seq,
    /// Packet flags
    pub flags: HeaderFlags,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HDR_SIZE] {
        let seq = self.seq.0.to_le_bytes();

        [self.curhop, self.nexthop, seq[0], seq[1], self.flags.to_byte()]
    }

    pub fn from_bytes(b: &[u8; HDR_SIZE]) -> Self {
        Self {
            curhop: b[0],
            nexthop: b[1],
            seq: Seq(u16::from_le_bytes([b[2], b[3]])),
            flags: HeaderFlags::from_byte(b[4]),
        }
    }
}

/// Extended header that appears at the beginning of the radio payload.
///
/// Wire layout: `src:u8 || dest:u8 || ack:u16 LE || data_len:u16 LE`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    /// Source node
    pub src: NodeId,
    /// Destination node
    pub dest: NodeId,
    /// Sequence number we are ACK'ing or NAK'ing
    pub ack: Seq,
    /// Length of the data portion of the payload.
    ///
    /// The payload may be padded or contain control data, so this is not
    /// necessarily the full payload length.
    pub data_len: u16,
}

impl ExtendedHeader {
    pub fn to_bytes(&self) -> [u8; EHDR_SIZE] {
        let ack = self.ack.0.to_le_bytes();
        let len = self.data_len.to_le_bytes();

        [self.src, self.dest, ack[0], ack[1], len[0], len[1]]
    }

    pub fn from_bytes(b: &[u8; EHDR_SIZE]) -> Self {
        Self {
            src: b[0],
            dest: b[1],
            ack: Seq(u16::from_le_bytes([b[2], b[3]])),
            data_len: u16::from_le_bytes([b[4], b[5]]),
        }
    }

    /// Read the extended header from the front of a payload buffer
    pub fn read(payload: &[u8]) -> Option<Self> {
        let b: &[u8; EHDR_SIZE] = payload.get(..EHDR_SIZE)?.try_into().ok()?;

        Some(Self::from_bytes(b))
    }

    /// Write the extended header into the front of a payload buffer
    pub fn write(&self, payload: &mut [u8]) {
        payload[..EHDR_SIZE].copy_from_slice(&self.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        for b in 0..=u8::MAX {
            assert_eq!(HeaderFlags::from_byte(b).to_byte(), b);
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = Header {
            curhop: 1,
            nexthop: 2,
            seq: Seq(0xbeef),
            flags: HeaderFlags {
                syn: true,
                has_seq: true,
                team: 5,
                ..Default::default()
            },
        };

        assert_eq!(Header::from_bytes(&hdr.to_bytes()), hdr);
    }

    #[test]
    fn test_ehdr_layout_is_little_endian() {
        let ehdr = ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(0x0102),
            data_len: 0x0304,
        };

        assert_eq!(ehdr.to_bytes(), [1, 2, 0x02, 0x01, 0x04, 0x03]);
        assert_eq!(ExtendedHeader::from_bytes(&ehdr.to_bytes()), ehdr);
    }
}
