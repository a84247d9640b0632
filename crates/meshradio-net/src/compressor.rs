use std::sync::atomic::{AtomicBool, Ordering};

use meshradio_core::header::EHDR_SIZE;
use meshradio_core::{NetPacket, Packet, RadioPacket};

use crate::element::{NetOut, PacketSink, RadioOut};
use crate::netfilter::ipv4_checksum;

/// Type of compression applied to a packet, carried in the leading flags
/// byte of a compressed payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    Uncompressed = 0,
    /// IPv4 packet with elided source and destination addresses
    Ipv4 = 1,
}

/// Compression flags byte: bits 0-2 type, bits 3-4 address mode, bit 5
/// read-TTL
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompressionFlags {
    pub ctype: u8,
    pub ipaddr_type: u8,
    pub read_ttl: bool,
}

impl CompressionFlags {
    pub fn to_byte(self) -> u8 {
        (self.ctype & 0x7) | (self.ipaddr_type & 0x3) << 3 | (self.read_ttl as u8) << 5
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            ctype: b & 0x7,
            ipaddr_type: (b >> 3) & 0x3,
            read_ttl: b & 0x20 != 0,
        }
    }
}

const IPV4_HDR_LEN: usize = 20;

/// A packet compression element.
///
/// On the network side, IPv4 source and destination addresses are elided
/// from the data region (they are reconstructable from the extended header
/// and the configured subnet) and the `compressed` header flag is set. On
/// the radio side the transformation is reversed, including the IP header
/// checksum.
pub struct PacketCompressor {
    enabled: AtomicBool,

    /// Internal IP network the addresses are reconstructed onto
    int_net: u32,

    /// Network packet output port
    pub net_out: NetOut,

    /// Radio packet output port
    pub radio_out: RadioOut,
}

impl PacketCompressor {
    pub fn new(enabled: bool, int_net: (u32, u32)) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            int_net: int_net.0 & int_net.1,
            net_out: NetOut::new(),
            radio_out: RadioOut::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Compress a network packet in place if possible
    pub fn compress(&self, pkt: &mut Packet) {
        let data = pkt.data();

        if data.len() < IPV4_HDR_LEN || data[0] != 0x45 {
            return;
        }

        // Elide the source and destination addresses; they come back from
        // the extended header on decompression
        let mut compressed = Vec::with_capacity(1 + data.len() - 8);

        compressed.push(
            CompressionFlags {
                ctype: CompressionType::Ipv4 as u8,
                ..Default::default()
            }
            .to_byte(),
        );
        compressed.extend_from_slice(&data[..12]);
        compressed.extend_from_slice(&data[20..]);

        let ehdr = pkt.ehdr();
        let mut ehdr = ehdr;
        ehdr.data_len = compressed.len() as u16;

        pkt.payload.truncate(EHDR_SIZE);
        pkt.payload.extend_from_slice(&compressed);
        pkt.set_ehdr(ehdr);
        pkt.hdr.flags.compressed = true;
    }

    /// Decompress a radio packet in place
    pub fn decompress(&self, pkt: &mut Packet) {
        if !pkt.hdr.flags.compressed {
            return;
        }

        let data = pkt.data().to_vec();

        let Some((&flags_byte, rest)) = data.split_first() else {
            return;
        };
        let flags = CompressionFlags::from_byte(flags_byte);

        if flags.ctype != CompressionType::Ipv4 as u8 || rest.len() < 12 {
            return;
        }

        let ehdr = pkt.ehdr();
        let src_addr = self.int_net | ehdr.src as u32;
        let dest_addr = self.int_net | ehdr.dest as u32;

        let mut restored = Vec::with_capacity(rest.len() + 8);

        restored.extend_from_slice(&rest[..12]);
        restored.extend_from_slice(&src_addr.to_be_bytes());
        restored.extend_from_slice(&dest_addr.to_be_bytes());
        restored.extend_from_slice(&rest[12..]);

        // Re-derive the header checksum
        let csum = ipv4_checksum(&restored[..IPV4_HDR_LEN]);
        restored[10..12].copy_from_slice(&csum.to_be_bytes());

        let mut ehdr = ehdr;
        ehdr.data_len = restored.len() as u16;

        pkt.payload.truncate(EHDR_SIZE);
        pkt.payload.extend_from_slice(&restored);
        pkt.set_ehdr(ehdr);
        pkt.hdr.flags.compressed = false;
    }
}

impl PacketSink<Box<NetPacket>> for PacketCompressor {
    fn send(&self, mut pkt: Box<NetPacket>) {
        if self.enabled() {
            self.compress(&mut pkt.base);
            pkt.payload_size = pkt.ehdr().data_len as usize;
        }

        self.net_out.push(pkt);
    }
}

impl PacketSink<Box<RadioPacket>> for PacketCompressor {
    fn send(&self, mut pkt: Box<RadioPacket>) {
        if self.enabled() {
            self.decompress(&mut pkt.base);
        }

        self.radio_out.push(pkt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::build_ipv4_udp;
    use meshradio_core::ExtendedHeader;

    const INT_NET: (u32, u32) = (0x0a0a0a00, 0xffffff00);

    #[test]
    fn test_compress_roundtrip() {
        let compressor = PacketCompressor::new(true, INT_NET);
        let ip = build_ipv4_udp(0x0a0a0a01, 0x0a0a0a02, b"payload bytes");

        let mut pkt = Packet::with_capacity(EHDR_SIZE + ip.len());
        pkt.set_ehdr(ExtendedHeader {
            src: 1,
            dest: 2,
            data_len: ip.len() as u16,
            ..Default::default()
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(&ip);

        compressor.compress(&mut pkt);
        assert!(pkt.hdr.flags.compressed);
        assert!(pkt.data().len() < ip.len());

        compressor.decompress(&mut pkt);
        assert!(!pkt.hdr.flags.compressed);
        assert_eq!(pkt.data(), &ip[..]);
    }

    #[test]
    fn test_non_ipv4_left_alone() {
        let compressor = PacketCompressor::new(true, INT_NET);
        let data = vec![0u8; 32];

        let mut pkt = Packet::with_capacity(EHDR_SIZE + data.len());
        pkt.set_ehdr(ExtendedHeader {
            data_len: data.len() as u16,
            ..Default::default()
        });

        compressor.compress(&mut pkt);
        assert!(!pkt.hdr.flags.compressed);
    }
}
