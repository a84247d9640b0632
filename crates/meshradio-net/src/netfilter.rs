use std::collections::HashSet;
use std::sync::Mutex;

use meshradio_core::{NetPacket, NodeId, NODE_BROADCAST};

use crate::element::{NetOut, PacketSink};

/// Minimum size of an IPv4 header
const IPV4_HDR_LEN: usize = 20;

/// The set of nodes we know how to reach
#[derive(Debug, Default)]
pub struct Neighborhood {
    pub this_node: NodeId,
    nodes: Mutex<HashSet<NodeId>>,
}

impl Neighborhood {
    pub fn new(this_node: NodeId) -> Self {
        Self {
            this_node,
            nodes: Mutex::new(HashSet::from([this_node])),
        }
    }

    pub fn add(&self, node: NodeId) {
        self.nodes.lock().unwrap().insert(node);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.lock().unwrap().contains(&node)
    }
}

/// Derives mesh addressing from IP packets read off the tun interface.
///
/// Node numbers are the last octet of a node's IP address by convention.
/// Packets not originated by this node, or destined for nodes we do not know
/// of, are dropped.
pub struct NetFilter {
    nhood: std::sync::Arc<Neighborhood>,

    int_net: u32,
    int_netmask: u32,
    int_broadcast: u32,

    ext_net: u32,
    ext_netmask: u32,
    ext_broadcast: u32,

    /// Network packet output port
    pub net_out: NetOut,
}

impl NetFilter {
    pub fn new(
        nhood: std::sync::Arc<Neighborhood>,
        int_net: (u32, u32),
        ext_net: (u32, u32),
    ) -> Self {
        Self {
            nhood,
            int_net: int_net.0 & int_net.1,
            int_netmask: int_net.1,
            int_broadcast: int_net.0 | !int_net.1,
            ext_net: ext_net.0 & ext_net.1,
            ext_netmask: ext_net.1,
            ext_broadcast: ext_net.0 | !ext_net.1,
            net_out: NetOut::new(),
        }
    }

    /// Fill in hop/src/dest information. Returns false if the packet should
    /// be dropped.
    ///
    /// The `data_len` field is set when the packet is read from the tun
    /// interface; sequence numbers and modulation parameters are set by the
    /// controller.
    pub fn process(&self, pkt: &mut NetPacket) -> bool {
        if pkt.size() == 0 || pkt.data().len() < IPV4_HDR_LEN {
            tracing::debug!("dropped short packet");
            return false;
        }

        let data = pkt.data();

        if data[0] >> 4 != 4 {
            tracing::debug!("dropped non-IPv4 packet: version={}", data[0] >> 4);
            return false;
        }

        let src_addr = u32::from_be_bytes(data[12..16].try_into().unwrap());
        let dest_addr = u32::from_be_bytes(data[16..20].try_into().unwrap());

        let (src_id, dest_id, broadcast) = if src_addr & self.int_netmask == self.int_net {
            // Internal-network traffic carries the node number in the last
            // octet
            (
                (src_addr & 0xff) as NodeId,
                (dest_addr & 0xff) as NodeId,
                dest_addr == self.int_broadcast,
            )
        } else if src_addr & self.ext_netmask == self.ext_net {
            (
                (src_addr & 0xff) as NodeId,
                (dest_addr & 0xff) as NodeId,
                dest_addr == self.ext_broadcast,
            )
        } else {
            tracing::debug!(
                "dropped IP packet from unknown subnet {}.{}.{}.{}",
                (src_addr >> 24) & 0xff,
                (src_addr >> 16) & 0xff,
                (src_addr >> 8) & 0xff,
                src_addr & 0xff
            );
            return false;
        };

        // Only transmit packets that are either broadcast or where we are
        // the source and we know of the destination
        if !broadcast && !(src_id == self.nhood.this_node && self.nhood.contains(dest_id)) {
            tracing::debug!("dropped packet: src={} dest={}", src_id, dest_id);
            return false;
        }

        pkt.hdr.curhop = src_id;
        pkt.hdr.nexthop = if broadcast { NODE_BROADCAST } else { dest_id };

        let mut ehdr = pkt.ehdr();
        ehdr.src = src_id;
        ehdr.dest = dest_id;
        pkt.set_ehdr(ehdr);

        // Cache payload size for the queue's byte accounting
        pkt.payload_size = pkt.ehdr().data_len as usize;

        tracing::trace!(
            "read {} bytes from {} to {}",
            pkt.ehdr().data_len,
            pkt.hdr.curhop,
            pkt.hdr.nexthop
        );

        true
    }
}

impl PacketSink<Box<NetPacket>> for NetFilter {
    fn send(&self, mut pkt: Box<NetPacket>) {
        if self.process(&mut pkt) {
            self.net_out.push(pkt);
        }
    }
}

/// Build a minimal IPv4/UDP packet for tests and the loopback demo
pub fn build_ipv4_udp(src: u32, dest: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = IPV4_HDR_LEN + 8 + payload.len();
    let mut pkt = Vec::with_capacity(total_len);

    pkt.push(0x45); // version 4, IHL 5
    pkt.push(0);
    pkt.extend_from_slice(&(total_len as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    pkt.push(64); // TTL
    pkt.push(17); // UDP
    pkt.extend_from_slice(&[0, 0]); // checksum, filled below
    pkt.extend_from_slice(&src.to_be_bytes());
    pkt.extend_from_slice(&dest.to_be_bytes());

    let csum = ipv4_checksum(&pkt[..IPV4_HDR_LEN]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());

    // UDP header
    pkt.extend_from_slice(&5000u16.to_be_bytes());
    pkt.extend_from_slice(&5000u16.to_be_bytes());
    pkt.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(payload);

    pkt
}

/// IPv4 header checksum with the checksum field taken as zero
pub fn ipv4_checksum(hdr: &[u8]) -> u16 {
    let mut sum = 0u32;

    for (i, pair) in hdr.chunks(2).enumerate() {
        if i == 5 {
            continue; // checksum field
        }

        let word = match pair {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => unreachable!(),
        };

        sum += word as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_core::header::EHDR_SIZE;
    use meshradio_core::ExtendedHeader;

    const INT_NET: (u32, u32) = (0x0a0a0a00, 0xffffff00);
    const EXT_NET: (u32, u32) = (0xc0a80000, 0xffff0000);

    fn filter(this_node: NodeId, known: &[NodeId]) -> NetFilter {
        let nhood = std::sync::Arc::new(Neighborhood::new(this_node));

        for &n in known {
            nhood.add(n);
        }

        NetFilter::new(nhood, INT_NET, EXT_NET)
    }

    fn pkt_with_data(data: Vec<u8>) -> NetPacket {
        let mut pkt = NetPacket::with_capacity(EHDR_SIZE + data.len());

        pkt.set_ehdr(ExtendedHeader {
            data_len: data.len() as u16,
            ..Default::default()
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(&data);
        pkt
    }

    #[test]
    fn test_derives_node_ids_from_ip() {
        let f = filter(1, &[2]);
        // 10.10.10.1 -> 10.10.10.2
        let mut pkt = pkt_with_data(build_ipv4_udp(0x0a0a0a01, 0x0a0a0a02, b"hi"));

        assert!(f.process(&mut pkt));
        assert_eq!(pkt.hdr.curhop, 1);
        assert_eq!(pkt.hdr.nexthop, 2);
        assert_eq!(pkt.ehdr().src, 1);
        assert_eq!(pkt.ehdr().dest, 2);
        assert_eq!(pkt.payload_size, pkt.ehdr().data_len as usize);
    }

    #[test]
    fn test_broadcast_maps_nexthop() {
        let f = filter(1, &[]);
        // 10.10.10.1 -> 10.10.10.255
        let mut pkt = pkt_with_data(build_ipv4_udp(0x0a0a0a01, 0x0a0a0aff, b"x"));

        assert!(f.process(&mut pkt));
        assert_eq!(pkt.hdr.nexthop, NODE_BROADCAST);
    }

    #[test]
    fn test_drops_unknown_destination() {
        let f = filter(1, &[2]);
        let mut pkt = pkt_with_data(build_ipv4_udp(0x0a0a0a01, 0x0a0a0a63, b"x"));

        assert!(!f.process(&mut pkt));
    }

    #[test]
    fn test_drops_foreign_subnet() {
        let f = filter(1, &[2]);
        // 172.16.0.1 is neither internal nor external
        let mut pkt = pkt_with_data(build_ipv4_udp(0xac100001, 0x0a0a0a02, b"x"));

        assert!(!f.process(&mut pkt));
    }

    #[test]
    fn test_ipv4_checksum() {
        // Known-good header: 172.16.10.99 -> 172.16.10.12, checksum 0xb1e6
        let hdr: [u8; 20] = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0xb1, 0xe6, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];

        assert_eq!(ipv4_checksum(&hdr), 0xb1e6);
    }
}
