use std::ops::{Deref, DerefMut};

use crate::channel::Channel;
use crate::clock::{MonoTime, WallTime};
use crate::header::{ExtendedHeader, Header, EHDR_SIZE};
use crate::seq::Seq;
use crate::{FlowUid, McsIdx, NodeId};

/// Control message tags as they appear on the air
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlTag {
    Hello = 0,
    Timestamp = 1,
    TimestampEcho = 2,
    ReceiverStats = 3,
    Nak = 4,
    SelectiveAck = 5,
    SetUnack = 6,
}

impl ControlTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Hello),
            1 => Some(Self::Timestamp),
            2 => Some(Self::TimestampEcho),
            3 => Some(Self::ReceiverStats),
            4 => Some(Self::Nak),
            5 => Some(Self::SelectiveAck),
            6 => Some(Self::SetUnack),
            _ => None,
        }
    }

    /// Size of a control record on the air, tag byte included
    pub const fn size(self) -> usize {
        match self {
            Self::Hello => 2,
            Self::Timestamp => 17,
            Self::TimestampEcho => 34,
            Self::ReceiverStats => 17,
            Self::Nak => 3,
            Self::SelectiveAck => 5,
            Self::SetUnack => 3,
        }
    }
}

/// A monotonic time point as serialized into control messages:
/// whole seconds (u64 LE) followed by fractional seconds (f64 LE).
fn encode_time(t: MonoTime, out: &mut Vec<u8>) {
    let secs = t.secs().floor();
    let frac = t.secs() - secs;

    out.extend_from_slice(&(secs as u64).to_le_bytes());
    out.extend_from_slice(&frac.to_le_bytes());
}

fn decode_time(b: &[u8]) -> MonoTime {
    let secs = u64::from_le_bytes(b[0..8].try_into().unwrap());
    let frac = f64::from_le_bytes(b[8..16].try_into().unwrap());

    MonoTime(secs as f64 + frac)
}

/// A control message, carried tag-prefixed after the data payload
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlMsg {
    Hello {
        is_gateway: bool,
    },
    /// Transmission time of this packet at the transmitter
    Timestamp {
        t_sent: MonoTime,
    },
    TimestampEcho {
        /// Node that sent the original timestamp
        node: NodeId,
        /// Transmitter's timestamp on the sent packet
        t_sent: MonoTime,
        /// Receiver's timestamp of the packet
        t_recv: MonoTime,
    },
    ReceiverStats {
        /// Long-term EVM at the receiver [dB]
        long_evm: f64,
        /// Long-term RSSI at the receiver [dB]
        long_rssi: f64,
    },
    Nak(Seq),
    SelectiveAck {
        begin: Seq,
        end: Seq,
    },
    SetUnack {
        /// Sender's first un-ACK'ed packet
        unack: Seq,
    },
}

impl ControlMsg {
    pub fn tag(&self) -> ControlTag {
        match self {
            Self::Hello { .. } => ControlTag::Hello,
            Self::Timestamp { .. } => ControlTag::Timestamp,
            Self::TimestampEcho { .. } => ControlTag::TimestampEcho,
            Self::ReceiverStats { .. } => ControlTag::ReceiverStats,
            Self::Nak(_) => ControlTag::Nak,
            Self::SelectiveAck { .. } => ControlTag::SelectiveAck,
            Self::SetUnack { .. } => ControlTag::SetUnack,
        }
    }

    /// Encoded size on the air, tag byte included
    pub fn size(&self) -> usize {
        self.tag().size()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag() as u8);

        match *self {
            Self::Hello { is_gateway } => out.push(is_gateway as u8),
            Self::Timestamp { t_sent } => encode_time(t_sent, out),
            Self::TimestampEcho { node, t_sent, t_recv } => {
                out.push(node);
                encode_time(t_sent, out);
                encode_time(t_recv, out);
            }
            Self::ReceiverStats { long_evm, long_rssi } => {
                out.extend_from_slice(&long_evm.to_le_bytes());
                out.extend_from_slice(&long_rssi.to_le_bytes());
            }
            Self::Nak(seq) => out.extend_from_slice(&seq.0.to_le_bytes()),
            Self::SelectiveAck { begin, end } => {
                out.extend_from_slice(&begin.0.to_le_bytes());
                out.extend_from_slice(&end.0.to_le_bytes());
            }
            Self::SetUnack { unack } => out.extend_from_slice(&unack.0.to_le_bytes()),
        }
    }

    /// Decode one control record. `b` must start at the tag byte and contain
    /// the full record.
    pub fn decode(b: &[u8]) -> Option<(ControlMsg, usize)> {
        let tag = ControlTag::from_byte(*b.first()?)?;

        if b.len() < tag.size() {
            return None;
        }

        let body = &b[1..];
        let msg = match tag {
            ControlTag::Hello => ControlMsg::Hello {
                is_gateway: body[0] != 0,
            },
            ControlTag::Timestamp => ControlMsg::Timestamp {
                t_sent: decode_time(body),
            },
            ControlTag::TimestampEcho => ControlMsg::TimestampEcho {
                node: body[0],
                t_sent: decode_time(&body[1..]),
                t_recv: decode_time(&body[17..]),
            },
            ControlTag::ReceiverStats => ControlMsg::ReceiverStats {
                long_evm: f64::from_le_bytes(body[0..8].try_into().unwrap()),
                long_rssi: f64::from_le_bytes(body[8..16].try_into().unwrap()),
            },
            ControlTag::Nak => ControlMsg::Nak(Seq(u16::from_le_bytes(body[0..2].try_into().unwrap()))),
            ControlTag::SelectiveAck => ControlMsg::SelectiveAck {
                begin: Seq(u16::from_le_bytes(body[0..2].try_into().unwrap())),
                end: Seq(u16::from_le_bytes(body[2..4].try_into().unwrap())),
            },
            ControlTag::SetUnack => ControlMsg::SetUnack {
                unack: Seq(u16::from_le_bytes(body[0..2].try_into().unwrap())),
            },
        };

        Some((msg, tag.size()))
    }
}

/// Flags internal to the stack, never transmitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InternalFlags {
    /// Set if the packet had an invalid header
    pub invalid_header: bool,
    /// Set if the packet had an invalid payload
    pub invalid_payload: bool,
    /// Set if the packet is a retransmission
    pub retransmission: bool,
    /// Set if the packet has an assigned sequence number
    pub has_seq: bool,
    /// Set if the packet contains a selective ACK
    pub has_selective_ack: bool,
    /// Set if this packet should be timestamped
    pub timestamp: bool,
}

/// A packet at any stage of the pipeline.
///
/// The payload always begins with the extended header; the data region
/// follows, and an optional length-prefixed control region comes after the
/// data.
#[derive(Debug, Default)]
pub struct Packet {
    /// PHY header
    pub hdr: Header,

    /// Payload: extended header, data, optional control region
    pub payload: Vec<u8>,

    /// Flow this packet belongs to
    pub flow_uid: Option<FlowUid>,

    /// Monotonic time at which the packet entered the system
    pub timestamp: MonoTime,

    /// Wall-clock time at which the packet was created
    pub wall_timestamp: Option<WallTime>,

    /// Cached size of the data portion of the payload
    pub payload_size: usize,

    /// Internal flags
    pub internal_flags: InternalFlags,
}

impl Packet {
    /// Create a packet with an empty payload of `n` bytes; `n` must cover the
    /// extended header.
    pub fn with_capacity(n: usize) -> Self {
        assert!(n >= EHDR_SIZE);

        Self {
            payload: vec![0; n],
            ..Default::default()
        }
    }

    pub fn from_payload(hdr: Header, payload: Vec<u8>) -> Self {
        Self {
            hdr,
            payload,
            ..Default::default()
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The extended header at the front of the payload
    pub fn ehdr(&self) -> ExtendedHeader {
        ExtendedHeader::read(&self.payload).unwrap_or_default()
    }

    pub fn set_ehdr(&mut self, ehdr: ExtendedHeader) {
        if self.payload.len() < EHDR_SIZE {
            self.payload.resize(EHDR_SIZE, 0);
        }
        ehdr.write(&mut self.payload);
    }

    /// The data region of the payload
    pub fn data(&self) -> &[u8] {
        let len = self.ehdr().data_len as usize;

        &self.payload[EHDR_SIZE..EHDR_SIZE + len]
    }

    /// Offset of the control-length field, one past the data region
    fn ctrl_len_off(&self) -> usize {
        EHDR_SIZE + self.ehdr().data_len as usize
    }

    /// Total length of the control region, excluding the length field itself
    pub fn control_len(&self) -> u16 {
        let off = self.ctrl_len_off();

        match self.payload.get(off..off + 2) {
            Some(b) => u16::from_le_bytes(b.try_into().unwrap()),
            None => 0,
        }
    }

    fn set_control_len(&mut self, ctrl_len: u16) {
        let off = self.ctrl_len_off();

        self.payload[off..off + 2].copy_from_slice(&ctrl_len.to_le_bytes());
    }

    /// Append a control message, growing the control region
    pub fn append_control(&mut self, msg: &ControlMsg) {
        if !self.hdr.flags.has_control {
            self.hdr.flags.has_control = true;
            self.payload.truncate(self.ctrl_len_off());
            self.payload.extend_from_slice(&0u16.to_le_bytes());
        }

        let ctrl_len = self.control_len();
        let mut encoded = Vec::with_capacity(msg.size());

        msg.encode(&mut encoded);
        self.payload.extend_from_slice(&encoded);
        self.set_control_len(ctrl_len + encoded.len() as u16);
    }

    /// Blindly remove the last control message, which must have tag `tag`
    pub fn remove_last_control(&mut self, tag: ControlTag) {
        let ctrl_len = self.control_len();

        debug_assert!(ctrl_len as usize >= tag.size());

        self.payload.truncate(self.payload.len() - tag.size());
        self.set_control_len(ctrl_len - tag.size() as u16);

        if self.control_len() == 0 {
            self.clear_control();
        }
    }

    /// Drop the control region entirely
    pub fn clear_control(&mut self) {
        self.hdr.flags.has_control = false;
        self.payload.truncate(self.ctrl_len_off());
    }

    /// Iterate the control messages in the packet
    pub fn control_iter(&self) -> ControlIter<'_> {
        let region = if self.hdr.flags.has_control {
            let off = self.ctrl_len_off() + 2;
            let len = self.control_len() as usize;

            self.payload.get(off..off + len).unwrap_or(&[])
        } else {
            &[]
        };

        ControlIter { region }
    }

    /// Check packet integrity against the extended header.
    pub fn integrity_intact(&self) -> bool {
        if self.size() < EHDR_SIZE {
            return false;
        }

        let data_len = self.ehdr().data_len as usize;

        if self.hdr.flags.has_control {
            if self.size() < EHDR_SIZE + data_len + 2 {
                return false;
            }

            self.size() == EHDR_SIZE + data_len + 2 + self.control_len() as usize
        } else {
            self.size() == EHDR_SIZE + data_len
        }
    }
}

/// Iterator over a packet's control region
pub struct ControlIter<'a> {
    region: &'a [u8],
}

impl Iterator for ControlIter<'_> {
    type Item = ControlMsg;

    fn next(&mut self) -> Option<ControlMsg> {
        let (msg, size) = ControlMsg::decode(self.region)?;

        self.region = &self.region[size..];

        Some(msg)
    }
}

/// Pipeline timestamps recorded as a network packet flows to the air
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketTimestamps {
    pub tuntap_read: Option<MonoTime>,
    pub enqueue: Option<MonoTime>,
    pub dequeue_start: Option<MonoTime>,
    pub dequeue_end: Option<MonoTime>,
    pub llc: Option<MonoTime>,
    pub mod_start: Option<MonoTime>,
    pub mod_end: Option<MonoTime>,
}

/// A packet received from the network, on its way to the radio
#[derive(Debug, Default)]
pub struct NetPacket {
    pub base: Packet,

    /// MCS to use, as an index into the PHY's MCS table
    pub mcsidx: McsIdx,

    /// Multiplicative TX gain
    pub g: f32,

    /// Deadline after which the packet may be dropped
    pub deadline: Option<MonoTime>,

    /// Number of retransmissions
    pub nretrans: u32,

    /// Pipeline timestamps
    pub timestamps: PacketTimestamps,

    /// Time the packet actually went over the air
    pub tx_timestamp: Option<MonoTime>,
}

impl NetPacket {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            base: Packet::with_capacity(n),
            g: 1.0,
            ..Default::default()
        }
    }

    pub fn deadline_passed(&self, now: MonoTime) -> bool {
        matches!(self.deadline, Some(d) if d < now)
    }

    /// True if this packet should be dropped. SYN packets are never dropped,
    /// since they establish connection state at the receiver.
    pub fn should_drop(&self, now: MonoTime) -> bool {
        !self.hdr.flags.syn && self.deadline_passed(now)
    }
}

impl Deref for NetPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.base
    }
}

impl DerefMut for NetPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        &mut self.base
    }
}

/// A packet demodulated from the radio
#[derive(Debug, Default)]
pub struct RadioPacket {
    pub base: Packet,

    /// Error vector magnitude [dB]
    pub evm: f32,

    /// Received signal strength indicator [dB]
    pub rssi: f32,

    /// Carrier frequency offset (f/Fs)
    pub cfo: f32,

    /// Channel the packet was received on
    pub channel: Channel,

    /// Channel index the packet was received on
    pub chanidx: usize,

    /// Timestamp of the RX slot the packet began in
    pub slot_timestamp: MonoTime,

    /// Sample offset of the start of the packet relative to the slot
    pub start_samples: i64,

    /// Sample offset of the end of the packet relative to the slot
    pub end_samples: i64,
}

impl RadioPacket {
    pub fn new(hdr: Header, payload: Vec<u8>) -> Self {
        Self {
            base: Packet::from_payload(hdr, payload),
            ..Default::default()
        }
    }
}

impl Deref for RadioPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.base
    }
}

impl DerefMut for RadioPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_packet(data: &[u8]) -> Packet {
        let mut pkt = Packet::with_capacity(EHDR_SIZE + data.len());

        pkt.set_ehdr(ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(7),
            data_len: data.len() as u16,
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(data);
        pkt
    }

    #[test]
    fn test_control_sizes() {
        assert_eq!(ControlTag::Hello.size(), 2);
        assert_eq!(ControlTag::Timestamp.size(), 17);
        assert_eq!(ControlTag::TimestampEcho.size(), 34);
        assert_eq!(ControlTag::ReceiverStats.size(), 17);
        assert_eq!(ControlTag::Nak.size(), 3);
        assert_eq!(ControlTag::SelectiveAck.size(), 5);
        assert_eq!(ControlTag::SetUnack.size(), 3);
    }

    #[test]
    fn test_framing_roundtrip() {
        let data = b"hello, radio";
        let mut pkt = mk_packet(data);

        let msgs = [
            ControlMsg::Hello { is_gateway: true },
            ControlMsg::Timestamp { t_sent: MonoTime(12.5) },
            ControlMsg::TimestampEcho {
                node: 3,
                t_sent: MonoTime(1.25),
                t_recv: MonoTime(2.75),
            },
            ControlMsg::ReceiverStats {
                long_evm: -22.5,
                long_rssi: -55.0,
            },
            ControlMsg::Nak(Seq(100)),
            ControlMsg::SelectiveAck {
                begin: Seq(5),
                end: Seq(9),
            },
            ControlMsg::SetUnack { unack: Seq(11) },
        ];

        for msg in &msgs {
            pkt.append_control(msg);
        }

        assert!(pkt.integrity_intact());
        assert_eq!(pkt.data(), data);
        assert_eq!(pkt.ehdr().src, 1);
        assert_eq!(pkt.ehdr().dest, 2);

        let parsed: Vec<ControlMsg> = pkt.control_iter().collect();
        assert_eq!(parsed, msgs);
    }

    #[test]
    fn test_integrity_no_control() {
        let pkt = mk_packet(b"abc");

        assert!(pkt.integrity_intact());

        let mut bad = mk_packet(b"abc");
        bad.payload.push(0);
        assert!(!bad.integrity_intact());
    }

    #[test]
    fn test_integrity_control_length_mismatch() {
        let mut pkt = mk_packet(b"abc");

        pkt.append_control(&ControlMsg::Nak(Seq(1)));
        assert!(pkt.integrity_intact());

        // Corrupt the control length
        pkt.payload.pop();
        assert!(!pkt.integrity_intact());
    }

    #[test]
    fn test_remove_last_control() {
        let mut pkt = mk_packet(b"xy");

        pkt.append_control(&ControlMsg::Nak(Seq(1)));
        pkt.append_control(&ControlMsg::SetUnack { unack: Seq(2) });
        pkt.remove_last_control(ControlTag::SetUnack);

        let parsed: Vec<ControlMsg> = pkt.control_iter().collect();
        assert_eq!(parsed, vec![ControlMsg::Nak(Seq(1))]);
        assert!(pkt.integrity_intact());

        pkt.remove_last_control(ControlTag::Nak);
        assert!(!pkt.hdr.flags.has_control);
        assert!(pkt.integrity_intact());
    }

    #[test]
    fn test_should_drop_spares_syn() {
        let mut pkt = NetPacket::with_capacity(EHDR_SIZE);

        pkt.deadline = Some(MonoTime(1.0));
        assert!(pkt.should_drop(MonoTime(2.0)));
        assert!(!pkt.should_drop(MonoTime(0.5)));

        pkt.hdr.flags.syn = true;
        assert!(!pkt.should_drop(MonoTime(2.0)));
    }
}
