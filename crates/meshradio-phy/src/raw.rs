use std::collections::VecDeque;

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::header::HDR_SIZE;
use meshradio_core::{Channel, Header, IQBuf, McsIdx, MonoTime, NetPacket, RadioPacket};

use crate::phy::{AutoGain, DemodCallback, Mcs, McsEntry, PacketDemodulator, PacketModulator, Phy};
use crate::slot::ModPacket;

/// Preamble sample signs, sent at full amplitude ahead of every frame
const PREAMBLE: [f32; 16] = [
    1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, 1.0,
];

/// Frame overhead in bytes: header, header check, length, payload check
const FRAME_OVERHEAD: usize = HDR_SIZE + 1 + 2 + 1;

/// Refuse to collect frames longer than this; a bogus length field means we
/// locked onto something that was not a preamble
const MAX_FRAME_LEN: usize = 16384;

/// A byte-mapped reference PHY.
///
/// Each payload byte becomes one complex sample; a fixed-amplitude preamble
/// provides frame sync and a gain reference. This PHY exists so the stack
/// can be exercised end-to-end in-process; production PHYs implement the
/// same traits.
pub struct RawPhy {
    mcs_table: Vec<McsEntry>,
}

impl RawPhy {
    pub fn new() -> Self {
        Self {
            mcs_table: vec![McsEntry {
                mcs: Mcs {
                    name: "raw8",
                    rate: 8.0,
                },
                autogain: AutoGain::default(),
            }],
        }
    }
}

impl Default for RawPhy {
    fn default() -> Self {
        Self::new()
    }
}

impl Phy for RawPhy {
    fn mcs_table(&self) -> &[McsEntry] {
        &self.mcs_table
    }

    fn min_rx_rate_oversample(&self) -> u32 {
        1
    }

    fn min_tx_rate_oversample(&self) -> u32 {
        1
    }

    fn modulated_size(&self, _mcsidx: McsIdx, payload_len: usize) -> usize {
        PREAMBLE.len() + FRAME_OVERHEAD + payload_len
    }

    fn make_modulator(&self) -> Box<dyn PacketModulator> {
        Box::new(RawModulator)
    }

    fn make_demodulator(&self) -> Box<dyn PacketDemodulator> {
        Box::new(RawDemodulator::new())
    }
}

fn byte_to_sample(b: u8) -> ComplexSample {
    ComplexSample::new((b as f32 + 0.5) / 256.0 - 0.5, 0.0)
}

fn sample_to_byte(re: f32) -> u8 {
    ((re + 0.5) * 256.0).floor().clamp(0.0, 255.0) as u8
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

struct RawModulator;

impl PacketModulator for RawModulator {
    fn modulate(&mut self, pkt: Box<NetPacket>, g: f32, mpkt: &mut ModPacket) {
        let hdr_bytes = pkt.hdr.to_bytes();
        let payload = &pkt.payload;

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());

        frame.extend_from_slice(&hdr_bytes);
        frame.push(checksum(&hdr_bytes));
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.push(checksum(payload));

        let mut samples = Vec::with_capacity(PREAMBLE.len() + frame.len());

        samples.extend(PREAMBLE.iter().map(|&p| ComplexSample::new(p * g, 0.0)));
        samples.extend(frame.iter().map(|&b| byte_to_sample(b) * g));

        mpkt.samples = Some(IQBuf::from_samples(samples));
        mpkt.pkt = Some(pkt);
    }
}

enum DemodPhase {
    /// Hunting for a preamble
    Search,
    /// Collecting frame bytes
    Collect,
}

struct RawDemodulator {
    channel: Channel,
    callback: Option<DemodCallback>,

    phase: DemodPhase,
    window: VecDeque<f32>,
    gain: f32,
    frame: Vec<u8>,

    /// Time base, established per slot via `timestamp`
    slot_timestamp: MonoTime,
    snapshot_off: Option<i64>,
    offset: usize,
    delay: usize,
    rate: f64,
    rx_rate: f64,

    /// Channel-rate samples consumed since the last `timestamp` call
    sample_idx: i64,

    /// Time base latched when the current frame's preamble was detected
    frame_start_idx: i64,
    frame_slot_timestamp: MonoTime,
    frame_base: i64,
}

impl RawDemodulator {
    fn new() -> Self {
        Self {
            channel: Channel::default(),
            callback: None,
            phase: DemodPhase::Search,
            window: VecDeque::with_capacity(PREAMBLE.len()),
            gain: 1.0,
            frame: Vec::new(),
            slot_timestamp: MonoTime::default(),
            snapshot_off: None,
            offset: 0,
            delay: 0,
            rate: 1.0,
            rx_rate: 1.0,
            sample_idx: 0,
            frame_start_idx: 0,
            frame_slot_timestamp: MonoTime::default(),
            frame_base: 0,
        }
    }

    /// RX-rate sample offset, relative to the slot start, of channel-rate
    /// sample `idx`
    fn rx_offset(&self, idx: i64) -> i64 {
        self.frame_base + (idx as f64 * self.rx_rate / self.rate).round() as i64
    }

    fn try_detect_preamble(&mut self) -> bool {
        if self.window.len() < PREAMBLE.len() {
            return false;
        }

        let mut amp_min = f32::MAX;
        let mut amp_max = 0.0f32;

        for (re, want) in self.window.iter().zip(PREAMBLE.iter()) {
            if re.signum() != want.signum() {
                return false;
            }

            amp_min = amp_min.min(re.abs());
            amp_max = amp_max.max(re.abs());
        }

        if amp_min < 0.05 || amp_min < 0.6 * amp_max {
            return false;
        }

        self.gain = self.window.iter().map(|re| re.abs()).sum::<f32>() / PREAMBLE.len() as f32;
        true
    }

    fn finish_frame(&mut self) {
        let frame = std::mem::take(&mut self.frame);

        let hdr_bytes: [u8; HDR_SIZE] = frame[..HDR_SIZE].try_into().unwrap();

        if checksum(&hdr_bytes) != frame[HDR_SIZE] {
            // Invalid header: drop silently and resync
            tracing::trace!("dropping frame with invalid header");
            return;
        }

        let payload_len = frame.len() - FRAME_OVERHEAD;
        let payload = frame[HDR_SIZE + 3..HDR_SIZE + 3 + payload_len].to_vec();
        let payload_ok = checksum(&payload) == frame[frame.len() - 1];

        let hdr = Header::from_bytes(&hdr_bytes);
        let mut pkt = RadioPacket::new(hdr, payload);

        pkt.base.internal_flags.has_seq = hdr.flags.has_seq;
        pkt.base.internal_flags.invalid_payload = !payload_ok || !pkt.integrity_intact();
        pkt.base.timestamp = self.frame_slot_timestamp;
        pkt.channel = self.channel;
        pkt.slot_timestamp = self.frame_slot_timestamp;
        pkt.start_samples = self.rx_offset(self.frame_start_idx);
        pkt.end_samples = self.rx_offset(self.sample_idx + 1);
        pkt.evm = -60.0;
        pkt.rssi = 20.0 * self.gain.max(1e-9).log10();
        pkt.cfo = 0.0;

        if let Some(callback) = self.callback.as_mut() {
            callback(pkt);
        }
    }
}

impl PacketDemodulator for RawDemodulator {
    fn reset(&mut self, channel: Channel) {
        self.channel = channel;
        self.phase = DemodPhase::Search;
        self.window.clear();
        self.frame.clear();
        self.sample_idx = 0;
    }

    fn timestamp(
        &mut self,
        t: MonoTime,
        snapshot_off: Option<i64>,
        offset: usize,
        delay: usize,
        rate: f64,
        rx_rate: f64,
    ) {
        self.slot_timestamp = t;
        self.snapshot_off = snapshot_off;
        self.offset = offset;
        self.delay = delay;
        self.rate = rate;
        self.rx_rate = rx_rate;
        self.sample_idx = 0;
    }

    fn demodulate(&mut self, samples: &[ComplexSample]) {
        for sample in samples {
            match self.phase {
                DemodPhase::Search => {
                    if self.window.len() == PREAMBLE.len() {
                        self.window.pop_front();
                    }
                    self.window.push_back(sample.re);

                    if self.try_detect_preamble() {
                        self.phase = DemodPhase::Collect;
                        self.frame.clear();
                        self.window.clear();

                        // Latch the frame's time base at the preamble
                        self.frame_start_idx = self.sample_idx + 1 - PREAMBLE.len() as i64;
                        self.frame_slot_timestamp = self.slot_timestamp;
                        self.frame_base = self.offset as i64 - self.delay as i64;
                    }
                }
                DemodPhase::Collect => {
                    self.frame.push(sample_to_byte(sample.re / self.gain));

                    if self.frame.len() >= HDR_SIZE + 3 {
                        let len_bytes = [self.frame[HDR_SIZE + 1], self.frame[HDR_SIZE + 2]];
                        let payload_len = u16::from_le_bytes(len_bytes) as usize;

                        if payload_len > MAX_FRAME_LEN {
                            // A length like this means we locked onto noise
                            self.phase = DemodPhase::Search;
                            self.frame.clear();
                        } else if self.frame.len() == FRAME_OVERHEAD + payload_len {
                            self.finish_frame();
                            self.phase = DemodPhase::Search;
                        }
                    }
                }
            }

            self.sample_idx += 1;
        }
    }

    fn set_callback(&mut self, callback: DemodCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_core::header::EHDR_SIZE;
    use meshradio_core::{ExtendedHeader, Seq};
    use std::sync::{Arc, Mutex};

    fn mk_netpacket(data: &[u8]) -> Box<NetPacket> {
        let mut pkt = NetPacket::with_capacity(EHDR_SIZE + data.len());

        pkt.hdr = Header {
            curhop: 1,
            nexthop: 2,
            seq: Seq(42),
            ..Default::default()
        };
        pkt.set_ehdr(ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(0),
            data_len: data.len() as u16,
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(data);
        Box::new(pkt)
    }

    fn demod_all(phy: &RawPhy, samples: &[ComplexSample]) -> Vec<RadioPacket> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        let mut demod = phy.make_demodulator();

        demod.set_callback(Box::new(move |pkt| {
            received2.lock().unwrap().push(pkt);
        }));
        demod.reset(Channel::default());
        demod.timestamp(MonoTime(1.0), None, 0, 0, 1.0, 1.0);
        demod.demodulate(samples);

        Arc::try_unwrap(received).unwrap().into_inner().unwrap()
    }

    #[test]
    fn test_modulate_demodulate_roundtrip() {
        let phy = RawPhy::new();
        let pkt = mk_netpacket(b"hello over the air");
        let payload = pkt.payload.clone();

        let mut mpkt = ModPacket::default();
        phy.make_modulator().modulate(pkt, 1.0, &mut mpkt);

        let samples = mpkt.samples.as_ref().unwrap().as_slice().to_vec();
        assert_eq!(samples.len(), phy.modulated_size(0, payload.len()));

        let received = demod_all(&phy, &samples);
        assert_eq!(received.len(), 1);

        let rx = &received[0];
        assert_eq!(rx.hdr.curhop, 1);
        assert_eq!(rx.hdr.nexthop, 2);
        assert_eq!(rx.hdr.seq, Seq(42));
        assert_eq!(rx.payload, payload);
        assert!(!rx.internal_flags.invalid_payload);
        assert!(rx.integrity_intact());
        assert_eq!(rx.ehdr().data_len as usize, payload.len() - EHDR_SIZE);
    }

    #[test]
    fn test_gain_invariance() {
        let phy = RawPhy::new();
        let pkt = mk_netpacket(b"gain test");
        let payload = pkt.payload.clone();

        let mut mpkt = ModPacket::default();
        phy.make_modulator().modulate(pkt, 0.25, &mut mpkt);

        let samples = mpkt.samples.as_ref().unwrap().as_slice().to_vec();
        let received = demod_all(&phy, &samples);

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, payload);
    }

    #[test]
    fn test_corrupt_payload_flagged() {
        let phy = RawPhy::new();
        let pkt = mk_netpacket(b"corrupt me");

        let mut mpkt = ModPacket::default();
        phy.make_modulator().modulate(pkt, 1.0, &mut mpkt);

        let mut samples = mpkt.samples.as_ref().unwrap().as_slice().to_vec();

        // Flip a payload sample far enough to change its byte
        let idx = PREAMBLE.len() + FRAME_OVERHEAD + 2;
        samples[idx].re += 0.1;

        let received = demod_all(&phy, &samples);
        assert_eq!(received.len(), 1);
        assert!(received[0].internal_flags.invalid_payload);
    }

    #[test]
    fn test_frame_offsets() {
        let phy = RawPhy::new();
        let pkt = mk_netpacket(b"where am i");
        let total = phy.modulated_size(0, pkt.payload.len());

        let mut mpkt = ModPacket::default();
        phy.make_modulator().modulate(pkt, 1.0, &mut mpkt);

        // Pad with leading silence
        let mut samples = vec![ComplexSample::new(0.0, 0.0); 100];
        samples.extend_from_slice(mpkt.samples.as_ref().unwrap().as_slice());

        let received = demod_all(&phy, &samples);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].start_samples, 100);
        assert_eq!(received[0].end_samples, 100 + total as i64);
    }

    #[test]
    fn test_back_to_back_frames() {
        let phy = RawPhy::new();
        let mut samples = Vec::new();

        for n in 0..3u8 {
            let mut pkt = mk_netpacket(&[n; 8]);
            pkt.hdr.seq = Seq(n as u16);

            let mut mpkt = ModPacket::default();
            phy.make_modulator().modulate(pkt, 1.0, &mut mpkt);
            samples.extend_from_slice(mpkt.samples.as_ref().unwrap().as_slice());
        }

        let received = demod_all(&phy, &samples);
        assert_eq!(received.len(), 3);

        for (n, rx) in received.iter().enumerate() {
            assert_eq!(rx.hdr.seq, Seq(n as u16));
        }
    }
}
