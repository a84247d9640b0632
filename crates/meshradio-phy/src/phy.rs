use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::{Channel, McsIdx, MonoTime, NetPacket, RadioPacket};

use crate::slot::ModPacket;

/// A modulation-and-coding scheme
#[derive(Clone, Debug, PartialEq)]
pub struct Mcs {
    pub name: &'static str,
    /// Spectral efficiency: payload bits per complex sample
    pub rate: f64,
}

/// Soft TX gain applied to a modulated signal.
///
/// Gain is stored in dB as f32 bits so readers on the modulation path never
/// take a lock.
#[derive(Debug)]
pub struct AutoGain {
    g_db_bits: AtomicU32,
}

impl AutoGain {
    pub fn new(g_db: f32) -> Self {
        Self {
            g_db_bits: AtomicU32::new(g_db.to_bits()),
        }
    }

    pub fn soft_tx_gain_db(&self) -> f32 {
        f32::from_bits(self.g_db_bits.load(Ordering::Acquire))
    }

    pub fn set_soft_tx_gain_db(&self, g_db: f32) {
        self.g_db_bits.store(g_db.to_bits(), Ordering::Release);
    }

    /// The multiplicative gain
    pub fn soft_tx_gain(&self) -> f32 {
        10f32.powf(self.soft_tx_gain_db() / 20.0)
    }
}

impl Default for AutoGain {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// One entry of a PHY's MCS table
#[derive(Debug)]
pub struct McsEntry {
    pub mcs: Mcs,
    pub autogain: AutoGain,
}

/// Modulates network packets into baseband IQ samples
pub trait PacketModulator: Send {
    /// Modulate a packet at the given soft gain, filling in the modulated
    /// packet's samples
    fn modulate(&mut self, pkt: Box<NetPacket>, g: f32, mpkt: &mut ModPacket);
}

/// Callback invoked for every packet a demodulator produces
pub type DemodCallback = Box<dyn FnMut(RadioPacket) + Send>;

/// Demodulates baseband IQ samples into radio packets
pub trait PacketDemodulator: Send {
    /// Reset demodulation state for a new channel/slot
    fn reset(&mut self, channel: Channel);

    /// Establish the time base for subsequent samples: the slot timestamp,
    /// the snapshot offset, the offset of the next sample relative to the
    /// slot start, the channelizer's filter delay, and the channel and RX
    /// sample rates.
    fn timestamp(
        &mut self,
        t: MonoTime,
        snapshot_off: Option<i64>,
        offset: usize,
        delay: usize,
        rate: f64,
        rx_rate: f64,
    );

    /// Feed samples at the channel rate to the demodulator
    fn demodulate(&mut self, samples: &[ComplexSample]);

    /// Install the packet callback
    fn set_callback(&mut self, callback: DemodCallback);
}

/// The physical-layer plug-in contract.
///
/// The PHY's internal framing, FEC, and modulation are opaque; the stack
/// interacts with it only through this interface.
pub trait Phy: Send + Sync {
    /// The MCS table `NetPacket::mcsidx` indexes
    fn mcs_table(&self) -> &[McsEntry];

    /// Minimum RX oversample factor required by the PHY
    fn min_rx_rate_oversample(&self) -> u32;

    /// Minimum TX oversample factor required by the PHY
    fn min_tx_rate_oversample(&self) -> u32;

    /// Size of a modulated payload in samples, for rate planning
    fn modulated_size(&self, mcsidx: McsIdx, payload_len: usize) -> usize;

    fn make_modulator(&self) -> Box<dyn PacketModulator>;

    fn make_demodulator(&self) -> Box<dyn PacketDemodulator>;
}

/// A logical channel paired with the PHY instance that runs on it
#[derive(Clone)]
pub struct PhyChannel {
    pub channel: Channel,
    pub phy: Arc<dyn Phy>,
    /// Per-MCS EVM thresholds for admission of received packets
    pub evm_thresholds: Arc<Vec<Option<f32>>>,
}

impl PhyChannel {
    pub fn new(channel: Channel, phy: Arc<dyn Phy>) -> Self {
        let nmcs = phy.mcs_table().len();

        Self {
            channel,
            phy,
            evm_thresholds: Arc::new(vec![None; nmcs]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autogain_conversion() {
        let gain = AutoGain::new(0.0);

        assert!((gain.soft_tx_gain() - 1.0).abs() < 1e-6);

        gain.set_soft_tx_gain_db(-20.0);
        assert!((gain.soft_tx_gain() - 0.1).abs() < 1e-6);

        gain.set_soft_tx_gain_db(6.0);
        assert!((gain.soft_tx_gain() - 1.9953).abs() < 1e-3);
    }
}
