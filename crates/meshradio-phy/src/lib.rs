//! Physical-layer machinery for the meshradio stack
//!
//! The PHY plug-in contract, the frequency-domain resampling DSP, the
//! multichannel slot synthesizer, the channelizer and parallel packet
//! demodulator, IQ sample compression, and the snapshot collector.

pub mod channelizer;
pub mod demodulator;
pub mod dsp;
pub mod iqcodec;
pub mod phy;
pub mod radio_queue;
pub mod raw;
pub mod slot;
pub mod snapshot;
pub mod sync;
pub mod synthesizer;

pub use channelizer::Channelizer;
pub use demodulator::ParallelDemodulator;
pub use phy::{McsEntry, PacketDemodulator, PacketModulator, Phy, PhyChannel};
pub use slot::{ModPacket, Slot, TXRecord, TXSlot};
pub use synthesizer::MultichannelSynthesizer;
