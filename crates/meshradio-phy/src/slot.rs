use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::{Channel, IQBuf, MonoTime, NetPacket, WallTime};

/// A modulated packet, placed at a packet-accurate sample offset within a
/// transmission slot.
#[derive(Default)]
pub struct ModPacket {
    /// Index of the channel the packet is modulated onto
    pub chanidx: usize,

    /// The channel the packet is modulated onto
    pub channel: Channel,

    /// Sample offset of the packet from the start of the slot, at the TX
    /// rate
    pub start: usize,

    /// Sample offset of the packet within its IQ buffer
    pub offset: usize,

    /// Number of samples occupied at the TX rate
    pub nsamples: usize,

    /// The modulated samples at the channel rate. Taken by the upsampler
    /// once the packet is committed to a slot.
    pub samples: Option<IQBuf>,

    /// The packet whose signal this is
    pub pkt: Option<Box<NetPacket>>,
}

/// Mutable state of a TX slot, guarded by the slot's mutex
#[derive(Default)]
pub struct SlotInner {
    /// Sample budget of the slot. Raised to `full_slot_samples` when the
    /// schedule permits overfilling.
    pub max_samples: usize,

    /// The shared frequency-domain buffer synthesizer workers accumulate
    /// into
    pub fdbuf: Option<Vec<ComplexSample>>,

    /// Leading samples of the slot already committed by the previous slot
    pub delay: usize,

    /// Valid time-domain samples represented by the frequency-domain buffer
    pub nsamples: usize,

    /// Valid frequency-domain samples; always a whole number of FFT blocks
    pub fdnsamples: usize,

    /// Samples of the final partial FFT block included in `nsamples`
    pub npartial: usize,

    /// The packets modulated into this slot
    pub mpkts: Vec<ModPacket>,

    /// The finalized time-domain signal
    pub iqbufs: Vec<Arc<IQBuf>>,
}

/// A transmission slot being synthesized.
///
/// Shared by the synthesizer worker threads; `nfinished` provides the
/// termination barrier, and the worker that brings it to the thread count
/// finalizes the slot's time-domain buffer.
pub struct Slot {
    /// Index of the slot in the schedule
    pub slotidx: usize,

    /// Wall-clock time at which the slot must go to air
    pub deadline: WallTime,

    /// Number of usable samples in the slot, guard excluded
    pub usable_samples: usize,

    /// Number of samples in the whole slot, guard included
    pub full_slot_samples: usize,

    /// Set once the MAC has claimed the slot; no further modulation may be
    /// committed
    pub closed: AtomicBool,

    /// Number of synthesizer workers finished with the slot
    pub nfinished: AtomicUsize,

    inner: Mutex<SlotInner>,
}

impl Slot {
    pub fn new(slotidx: usize, deadline: WallTime, max_samples: usize, full_slot_samples: usize) -> Self {
        Self {
            slotidx,
            deadline,
            usable_samples: max_samples,
            full_slot_samples,
            closed: AtomicBool::new(false),
            nfinished: AtomicUsize::new(0),
            inner: Mutex::new(SlotInner {
                max_samples,
                ..Default::default()
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// The result of transmitting (or attempting to transmit) a slot
#[derive(Default)]
pub struct TXRecord {
    /// Time the burst actually went to air
    pub timestamp: Option<MonoTime>,

    /// Leading samples of the slot's buffer that were skipped
    pub delay: usize,

    /// Number of samples transmitted
    pub nsamples: usize,

    /// The packets carried by the burst
    pub mpkts: Vec<ModPacket>,

    /// The transmitted IQ buffers
    pub iqbufs: Vec<Arc<IQBuf>>,
}

/// A finalized slot handed from the synthesizer to the MAC
pub struct TXSlot {
    pub txrecord: TXRecord,

    /// The slot's intended wall-clock transmission time
    pub deadline: WallTime,

    /// Samples committed past the usable (guard-less) portion of the slot;
    /// negative when the slot is underfilled
    pub nexcess: isize,

    /// True if modulation continues into the next slot, keeping the TX
    /// burst open
    pub continued: bool,
}

impl TXSlot {
    pub fn empty(deadline: WallTime) -> Self {
        Self {
            txrecord: TXRecord::default(),
            deadline,
            nexcess: 0,
            continued: false,
        }
    }
}
