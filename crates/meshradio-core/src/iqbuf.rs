use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::clock::MonoTime;
use crate::dsp_types::ComplexSample;

/// A buffer of IQ samples shared between one producer and many consumers.
///
/// The radio RX worker fills the buffer while demodulator threads read it
/// concurrently. The protocol: the producer writes sample data strictly below
/// the new fill level before publishing that level with a release store to
/// `nsamples`; consumers may read any sample below the level observed by an
/// acquire load. Once `complete` is set no further writes occur.
///
/// TX-side buffers are filled before they are shared and are simply complete
/// from construction.
pub struct IQBuf {
    buf: UnsafeCell<Vec<ComplexSample>>,

    /// Number of samples filled so far. Valid until `complete` is set.
    pub nsamples: AtomicUsize,

    /// True once the producer has finished filling the buffer.
    pub complete: AtomicBool,

    /// Timestamp of the first sample, as f64 bits. `u64::MAX` means unset.
    timestamp_bits: AtomicU64,

    /// Samples missed at the beginning relative to the requested RX start
    pub undersample: AtomicUsize,

    /// Samples missed at the end relative to the requested RX end
    pub oversample: AtomicUsize,

    /// Sequence number of the RX period this buffer belongs to
    pub seq: u64,

    /// Sample center frequency (Hz)
    pub fc: f64,

    /// Sample rate (Hz)
    pub fs: f64,

    /// Leading samples to skip
    pub delay: usize,

    /// Offset from the beginning of the current snapshot
    pub snapshot_off: Option<i64>,
}

// Safe by the producer/consumer protocol documented on the type: sample
// writes happen-before the consumer's acquire load of `nsamples`.
unsafe impl Send for IQBuf {}
unsafe impl Sync for IQBuf {}

const TIMESTAMP_UNSET: u64 = u64::MAX;

impl IQBuf {
    /// Allocate a zeroed buffer of `n` samples, ready for a producer to fill
    pub fn new(n: usize) -> Self {
        Self {
            buf: UnsafeCell::new(vec![ComplexSample::new(0.0, 0.0); n]),
            nsamples: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            timestamp_bits: AtomicU64::new(TIMESTAMP_UNSET),
            undersample: AtomicUsize::new(0),
            oversample: AtomicUsize::new(0),
            seq: 0,
            fc: 0.0,
            fs: 0.0,
            delay: 0,
            snapshot_off: None,
        }
    }

    /// Wrap an already-filled sample vector; the buffer is complete
    pub fn from_samples(samples: Vec<ComplexSample>) -> Self {
        let n = samples.len();
        let buf = Self::new(0);

        unsafe { *buf.buf.get() = samples };
        buf.nsamples.store(n, Ordering::Release);
        buf.complete.store(true, Ordering::Release);

        buf
    }

    /// Capacity of the buffer in samples
    pub fn len(&self) -> usize {
        unsafe { (*self.buf.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer: write samples at `off` and publish the new fill level.
    ///
    /// `off` must equal the current fill level; only the single producer may
    /// call this.
    pub fn fill(&self, off: usize, samples: &[ComplexSample]) {
        debug_assert_eq!(off, self.nsamples.load(Ordering::Relaxed));

        unsafe {
            let buf = &mut *self.buf.get();
            buf[off..off + samples.len()].copy_from_slice(samples);
        }

        self.nsamples.store(off + samples.len(), Ordering::Release);
    }

    /// Producer: mark the buffer complete. No writes may follow.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Consumer: the currently-published samples
    pub fn filled(&self) -> &[ComplexSample] {
        let n = self.nsamples.load(Ordering::Acquire);

        unsafe { &(&*self.buf.get())[..n] }
    }

    /// All samples in the buffer. Only meaningful once the buffer is
    /// complete, or on TX buffers which are filled before sharing.
    pub fn as_slice(&self) -> &[ComplexSample] {
        unsafe { &*self.buf.get() }
    }

    /// Mutable access for a uniquely-owned buffer (TX synthesis path)
    pub fn as_mut_slice(&mut self) -> &mut [ComplexSample] {
        self.buf.get_mut()
    }

    /// Resize a uniquely-owned buffer
    pub fn resize(&mut self, n: usize) {
        self.buf.get_mut().resize(n, ComplexSample::new(0.0, 0.0));
        *self.nsamples.get_mut() = n;
    }

    /// Zero a uniquely-owned buffer
    pub fn zero(&mut self) {
        self.buf.get_mut().fill(ComplexSample::new(0.0, 0.0));
    }

    pub fn set_timestamp(&self, t: MonoTime) {
        self.timestamp_bits.store(t.secs().to_bits(), Ordering::Release);
    }

    pub fn timestamp(&self) -> Option<MonoTime> {
        match self.timestamp_bits.load(Ordering::Acquire) {
            TIMESTAMP_UNSET => None,
            bits => Some(MonoTime(f64::from_bits(bits))),
        }
    }

    /// Spin until the producer has published at least one sample or marked
    /// the buffer complete.
    pub fn wait_to_start_filling(&self) {
        while self.nsamples.load(Ordering::Acquire) == 0 && !self.is_complete() {
            std::hint::spin_loop();
        }
    }

    /// Compute peak and average power over the samples past `delay`
    pub fn power(&self) -> (f32, f32) {
        let samples = self.as_slice();
        let mut peak = 0.0f32;
        let mut avg = 0.0f32;

        for x in &samples[self.delay.min(samples.len())..] {
            let norm = x.norm_sqr();

            if norm > peak {
                peak = norm;
            }
            avg += norm;
        }

        if !samples.is_empty() {
            avg /= samples.len() as f32;
        }

        (peak, avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fill_publishes_samples() {
        let buf = IQBuf::new(16);

        assert_eq!(buf.filled().len(), 0);

        buf.fill(0, &[ComplexSample::new(1.0, 0.0); 4]);
        assert_eq!(buf.filled().len(), 4);

        buf.fill(4, &[ComplexSample::new(0.0, 1.0); 4]);
        assert_eq!(buf.filled().len(), 8);
        assert_eq!(buf.filled()[0], ComplexSample::new(1.0, 0.0));
        assert_eq!(buf.filled()[4], ComplexSample::new(0.0, 1.0));

        assert!(!buf.is_complete());
        buf.mark_complete();
        assert!(buf.is_complete());
    }

    #[test]
    fn test_concurrent_fill_and_read() {
        let buf = Arc::new(IQBuf::new(4096));
        let producer = Arc::clone(&buf);

        let t = std::thread::spawn(move || {
            let chunk = [ComplexSample::new(0.5, -0.5); 64];

            for i in 0..64 {
                producer.fill(i * 64, &chunk);
            }
            producer.mark_complete();
        });

        // Reader polls nsamples/complete the way a demod thread does
        let mut seen = 0;
        loop {
            let complete = buf.is_complete();
            let filled = buf.filled();

            for x in &filled[seen..] {
                assert_eq!(*x, ComplexSample::new(0.5, -0.5));
            }
            seen = filled.len();

            if complete && seen == 4096 {
                break;
            }
        }

        t.join().unwrap();
    }

    #[test]
    fn test_timestamp_set_and_read() {
        let buf = IQBuf::new(1);

        assert!(buf.timestamp().is_none());
        buf.set_timestamp(MonoTime(12.25));
        assert_eq!(buf.timestamp(), Some(MonoTime(12.25)));
    }

    #[test]
    fn test_from_samples_is_complete() {
        let buf = IQBuf::from_samples(vec![ComplexSample::new(1.0, 2.0); 8]);

        assert!(buf.is_complete());
        assert_eq!(buf.filled().len(), 8);
    }
}
