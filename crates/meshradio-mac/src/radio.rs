use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::{IQBuf, MonoClock, MonoTime};

/// The radio driver seam.
///
/// The driver yields timestamped RX sample bursts and accepts timestamped TX
/// bursts; hardware drivers are external collaborators implementing this
/// trait.
pub trait Radio: Send + Sync {
    fn set_rx_rate(&self, rate: f64) -> f64;
    fn set_tx_rate(&self, rate: f64) -> f64;
    fn rx_rate(&self) -> f64;
    fn tx_rate(&self) -> f64;

    fn rx_frequency(&self) -> f64;
    fn tx_frequency(&self) -> f64;

    fn start_rx_stream(&self, t: MonoTime);
    fn stop_rx_stream(&self);

    /// Read `nsamples` starting at time `t` into `buf`, filling it
    /// incrementally and marking it complete. Returns false on a
    /// non-timeout RX error.
    fn burst_rx(&self, t: MonoTime, nsamples: usize, buf: &IQBuf) -> bool;

    /// Recommended buffer size for a burst of `nsamples`
    fn recommended_burst_rx_size(&self, nsamples: usize) -> usize {
        nsamples
    }

    /// Transmit the buffers starting at time `t`. `start_of_burst` opens a
    /// new burst; `end_of_burst` closes it. Each buffer's leading `delay`
    /// samples are skipped.
    fn burst_tx(&self, t: MonoTime, start_of_burst: bool, end_of_burst: bool, bufs: &[Arc<IQBuf>]);

    fn stop_tx_burst(&self);
    fn in_tx_burst(&self) -> bool;

    fn tx_underflow_count(&self) -> u64;
    fn tx_late_count(&self) -> u64;

    /// The radio's hardware clock, for drivers whose clock resets on rate
    /// changes
    fn clock(&self) -> f64 {
        0.0
    }

    fn set_clock(&self, _t: f64) {}
}

/// Saves the radio's hardware clock and restores it when dropped.
///
/// Some radios reset their clock on rate changes; scope rate-change calls
/// inside this guard.
pub struct MasterClockGuard<'a> {
    radio: &'a dyn Radio,
    saved: f64,
}

impl<'a> MasterClockGuard<'a> {
    pub fn new(radio: &'a dyn Radio) -> Self {
        Self {
            radio,
            saved: radio.clock(),
        }
    }
}

impl Drop for MasterClockGuard<'_> {
    fn drop(&mut self) {
        self.radio.set_clock(self.saved);
    }
}

/// A transmission scheduled on the loopback medium
struct TxEntry {
    start_sample: i64,
    samples: Vec<ComplexSample>,
}

struct LoopState {
    rates: (f64, f64),
    tx_ledger: Vec<TxEntry>,
    streaming: bool,
}

/// An in-process radio: TX bursts appear in the RX stream of the same
/// medium, sample-accurately, paced against the monotonic clock.
///
/// Several nodes may share one medium by sharing the `LoopbackRadio`, or a
/// node may simply hear itself.
pub struct LoopbackRadio {
    state: Mutex<LoopState>,
    in_burst: AtomicBool,
    tx_late: AtomicU64,
    tx_underflow: AtomicU64,
    clock_offset: Mutex<f64>,
}

impl LoopbackRadio {
    pub fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(LoopState {
                rates: (rate, rate),
                tx_ledger: Vec::new(),
                streaming: false,
            }),
            in_burst: AtomicBool::new(false),
            tx_late: AtomicU64::new(0),
            tx_underflow: AtomicU64::new(0),
            clock_offset: Mutex::new(0.0),
        }
    }

    fn sample_at(&self, t: MonoTime, rate: f64) -> i64 {
        (t.secs() * rate).round() as i64
    }
}

impl Radio for LoopbackRadio {
    fn set_rx_rate(&self, rate: f64) -> f64 {
        self.state.lock().unwrap().rates.0 = rate;
        rate
    }

    fn set_tx_rate(&self, rate: f64) -> f64 {
        self.state.lock().unwrap().rates.1 = rate;
        rate
    }

    fn rx_rate(&self) -> f64 {
        self.state.lock().unwrap().rates.0
    }

    fn tx_rate(&self) -> f64 {
        self.state.lock().unwrap().rates.1
    }

    fn rx_frequency(&self) -> f64 {
        0.0
    }

    fn tx_frequency(&self) -> f64 {
        0.0
    }

    fn start_rx_stream(&self, _t: MonoTime) {
        self.state.lock().unwrap().streaming = true;
    }

    fn stop_rx_stream(&self) {
        self.state.lock().unwrap().streaming = false;
    }

    fn burst_rx(&self, t: MonoTime, nsamples: usize, buf: &IQBuf) -> bool {
        let rate = self.rx_rate();
        let nsamples = nsamples.min(buf.len());

        buf.set_timestamp(t);

        // Pace against the monotonic clock: the burst's samples exist once
        // its period has elapsed
        MonoClock::sleep_until(t + nsamples as f64 / rate);

        let s0 = self.sample_at(t, rate);
        let mut period = vec![ComplexSample::new(0.0, 0.0); nsamples];

        {
            let mut state = self.state.lock().unwrap();

            for entry in &state.tx_ledger {
                let from = entry.start_sample.max(s0);
                let to = (entry.start_sample + entry.samples.len() as i64).min(s0 + nsamples as i64);

                for s in from..to {
                    period[(s - s0) as usize] += entry.samples[(s - entry.start_sample) as usize];
                }
            }

            // Prune transmissions entirely in the past
            state
                .tx_ledger
                .retain(|entry| entry.start_sample + entry.samples.len() as i64 > s0 + nsamples as i64);
        }

        buf.fill(0, &period);
        buf.mark_complete();

        true
    }

    fn burst_tx(&self, t: MonoTime, start_of_burst: bool, end_of_burst: bool, bufs: &[Arc<IQBuf>]) {
        let rate = self.tx_rate();

        if t < MonoClock::now() {
            self.tx_late.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("TX late: t={:.6} now={:.6}", t.secs(), MonoClock::now().secs());
        }

        if start_of_burst {
            self.in_burst.store(true, Ordering::Release);
        }

        let mut start_sample = self.sample_at(t, rate);
        let mut state = self.state.lock().unwrap();

        for buf in bufs {
            let samples = &buf.as_slice()[buf.delay..];

            state.tx_ledger.push(TxEntry {
                start_sample,
                samples: samples.to_vec(),
            });
            start_sample += samples.len() as i64;
        }

        if end_of_burst {
            self.in_burst.store(false, Ordering::Release);
        }
    }

    fn stop_tx_burst(&self) {
        self.in_burst.store(false, Ordering::Release);
    }

    fn in_tx_burst(&self) -> bool {
        self.in_burst.load(Ordering::Acquire)
    }

    fn tx_underflow_count(&self) -> u64 {
        self.tx_underflow.load(Ordering::Relaxed)
    }

    fn tx_late_count(&self) -> u64 {
        self.tx_late.load(Ordering::Relaxed)
    }

    fn clock(&self) -> f64 {
        *self.clock_offset.lock().unwrap()
    }

    fn set_clock(&self, t: f64) {
        *self.clock_offset.lock().unwrap() = t;
    }
}
