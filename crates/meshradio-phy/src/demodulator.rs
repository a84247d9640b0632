use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::logger::{Logger, Source};
use meshradio_core::MonoTime;
use meshradio_net::element::RadioOut;

use crate::channelizer::Channelizer;
use crate::dsp::{lowpass_taps, FDDownsampler, ResamplerParams};
use crate::iqcodec::{IqCodec, Sc14Codec};
use crate::phy::{PacketDemodulator, PhyChannel};
use crate::radio_queue::RadioPacketQueue;
use crate::sync::SyncBarrier;

/// Per-thread, per-channel demodulation state
struct ChannelState {
    downsampler: FDDownsampler,
    demod: Box<dyn PacketDemodulator>,
    channel_rate: f64,
    /// Decimation factor
    d: usize,
}

struct DemodConfig {
    channels: Vec<PhyChannel>,
    rx_rate: f64,
    epoch: u64,
}

struct DemodInner {
    sync: SyncBarrier,
    params: ResamplerParams,
    channelizer: Arc<Channelizer>,
    radio_q: Arc<RadioPacketQueue>,

    /// Output port delivering ordered packets to the controller
    source: RadioOut,

    config: Mutex<DemodConfig>,
}

/// Design the channelizing filter for a channel. The tap count keeps the
/// filter delay a whole number of channel-rate samples.
fn design_taps(params: ResamplerParams, d: usize) -> Vec<ComplexSample> {
    let k = ((params.p - 1) / (2 * d)).clamp(2, 15);

    lowpass_taps(2 * d * k + 1, (0.64 / d as f64).min(0.45))
}

/// The parallel packet demodulator.
///
/// A pool of worker threads takes per-channel windows from the channelizer,
/// downsamples each to its channel rate, and runs the PHY demodulator.
/// Ordered delivery is preserved by the barrier queue: each window's packets
/// are inserted ahead of the barrier pushed when the window was taken, and a
/// dedicated delivery thread drains the queue to the output port.
pub struct ParallelDemodulator {
    inner: Arc<DemodInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ParallelDemodulator {
    pub fn new(
        channels: Vec<PhyChannel>,
        rx_rate: f64,
        nthreads: usize,
        params: ResamplerParams,
    ) -> Self {
        assert!(nthreads > 0);

        let channelizer = Arc::new(Channelizer::new(channels.len()));
        let radio_q = Arc::new(RadioPacketQueue::new());

        let inner = Arc::new(DemodInner {
            sync: SyncBarrier::new(nthreads),
            params,
            channelizer,
            radio_q,
            source: RadioOut::new(),
            config: Mutex::new(DemodConfig {
                channels,
                rx_rate,
                epoch: 1,
            }),
        });

        let mut threads = Vec::with_capacity(nthreads + 1);

        for tid in 0..nthreads {
            let worker_inner = Arc::clone(&inner);

            threads.push(
                std::thread::Builder::new()
                    .name(format!("demod-{}", tid))
                    .spawn(move || demod_worker(worker_inner, tid))
                    .expect("failed to spawn demodulator thread"),
            );
        }

        // The delivery thread drains ordered packets to the network side
        let delivery_inner = Arc::clone(&inner);

        threads.push(
            std::thread::Builder::new()
                .name("demod-delivery".into())
                .spawn(move || {
                    while let Some(pkt) = delivery_inner.radio_q.pop() {
                        delivery_inner.source.push(pkt);
                    }
                })
                .expect("failed to spawn delivery thread"),
        );

        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// The channelizer fed by the MAC's RX loop
    pub fn channelizer(&self) -> &Arc<Channelizer> {
        &self.inner.channelizer
    }

    /// The ordered packet output port
    pub fn source(&self) -> &RadioOut {
        &self.inner.source
    }

    /// Install a new channel set or RX rate
    pub fn reconfigure(&self, channels: Vec<PhyChannel>, rx_rate: f64) {
        let nchannels = channels.len();

        self.inner.sync.modify(|| {
            let mut config = self.inner.config.lock().unwrap();

            config.channels = channels;
            config.rx_rate = rx_rate;
            config.epoch += 1;
        });
        self.inner.channelizer.set_nchannels(nchannels);
    }

    pub fn stop(&self) {
        self.inner.channelizer.stop();
        self.inner.sync.shutdown();
        self.inner.radio_q.stop();

        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ParallelDemodulator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn demod_worker(inner: Arc<DemodInner>, tid: usize) {
    let mut states: HashMap<usize, ChannelState> = HashMap::new();
    let mut state_epoch = 0u64;
    let codec = Sc14Codec;

    loop {
        if inner.sync.needs_sync(tid) {
            if inner.sync.sync(tid) {
                return;
            }

            // Configuration changed: rebuild per-channel state lazily
            states.clear();
        }

        let Some(window) = inner.channelizer.pop(&inner.radio_q) else {
            return;
        };

        let (channels, rx_rate, epoch) = {
            let config = inner.config.lock().unwrap();

            (config.channels.clone(), config.rx_rate, config.epoch)
        };

        if epoch != state_epoch {
            states.clear();
            state_epoch = epoch;
        }

        let Some(phychan) = channels.get(window.chanidx) else {
            inner.radio_q.erase_barrier(window.barrier);
            continue;
        };

        let state = match states.entry(window.chanidx) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let d = (rx_rate / phychan.channel.bw).round().max(1.0) as usize;
                let taps = design_taps(inner.params, d);
                let downsampler = match FDDownsampler::new(
                    inner.params,
                    phychan.phy.min_rx_rate_oversample() as usize,
                    d,
                    phychan.channel.fc / rx_rate,
                    &taps,
                ) {
                    Ok(downsampler) => downsampler,
                    Err(err) => {
                        tracing::error!("cannot channelize channel {}: {}", window.chanidx, err);
                        inner.radio_q.erase_barrier(window.barrier);
                        continue;
                    }
                };

                e.insert(ChannelState {
                    downsampler,
                    demod: phychan.phy.make_demodulator(),
                    channel_rate: phychan.channel.bw,
                    d,
                })
            }
        };

        // Route this window's packets ahead of its barrier
        let radio_q = Arc::clone(&inner.radio_q);
        let barrier = window.barrier;
        let chanidx = window.chanidx;
        let received = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let received_cb = Arc::clone(&received);

        state.demod.set_callback(Box::new(move |mut pkt| {
            received_cb.store(true, Ordering::Relaxed);
            pkt.chanidx = chanidx;

            if !pkt.internal_flags.invalid_header {
                radio_q.push_before(barrier, Box::new(pkt));
            }
        }));

        let (prev_samps, cur_samps) = inner.channelizer.window_params();
        let buf1 = &window.prev;
        let buf2 = &window.cur;

        // Demodulate the tail of the previous period. This can exceed the
        // buffer when a large demodulation overlap is configured.
        let buf1_nsamples = (buf1.oversample.load(Ordering::Acquire) + prev_samps).min(buf1.len());
        let buf1_off = buf1.len() - buf1_nsamples;

        // The previous period has ended; wait for its producer to finish
        while !buf1.is_complete() {
            if inner.sync.is_done() {
                inner.radio_q.erase_barrier(window.barrier);
                return;
            }
            std::thread::yield_now();
        }

        let delay = state.downsampler.delay();
        let rate = state.channel_rate;

        // Wait for the current period to start filling; demodulation can
        // outrun the radio producer
        while buf2.filled().is_empty() && !buf2.is_complete() {
            if inner.sync.is_done() {
                inner.radio_q.erase_barrier(window.barrier);
                return;
            }
            std::thread::yield_now();
        }

        let undersample = buf2.undersample.load(Ordering::Acquire);
        let nwanted = cur_samps.saturating_sub(undersample);

        if nwanted > 0 {
            // Poll the producer's fill level; an RX error marks the buffer
            // complete, terminating the wait
            loop {
                if buf2.filled().len() >= nwanted || buf2.is_complete() || inner.sync.is_done() {
                    break;
                }
                std::thread::yield_now();
            }
        }

        let n = buf2.filled().len().min(nwanted);

        // Channelize the previous tail and the current period as one
        // continuous stretch so frames spanning the boundary survive
        let mut wideband = Vec::with_capacity(buf1_nsamples + n);

        wideband.extend_from_slice(&buf1.as_slice()[buf1_off..]);
        wideband.extend_from_slice(&buf2.filled()[..n]);

        let mut narrowband = Vec::new();

        state.downsampler.resample(&wideband, &mut narrowband, 1.0);

        // Split delivery at the period boundary so each frame's time base
        // comes from the period its preamble was found in
        let boundary = (buf1_nsamples / state.d).min(narrowband.len());

        state.demod.reset(phychan.channel);
        state.demod.timestamp(
            buf1.timestamp().unwrap_or_default(),
            buf1.snapshot_off,
            buf1_off,
            delay,
            rate,
            rx_rate,
        );
        state.demod.demodulate(&narrowband[..boundary]);

        // When the snapshot window ended with the previous buffer, keep
        // accounting offsets relative to it for one more period
        let snapshot_off = buf2
            .snapshot_off
            .or(buf1.snapshot_off.map(|off| off + buf1.len() as i64));

        state.demod.timestamp(
            buf2.timestamp().unwrap_or_default(),
            snapshot_off,
            0,
            delay,
            rate,
            rx_rate,
        );
        state.demod.demodulate(&narrowband[boundary..]);

        // We are done producing packets for this window
        inner.radio_q.erase_barrier(window.barrier);

        // If we received anything, log both periods
        if received.load(Ordering::Relaxed) {
            if let Some(logger) = Logger::global() {
                if logger.collect_source(Source::Slots) {
                    for buf in [buf1, buf2] {
                        logger.log_slot(
                            buf.timestamp().unwrap_or(MonoTime(0.0)),
                            rx_rate,
                            buf.fc,
                            codec.compress(buf.filled()),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_design_taps_delay_divisible() {
        let params = ResamplerParams { p: 129, v: 2 };

        for d in [1usize, 2, 4, 8] {
            let taps = design_taps(params, d);

            assert!(taps.len() % 2 == 1);
            assert!(taps.len() <= params.p);
            // Group delay lands on a whole channel-rate sample
            assert_eq!(((taps.len() - 1) / 2) % d, 0);
        }
    }
}
