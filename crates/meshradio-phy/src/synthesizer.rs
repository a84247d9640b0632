use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use meshradio_core::dsp_types::ComplexSample;
use meshradio_core::{IQBuf, MonoClock, NetPacket, Schedule, WallTime};
use meshradio_net::element::NetIn;
use num::Zero;

use crate::dsp::{DspError, FDUpsampler, ResamplerParams, ToTimeDomain};
use crate::phy::{PacketModulator, PhyChannel};
use crate::slot::{ModPacket, Slot, SlotInner, TXRecord, TXSlot};
use crate::sync::SyncBarrier;

/// Carry information from the previous slot a channel modulated into
#[derive(Clone, Copy)]
struct PrevSlotInfo {
    npartial: usize,
    full_slot_samples: usize,
}

/// Per-channel modulator state
struct ChannelMod {
    chanidx: usize,
    channel: meshradio_core::Channel,
    modulator: Box<dyn PacketModulator>,
    upsampler: FDUpsampler,

    /// IQ buffer currently being upsampled
    iqbuf: Option<IQBuf>,

    /// Offset of unconsumed samples in the IQ buffer
    iqbufoff: usize,

    /// Time-domain samples of this slot already committed by the previous
    /// slot
    delay: usize,

    /// Valid un-overlapped time-domain samples represented by the emitted
    /// FFT blocks
    nsamples: usize,

    /// Sample budget for the current slot
    max_samples: usize,

    /// Samples of the final partial FFT block included in `nsamples`
    npartial: usize,

    /// FFT buffer offset before a flush of a partial block
    partial_fftoff: Option<usize>,

    /// Frequency-domain samples emitted into the slot's buffer
    fdnsamples: usize,
}

/// Accumulate an emitted block into the slot's shared frequency-domain
/// buffer. Channels occupy disjoint bins, so addition composes them.
fn merge_block(inner: &mut SlotInner, off: usize, block: &[ComplexSample]) {
    let Some(fdbuf) = inner.fdbuf.as_mut() else {
        return;
    };

    if off + block.len() > fdbuf.len() {
        tracing::warn!("frequency-domain buffer overrun: off={} len={}", off, fdbuf.len());
        return;
    }

    for (d, s) in fdbuf[off..off + block.len()].iter_mut().zip(block) {
        *d += *s;
    }
}

impl ChannelMod {
    fn modulate(&mut self, pkt: Box<NetPacket>, g: f32, mpkt: &mut ModPacket) {
        let g_effective = pkt.g * g;

        self.modulator.modulate(pkt, g_effective, mpkt);

        mpkt.chanidx = self.chanidx;
        mpkt.channel = self.channel;
    }

    fn upsampled_size(&self, n: usize) -> usize {
        self.upsampler.upsampled_size(n)
    }

    /// Set up channel state for a new slot
    fn next_slot(&mut self, prev: Option<PrevSlotInfo>, slot: &Slot, max_samples: usize) {
        let n_fft = self.upsampler.params.n();
        let l = self.upsampler.params.l();

        self.max_samples = max_samples;

        // Was a partial block output in the previous slot?
        match prev {
            Some(p) if p.npartial != 0 => {
                if self.npartial != 0 {
                    // We output a partial FFT block for the previous slot,
                    // either because only part of a full block fit, or
                    // because we flushed the upsampling buffer with zeros.
                    // Any channel that outputs a partial block has the same
                    // number of partial samples.
                    debug_assert_eq!(self.npartial, p.npartial);

                    if let Some(fftoff) = self.partial_fftoff {
                        // We flushed with zeros; rewind the upsampler so the
                        // zeros are replaced with actual signal
                        self.upsampler.restore_fft_offset(fftoff);
                        self.nsamples = 0;
                        self.fdnsamples = 0;
                    } else {
                        // Re-emit the previously output FFT block; the first
                        // npartial samples were already sent in the previous
                        // slot
                        let block = self.upsampler.copy_fft_out().to_vec();

                        merge_block(&mut slot.lock(), 0, &block);
                        self.nsamples = l;
                        self.fdnsamples = n_fft;
                    }
                } else {
                    // Somebody else output a partial block; our first
                    // npartial output samples must be zero to stay aligned
                    let (x, i) = (self.upsampler.x, self.upsampler.i);

                    self.upsampler.reset(x * p.npartial / i);
                    self.nsamples = 0;
                    self.fdnsamples = 0;
                }

                self.delay = p.npartial;
                self.npartial = 0;
            }
            _ => {
                // Not continuing modulation of a slot: re-initialize the FFT
                // buffer, except when a packet ended exactly on the slot
                // boundary
                if let Some(p) = prev {
                    if self.nsamples != self.delay + p.full_slot_samples {
                        self.upsampler.reset(0);
                    }
                }

                self.nsamples = 0;
                self.fdnsamples = 0;
                self.delay = 0;
                self.npartial = 0;
            }
        }
    }

    /// Will the modulated packet fit in the current slot?
    fn fits(&self, mpkt: &mut ModPacket, overfill: bool) -> bool {
        let samples = mpkt.samples.as_ref().expect("modulated packet has no samples");
        let n = self.upsampled_size(samples.len() - samples.delay);
        let pending = self.nsamples + self.upsampler.npending();

        if pending + n <= self.delay + self.max_samples
            || (pending < self.delay + self.max_samples && overfill)
        {
            mpkt.start = self.nsamples;
            mpkt.nsamples = n;
            true
        } else {
            false
        }
    }

    fn set_iqbuf(&mut self, iqbuf: IQBuf) {
        self.iqbufoff = iqbuf.delay;
        self.iqbuf = Some(iqbuf);
    }

    /// Upsample the current IQ buffer into the slot's frequency-domain
    /// buffer. Returns the number of input samples consumed.
    fn upsample_into(&mut self, slot: &Slot) -> usize {
        let Self {
            upsampler,
            iqbuf,
            iqbufoff,
            delay,
            nsamples,
            max_samples,
            fdnsamples,
            ..
        } = self;

        let n_fft = upsampler.params.n();
        let buf = iqbuf.as_ref().expect("no IQ buffer to upsample");
        let input = &buf.as_slice()[*iqbufoff..];

        upsampler.upsample(input, 1.0, false, |block, n| {
            merge_block(&mut slot.lock(), *fdnsamples, block);
            *fdnsamples += n_fft;
            *nsamples += n;

            *nsamples < *delay + *max_samples
        })
    }

    /// Flush the channel's remaining signal into the slot and record the
    /// slot-level sample counts
    fn flush(&mut self, slot: &Slot) {
        let l = self.upsampler.params.l();

        if self.nsamples < self.delay + self.max_samples {
            self.partial_fftoff = Some(self.upsampler.save_fft_offset());

            let Self {
                upsampler,
                delay,
                nsamples,
                max_samples,
                fdnsamples,
                ..
            } = self;
            let n_fft = upsampler.params.n();

            upsampler.upsample(&[], 1.0, true, |block, n| {
                merge_block(&mut slot.lock(), *fdnsamples, block);
                *fdnsamples += n_fft;
                *nsamples += n;

                *nsamples < *delay + *max_samples
            });
        } else {
            self.partial_fftoff = None;
        }

        if self.nsamples > self.delay + self.max_samples {
            self.nsamples = self.delay + self.max_samples;
            self.npartial = self.nsamples % l;
        } else {
            self.npartial = 0;
        }

        let mut inner = slot.lock();

        if self.nsamples > inner.nsamples {
            inner.delay = self.delay;
            inner.nsamples = self.nsamples;
            inner.fdnsamples = self.fdnsamples;
            inner.npartial = self.npartial;
        }
    }
}

/// Configuration shared by the synthesizer workers
struct SynthState {
    channels: Vec<PhyChannel>,
    schedule: Schedule,
    g_multichan: f32,
    mods: Vec<Arc<Mutex<ChannelMod>>>,
}

struct CurSlot {
    slot: Option<Arc<Slot>>,
}

struct SynthInner {
    sync: SyncBarrier,
    nthreads: usize,
    params: ResamplerParams,

    /// Upstream source of packets to modulate
    sink: NetIn,

    state: Mutex<SynthState>,
    curslot: Mutex<CurSlot>,
    slot_cond: Condvar,

    timedomain: Mutex<ToTimeDomain>,

    /// Serializes slot finalization between the worker barrier and the MAC
    finalize_lock: Mutex<()>,

    /// Modulated packets discarded because their channel disappeared in a
    /// schedule change
    dropped_mpkts: AtomicUsize,
}

/// The multichannel frequency-domain synthesizer.
///
/// Worker threads each take a subset of channels (striding by the thread
/// count) and modulate packets pulled from the sink into the current slot's
/// shared frequency-domain buffer via per-channel overlap-save upsamplers.
/// The slot's `nfinished` counter elects the worker that converts the
/// frequency-domain buffer back to the time domain.
pub struct MultichannelSynthesizer {
    inner: Arc<SynthInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MultichannelSynthesizer {
    pub fn new(
        channels: Vec<PhyChannel>,
        schedule: Schedule,
        tx_rate: f64,
        nthreads: usize,
        params: ResamplerParams,
    ) -> Result<Self, DspError> {
        assert!(nthreads > 0);

        let inner = Arc::new(SynthInner {
            sync: SyncBarrier::new(nthreads),
            nthreads,
            params,
            sink: NetIn::new(),
            state: Mutex::new(SynthState {
                channels: Vec::new(),
                schedule: Schedule::default(),
                g_multichan: 1.0,
                mods: Vec::new(),
            }),
            curslot: Mutex::new(CurSlot { slot: None }),
            slot_cond: Condvar::new(),
            timedomain: Mutex::new(ToTimeDomain::new(params)),
            finalize_lock: Mutex::new(()),
            dropped_mpkts: AtomicUsize::new(0),
        });

        let mut threads = Vec::with_capacity(nthreads);

        for tid in 0..nthreads {
            let worker_inner = Arc::clone(&inner);

            threads.push(
                std::thread::Builder::new()
                    .name(format!("synth-{}", tid))
                    .spawn(move || mod_worker(worker_inner, tid))
                    .expect("failed to spawn synthesizer thread"),
            );
        }

        let synthesizer = Self {
            inner,
            threads: Mutex::new(threads),
        };

        synthesizer.reconfigure(channels, schedule, tx_rate)?;
        Ok(synthesizer)
    }

    /// The pull port feeding the synthesizer
    pub fn sink(&self) -> &NetIn {
        &self.inner.sink
    }

    /// Install a new channel set and schedule. Takes effect through the
    /// reconfiguration barrier with at most one slot of latency.
    pub fn reconfigure(
        &self,
        channels: Vec<PhyChannel>,
        schedule: Schedule,
        tx_rate: f64,
    ) -> Result<(), DspError> {
        // Build the new channel state up front; the barrier just installs it
        let mut mods = Vec::with_capacity(channels.len());

        for (chanidx, chan) in channels.iter().enumerate() {
            let x = chan.phy.min_tx_rate_oversample() as usize;
            let i = (tx_rate / chan.channel.bw).round() as usize;
            let upsampler = FDUpsampler::new(self.inner.params, x, i.max(1), chan.channel.fc / tx_rate)?;

            mods.push(Arc::new(Mutex::new(ChannelMod {
                chanidx,
                channel: chan.channel,
                modulator: chan.phy.make_modulator(),
                upsampler,
                iqbuf: None,
                iqbufoff: 0,
                delay: 0,
                nsamples: 0,
                max_samples: 0,
                npartial: 0,
                partial_fftoff: None,
                fdnsamples: 0,
            })));
        }

        // Gain compensating for the number of channels we may transmit on
        // simultaneously
        let chancount = (0..channels.len())
            .filter(|&chanidx| {
                (0..schedule.nslots()).any(|slotidx| schedule.is_set(chanidx, slotidx))
            })
            .count();
        let g_multichan = if chancount == 0 { 1.0 } else { 1.0 / chancount as f32 };

        self.inner.sync.modify(|| {
            let mut state = self.inner.state.lock().unwrap();

            state.channels = channels;
            state.schedule = schedule;
            state.g_multichan = g_multichan;
            state.mods = mods;
        });
        self.inner.wake_workers();

        Ok(())
    }

    /// Begin modulating a new slot
    pub fn push_slot(&self, deadline: WallTime, slotidx: usize, max_samples: usize, full_slot_samples: usize) {
        let slot = Arc::new(Slot::new(slotidx, deadline, max_samples, full_slot_samples));

        self.inner.curslot.lock().unwrap().slot = Some(slot);
        self.inner.slot_cond.notify_all();
    }

    /// Close and take the slot currently being modulated, finalizing its
    /// time-domain buffer
    pub fn pop_slot(&self) -> TXSlot {
        let slot = self.inner.curslot.lock().unwrap().slot.take();

        let Some(slot) = slot else {
            return TXSlot::empty(WallTime(0.0));
        };

        slot.close();
        self.finalize(&slot);

        let mut inner = slot.lock();
        let nexcess = inner.nsamples as isize - inner.delay as isize - slot.usable_samples as isize;
        let continued = inner.npartial != 0;

        TXSlot {
            txrecord: TXRecord {
                timestamp: None,
                delay: inner.delay,
                nsamples: inner.nsamples,
                mpkts: std::mem::take(&mut inner.mpkts),
                iqbufs: std::mem::take(&mut inner.iqbufs),
            },
            deadline: slot.deadline,
            nexcess,
            continued,
        }
    }

    /// Convert a slot's frequency-domain buffer to the time domain
    fn finalize(&self, slot: &Slot) {
        self.inner.finalize(slot);
    }

    /// Number of modulated packets dropped across schedule changes
    pub fn dropped_mpkts(&self) -> usize {
        self.inner.dropped_mpkts.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        // Disconnecting the sink wakes any worker blocked in a pull
        self.inner.sink.disconnect();
        self.inner.sync.shutdown();
        self.inner.wake_workers();

        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for MultichannelSynthesizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SynthInner {
    /// Wake workers waiting for a slot. The sync flags are set under a
    /// different mutex, so the wake must hold the slot lock to avoid a lost
    /// wakeup.
    fn wake_workers(&self) {
        let _guard = self.curslot.lock().unwrap();

        self.slot_cond.notify_all();
    }

    /// Flush all channel state into the slot and convert the result to the
    /// time domain. Idempotent: a slot that already has a time-domain buffer
    /// is left alone.
    fn finalize(&self, slot: &Slot) {
        let _finalizing = self.finalize_lock.lock().unwrap();

        {
            let inner = slot.lock();

            if inner.fdbuf.is_none() || !inner.iqbufs.is_empty() {
                return;
            }
        }

        let (mods, schedule, nchannels) = {
            let state = self.state.lock().unwrap();

            (state.mods.clone(), state.schedule.clone(), state.channels.len())
        };

        for (chanidx, mod_arc) in mods.iter().enumerate() {
            if schedule.is_set(chanidx, slot.slotidx) {
                mod_arc.lock().unwrap().flush(slot);
            }
        }

        let mut inner = slot.lock();

        // Drop packets whose channel disappeared in a schedule change
        let before = inner.mpkts.len();

        inner.mpkts.retain(|mpkt| mpkt.chanidx < nchannels);
        let dropped = before - inner.mpkts.len();
        if dropped > 0 {
            tracing::warn!("dropping {} modulated packets from vanished channels", dropped);
            self.dropped_mpkts.fetch_add(dropped, Ordering::Relaxed);
        }

        // If we have any samples, the delay is always less than nsamples
        if inner.nsamples == 0 {
            return;
        }

        let fdnsamples = inner.fdnsamples;
        let Some(fdbuf) = inner.fdbuf.take() else {
            return;
        };

        debug_assert!(fdnsamples <= fdbuf.len());
        debug_assert_eq!(fdnsamples % self.params.n(), 0);

        let mut td = Vec::new();

        self.timedomain
            .lock()
            .unwrap()
            .to_time_domain(&fdbuf[..fdnsamples], &mut td);
        td.truncate(inner.nsamples);

        let mut iqbuf = IQBuf::from_samples(td);

        iqbuf.delay = inner.delay;
        inner.iqbufs.push(Arc::new(iqbuf));
    }
}

fn mod_worker(inner: Arc<SynthInner>, tid: usize) {
    let mut prev_slot: Option<Arc<Slot>> = None;
    let mut pending_pkt: Option<Box<NetPacket>> = None;
    let mut pending_mpkt: Option<ModPacket> = None;

    'outer: loop {
        // Wait for the next slot or a state change
        let slot = {
            let mut cur = inner.curslot.lock().unwrap();

            loop {
                if inner.sync.needs_sync(tid) {
                    break None;
                }

                match &cur.slot {
                    Some(slot) if !prev_slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, slot)) => {
                        break Some(Arc::clone(slot));
                    }
                    _ => cur = inner.slot_cond.wait(cur).unwrap(),
                }
            }
        };

        let Some(slot) = slot else {
            // Synchronize on state change
            if inner.sync.sync(tid) {
                break;
            }

            let nchannels = inner.state.lock().unwrap().channels.len();

            // If we are unneeded, sleep
            if nchannels == 0 || tid >= nchannels {
                inner.sync.sleep_until_state_change(tid);
            }

            continue;
        };

        let (schedule, channels, g_multichan, mods) = {
            let state = inner.state.lock().unwrap();

            (
                state.schedule.clone(),
                state.channels.clone(),
                state.g_multichan,
                state.mods.clone(),
            )
        };

        // If we don't have a schedule yet, try again
        if schedule.nslots() == 0 || slot.slotidx >= schedule.nslots() {
            prev_slot = Some(slot);
            continue;
        }

        // Allocate (and zero) the frequency-domain buffer if we are the
        // first to touch the slot. Each block of L input samples becomes N
        // frequency-domain samples; one extra block absorbs overflow from
        // the previous slot.
        {
            let (n, l) = (inner.params.n(), inner.params.l());
            let mut sinner = slot.lock();

            if sinner.fdbuf.is_none() {
                sinner.fdbuf = Some(vec![
                    ComplexSample::zero();
                    n * (1 + (slot.full_slot_samples + l - 1) / l)
                ]);
            }
        }

        for chanidx in (tid..channels.len()).step_by(inner.nthreads) {
            // Skip this channel if we're not allowed to modulate
            if !schedule.is_set(chanidx, slot.slotidx) {
                continue;
            }

            // We can overfill if we are allowed to transmit on the same
            // channel in the next slot
            let overfill = schedule.may_overfill(chanidx, slot.slotidx);
            let max_samples = if overfill {
                slot.lock().max_samples = slot.full_slot_samples;
                slot.full_slot_samples
            } else {
                slot.usable_samples
            };

            let mod_arc = &mods[chanidx];

            {
                let mut chanmod = mod_arc.lock().unwrap();
                let prev = prev_slot.as_ref().map(|p| PrevSlotInfo {
                    npartial: p.lock().npartial,
                    full_slot_samples: p.full_slot_samples,
                });

                chanmod.next_slot(prev, &slot, max_samples);

                // Upsample leftover IQ from the previous slot
                if chanmod.iqbuf.is_some() {
                    let n = chanmod.upsample_into(&slot);

                    chanmod.iqbufoff += n;
                    if chanmod.iqbufoff != chanmod.iqbuf.as_ref().unwrap().len() {
                        tracing::error!("leftover IQ buffer bigger than slot!");
                    }
                    chanmod.iqbuf = None;
                }
            }

            // Modulate packets for the current slot
            loop {
                if inner.sync.needs_sync(tid) {
                    break;
                }

                if pending_mpkt.is_none() {
                    if pending_pkt.is_none() {
                        match inner.sink.pull() {
                            Some(pkt) => pending_pkt = Some(pkt),
                            None => {
                                if slot.is_closed() || inner.sync.needs_sync(tid) {
                                    break;
                                }
                                continue;
                            }
                        }
                    }

                    pending_mpkt = Some(ModPacket::default());
                }

                // If the slot is closed, bail; the pending packet carries
                // over to the next slot
                if slot.is_closed() {
                    break;
                }

                let mut chanmod = mod_arc.lock().unwrap();
                let mpkt = pending_mpkt.as_mut().unwrap();

                if mpkt.pkt.is_none() {
                    let mut pkt = pending_pkt.take().unwrap();
                    let g = channels[chanidx].phy.mcs_table()[pkt.mcsidx]
                        .autogain
                        .soft_tx_gain()
                        * g_multichan;

                    pkt.timestamps.mod_start = Some(MonoClock::now());
                    chanmod.modulate(pkt, g, mpkt);
                    if let Some(pkt) = mpkt.pkt.as_mut() {
                        pkt.timestamps.mod_end = Some(MonoClock::now());
                    }
                }

                let mut pushed = false;

                if chanmod.fits(mpkt, overfill) {
                    // The modulated IQ buffer moves into the upsampler
                    chanmod.set_iqbuf(mpkt.samples.take().unwrap());

                    let nsamples0 = chanmod.nsamples;
                    let consumed = chanmod.upsample_into(&slot);

                    {
                        let iqbuf_len = chanmod.iqbuf.as_ref().unwrap().len();
                        let mut sinner = slot.lock();

                        if !slot.is_closed() {
                            mpkt.offset = nsamples0;
                            chanmod.iqbufoff += consumed;

                            sinner.mpkts.push(pending_mpkt.take().unwrap());
                            pushed = true;
                        }

                        drop(sinner);

                        if pushed {
                            if chanmod.iqbufoff == iqbuf_len {
                                chanmod.iqbuf = None;
                            }
                        }
                    }

                    if pushed {
                        // A partially-consumed buffer continues into the
                        // next slot
                        if chanmod.iqbuf.is_some() {
                            break;
                        }
                    } else {
                        // The slot closed under us: the packet is
                        // re-enqueued, not dropped
                        chanmod.iqbuf = None;
                        pending_pkt = pending_mpkt.take().and_then(|mut m| m.pkt.take());
                        break;
                    }
                }

                if !pushed && pending_mpkt.is_some() {
                    let mpkt = pending_mpkt.as_mut().unwrap();
                    let n = match mpkt.samples.as_ref() {
                        Some(samples) => chanmod.upsampled_size(samples.len() - samples.delay),
                        None => 0,
                    };

                    if n > slot.full_slot_samples {
                        // Too large for any slot: drop it
                        tracing::warn!("modulated packet is larger than slot!");
                        pending_mpkt = None;
                    } else {
                        // Too large for the remainder of this slot: try
                        // again in the next slot
                        pending_pkt = pending_mpkt.take().and_then(|mut m| m.pkt.take());
                        break;
                    }
                }
            }
        }

        // We are done with this slot; finalize it if everyone else has
        // finished too
        if slot.nfinished.fetch_add(1, Ordering::AcqRel) == inner.nthreads - 1 && !slot.is_closed() {
            inner.finalize(&slot);
        }

        prev_slot = Some(slot);

        if inner.sync.is_done() {
            break 'outer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::Phy;
    use crate::raw::RawPhy;
    use meshradio_core::header::EHDR_SIZE;
    use meshradio_core::{Channel, ExtendedHeader, RadioPacket, Seq};
    use meshradio_net::queue::NetQueue;
    use meshradio_net::FifoQueue;
    use std::time::Duration;

    const TEST_PARAMS: ResamplerParams = ResamplerParams { p: 17, v: 2 };

    fn mk_netpacket(data: &[u8], seq: u16) -> Box<NetPacket> {
        let mut pkt = NetPacket::with_capacity(EHDR_SIZE + data.len());

        pkt.hdr.curhop = 1;
        pkt.hdr.nexthop = 2;
        pkt.hdr.seq = Seq(seq);
        pkt.set_ehdr(ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(0),
            data_len: data.len() as u16,
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(data);
        Box::new(pkt)
    }

    fn single_channel_synth(schedule: Vec<Vec<bool>>) -> (MultichannelSynthesizer, Arc<FifoQueue>) {
        let phy = Arc::new(RawPhy::new());
        let channels = vec![PhyChannel::new(Channel::new(0.0, 1.0), phy)];
        let schedule = Schedule::new(schedule, 1.0, 0.1);
        let synth = MultichannelSynthesizer::new(channels, schedule, 1.0, 1, TEST_PARAMS).unwrap();
        let queue = Arc::new(FifoQueue::new());

        synth.sink().connect(queue.clone());
        (synth, queue)
    }

    fn demod_payloads(samples: &[ComplexSample]) -> Vec<RadioPacket> {
        let phy = RawPhy::new();
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let received2 = std::sync::Arc::clone(&received);
        let mut demod = phy.make_demodulator();

        demod.set_callback(Box::new(move |pkt| received2.lock().unwrap().push(pkt)));
        demod.reset(Channel::default());
        demod.timestamp(meshradio_core::MonoTime(0.0), None, 0, 0, 1.0, 1.0);
        demod.demodulate(samples);

        std::sync::Arc::try_unwrap(received).unwrap().into_inner().unwrap()
    }

    #[test]
    fn test_single_slot_synthesis() {
        let (synth, queue) = single_channel_synth(vec![vec![true, false]]);
        let data = b"0123456789";
        let frame_len = RawPhy::new().modulated_size(0, EHDR_SIZE + data.len());

        queue.push(mk_netpacket(data, 1));
        synth.push_slot(WallTime(1.0), 0, 64, 80);
        std::thread::sleep(Duration::from_millis(200));

        let txslot = synth.pop_slot();

        assert_eq!(txslot.txrecord.mpkts.len(), 1);
        assert_eq!(txslot.txrecord.delay, 0);
        assert_eq!(txslot.txrecord.nsamples, frame_len);
        assert!(txslot.nexcess < 0);
        assert!(!txslot.continued);

        let mpkt = &txslot.txrecord.mpkts[0];
        assert_eq!(mpkt.start, 0);
        assert_eq!(mpkt.nsamples, frame_len);
        assert!(mpkt.start + mpkt.nsamples <= 80);

        // The finalized buffer carries exactly nsamples
        let iqbuf = &txslot.txrecord.iqbufs[0];
        assert_eq!(iqbuf.len(), txslot.txrecord.nsamples);

        // And it demodulates back to the packet we pushed
        let received = demod_payloads(iqbuf.as_slice());
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].hdr.seq, Seq(1));
        assert_eq!(&received[0].data(), &data);

        synth.stop();
    }

    #[test]
    fn test_overfill_carries_partial_into_next_slot() {
        // Back-to-back slots on the same channel: slot 0 may overfill
        let (synth, queue) = single_channel_synth(vec![vec![true, true]]);
        let data = b"0123456789";
        // usable = 32, full = 40: the 41-sample frame overfills slot 0
        let frame_len = RawPhy::new().modulated_size(0, EHDR_SIZE + data.len());
        assert_eq!(frame_len, 41);

        queue.push(mk_netpacket(data, 7));
        synth.push_slot(WallTime(1.0), 0, 32, 40);
        std::thread::sleep(Duration::from_millis(200));

        let first = synth.pop_slot();

        // The first slot includes samples past max_samples, up to the full
        // slot
        assert_eq!(first.txrecord.nsamples, 40);
        assert_eq!(first.txrecord.delay, 0);
        assert_eq!(first.nexcess, 8);
        assert!(first.continued);

        synth.push_slot(WallTime(2.0), 1, 32, 40);
        NetQueue::kick(&*queue);
        std::thread::sleep(Duration::from_millis(200));

        let second = synth.pop_slot();

        // The second slot begins at the carry offset: its delay is the
        // previous slot's partial-block sample count, and only the one
        // remaining frame sample is new
        assert_eq!(second.txrecord.delay, 8);
        assert_eq!(second.txrecord.nsamples, 9);
        assert!(!second.continued);

        // Concatenating the transmitted sample ranges reconstructs the
        // frame
        let mut signal = first.txrecord.iqbufs[0].as_slice().to_vec();
        let second_buf = second.txrecord.iqbufs[0].as_slice();

        signal.extend_from_slice(&second_buf[second.txrecord.delay..]);
        assert_eq!(signal.len(), frame_len);

        let received = demod_payloads(&signal);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].hdr.seq, Seq(7));
        assert_eq!(&received[0].data(), &data);

        synth.stop();
    }

    #[test]
    fn test_two_channel_parallel_synthesis() {
        use crate::dsp::{lowpass_taps, FDDownsampler};

        // A wider FFT leaves room for two channels at fc = ±tx_rate/4
        let params = ResamplerParams { p: 129, v: 2 };
        let tx_rate = 4.0;

        let phy = Arc::new(RawPhy::new());
        let channels = vec![
            PhyChannel::new(Channel::new(1.0, 1.0), phy.clone()),
            PhyChannel::new(Channel::new(-1.0, 1.0), phy.clone()),
        ];
        let schedule = Schedule::new(vec![vec![true, false], vec![true, false]], 1.0, 0.1);
        let synth = MultichannelSynthesizer::new(channels, schedule, tx_rate, 1, params).unwrap();
        let queue = Arc::new(FifoQueue::new());

        synth.sink().connect(queue.clone());

        queue.push(mk_netpacket(b"from ch", 1));
        queue.push(mk_netpacket(b"from ch", 2));

        // One 41-byte frame upsamples to 164 samples; a 256-sample budget
        // holds one frame per channel but not two
        synth.push_slot(WallTime(1.0), 0, 256, 320);
        std::thread::sleep(Duration::from_millis(300));

        let txslot = synth.pop_slot();

        // Both packets landed in the one slot, one per channel. With a
        // single worker the first pulled packet fills channel 0.
        assert_eq!(txslot.txrecord.mpkts.len(), 2);
        assert_eq!(txslot.txrecord.iqbufs.len(), 1);
        assert_eq!(txslot.txrecord.mpkts[0].chanidx, 0);
        assert_eq!(txslot.txrecord.mpkts[1].chanidx, 1);

        // Channelizing each carrier recovers its packet and only its
        // packet. The tap count keeps the filter delay a whole number of
        // channel-rate samples.
        let mut wideband = txslot.txrecord.iqbufs[0].as_slice().to_vec();
        wideband.extend(std::iter::repeat(ComplexSample::zero()).take(128));

        let taps = lowpass_taps(121, 0.16);

        for (fc, expect_seq) in [(1.0f64, 1u16), (-1.0, 2)] {
            let mut down = FDDownsampler::new(params, 1, 4, fc / tx_rate, &taps).unwrap();
            let mut narrowband = Vec::new();

            down.resample(&wideband, &mut narrowband, 1.0);

            let received = demod_payloads(&narrowband);
            assert_eq!(received.len(), 1, "channel at {} Hz", fc);
            assert_eq!(received[0].hdr.seq, Seq(expect_seq));
        }

        synth.stop();
    }
}
