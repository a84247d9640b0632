use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use meshradio_core::{MonoClock, Schedule, WallClock, WallTime};
use meshradio_phy::snapshot::SnapshotCollector;
use meshradio_phy::sync::SyncBarrier;
use meshradio_phy::{MultichannelSynthesizer, ParallelDemodulator};

use crate::controller::Controller;
use crate::mac::{
    rx_worker, tx_notifier, MacConfig, MacInner, MacStats, RuntimeConfig, TxSlotChannel, NOTIFIER_TID,
    NTIDS, RX_TID, TX_SLOT_TID, TX_TID,
};
use crate::radio::Radio;

/// The slot-scheduling discipline: who may transmit when.
pub trait SlotScheduler: Send + Sync {
    /// The next slot at or after `t` in which we may transmit, as
    /// (slot start time, slot index)
    fn find_next_slot(&self, schedule: &Schedule, t: WallTime) -> Option<(WallTime, usize)>;

    /// Final per-slot gate, evaluated when the slot is scheduled for
    /// modulation
    fn transmit_in_slot(&self, _t: WallTime, _slotidx: usize) -> bool {
        true
    }

    /// May this node transmit at all under the schedule?
    fn can_transmit(&self, schedule: &Schedule) -> bool;
}

/// Deadline comparisons tolerate floating-point noise up to a nanosecond
const DEADLINE_EPS: f64 = 1e-9;

/// The slot-synchronized MAC.
///
/// Four worker threads drive the radio:
/// - the RX worker streams one IQ buffer per period into the channelizer,
/// - the TX slot worker aligns to wall-clock slot boundaries, pops the
///   finalized slot from the synthesizer, and schedules modulation of the
///   following slot,
/// - the TX worker hands finalized bursts to the radio,
/// - the TX notifier performs post-transmit accounting.
pub struct SlottedMac {
    inner: Arc<MacInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SlottedMac {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radio: Arc<dyn Radio>,
        controller: Arc<dyn Controller>,
        collector: Option<Arc<SnapshotCollector>>,
        synthesizer: Arc<MultichannelSynthesizer>,
        demodulator: Arc<ParallelDemodulator>,
        scheduler: Box<dyn SlotScheduler>,
        config: MacConfig,
    ) -> Self {
        let inner = Arc::new(MacInner {
            sync: SyncBarrier::new(NTIDS),
            radio,
            controller,
            collector,
            synthesizer,
            demodulator,
            scheduler,
            config: Mutex::new(RuntimeConfig {
                schedule: Schedule::default(),
                rx_period: 0.0,
                slot_send_lead_time: 5e-3,
                rx_rate: 0.0,
                tx_rate: 0.0,
                rx_period_samps: 0,
                rx_bufsize: 0,
                tx_slot_samps: 0,
                tx_full_slot_samps: 0,
                can_transmit: false,
            }),
            tx_slot: TxSlotChannel::new(),
            tx_records: Mutex::new(VecDeque::new()),
            tx_records_cond: Condvar::new(),
            stop_burst: std::sync::atomic::AtomicBool::new(false),
            stats: MacStats::default(),
        });

        let mac = Self {
            inner: Arc::clone(&inner),
            threads: Mutex::new(Vec::new()),
        };

        mac.reconfigure(config);

        let mut threads = mac.threads.lock().unwrap();

        for (name, tid) in [
            ("mac-rx", RX_TID),
            ("mac-tx", TX_TID),
            ("mac-tx-slot", TX_SLOT_TID),
            ("mac-tx-notifier", NOTIFIER_TID),
        ] {
            let worker_inner = Arc::clone(&inner);

            threads.push(
                std::thread::Builder::new()
                    .name(name.into())
                    .spawn(move || match tid {
                        RX_TID => rx_worker(worker_inner),
                        TX_TID => tx_worker(worker_inner),
                        TX_SLOT_TID => tx_slot_worker(worker_inner),
                        _ => tx_notifier(worker_inner),
                    })
                    .expect("failed to spawn MAC thread"),
            );
        }
        drop(threads);

        mac
    }

    /// Install new MAC timing. Slot sample budgets are re-derived from the
    /// radio's current rates.
    pub fn reconfigure(&self, config: MacConfig) {
        let rx_rate = self.inner.radio.rx_rate();
        let tx_rate = self.inner.radio.tx_rate();
        let slot_size = config.schedule.slot_size();
        let guard_size = config.schedule.guard_size();
        let rx_period_samps = (rx_rate * config.rx_period).round() as usize;
        let can_transmit = self.inner.scheduler.can_transmit(&config.schedule);

        self.inner.sync.modify(|| {
            let mut runtime = self.inner.config.lock().unwrap();

            *runtime = RuntimeConfig {
                rx_period: config.rx_period,
                slot_send_lead_time: config.slot_send_lead_time,
                rx_rate,
                tx_rate,
                rx_period_samps,
                rx_bufsize: self.inner.radio.recommended_burst_rx_size(rx_period_samps),
                tx_slot_samps: (tx_rate * (slot_size - guard_size)) as usize,
                tx_full_slot_samps: (tx_rate * slot_size) as usize,
                can_transmit,
                schedule: config.schedule.clone(),
            };
        });

        // The demodulation window covers the period plus an overlap into
        // the previous period for boundary-spanning packets
        self.inner
            .demodulator
            .channelizer()
            .set_window_params(rx_period_samps / 4, rx_period_samps);

        self.inner.tx_slot.enable();
    }

    pub fn stats(&self) -> &MacStats {
        &self.inner.stats
    }

    pub fn stop(&self) {
        self.inner.sync.shutdown();
        self.inner.tx_slot.disable();
        self.inner.tx_records_cond.notify_all();

        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SlottedMac {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The TX worker: consumes finalized TX slots and issues radio bursts.
fn tx_worker(inner: Arc<MacInner>) {
    loop {
        if inner.sync.needs_sync(TX_TID) && inner.sync.sync(TX_TID) {
            return;
        }

        let Some(mut slot) = inner.tx_slot.pop_timeout(Duration::from_millis(100)) else {
            if inner.sync.is_done() {
                return;
            }
            continue;
        };

        // A slot with no IQ data closes any open burst
        if slot.txrecord.mpkts.is_empty() {
            inner.radio.stop_tx_burst();
            continue;
        }

        if inner.stop_burst.swap(false, Ordering::Relaxed) {
            inner.radio.stop_tx_burst();
        }

        let tx_rate = inner.config.lock().unwrap().tx_rate;
        let t_slot = WallClock::to_mono_time(slot.deadline);

        slot.txrecord.timestamp = Some(t_slot);

        inner.radio.burst_tx(
            t_slot + slot.txrecord.delay as f64 / tx_rate,
            // Start a burst if we're not already in one
            !inner.radio.in_tx_burst(),
            // Stop the burst if the slot isn't continued or wasn't filled
            !slot.continued || slot.nexcess < 0,
            &slot.txrecord.iqbufs,
        );

        // Hand off to the notifier
        inner.push_tx_record(slot.txrecord);
    }
}

/// The TX slot worker: tracks wall-clock slot boundaries, schedules
/// modulation, and feeds finalized slots to the TX worker.
fn tx_slot_worker(inner: Arc<MacInner>) {
    let mut t_next_slot = WallTime(f64::NEG_INFINITY);

    loop {
        if inner.sync.needs_sync(TX_SLOT_TID) {
            if inner.sync.sync(TX_SLOT_TID) {
                break;
            }

            // If we cannot transmit, sleep until the next state change
            if !inner.config.lock().unwrap().can_transmit {
                inner.sync.sleep_until_state_change(TX_SLOT_TID);
                continue;
            }

            t_next_slot = WallTime(f64::NEG_INFINITY);
        }

        let (schedule, lead_time, tx_slot_samps, tx_full_slot_samps, can_transmit) = {
            let config = inner.config.lock().unwrap();

            (
                config.schedule.clone(),
                config.slot_send_lead_time,
                config.tx_slot_samps,
                config.tx_full_slot_samps,
                config.can_transmit,
            )
        };

        if !can_transmit || schedule.nslots() == 0 {
            MonoClock::sleep_for(0.1);
            continue;
        }

        let slot_size = schedule.slot_size();
        let t_now = WallClock::now();

        // If we missed a slot, find the next one
        if t_now > t_next_slot {
            match inner.scheduler.find_next_slot(&schedule, t_now) {
                Some((t, _idx)) => t_next_slot = t,
                None => {
                    MonoClock::sleep_for(0.1);
                    continue;
                }
            }
        }

        // Less than one slot away: finalize and transmit
        if t_next_slot - t_now < slot_size {
            let mut slot = inner.synthesizer.pop_slot();

            if slot.txrecord.nsamples > 0 && (slot.deadline - t_next_slot).abs() > DEADLINE_EPS {
                tracing::warn!(
                    "MISSED SLOT DEADLINE: desired slot={:.6}; slot={:.6}; now={:.6}",
                    t_next_slot.secs(),
                    slot.deadline.secs(),
                    WallClock::now().secs()
                );
                inner.stats.missed_deadlines.fetch_add(1, Ordering::Relaxed);

                // Stop any current TX burst and re-queue the slot's packets
                inner.stop_burst.store(true, Ordering::Relaxed);
                inner.abort_tx_record(std::mem::take(&mut slot.txrecord));
            }

            // Whole slots consumed by samples sent beyond the slot end; the
            // within-slot carry is handled by the synthesizer's partial-block
            // chain
            let noverfillslots = if slot.txrecord.nsamples > 0 && slot.nexcess > 0 {
                slot.nexcess as usize / tx_full_slot_samps.max(1)
            } else {
                0
            };

            // Find the following slot. Half a slot of slack avoids skipping
            // a slot to rounding.
            let t_search = t_next_slot + noverfillslots as f64 * slot_size + slot_size / 2.0;
            let Some((t_following, following_idx)) = inner.scheduler.find_next_slot(&schedule, t_search)
            else {
                MonoClock::sleep_for(0.1);
                continue;
            };

            // Schedule modulation of the following slot
            if inner.scheduler.transmit_in_slot(t_following, following_idx) {
                inner
                    .synthesizer
                    .push_slot(t_following, following_idx, tx_slot_samps, tx_full_slot_samps);
            }

            // Transmit the slot we just popped
            if slot.txrecord.nsamples > 0 {
                inner.tx_slot.push(slot);
            }

            t_next_slot = t_following;
        }

        // Sleep until it's time to hand off the next slot
        let sleep_secs = (t_next_slot - WallClock::now()) - lead_time;

        if inner.sync.is_done() {
            break;
        }
        MonoClock::sleep_for(sleep_secs.min(0.1));
    }

    // We cannot transmit the remaining packets
    let slot = inner.synthesizer.pop_slot();

    inner.abort_tx_record(slot.txrecord);
}
