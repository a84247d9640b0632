use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use meshradio_core::logger::{Logger, PacketFields, SelfTxRecord, Source};
use meshradio_core::{IQBuf, MonoClock, Schedule, WallClock};
use meshradio_phy::slot::{TXRecord, TXSlot};
use meshradio_phy::snapshot::SnapshotCollector;
use meshradio_phy::sync::SyncBarrier;
use meshradio_phy::{MultichannelSynthesizer, ParallelDemodulator};

use crate::controller::Controller;
use crate::radio::Radio;
use crate::slotted::SlotScheduler;

/// Worker thread ids for the MAC's reconfiguration barrier
pub(crate) const RX_TID: usize = 0;
pub(crate) const TX_TID: usize = 1;
pub(crate) const TX_SLOT_TID: usize = 2;
pub(crate) const NOTIFIER_TID: usize = 3;
pub(crate) const NTIDS: usize = 4;

/// User-facing MAC timing configuration
#[derive(Clone, Debug)]
pub struct MacConfig {
    pub schedule: Schedule,
    /// One RX buffer is produced per period (seconds)
    pub rx_period: f64,
    /// How long before a slot boundary its finalized IQ must reach the
    /// radio (seconds)
    pub slot_send_lead_time: f64,
}

/// Runtime configuration derived from [MacConfig] and the radio's rates
pub(crate) struct RuntimeConfig {
    pub schedule: Schedule,
    pub rx_period: f64,
    pub slot_send_lead_time: f64,
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub rx_period_samps: usize,
    pub rx_bufsize: usize,
    pub tx_slot_samps: usize,
    pub tx_full_slot_samps: usize,
    pub can_transmit: bool,
}

#[derive(Default)]
pub struct MacStats {
    pub missed_deadlines: AtomicU64,
    pub rx_errors: AtomicU64,
    /// Samples transmitted per channel
    pub load: Mutex<Vec<u64>>,
}

/// Single-slot hand-off from the slot scheduler to the TX worker
pub(crate) struct TxSlotChannel {
    state: Mutex<(Option<TXSlot>, bool)>,
    cond: Condvar,
}

impl TxSlotChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((None, true)),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, slot: TXSlot) {
        let mut state = self.state.lock().unwrap();

        if state.1 {
            state.0 = Some(slot);
            drop(state);
            self.cond.notify_one();
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<TXSlot> {
        let mut state = self.state.lock().unwrap();

        if state.0.is_none() {
            state = self.cond.wait_timeout(state, timeout).unwrap().0;
        }

        state.0.take()
    }

    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();

        state.1 = false;
        state.0 = None;
        drop(state);
        self.cond.notify_all();
    }

    pub fn enable(&self) {
        self.state.lock().unwrap().1 = true;
    }
}

pub(crate) struct MacInner {
    pub sync: SyncBarrier,
    pub radio: Arc<dyn Radio>,
    pub controller: Arc<dyn Controller>,
    pub collector: Option<Arc<SnapshotCollector>>,
    pub synthesizer: Arc<MultichannelSynthesizer>,
    pub demodulator: Arc<ParallelDemodulator>,
    pub scheduler: Box<dyn SlotScheduler>,
    pub config: Mutex<RuntimeConfig>,
    pub tx_slot: TxSlotChannel,
    pub tx_records: Mutex<VecDeque<TXRecord>>,
    pub tx_records_cond: Condvar,
    pub stop_burst: AtomicBool,
    pub stats: MacStats,
}

impl MacInner {
    pub fn push_tx_record(&self, record: TXRecord) {
        self.tx_records.lock().unwrap().push_back(record);
        self.tx_records_cond.notify_one();
    }

    /// Re-queue the packets of a slot that will not be transmitted
    pub fn abort_tx_record(&self, record: TXRecord) {
        for mut mpkt in record.mpkts {
            if let Some(pkt) = mpkt.pkt.take() {
                self.controller.missed(pkt);
            }
        }
    }
}

/// The RX worker: drives the radio's RX stream continuously, producing one
/// IQ buffer per period aligned to wall-clock boundaries.
pub(crate) fn rx_worker(inner: Arc<MacInner>) {
    let mut seq: u64 = 0;

    'outer: while !inner.sync.is_done() {
        if inner.sync.needs_sync(RX_TID) && inner.sync.sync(RX_TID) {
            break;
        }

        let (rx_period, rx_period_samps, rx_bufsize, rx_rate) = {
            let config = inner.config.lock().unwrap();

            (
                config.rx_period,
                config.rx_period_samps,
                config.rx_bufsize,
                config.rx_rate,
            )
        };

        // Wait for the period to be known
        if rx_period_samps == 0 {
            MonoClock::sleep_for(0.1);
            continue;
        }

        // Set up streaming starting at the next period boundary
        let t_now = WallClock::now();
        let period_pos = t_now.secs().rem_euclid(rx_period);
        let mut t_next_period = t_now + (rx_period - period_pos);

        // Bump the sequence number to indicate a discontinuity
        seq += 1;

        inner.radio.start_rx_stream(WallClock::to_mono_time(t_next_period));

        while !inner.sync.is_done() {
            if inner.sync.needs_sync(RX_TID) {
                continue 'outer;
            }

            let t_cur_period = t_next_period;

            t_next_period = t_next_period + rx_period;

            let mut buf = IQBuf::new(rx_bufsize);

            buf.seq = seq;
            seq += 1;
            buf.fs = rx_rate;

            // Offer the buffer to the snapshot collector before sharing it
            let do_snapshot = match &inner.collector {
                Some(collector) => collector.push(&mut buf),
                None => false,
            };

            let buf = Arc::new(buf);

            // Hand the buffer to the channelizer now so demodulation can
            // begin while the radio is still filling it
            inner.demodulator.channelizer().push(Arc::clone(&buf));

            let ok = inner
                .radio
                .burst_rx(WallClock::to_mono_time(t_cur_period), rx_period_samps, &buf);

            if do_snapshot {
                if let Some(collector) = &inner.collector {
                    collector.finalize_push(Arc::clone(&buf));
                }
            }

            if !ok {
                // Pending demodulator threads terminate on the completed
                // buffer
                buf.mark_complete();
                inner.stats.rx_errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        tracing::error!("attempting to reset RX loop");
        inner.radio.stop_rx_stream();
    }
}

/// The TX notifier: post-transmit accounting for every burst that went to
/// air.
pub(crate) fn tx_notifier(inner: Arc<MacInner>) {
    loop {
        let record = {
            let mut records = inner.tx_records.lock().unwrap();

            loop {
                if let Some(record) = records.pop_front() {
                    break record;
                }
                if inner.sync.is_done() {
                    return;
                }

                records = inner
                    .tx_records_cond
                    .wait_timeout(records, Duration::from_millis(100))
                    .unwrap()
                    .0;
            }
        };

        notify_tx_record(&inner, record);
    }
}

fn notify_tx_record(inner: &MacInner, mut record: TXRecord) {
    let (tx_rate, rx_rate) = {
        let config = inner.config.lock().unwrap();

        (config.tx_rate, config.rx_rate)
    };

    if let Some(timestamp) = record.timestamp {
        // Timestamp packets with their actual time on air
        for mpkt in &mut record.mpkts {
            if let Some(pkt) = mpkt.pkt.as_mut() {
                pkt.tx_timestamp = Some(timestamp + (record.delay + mpkt.start) as f64 / tx_rate);
            }
        }

        // Account the channel load
        {
            let mut load = inner.stats.load.lock().unwrap();

            for mpkt in &record.mpkts {
                if mpkt.chanidx >= load.len() {
                    load.resize(mpkt.chanidx + 1, 0);
                }
                load[mpkt.chanidx] += mpkt.nsamples as u64;
            }
        }
    }

    // Log the transmissions
    if let Some(logger) = Logger::global() {
        if logger.collect_source(Source::SentPackets) {
            for mpkt in &record.mpkts {
                if let Some(pkt) = mpkt.pkt.as_ref() {
                    logger.log_send(meshradio_core::logger::SendRecord {
                        timestamp: pkt.timestamp.secs(),
                        tx_timestamp: pkt.tx_timestamp.map_or(0.0, |t| t.secs()),
                        mcsidx: pkt.mcsidx as u32,
                        nretrans: pkt.nretrans,
                        nsamples: mpkt.nsamples as u64,
                        dropped: false,
                        pkt: PacketFields::new(&pkt.hdr, &pkt.ehdr(), pkt.size()),
                    });
                }
            }
        }

        logger.log_tx_record(record.timestamp, record.nsamples, tx_rate);
    }

    // Inform the controller so upper layers can account for ACK baselines
    inner.controller.transmitted(&mut record.mpkts);

    // Tell the snapshot collector about local self-transmissions
    if let (Some(collector), Some(timestamp)) = (&inner.collector, record.timestamp) {
        for mpkt in &record.mpkts {
            collector.self_tx(
                timestamp + mpkt.start as f64 / tx_rate,
                rx_rate,
                mpkt.channel.fc,
                mpkt.channel.bw,
                mpkt.nsamples,
            );
        }

        if let Some(logger) = Logger::global() {
            logger.log_self_tx(SelfTxRecord {
                timestamp: timestamp.secs(),
                rx_rate,
                tx_rate,
                fc: record.mpkts.first().map_or(0.0, |m| m.channel.fc),
                bw: record.mpkts.first().map_or(0.0, |m| m.channel.bw),
                nsamples: record.nsamples as u64,
            });
        }
    }
}
