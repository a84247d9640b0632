use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use bitcode::{Decode, Encode};
use crossbeam_channel::{bounded, Sender};

use crate::clock::{MonoTime, WallTime};
use crate::header::{ExtendedHeader, Header};

/// Datasets in the on-disk log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dataset {
    Slots,
    TxRecords,
    Snapshots,
    SelfTx,
    Recv,
    Send,
    Event,
    ArqEvent,
}

impl Dataset {
    pub fn name(self) -> &'static str {
        match self {
            Self::Slots => "slots",
            Self::TxRecords => "tx_records",
            Self::Snapshots => "snapshots",
            Self::SelfTx => "selftx",
            Self::Recv => "recv",
            Self::Send => "send",
            Self::Event => "event",
            Self::ArqEvent => "arq_event",
        }
    }
}

/// Log sources that may be enabled or disabled at runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Source {
    Slots = 1 << 0,
    TxRecords = 1 << 1,
    Snapshots = 1 << 2,
    SelfTx = 1 << 3,
    RecvPackets = 1 << 4,
    SentPackets = 1 << 5,
    SentIq = 1 << 6,
    Events = 1 << 7,
}

/// A received RX slot's worth of IQ, with codec-compressed sample data
#[derive(Encode, Decode, Debug, PartialEq)]
pub struct SlotRecord {
    pub timestamp: f64,
    pub fs: f64,
    pub fc: f64,
    pub iq_data: Vec<u8>,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct TxRecordRecord {
    pub timestamp: f64,
    pub nsamples: u64,
    pub tx_rate: f64,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub timestamp: f64,
    pub fs: f64,
    pub fc: f64,
    pub iq_data: Vec<u8>,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct SelfTxRecord {
    pub timestamp: f64,
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub fc: f64,
    pub bw: f64,
    pub nsamples: u64,
}

/// Header fields shared by the send and recv datasets
#[derive(Encode, Decode, Debug, PartialEq)]
pub struct PacketFields {
    pub curhop: u8,
    pub nexthop: u8,
    pub seq: u16,
    pub flags: u8,
    pub src: u8,
    pub dest: u8,
    pub ack: u16,
    pub data_len: u16,
    pub size: u32,
}

impl PacketFields {
    pub fn new(hdr: &Header, ehdr: &ExtendedHeader, size: usize) -> Self {
        Self {
            curhop: hdr.curhop,
            nexthop: hdr.nexthop,
            seq: hdr.seq.0,
            flags: hdr.flags.to_byte(),
            src: ehdr.src,
            dest: ehdr.dest,
            ack: ehdr.ack.0,
            data_len: ehdr.data_len,
            size: size as u32,
        }
    }
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct RecvRecord {
    pub timestamp: f64,
    pub slot_timestamp: f64,
    pub start_samples: i64,
    pub end_samples: i64,
    pub fc: f64,
    pub bw: f64,
    pub evm: f32,
    pub rssi: f32,
    pub cfo: f32,
    pub invalid_header: bool,
    pub invalid_payload: bool,
    pub pkt: PacketFields,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct SendRecord {
    pub timestamp: f64,
    pub tx_timestamp: f64,
    pub mcsidx: u32,
    pub nretrans: u32,
    pub nsamples: u64,
    pub dropped: bool,
    pub pkt: PacketFields,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct EventRecord {
    pub timestamp: f64,
    pub event: String,
}

#[derive(Encode, Decode, Debug, PartialEq)]
pub struct ArqEventRecord {
    pub timestamp: f64,
    pub node: u8,
    pub seq: u16,
    pub event_type: u8,
}

/// Where serialized records go. The stock sink writes length-prefixed
/// records per dataset; an HDF5 container backend plugs in here.
pub trait LogSink: Send {
    fn append(&mut self, dataset: Dataset, record: &[u8]);
    fn flush(&mut self) {}
}

/// A sink writing one length-prefixed record stream per dataset
pub struct FileSink {
    dir: std::path::PathBuf,
    files: Vec<(Dataset, std::fs::File)>,
}

impl FileSink {
    pub fn create<P: AsRef<std::path::Path>>(dir: P) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
        })
    }
}

impl LogSink for FileSink {
    fn append(&mut self, dataset: Dataset, record: &[u8]) {
        use std::io::Write;

        let file = match self.files.iter_mut().find(|(d, _)| *d == dataset) {
            Some((_, f)) => f,
            None => {
                let path = self.dir.join(format!("{}.log", dataset.name()));
                let file = match std::fs::File::create(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!("failed to create log dataset {:?}: {}", path, e);
                        return;
                    }
                };

                self.files.push((dataset, file));
                &mut self.files.last_mut().unwrap().1
            }
        };

        let len = (record.len() as u32).to_le_bytes();

        if file.write_all(&len).and_then(|_| file.write_all(record)).is_err() {
            tracing::error!("failed to append record to {} dataset", dataset.name());
        }
    }

    fn flush(&mut self) {
        use std::io::Write;

        for (_, f) in &mut self.files {
            let _ = f.flush();
        }
    }
}

enum Entry {
    Record(Dataset, Vec<u8>),
    Stop,
}

/// Bound on the logger's queue; records are dropped, not blocked on, when
/// the worker falls behind.
const LOG_QUEUE_DEPTH: usize = 4096;

/// The process-wide structured logger.
///
/// Producers serialize records and hand them to a worker thread through a
/// bounded queue; the worker owns the sink. Call sites short-circuit when
/// the corresponding source is not being collected.
pub struct Logger {
    tx: Sender<Entry>,
    sources: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

impl Logger {
    /// Install the global logger. Returns false if one is already installed.
    pub fn init(mut sink: Box<dyn LogSink>) -> bool {
        let (tx, rx) = bounded::<Entry>(LOG_QUEUE_DEPTH);

        let worker = std::thread::Builder::new()
            .name("logger".into())
            .spawn(move || {
                for entry in rx.iter() {
                    match entry {
                        Entry::Record(dataset, record) => sink.append(dataset, &record),
                        Entry::Stop => break,
                    }
                }
                sink.flush();
            })
            .expect("failed to spawn logger thread");

        LOGGER
            .set(Logger {
                tx,
                sources: AtomicU32::new(0),
                worker: Mutex::new(Some(worker)),
            })
            .is_ok()
    }

    /// The global logger, if installed
    pub fn global() -> Option<&'static Logger> {
        LOGGER.get()
    }

    pub fn set_collect_source(&self, source: Source, collect: bool) {
        if collect {
            self.sources.fetch_or(source as u32, Ordering::Release);
        } else {
            self.sources.fetch_and(!(source as u32), Ordering::Release);
        }
    }

    pub fn collect_source(&self, source: Source) -> bool {
        self.sources.load(Ordering::Acquire) & (source as u32) != 0
    }

    fn push<R: Encode>(&self, dataset: Dataset, record: &R) {
        // Drop rather than block: the logger must never stall the MAC
        let _ = self
            .tx
            .try_send(Entry::Record(dataset, bitcode::encode(record)));
    }

    pub fn log_slot(&self, timestamp: MonoTime, fs: f64, fc: f64, iq_data: Vec<u8>) {
        if self.collect_source(Source::Slots) {
            self.push(
                Dataset::Slots,
                &SlotRecord {
                    timestamp: timestamp.secs(),
                    fs,
                    fc,
                    iq_data,
                },
            );
        }
    }

    pub fn log_snapshot(&self, timestamp: MonoTime, fs: f64, fc: f64, iq_data: Vec<u8>) {
        if self.collect_source(Source::Snapshots) {
            self.push(
                Dataset::Snapshots,
                &SnapshotRecord {
                    timestamp: timestamp.secs(),
                    fs,
                    fc,
                    iq_data,
                },
            );
        }
    }

    pub fn log_tx_record(&self, timestamp: Option<MonoTime>, nsamples: usize, tx_rate: f64) {
        if self.collect_source(Source::TxRecords) {
            self.push(
                Dataset::TxRecords,
                &TxRecordRecord {
                    timestamp: timestamp.map_or(0.0, MonoTime::secs),
                    nsamples: nsamples as u64,
                    tx_rate,
                },
            );
        }
    }

    pub fn log_self_tx(&self, record: SelfTxRecord) {
        if self.collect_source(Source::SelfTx) {
            self.push(Dataset::SelfTx, &record);
        }
    }

    pub fn log_recv(&self, record: RecvRecord) {
        if self.collect_source(Source::RecvPackets) {
            self.push(Dataset::Recv, &record);
        }
    }

    pub fn log_send(&self, record: SendRecord) {
        if self.collect_source(Source::SentPackets) {
            self.push(Dataset::Send, &record);
        }
    }

    pub fn log_event(&self, t: WallTime, event: String) {
        if self.collect_source(Source::Events) {
            self.push(
                Dataset::Event,
                &EventRecord {
                    timestamp: t.secs(),
                    event,
                },
            );
        }
    }

    pub fn log_arq_event(&self, t: WallTime, node: u8, seq: u16, event_type: u8) {
        if self.collect_source(Source::Events) {
            self.push(
                Dataset::ArqEvent,
                &ArqEventRecord {
                    timestamp: t.secs(),
                    node,
                    seq,
                    event_type,
                },
            );
        }
    }

    /// Stop the worker and flush the sink
    pub fn stop(&self) {
        let _ = self.tx.send(Entry::Stop);

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MemSink {
        records: Arc<Mutex<Vec<(Dataset, Vec<u8>)>>>,
    }

    impl LogSink for MemSink {
        fn append(&mut self, dataset: Dataset, record: &[u8]) {
            self.records.lock().unwrap().push((dataset, record.to_vec()));
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = SendRecord {
            timestamp: 1.5,
            tx_timestamp: 2.5,
            mcsidx: 3,
            nretrans: 1,
            nsamples: 1000,
            dropped: false,
            pkt: PacketFields {
                curhop: 1,
                nexthop: 2,
                seq: 10,
                flags: 0x04,
                src: 1,
                dest: 2,
                ack: 9,
                data_len: 64,
                size: 70,
            },
        };

        let bytes = bitcode::encode(&record);
        let decoded: SendRecord = bitcode::decode(&bytes).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_sources_gate_records() {
        let records = Arc::new(Mutex::new(Vec::new()));

        // The logger is a process-wide singleton, so this test owns it
        assert!(Logger::init(Box::new(MemSink {
            records: Arc::clone(&records),
        })));

        let logger = Logger::global().unwrap();

        // Source disabled: record dropped at the call site
        logger.log_event(WallTime(1.0), "ignored".into());

        logger.set_collect_source(Source::Events, true);
        logger.log_event(WallTime(2.0), "kept".into());

        logger.stop();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Dataset::Event);

        let event: EventRecord = bitcode::decode(&records[0].1).unwrap();
        assert_eq!(event.event, "kept");
    }
}
