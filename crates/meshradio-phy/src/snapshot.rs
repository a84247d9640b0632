use std::sync::{Arc, Mutex};

use meshradio_core::{IQBuf, MonoClock, MonoTime};

/// A self-transmission event within a snapshot window, in sample offsets
/// relative to the snapshot start
#[derive(Clone, Debug, PartialEq)]
pub struct SelfTx {
    pub start: i64,
    pub end: i64,
    pub fc: f64,
    pub bw: f64,
}

/// A completed snapshot: a window of raw RX IQ together with our own
/// transmissions during the window
pub struct Snapshot {
    pub timestamp: MonoTime,
    pub iqbufs: Vec<Arc<IQBuf>>,
    pub selftx: Vec<SelfTx>,
}

struct SnapState {
    active: bool,
    timestamp: MonoTime,
    /// Sample offset assigned to the next pushed buffer
    offset: i64,
    iqbufs: Vec<Arc<IQBuf>>,
    selftx: Vec<SelfTx>,
}

/// Collects windowed captures of raw RX IQ plus self-transmission events
/// for offline analysis.
pub struct SnapshotCollector {
    state: Mutex<SnapState>,
}

impl SnapshotCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SnapState {
                active: false,
                timestamp: MonoTime::default(),
                offset: 0,
                iqbufs: Vec::new(),
                selftx: Vec::new(),
            }),
        }
    }

    /// Begin a new snapshot window
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();

        state.active = true;
        state.timestamp = MonoClock::now();
        state.offset = 0;
        state.iqbufs.clear();
        state.selftx.clear();
    }

    pub fn active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Offer an RX buffer to the collector before it is shared. Returns true
    /// if the buffer joined the snapshot; the buffer's snapshot offset is
    /// filled in.
    pub fn push(&self, buf: &mut IQBuf) -> bool {
        let mut state = self.state.lock().unwrap();

        if !state.active {
            return false;
        }

        buf.snapshot_off = Some(state.offset);
        true
    }

    /// Complete a push started with [SnapshotCollector::push], advancing the
    /// snapshot offset past the buffer
    pub fn finalize_push(&self, buf: Arc<IQBuf>) {
        let mut state = self.state.lock().unwrap();

        if state.active {
            state.offset += buf.len() as i64;
            state.iqbufs.push(buf);
        }
    }

    /// Record one of our own transmissions so the snapshot can distinguish
    /// it from over-the-air signal
    pub fn self_tx(&self, start: MonoTime, rx_rate: f64, fc: f64, bw: f64, nsamples: usize) {
        let mut state = self.state.lock().unwrap();

        if state.active {
            let start_off = ((start - state.timestamp) * rx_rate).round() as i64;

            state.selftx.push(SelfTx {
                start: start_off,
                end: start_off + nsamples as i64,
                fc,
                bw,
            });
        }
    }

    /// Finish the snapshot window and take its contents
    pub fn finish(&self) -> Option<Snapshot> {
        let mut state = self.state.lock().unwrap();

        if !state.active {
            return None;
        }

        state.active = false;

        Some(Snapshot {
            timestamp: state.timestamp,
            iqbufs: std::mem::take(&mut state.iqbufs),
            selftx: std::mem::take(&mut state.selftx),
        })
    }
}

impl Default for SnapshotCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_window() {
        let collector = SnapshotCollector::new();

        // Inactive collector refuses buffers
        let mut buf = IQBuf::new(64);
        assert!(!collector.push(&mut buf));

        collector.start();

        let mut buf1 = IQBuf::new(64);
        assert!(collector.push(&mut buf1));
        assert_eq!(buf1.snapshot_off, Some(0));
        collector.finalize_push(Arc::new(buf1));

        let mut buf2 = IQBuf::new(32);
        assert!(collector.push(&mut buf2));
        assert_eq!(buf2.snapshot_off, Some(64));
        collector.finalize_push(Arc::new(buf2));

        let snapshot = collector.finish().unwrap();
        assert_eq!(snapshot.iqbufs.len(), 2);
        assert!(!collector.active());
        assert!(collector.finish().is_none());
    }
}
