use std::sync::{Condvar, Mutex};

struct BarrierState {
    done: bool,
    /// Bumped on every configuration change; lets waiters detect changes
    /// without a per-thread flag read
    epoch: u64,
    needs_sync: Vec<bool>,
}

/// The reconfiguration barrier embedded in the MAC, the synthesizer, and
/// the channelizer.
///
/// A configuration write goes through [SyncBarrier::modify]: the closure
/// applies the new state under the barrier's mutex, every worker thread is
/// flagged, and all waiters are woken. Workers poll [SyncBarrier::needs_sync]
/// at their outer loop boundary and call [SyncBarrier::sync] to acknowledge,
/// giving at-most-one-slot reconfiguration latency with no data loss.
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl SyncBarrier {
    pub fn new(nthreads: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                done: false,
                epoch: 0,
                needs_sync: vec![false; nthreads],
            }),
            cond: Condvar::new(),
        }
    }

    /// Apply a configuration change and wake every worker. Returns false if
    /// the barrier has already shut down.
    pub fn modify<F: FnOnce()>(&self, f: F) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.done {
            return false;
        }

        f();

        state.epoch += 1;
        for flag in &mut state.needs_sync {
            *flag = true;
        }
        drop(state);
        self.cond.notify_all();

        true
    }

    /// Shut down: flags every worker and marks the barrier done
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();

        state.done = true;
        state.epoch += 1;
        for flag in &mut state.needs_sync {
            *flag = true;
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Does worker `tid` need to synchronize?
    pub fn needs_sync(&self, tid: usize) -> bool {
        self.state.lock().unwrap().needs_sync[tid]
    }

    /// Acknowledge the configuration change. Returns true if the barrier is
    /// shutting down.
    pub fn sync(&self, tid: usize) -> bool {
        let mut state = self.state.lock().unwrap();

        state.needs_sync[tid] = false;
        state.done
    }

    /// Sleep until the next configuration change
    pub fn sleep_until_state_change(&self, tid: usize) {
        let mut state = self.state.lock().unwrap();

        while !state.needs_sync[tid] && !state.done {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// The current configuration epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    /// Wait until either worker `tid` is flagged or the epoch moves past
    /// `seen`. Used by workers that also wait on work arrival signaled via
    /// [SyncBarrier::notify_work].
    pub fn wait_for_work(&self, tid: usize, seen: u64) -> u64 {
        let mut state = self.state.lock().unwrap();

        while !state.needs_sync[tid] && !state.done && state.epoch == seen {
            state = self.cond.wait(state).unwrap();
        }

        state.epoch
    }

    /// Signal workers blocked in [SyncBarrier::wait_for_work] without
    /// flagging a reconfiguration
    pub fn notify_work(&self) {
        let mut state = self.state.lock().unwrap();

        state.epoch += 1;
        drop(state);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_modify_flags_all_workers() {
        let barrier = SyncBarrier::new(3);
        let value = AtomicUsize::new(0);

        assert!(barrier.modify(|| {
            value.store(42, Ordering::SeqCst);
        }));
        assert_eq!(value.load(Ordering::SeqCst), 42);

        for tid in 0..3 {
            assert!(barrier.needs_sync(tid));
            assert!(!barrier.sync(tid));
            assert!(!barrier.needs_sync(tid));
        }
    }

    #[test]
    fn test_shutdown_wakes_sleepers() {
        let barrier = Arc::new(SyncBarrier::new(1));
        let sleeper = Arc::clone(&barrier);

        let t = std::thread::spawn(move || {
            sleeper.sleep_until_state_change(0);
            sleeper.sync(0)
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.shutdown();

        // The sleeper wakes and observes shutdown
        assert!(t.join().unwrap());
        assert!(!barrier.modify(|| {}));
    }
}
