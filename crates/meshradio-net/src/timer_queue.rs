use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use meshradio_core::{MonoClock, MonoTime};

type TimerFn = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: MonoTime,
    seq: u64,
    f: TimerFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .partial_cmp(&other.deadline)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(self.seq.cmp(&other.seq))
    }
}

struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    done: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A deadline-ordered timer delivering one-shot callbacks from a dedicated
/// thread. Used by the mandate queue to deliver token-bucket refill events.
pub struct TimerQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn start() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                done: false,
            }),
            cond: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("timer-queue".into())
            .spawn(move || Self::worker(worker_inner))
            .expect("failed to spawn timer thread");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn worker(inner: Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();

        loop {
            if state.done {
                return;
            }

            let now = MonoClock::now();

            match state.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {
                    let Reverse(entry) = state.heap.pop().unwrap();

                    // Run the callback without holding the lock
                    drop(state);
                    (entry.f)();
                    state = inner.state.lock().unwrap();
                }
                Some(Reverse(entry)) => {
                    let wait = std::time::Duration::from_secs_f64(entry.deadline - now);
                    state = inner.cond.wait_timeout(state, wait).unwrap().0;
                }
                None => {
                    state = inner.cond.wait(state).unwrap();
                }
            }
        }
    }

    /// Run `f` after `delay` seconds
    pub fn run_in<F: FnOnce() + Send + 'static>(&self, delay: f64, f: F) {
        self.run_at(MonoClock::now() + delay.max(0.0), f);
    }

    /// Run `f` at monotonic time `t`
    pub fn run_at<F: FnOnce() + Send + 'static>(&self, t: MonoTime, f: F) {
        let mut state = self.inner.state.lock().unwrap();
        let seq = state.next_seq;

        state.next_seq += 1;
        state.heap.push(Reverse(Entry {
            deadline: t,
            seq,
            f: Box::new(f),
        }));
        drop(state);
        self.inner.cond.notify_one();
    }

    pub fn stop(&self) {
        self.inner.state.lock().unwrap().done = true;
        self.inner.cond.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timers_fire_in_order() {
        let tq = TimerQueue::start();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(0.03, 3), (0.01, 1), (0.02, 2)] {
            let fired = Arc::clone(&fired);
            tq.run_in(delay, move || fired.lock().unwrap().push(label));
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_stop_discards_pending() {
        let tq = TimerQueue::start();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);

        tq.run_in(10.0, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tq.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
