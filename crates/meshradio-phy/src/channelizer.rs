use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use meshradio_core::IQBuf;

use crate::radio_queue::{Barrier, RadioPacketQueue};

/// A unit of demodulation work: a channel index plus the previous and
/// current RX period buffers, with a barrier already holding the channel's
/// place in the delivery order.
pub struct ChannelWindow {
    pub barrier: Barrier,
    pub chanidx: usize,
    pub prev: Arc<IQBuf>,
    pub cur: Arc<IQBuf>,
}

struct IqState {
    iq: VecDeque<Arc<IQBuf>>,
    next_channel: usize,
    nchannels: usize,
    done: bool,
}

/// Splits the wideband RX stream into per-channel demodulation windows.
///
/// The radio pushes one buffer per RX period. Each pair of successive
/// buffers is handed out once per channel; demodulation spans the tail of
/// the previous buffer and the body of the current one so packets crossing
/// a period boundary are not lost.
pub struct Channelizer {
    state: Mutex<IqState>,
    cond: Condvar,
    /// (prev_samps, cur_samps) demodulation window sizes
    window: Mutex<(usize, usize)>,
}

impl Channelizer {
    pub fn new(nchannels: usize) -> Self {
        Self {
            state: Mutex::new(IqState {
                iq: VecDeque::new(),
                next_channel: 0,
                nchannels,
                done: false,
            }),
            cond: Condvar::new(),
            window: Mutex::new((0, 0)),
        }
    }

    /// Push the next RX period's buffer
    pub fn push(&self, buf: Arc<IQBuf>) {
        self.state.lock().unwrap().iq.push_back(buf);
        self.cond.notify_all();
    }

    /// How many samples to demodulate from the tail of the previous buffer
    /// and from the current buffer
    pub fn set_window_params(&self, prev_samps: usize, cur_samps: usize) {
        *self.window.lock().unwrap() = (prev_samps, cur_samps);
    }

    pub fn window_params(&self) -> (usize, usize) {
        *self.window.lock().unwrap()
    }

    pub fn set_nchannels(&self, nchannels: usize) {
        let mut state = self.state.lock().unwrap();

        state.nchannels = nchannels;

        // If we were mid-window on a larger channel set, move on
        if state.next_channel >= nchannels {
            if state.nchannels > 0 && state.iq.len() > 1 {
                state.iq.pop_front();
            }
            state.next_channel = 0;
        }
    }

    /// Take the next channel window, pushing a barrier for it. Blocks until
    /// two buffers are available; returns `None` on shutdown.
    pub fn pop(&self, radio_q: &RadioPacketQueue) -> Option<ChannelWindow> {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.done {
                return None;
            }
            if state.nchannels > 0 && state.iq.len() > 1 {
                break;
            }

            state = self.cond.wait(state).unwrap();
        }

        if state.iq.len() > 8 {
            tracing::warn!("large demodulation queue: size={}", state.iq.len());
        }

        let barrier = radio_q.push_barrier();
        let chanidx = state.next_channel;

        state.next_channel += 1;

        let prev = Arc::clone(&state.iq[0]);
        let cur = Arc::clone(&state.iq[1]);

        // Once every channel has seen this window, slide it forward
        if state.next_channel == state.nchannels {
            state.iq.pop_front();
            state.next_channel = 0;
        }

        Some(ChannelWindow {
            barrier,
            chanidx,
            prev,
            cur,
        })
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().done = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_stride_channels() {
        let channelizer = Channelizer::new(2);
        let radio_q = RadioPacketQueue::new();

        let bufs: Vec<Arc<IQBuf>> = (0..3).map(|_| Arc::new(IQBuf::new(16))).collect();

        for buf in &bufs {
            channelizer.push(Arc::clone(buf));
        }

        // First window pair (buf0, buf1) for channels 0 and 1
        let w0 = channelizer.pop(&radio_q).unwrap();
        assert_eq!(w0.chanidx, 0);
        assert!(Arc::ptr_eq(&w0.prev, &bufs[0]));
        assert!(Arc::ptr_eq(&w0.cur, &bufs[1]));

        let w1 = channelizer.pop(&radio_q).unwrap();
        assert_eq!(w1.chanidx, 1);
        assert!(Arc::ptr_eq(&w1.prev, &bufs[0]));

        // The window then slides to (buf1, buf2)
        let w2 = channelizer.pop(&radio_q).unwrap();
        assert_eq!(w2.chanidx, 0);
        assert!(Arc::ptr_eq(&w2.prev, &bufs[1]));
        assert!(Arc::ptr_eq(&w2.cur, &bufs[2]));
    }

    #[test]
    fn test_stop_unblocks_pop() {
        let channelizer = Arc::new(Channelizer::new(1));
        let radio_q = Arc::new(RadioPacketQueue::new());

        let popper = Arc::clone(&channelizer);
        let q = Arc::clone(&radio_q);
        let t = std::thread::spawn(move || popper.pop(&q).is_none());

        std::thread::sleep(std::time::Duration::from_millis(20));
        channelizer.stop();
        assert!(t.join().unwrap());
    }
}
