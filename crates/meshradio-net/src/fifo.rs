use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use meshradio_core::{NetPacket, NodeId};

use crate::element::PacketSource;
use crate::queue::NetQueue;

/// A plain FIFO queue with a high-priority head segment.
struct State {
    q: VecDeque<Box<NetPacket>>,
    hiq: VecDeque<Box<NetPacket>>,
    done: bool,
}

pub struct FifoQueue {
    state: Mutex<State>,
    cond: Condvar,
    kicked: AtomicBool,
    transmission_delay: AtomicU64,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                q: VecDeque::new(),
                hiq: VecDeque::new(),
                done: false,
            }),
            cond: Condvar::new(),
            kicked: AtomicBool::new(false),
            transmission_delay: AtomicU64::new(0),
        }
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NetQueue for FifoQueue {
    fn push(&self, pkt: Box<NetPacket>) {
        self.state.lock().unwrap().q.push_back(pkt);
        self.cond.notify_one();
    }

    fn push_hi(&self, pkt: Box<NetPacket>) {
        self.state.lock().unwrap().hiq.push_back(pkt);
        self.cond.notify_one();
    }

    fn repush(&self, pkt: Box<NetPacket>) {
        let mut state = self.state.lock().unwrap();

        if pkt.hdr.flags.syn {
            state.hiq.push_front(pkt);
        } else {
            state.hiq.push_back(pkt);
        }
        drop(state);
        self.cond.notify_one();
    }

    fn pop(&self) -> Option<Box<NetPacket>> {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.done || self.kicked.swap(false, Ordering::AcqRel) {
                return None;
            }

            if let Some(pkt) = state.hiq.pop_front().or_else(|| state.q.pop_front()) {
                return Some(pkt);
            }

            state = self.cond.wait(state).unwrap();
        }
    }

    fn kick(&self) {
        self.kicked.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    fn stop(&self) {
        self.state.lock().unwrap().done = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();

        state.done = false;
        state.q.clear();
        state.hiq.clear();
    }

    fn set_send_window_status(&self, _node: NodeId, _open: bool) {}

    fn update_mcs_rate(&self, _node: NodeId, _rate: f64) {}

    fn set_transmission_delay(&self, delay: f64) {
        self.transmission_delay.store(delay.to_bits(), Ordering::Release);
    }

    fn transmission_delay(&self) -> f64 {
        f64::from_bits(self.transmission_delay.load(Ordering::Acquire))
    }
}

impl PacketSource<Box<NetPacket>> for FifoQueue {
    fn recv(&self) -> Option<Box<NetPacket>> {
        self.pop()
    }

    fn kick(&self) {
        NetQueue::kick(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_core::header::EHDR_SIZE;

    fn pkt(syn: bool) -> Box<NetPacket> {
        let mut p = NetPacket::with_capacity(EHDR_SIZE);
        p.hdr.flags.syn = syn;
        Box::new(p)
    }

    #[test]
    fn test_fifo_order_and_hi_priority() {
        let q = FifoQueue::new();

        q.push(pkt(false));
        q.push_hi(pkt(false));

        // High-priority queue drains first
        let first = q.pop().unwrap();
        assert!(!first.hdr.flags.syn);

        q.push(pkt(false));
        // Repush of a SYN packet goes to the head of the high-priority queue
        q.repush(pkt(true));
        assert!(q.pop().unwrap().hdr.flags.syn);
    }

    #[test]
    fn test_stop_unblocks_pop() {
        let q = std::sync::Arc::new(FifoQueue::new());
        let q2 = std::sync::Arc::clone(&q);
        let t = std::thread::spawn(move || q2.pop());

        std::thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(t.join().unwrap().is_none());
    }
}
