use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use meshradio_core::RadioPacket;

/// A barrier handle issued by [RadioPacketQueue::push_barrier]
pub type Barrier = u64;

enum Entry {
    Barrier(Barrier),
    Packet(Box<RadioPacket>),
}

struct State {
    q: VecDeque<Entry>,
    next_barrier: Barrier,
    done: bool,
}

/// A queue of demodulated packets that preserves ordering across parallel
/// decoders.
///
/// A barrier is a placeholder entry: seeing one is like seeing the end of
/// the queue. A demod worker pushes a barrier before starting a slot's work,
/// inserts its packets ahead of that barrier, and erases the barrier when it
/// finishes, guaranteeing that packets inserted after the barrier are not
/// read until the work ahead of it is complete.
pub struct RadioPacketQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl RadioPacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                q: VecDeque::new(),
                next_barrier: 0,
                done: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append a packet at the tail
    pub fn push(&self, pkt: Box<RadioPacket>) {
        self.state.lock().unwrap().q.push_back(Entry::Packet(pkt));
        self.cond.notify_one();
    }

    /// Insert a packet immediately before barrier `b`
    pub fn push_before(&self, b: Barrier, pkt: Box<RadioPacket>) {
        let mut state = self.state.lock().unwrap();

        match state.q.iter().position(|e| matches!(e, Entry::Barrier(id) if *id == b)) {
            Some(pos) => state.q.insert(pos, Entry::Packet(pkt)),
            // The barrier is gone; ordering no longer matters
            None => state.q.push_back(Entry::Packet(pkt)),
        }

        drop(state);
        self.cond.notify_one();
    }

    /// Push a barrier onto the tail of the queue
    pub fn push_barrier(&self) -> Barrier {
        let mut state = self.state.lock().unwrap();
        let b = state.next_barrier;

        state.next_barrier += 1;
        state.q.push_back(Entry::Barrier(b));
        drop(state);
        self.cond.notify_one();

        b
    }

    /// Erase barrier `b`, releasing any packets queued behind it
    pub fn erase_barrier(&self, b: Barrier) {
        let mut state = self.state.lock().unwrap();

        if let Some(pos) = state.q.iter().position(|e| matches!(e, Entry::Barrier(id) if *id == b)) {
            state.q.remove(pos);
        }

        drop(state);
        self.cond.notify_all();
    }

    /// Pop the head packet, blocking while the queue is empty or the head
    /// is a barrier. Returns `None` once stopped.
    pub fn pop(&self) -> Option<Box<RadioPacket>> {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.done {
                return None;
            }

            if matches!(state.q.front(), Some(Entry::Packet(_))) {
                match state.q.pop_front() {
                    Some(Entry::Packet(pkt)) => return Some(pkt),
                    _ => unreachable!(),
                }
            }

            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().done = true;
        self.cond.notify_all();
    }
}

impl Default for RadioPacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_core::{Header, Seq};
    use std::sync::Arc;

    fn pkt(seq: u16) -> Box<RadioPacket> {
        Box::new(RadioPacket::new(
            Header {
                seq: Seq(seq),
                ..Default::default()
            },
            vec![0; 8],
        ))
    }

    #[test]
    fn test_barrier_blocks_delivery() {
        let q = Arc::new(RadioPacketQueue::new());

        let b = q.push_barrier();
        q.push(pkt(10)); // after the barrier

        let popper = Arc::clone(&q);
        let t = std::thread::spawn(move || popper.pop().map(|p| p.hdr.seq.0));

        // The barrier holds back seq 10
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!t.is_finished());

        // Packets inserted before the barrier flow out first
        q.push_before(b, pkt(1));
        assert_eq!(t.join().unwrap(), Some(1));

        // Erasing the barrier releases the rest
        q.erase_barrier(b);
        assert_eq!(q.pop().unwrap().hdr.seq.0, 10);
    }

    #[test]
    fn test_two_barriers_preserve_slot_order() {
        let q = RadioPacketQueue::new();

        let b1 = q.push_barrier();
        let b2 = q.push_barrier();

        // The second slot's worker finishes first
        q.push_before(b2, pkt(20));
        q.erase_barrier(b2);

        // Its packet must still wait for the first slot's barrier
        q.push_before(b1, pkt(11));
        q.erase_barrier(b1);

        assert_eq!(q.pop().unwrap().hdr.seq.0, 11);
        assert_eq!(q.pop().unwrap().hdr.seq.0, 20);
    }

    #[test]
    fn test_stop_unblocks_pop() {
        let q = Arc::new(RadioPacketQueue::new());
        let popper = Arc::clone(&q);
        let t = std::thread::spawn(move || popper.pop());

        std::thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(t.join().unwrap().is_none());
    }
}
