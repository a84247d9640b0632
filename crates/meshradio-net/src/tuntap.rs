use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use meshradio_core::header::EHDR_SIZE;
use meshradio_core::{ExtendedHeader, MonoClock, NetPacket, RadioPacket, WallClock};

/// The kernel tun/tap interface seam.
///
/// `recv` blocks for the next IP packet from the kernel, delivered as a
/// [NetPacket] whose extended header has `data_len` pre-filled and whose
/// timestamps record the read time. `send` hands a demodulated packet's data
/// region back to the kernel. The real device implementation is an external
/// collaborator; [TunLoop] provides the in-process stand-in.
pub trait TunTap: Send + Sync {
    /// Read the next packet from the interface. Returns `None` on shutdown.
    fn recv(&self) -> Option<Box<NetPacket>>;

    /// Deliver a received packet's payload to the interface
    fn send(&self, pkt: &RadioPacket);

    fn mtu(&self) -> usize;
}

/// A scoped capability guard.
///
/// Privileged interface ioctls run with capabilities raised only for the
/// duration of the guard; dropping the guard lowers them again.
pub struct CapGuard {
    lower: Option<Box<dyn FnOnce() + Send>>,
}

impl CapGuard {
    pub fn raise<R, L>(raise: R, lower: L) -> Self
    where
        R: FnOnce(),
        L: FnOnce() + Send + 'static,
    {
        raise();

        Self {
            lower: Some(Box::new(lower)),
        }
    }
}

impl Drop for CapGuard {
    fn drop(&mut self) {
        if let Some(lower) = self.lower.take() {
            lower();
        }
    }
}

struct TunLoopState {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
    done: bool,
}

/// An in-memory tun/tap used by tests and the loopback demo.
///
/// Packets injected with [TunLoop::inject] appear on `recv`; packets sent
/// toward the kernel are captured and can be drained with
/// [TunLoop::take_sent].
pub struct TunLoop {
    state: Mutex<TunLoopState>,
    cond: Condvar,
    mtu: usize,
}

impl TunLoop {
    pub fn new(mtu: usize) -> Self {
        Self {
            state: Mutex::new(TunLoopState {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                done: false,
            }),
            cond: Condvar::new(),
            mtu,
        }
    }

    /// Inject an IP packet as if the kernel had written it to the device
    pub fn inject(&self, ip_packet: Vec<u8>) {
        self.state.lock().unwrap().inbound.push_back(ip_packet);
        self.cond.notify_one();
    }

    /// Drain the packets delivered toward the kernel
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().outbound)
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().done = true;
        self.cond.notify_all();
    }
}

impl TunTap for TunLoop {
    fn recv(&self) -> Option<Box<NetPacket>> {
        let mut state = self.state.lock().unwrap();

        let data = loop {
            if let Some(data) = state.inbound.pop_front() {
                break data;
            }
            if state.done {
                return None;
            }

            state = self.cond.wait(state).unwrap();
        };

        let mut pkt = NetPacket::with_capacity(EHDR_SIZE + data.len());

        pkt.set_ehdr(ExtendedHeader {
            data_len: data.len() as u16,
            ..Default::default()
        });
        pkt.payload[EHDR_SIZE..].copy_from_slice(&data);
        pkt.timestamp = MonoClock::now();
        pkt.wall_timestamp = Some(WallClock::now());
        pkt.timestamps.tuntap_read = Some(pkt.timestamp);

        Some(pkt.into())
    }

    fn send(&self, pkt: &RadioPacket) {
        self.state.lock().unwrap().outbound.push(pkt.data().to_vec());
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_recv_prefills_ehdr() {
        let tun = TunLoop::new(1500);

        tun.inject(vec![0x45, 0, 0, 4]);

        let pkt = tun.recv().unwrap();
        assert_eq!(pkt.ehdr().data_len, 4);
        assert_eq!(pkt.data(), &[0x45, 0, 0, 4]);
        assert!(pkt.timestamps.tuntap_read.is_some());
    }

    #[test]
    fn test_shutdown_unblocks_recv() {
        let tun = std::sync::Arc::new(TunLoop::new(1500));
        let tun2 = std::sync::Arc::clone(&tun);
        let t = std::thread::spawn(move || tun2.recv());

        std::thread::sleep(std::time::Duration::from_millis(20));
        tun.shutdown();
        assert!(t.join().unwrap().is_none());
    }

    #[test]
    fn test_cap_guard_lowers_on_drop() {
        use std::sync::atomic::{AtomicU8, Ordering};
        use std::sync::Arc;

        let level = Arc::new(AtomicU8::new(0));
        let raise_level = Arc::clone(&level);
        let lower_level = Arc::clone(&level);

        {
            let _guard = CapGuard::raise(
                move || raise_level.store(1, Ordering::SeqCst),
                move || lower_level.store(0, Ordering::SeqCst),
            );

            assert_eq!(level.load(Ordering::SeqCst), 1);
        }

        assert_eq!(level.load(Ordering::SeqCst), 0);
    }
}
