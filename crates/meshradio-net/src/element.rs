//! Typed push/pull connections between processing elements.
//!
//! Every processing element exposes ports. A port is parameterized by
//! direction, protocol, and payload type:
//!
//! - A *push input* is any element implementing [PacketSink]: packets are
//!   delivered eagerly into it.
//! - A *pull output* is any element implementing [PacketSource]: packets are
//!   handed out on demand by a blocking `recv`.
//! - [PushPort] is a push *output*: it forwards into a connected sink, and a
//!   push to a disconnected port is a no-op.
//! - [PullPort] is a pull *input*: it receives from a connected source, and a
//!   disconnected pull unblocks with `None`.
//!
//! Direction/protocol/payload matching is enforced by the types: a push
//! output can only be connected to a sink of the same payload, a pull input
//! only to a source of the same payload.

use std::sync::{Arc, Mutex};

use meshradio_core::{NetPacket, RadioPacket};

/// An element accepting eagerly-delivered packets
pub trait PacketSink<T>: Send + Sync {
    fn send(&self, pkt: T);
}

/// An element handing out packets on demand
pub trait PacketSource<T>: Send + Sync {
    /// Receive the next packet, blocking until one is available. Returns
    /// `None` when the source is stopped or kicked.
    fn recv(&self) -> Option<T>;

    /// Wake any receiver currently blocked in `recv`
    fn kick(&self);
}

/// A push output port
pub struct PushPort<T> {
    downstream: Mutex<Option<Arc<dyn PacketSink<T>>>>,
}

impl<T> Default for PushPort<T> {
    fn default() -> Self {
        Self {
            downstream: Mutex::new(None),
        }
    }
}

impl<T> PushPort<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, sink: Arc<dyn PacketSink<T>>) {
        *self.downstream.lock().unwrap() = Some(sink);
    }

    pub fn disconnect(&self) {
        *self.downstream.lock().unwrap() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.downstream.lock().unwrap().is_some()
    }

    /// Push a packet out the port. A push to a disconnected port is a no-op.
    pub fn push(&self, pkt: T) {
        let downstream = self.downstream.lock().unwrap().clone();

        if let Some(sink) = downstream {
            sink.send(pkt);
        }
    }
}

/// A pull input port
pub struct PullPort<T> {
    upstream: Mutex<Option<Arc<dyn PacketSource<T>>>>,
}

impl<T> Default for PullPort<T> {
    fn default() -> Self {
        Self {
            upstream: Mutex::new(None),
        }
    }
}

impl<T> PullPort<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, source: Arc<dyn PacketSource<T>>) {
        *self.upstream.lock().unwrap() = Some(source);
    }

    /// Disconnect the port, waking any receiver blocked in the upstream
    pub fn disconnect(&self) {
        let upstream = self.upstream.lock().unwrap().take();

        if let Some(source) = upstream {
            source.kick();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.upstream.lock().unwrap().is_some()
    }

    /// Pull a packet from the port. A disconnected pull returns `None`
    /// without blocking.
    pub fn pull(&self) -> Option<T> {
        let upstream = self.upstream.lock().unwrap().clone();

        upstream.and_then(|source| source.recv())
    }
}

pub type NetOut = PushPort<Box<NetPacket>>;
pub type NetIn = PullPort<Box<NetPacket>>;
pub type RadioOut = PushPort<Box<RadioPacket>>;
pub type RadioIn = PullPort<Box<RadioPacket>>;

/// Adapt a closure into a packet sink
pub struct FnSink<T, F: Fn(T) + Send + Sync> {
    f: F,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F: Fn(T) + Send + Sync> FnSink<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send, F: Fn(T) + Send + Sync> PacketSink<T> for FnSink<T, F> {
    fn send(&self, pkt: T) {
        (self.f)(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_push_to_disconnected_is_noop() {
        let port: PushPort<u32> = PushPort::new();

        port.push(42);
        assert!(!port.is_connected());
    }

    #[test]
    fn test_push_delivers() {
        let port: PushPort<u32> = PushPort::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        port.connect(Arc::new(FnSink::new(move |_pkt: u32| {
            count2.fetch_add(1, Ordering::SeqCst);
        })));

        port.push(1);
        port.push(2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        port.disconnect();
        port.push(3);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    struct BlockingSource {
        kicked: std::sync::Condvar,
        state: Mutex<bool>,
    }

    impl PacketSource<u32> for BlockingSource {
        fn recv(&self) -> Option<u32> {
            let mut kicked = self.state.lock().unwrap();

            while !*kicked {
                kicked = self.kicked.wait(kicked).unwrap();
            }

            None
        }

        fn kick(&self) {
            *self.state.lock().unwrap() = true;
            self.kicked.notify_all();
        }
    }

    #[test]
    fn test_disconnect_unblocks_pull() {
        let port: Arc<PullPort<u32>> = Arc::new(PullPort::new());

        port.connect(Arc::new(BlockingSource {
            kicked: std::sync::Condvar::new(),
            state: Mutex::new(false),
        }));

        let puller = Arc::clone(&port);
        let t = std::thread::spawn(move || puller.pull());

        std::thread::sleep(std::time::Duration::from_millis(20));
        port.disconnect();

        // The blocked pull must unblock with no value
        assert_eq!(t.join().unwrap(), None);
        // And subsequent pulls return immediately
        assert_eq!(port.pull(), None);
    }
}
