//! Network-side elements of the meshradio stack
//!
//! The dataflow fabric (typed push/pull ports), the packet queues including
//! the mandate queue, and the elements between the kernel tun/tap interface
//! and the radio: the network filter and the packet compressor.

pub mod compressor;
pub mod element;
pub mod fifo;
pub mod mandate_queue;
pub mod netfilter;
pub mod queue;
pub mod timer_queue;
pub mod tuntap;

pub use element::{PacketSink, PacketSource, PullPort, PushPort};
pub use fifo::FifoQueue;
pub use mandate_queue::{Mandate, MandateQueue};
pub use queue::NetQueue;
