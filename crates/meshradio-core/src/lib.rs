//! Core types for the meshradio stack
//!
//! This crate provides the packet model, IQ sample buffers, clocks, the
//! channel/slot schedule, and the structured logger shared by every layer.

pub mod channel;
pub mod clock;
pub mod debug;
pub mod header;
pub mod iqbuf;
pub mod logger;
pub mod packet;
pub mod schedule;
pub mod seq;

// Re-export commonly used items
pub use channel::Channel;
pub use clock::{MonoClock, MonoTime, WallClock, WallTime};
pub use header::{ExtendedHeader, Header, HeaderFlags, EHDR_SIZE, HDR_SIZE};
pub use iqbuf::IQBuf;
pub use packet::{ControlMsg, NetPacket, Packet, RadioPacket};
pub use schedule::Schedule;
pub use seq::Seq;

/// A node identifier in the mesh. Derived from the last octet of a node's
/// IP/MAC addresses by the network filter.
pub type NodeId = u8;

/// The broadcast node id
pub const NODE_BROADCAST: NodeId = 255;

/// A flow identifier, used to route packets to per-flow queues
pub type FlowUid = u16;

/// Index into a PHY's MCS table
pub type McsIdx = usize;

/// Data types used for signal processing
pub mod dsp_types {
    pub type RealSample = f32;
    pub use std::f32::consts as sample_consts;

    pub type ComplexSample = num_complex::Complex<RealSample>;

    pub type SampleCount = i64;
}
