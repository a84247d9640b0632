//! Medium access control for the meshradio stack
//!
//! The slot-synchronized MAC drives the radio's RX stream continuously and
//! hands finalized TX slots to the radio ahead of wall-clock slot
//! boundaries, with TDMA and slotted-ALOHA scheduling disciplines.

pub mod aloha;
pub mod controller;
pub mod mac;
pub mod radio;
pub mod slotted;
pub mod tdma;

pub use aloha::SlottedAloha;
pub use controller::{Controller, PassthroughController};
pub use mac::{MacConfig, MacStats};
pub use radio::{LoopbackRadio, MasterClockGuard, Radio};
pub use slotted::SlottedMac;
pub use tdma::Tdma;
