use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde::Deserialize;

use meshradio_core::NodeId;

/// Which medium-access discipline drives the slot scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MacMode {
    Tdma,
    SlottedAloha,
}

/// The radio backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RadioBackend {
    Undefined,
    /// In-process loopback, for tests and bench runs
    Loopback,
}

/// One logical channel carved out of the wideband radio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfgChannel {
    /// Center frequency offset from the radio center frequency (Hz)
    pub fc: f64,
    /// Channel bandwidth (Hz)
    pub bw: f64,
}

/// Radio / PHY I/O configuration
#[derive(Debug, Clone)]
pub struct CfgRadio {
    pub backend: RadioBackend,

    /// Wideband TX sample rate (Hz)
    pub tx_rate: f64,
    /// Wideband RX sample rate (Hz)
    pub rx_rate: f64,

    /// Logical channels
    pub channels: Vec<CfgChannel>,

    /// Capture the raw TX baseband to a file
    pub tx_capture_file: Option<String>,
    /// Capture the raw RX baseband to a file
    pub rx_capture_file: Option<String>,
}

impl Default for CfgRadio {
    fn default() -> Self {
        Self {
            backend: RadioBackend::Undefined,
            tx_rate: 10e6,
            rx_rate: 10e6,
            channels: vec![CfgChannel { fc: 0.0, bw: 1e6 }],
            tx_capture_file: None,
            rx_capture_file: None,
        }
    }
}

/// MAC timing configuration
#[derive(Debug, Clone)]
pub struct CfgMac {
    pub mode: MacMode,

    /// Slot duration (seconds)
    pub slot_size: f64,
    /// Guard duration at the end of each slot (seconds)
    pub guard_size: f64,
    /// RX period; one IQ buffer is produced per period (seconds)
    pub rx_period: f64,
    /// How far before a slot boundary the finalized slot must be handed to
    /// the radio (seconds)
    pub slot_send_lead_time: f64,
    /// Per-slot TDMA ownership, one row per channel
    pub schedule: Vec<Vec<bool>>,
    /// Transmission probability for slotted ALOHA
    pub aloha_p: f64,
}

impl Default for CfgMac {
    fn default() -> Self {
        Self {
            mode: MacMode::Tdma,
            slot_size: 0.035,
            guard_size: 0.01,
            rx_period: 0.035,
            slot_send_lead_time: 5e-3,
            schedule: vec![vec![true]],
            aloha_p: 0.1,
        }
    }
}

/// Queueing configuration
#[derive(Debug, Clone)]
pub struct CfgQueue {
    /// Enable the round-robin bonus phase after mandated flows are served
    pub bonus_phase: bool,
}

impl Default for CfgQueue {
    fn default() -> Self {
        Self { bonus_phase: true }
    }
}

/// Network-side configuration
#[derive(Debug, Clone)]
pub struct CfgNet {
    /// This node's identifier; also the last octet of its addresses
    pub node_id: NodeId,
    /// tun/tap MTU
    pub mtu: usize,
    /// Internal network (e.g. 10.10.10.0/24), given as (net, netmask)
    pub int_net: (u32, u32),
    /// External network, given as (net, netmask)
    pub ext_net: (u32, u32),
    /// Enable header compression
    pub compress: bool,
}

impl Default for CfgNet {
    fn default() -> Self {
        Self {
            node_id: 1,
            mtu: 1500,
            int_net: (0x0a0a0a00, 0xffffff00),
            ext_net: (0xc0a80000, 0xffff0000),
            compress: false,
        }
    }
}

/// Number of worker threads for the parallel DSP stages
#[derive(Debug, Clone)]
pub struct CfgThreads {
    pub synthesizer: usize,
    pub demodulator: usize,
}

impl Default for CfgThreads {
    fn default() -> Self {
        Self {
            synthesizer: 2,
            demodulator: 2,
        }
    }
}

/// Full stack configuration
#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub debug_log: Option<String>,
    /// Directory for the structured on-disk log; None disables it
    pub log_dir: Option<String>,
    pub radio: CfgRadio,
    pub mac: CfgMac,
    pub queue: CfgQueue,
    pub net: CfgNet,
    pub threads: CfgThreads,
}

/// Shared, read-mostly configuration handle cloned into every component
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<StackConfig>>,
}

impl SharedConfig {
    pub fn from_config(cfg: StackConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn config(&self) -> RwLockReadGuard<'_, StackConfig> {
        self.inner.read().unwrap()
    }

    pub fn update<F: FnOnce(&mut StackConfig)>(&self, f: F) {
        f(&mut self.inner.write().unwrap());
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::from_config(StackConfig::default())
    }
}
